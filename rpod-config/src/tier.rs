//! Resource tiers.

use rpod_provider::ResourceShape;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A named resource class assigned per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Tier1,
    Tier2,
    Tier3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Tier1, Tier::Tier2, Tier::Tier3];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Tier1 => "tier1",
            Tier::Tier2 => "tier2",
            Tier::Tier3 => "tier3",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tier1" => Ok(Tier::Tier1),
            "tier2" => Ok(Tier::Tier2),
            "tier3" => Ok(Tier::Tier3),
            other => Err(format!("unknown tier '{other}' (expected tier1, tier2 or tier3)")),
        }
    }
}

/// Resource shape for a tier, plus the fixed external port it uses on a
/// single host. `fixed_port: None` means the port comes from the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    #[serde(flatten)]
    pub shape: ResourceShape,
    #[serde(default)]
    pub fixed_port: Option<u16>,
}

impl TierLimits {
    const fn new(cpu_request: u32, cpu_limit: u32, mem_request_gib: u64, mem_limit_gib: u64) -> Self {
        Self {
            shape: ResourceShape {
                cpu_request_millis: cpu_request,
                cpu_limit_millis: cpu_limit,
                memory_request_mib: mem_request_gib * 1024,
                memory_limit_mib: mem_limit_gib * 1024,
            },
            fixed_port: None,
        }
    }

    const fn with_port(mut self, port: u16) -> Self {
        self.fixed_port = Some(port);
        self
    }
}

const TIER1: TierLimits = TierLimits::new(1000, 2000, 2, 4);
const TIER2: TierLimits = TierLimits::new(2000, 4000, 4, 8);
const TIER3: TierLimits = TierLimits::new(4000, 8000, 8, 16);

/// Tier to limits mapping. Read-only once the process has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierTable(BTreeMap<Tier, TierLimits>);

impl TierTable {
    /// Single-host defaults: every tier pinned to its own host port.
    pub fn single_host() -> Self {
        Self(BTreeMap::from([
            (Tier::Tier1, TIER1.with_port(8810)),
            (Tier::Tier2, TIER2.with_port(8820)),
            (Tier::Tier3, TIER3.with_port(8830)),
        ]))
    }

    /// Cluster defaults: ports are allocated dynamically.
    pub fn cluster() -> Self {
        Self(BTreeMap::from([
            (Tier::Tier1, TIER1),
            (Tier::Tier2, TIER2),
            (Tier::Tier3, TIER3),
        ]))
    }

    pub fn get(&self, tier: Tier) -> Option<&TierLimits> {
        self.0.get(&tier)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tier, &TierLimits)> {
        self.0.iter()
    }

    /// Tiers that have no entry.
    pub fn missing(&self) -> Vec<Tier> {
        Tier::ALL
            .into_iter()
            .filter(|t| !self.0.contains_key(t))
            .collect()
    }
}

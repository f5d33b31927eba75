//! User directory: username to profile resolution.
//!
//! The YAML source accepts either a top-level `users:` map or a bare map of
//! username to entry:
//!
//! ```yaml
//! users:
//!   alice:
//!     tier: tier2
//!     home: /home/alice
//!     password: s3cret
//!     projects:
//!       - base: Genomics
//!         folders: [raw, results]
//! ```

use crate::error::DirectoryError;
use crate::tier::Tier;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Read access to an external base project and some of its subfolders.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ProjectGrant {
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub folders: Vec<String>,
}

impl ProjectGrant {
    pub fn new(base: impl Into<String>, folders: &[&str]) -> Self {
        Self {
            base: base.into(),
            folders: folders.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub username: String,
    pub tier: Tier,
    /// Home directory inside the session.
    pub home: PathBuf,
    pub password: String,
    pub projects: Vec<ProjectGrant>,
}

impl UserProfile {
    pub fn new(username: impl Into<String>, tier: Tier, password: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            home: default_home(&username),
            username,
            tier,
            password: password.into(),
            projects: Vec::new(),
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn with_project(mut self, grant: ProjectGrant) -> Self {
        self.projects.push(grant);
        self
    }
}

impl fmt::Debug for UserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserProfile")
            .field("username", &self.username)
            .field("tier", &self.tier)
            .field("home", &self.home)
            .field("password", &"<redacted>")
            .field("projects", &self.projects)
            .finish()
    }
}

fn default_home(username: &str) -> PathBuf {
    PathBuf::from(format!("/home/{username}"))
}

/// Resolves usernames to profiles. Implementations never mutate their
/// source.
pub trait UserDirectory: Send + Sync {
    fn resolve(&self, username: &str) -> Result<UserProfile, DirectoryError>;

    /// Every configured username, sorted.
    fn usernames(&self) -> Result<Vec<String>, DirectoryError>;
}

#[derive(Debug, Default, Deserialize)]
struct UserEntry {
    tier: Option<String>,
    home: Option<String>,
    password: Option<String>,
    #[serde(default)]
    projects: Vec<ProjectGrant>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UsersDocument {
    Wrapped(WrappedUsers),
    Flat(BTreeMap<String, Option<UserEntry>>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WrappedUsers {
    users: Option<BTreeMap<String, Option<UserEntry>>>,
}

impl UserEntry {
    fn into_profile(self, username: &str) -> Result<UserProfile, DirectoryError> {
        let tier = match self.tier.as_deref() {
            Some(raw) => raw.parse::<Tier>().map_err(|e| {
                DirectoryError::Configuration(format!("user '{username}': {e}"))
            })?,
            None => Tier::default(),
        };
        let password = self.password.filter(|p| !p.is_empty()).ok_or_else(|| {
            DirectoryError::Configuration(format!("user '{username}' has no password configured"))
        })?;

        Ok(UserProfile {
            username: username.to_string(),
            tier,
            home: self
                .home
                .map(PathBuf::from)
                .unwrap_or_else(|| default_home(username)),
            password,
            projects: self.projects,
        })
    }
}

/// [`UserDirectory`] backed by a YAML file, re-read on every lookup so edits
/// take effect without a restart.
#[derive(Debug, Clone)]
pub struct YamlUserDirectory {
    path: PathBuf,
}

impl YamlUserDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<BTreeMap<String, Option<UserEntry>>, DirectoryError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            DirectoryError::Configuration(format!("cannot read {}: {e}", self.path.display()))
        })?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let document: UsersDocument = serde_yaml_ng::from_str(&content).map_err(|e| {
            DirectoryError::Configuration(format!("cannot parse {}: {e}", self.path.display()))
        })?;
        let users = match document {
            UsersDocument::Wrapped(wrapped) => wrapped.users.unwrap_or_default(),
            UsersDocument::Flat(users) => users,
        };
        debug!(path = %self.path.display(), count = users.len(), "loaded user directory");
        Ok(users)
    }
}

impl UserDirectory for YamlUserDirectory {
    fn resolve(&self, username: &str) -> Result<UserProfile, DirectoryError> {
        let mut users = self.load()?;
        let entry = users
            .remove(username)
            .ok_or_else(|| DirectoryError::NotFound(username.to_string()))?;
        entry.unwrap_or_default().into_profile(username)
    }

    fn usernames(&self) -> Result<Vec<String>, DirectoryError> {
        Ok(self.load()?.into_keys().collect())
    }
}

/// Fixed in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticUserDirectory {
    users: BTreeMap<String, UserProfile>,
}

impl StaticUserDirectory {
    pub fn new(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        Self {
            users: profiles
                .into_iter()
                .map(|p| (p.username.clone(), p))
                .collect(),
        }
    }
}

impl UserDirectory for StaticUserDirectory {
    fn resolve(&self, username: &str) -> Result<UserProfile, DirectoryError> {
        self.users
            .get(username)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(username.to_string()))
    }

    fn usernames(&self) -> Result<Vec<String>, DirectoryError> {
        Ok(self.users.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn directory(yaml: &str) -> (NamedTempFile, YamlUserDirectory) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let directory = YamlUserDirectory::new(file.path());
        (file, directory)
    }

    #[test]
    fn test_resolve_wrapped_document() {
        let (_file, dir) = directory(
            r#"
users:
  alice:
    tier: tier2
    home: /home/alice
    password: s3cret
    projects:
      - base: Genomics
        folders: [raw, results]
  bob:
    password: hunter2
"#,
        );

        let alice = dir.resolve("alice").unwrap();
        assert_eq!(alice.tier, Tier::Tier2);
        assert_eq!(alice.password, "s3cret");
        assert_eq!(
            alice.projects,
            vec![ProjectGrant::new("Genomics", &["raw", "results"])]
        );

        let bob = dir.resolve("bob").unwrap();
        assert_eq!(bob.tier, Tier::Tier1);
        assert_eq!(bob.home, PathBuf::from("/home/bob"));

        assert_eq!(dir.usernames().unwrap(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_resolve_flat_document() {
        let (_file, dir) = directory("carol:\n  tier: tier3\n  password: pw\n");
        assert_eq!(dir.resolve("carol").unwrap().tier, Tier::Tier3);
    }

    #[test]
    fn test_unknown_user_is_not_found() {
        let (_file, dir) = directory("users:\n  alice:\n    password: pw\n");
        assert_eq!(
            dir.resolve("mallory").unwrap_err(),
            DirectoryError::NotFound("mallory".into())
        );
    }

    #[test]
    fn test_broken_source_is_configuration_error() {
        let missing = YamlUserDirectory::new("/nonexistent/users.yaml");
        assert!(matches!(
            missing.resolve("alice"),
            Err(DirectoryError::Configuration(_))
        ));

        let (_file, malformed) = directory("users: [this, is: not valid");
        assert!(matches!(
            malformed.resolve("alice"),
            Err(DirectoryError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_password_or_bad_tier() {
        let (_file, dir) = directory(
            "users:\n  nopw:\n    tier: tier1\n  gold:\n    tier: platinum\n    password: pw\n",
        );
        assert!(matches!(dir.resolve("nopw"), Err(DirectoryError::Configuration(_))));
        assert!(matches!(dir.resolve("gold"), Err(DirectoryError::Configuration(_))));
    }

    #[test]
    fn test_reloads_on_every_lookup() {
        let (mut file, dir) = directory("users:\n  alice:\n    password: pw\n");
        assert!(dir.resolve("dave").is_err());

        file.write_all(b"  dave:\n    password: pw2\n").unwrap();
        file.flush().unwrap();
        assert_eq!(dir.resolve("dave").unwrap().password, "pw2");
    }

    #[test]
    fn test_debug_redacts_password() {
        let profile = UserProfile::new("alice", Tier::Tier1, "s3cret");
        let rendered = format!("{profile:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_static_directory() {
        let dir = StaticUserDirectory::new([UserProfile::new("alice", Tier::Tier2, "pw")]);
        assert_eq!(dir.resolve("alice").unwrap().tier, Tier::Tier2);
        assert!(matches!(dir.resolve("bob"), Err(DirectoryError::NotFound(_))));
    }
}

//! Deterministic resource names.
//!
//! Every backend object for a user is addressed through names derived here,
//! so the rules must stay stable: a changed rule orphans live sessions.
//!
//! Project mount names follow `proj-<idx>-<base>-<folder>-<hash8>` where
//! `<base>` and `<folder>` are slugs (lowercase, every run of characters
//! outside `[a-z0-9]` collapsed to a single `-`, edges trimmed, `x` when
//! nothing is left) and `<hash8>` is the first 8 hex digits of the SHA-256 of
//! the raw base, index and folder. The slug keeps names readable; the hash
//! keeps `Data Set` and `data-set` apart. The result is a valid DNS label.

use crate::error::{Result, SessionError};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt::Write;

pub const SESSION_PREFIX: &str = "session-";

/// Longest accepted username; keeps derived names inside DNS label limits.
pub const MAX_USERNAME_LEN: usize = 50;

const MAX_LABEL_LEN: usize = 63;

static USERNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$")
        .expect("Username regex should compile - this is a static pattern")
});

pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(SessionError::InvalidInput("username is required".into()));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(SessionError::InvalidInput(format!(
            "username must be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    if !USERNAME_RE.is_match(username) {
        return Err(SessionError::InvalidInput(format!(
            "username '{username}' may only contain lowercase letters, digits and inner hyphens"
        )));
    }
    Ok(())
}

/// `session-<username>`.
pub fn session_name(username: &str) -> String {
    format!("{SESSION_PREFIX}{username}")
}

pub fn username_from_session(name: &str) -> Option<&str> {
    name.strip_prefix(SESSION_PREFIX).filter(|u| !u.is_empty())
}

pub fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn project_mount_name(base: &str, index: usize, folder: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    hasher.update([0]);
    hasher.update(index.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(folder.as_bytes());
    let digest = hasher.finalize();

    let mut hash8 = String::with_capacity(8);
    for byte in &digest[..4] {
        let _ = write!(hash8, "{byte:02x}");
    }

    let mut stem = format!("proj-{index}-{}-{}", slug(base), slug(folder));
    let max_stem = MAX_LABEL_LEN - hash8.len() - 1;
    if stem.len() > max_stem {
        stem.truncate(max_stem);
        while stem.ends_with('-') {
            stem.pop();
        }
    }
    format!("{stem}-{hash8}")
}

/// A single path segment that stays where it is put and survives a
/// `src:dst:mode` bind string: non-empty, no separators or colons, not `.`
/// or `..`.
pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', ':', '\0'])
}

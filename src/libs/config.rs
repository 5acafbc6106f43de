use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::libs::error::{Result, TablesmithError};
use crate::libs::statement::KeyPolicy;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding working copies; created on first upload.
    pub scratch_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub session_idle_ttl: Duration,
    pub busy_timeout: Duration,
    /// Off by default, matching the file format's own default.
    pub enforce_foreign_keys: bool,
    pub key_policy: KeyPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("tablesmith"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            session_idle_ttl: DEFAULT_SESSION_IDLE_TTL,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            enforce_foreign_keys: false,
            key_policy: KeyPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_key_policy(mut self, policy: KeyPolicy) -> Self {
        self.key_policy = policy;
        self
    }
}

impl FromStr for KeyPolicy {
    type Err = TablesmithError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first_column" | "first-column" | "fallback" => Ok(KeyPolicy::FirstColumnFallback),
            "declared" | "declared_only" | "declared-only" => Ok(KeyPolicy::DeclaredOnly),
            other => Err(TablesmithError::invalid(format!("unknown key policy {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_policy_names() {
        assert_eq!("declared".parse::<KeyPolicy>().unwrap(), KeyPolicy::DeclaredOnly);
        assert_eq!(" First-Column ".parse::<KeyPolicy>().unwrap(), KeyPolicy::FirstColumnFallback);
        assert!("random".parse::<KeyPolicy>().is_err());
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
        assert!(!config.enforce_foreign_keys);
        assert_eq!(config.key_policy, KeyPolicy::FirstColumnFallback);
        assert!(config.scratch_dir.ends_with("tablesmith"));
    }
}

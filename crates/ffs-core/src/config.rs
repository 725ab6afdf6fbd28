//! Mount configuration.

use ffs_error::{FfsError, Result};
use ffs_sync::LockPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Options for one mount, loadable from JSON.
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    /// Name used in logs and diagnostics.
    pub name: String,
    /// Grant policy for inode locks.
    pub lock: LockPolicy,
    /// Log every lock transition at TRACE through the lock observer hook.
    pub trace_transitions: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            name: "ffs".to_owned(),
            lock: LockPolicy::default(),
            trace_transitions: false,
        }
    }
}

impl MountConfig {
    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    ///
    /// `Config` when the JSON is malformed or fails validation.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| FfsError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    ///
    /// # Errors
    ///
    /// `Io` when the file cannot be read, `Config` when it does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FfsError::Config("mount name must not be empty".to_owned()));
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| FfsError::Config(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_uses_defaults() {
        let config = MountConfig::from_json_str("{}").expect("config");
        assert_eq!(config, MountConfig::default());
        assert_eq!(config.lock.max_writer_bypass, 8);
    }

    #[test]
    fn partial_lock_policy_is_merged() {
        let config = MountConfig::from_json_str(
            r#"{"name": "scratch", "lock": {"max_writer_bypass": 0}, "trace_transitions": true}"#,
        )
        .expect("config");
        assert_eq!(config.name, "scratch");
        assert_eq!(config.lock.max_writer_bypass, 0);
        assert!(config.lock.pair_retry_yield);
        assert!(config.trace_transitions);
    }

    #[test]
    fn malformed_and_invalid_configs_are_rejected() {
        assert!(matches!(
            MountConfig::from_json_str("{\"name\": 3}"),
            Err(FfsError::Config(_))
        ));
        assert!(matches!(
            MountConfig::from_json_str("{\"bogus\": true}"),
            Err(FfsError::Config(_))
        ));
        assert!(matches!(
            MountConfig::from_json_str("{\"name\": \"  \"}"),
            Err(FfsError::Config(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"name": "from-file"}}"#).expect("write");
        let config = MountConfig::load(file.path()).expect("load");
        assert_eq!(config.name, "from-file");

        let missing = file.path().with_extension("missing");
        let err = MountConfig::load(&missing).expect_err("missing file");
        assert!(matches!(err, FfsError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound));
    }

    #[test]
    fn pretty_json_round_trips() {
        let config = MountConfig {
            name: "rt".to_owned(),
            ..MountConfig::default()
        };
        let text = config.to_json_pretty().expect("json");
        assert_eq!(MountConfig::from_json_str(&text).expect("parse"), config);
    }
}

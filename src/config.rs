//! TOML session configuration
//!
//! ```toml
//! flavor = "frida"
//! output = "drcov.log"
//! whitelist = ["target.exe", "plugin.dll"]
//!
//! [[custom]]
//! base = "0x10000000"
//! size = 0x4000
//! path = "unpacked.bin"
//! ```
//!
//! Every key is optional. Command line flags override file values.

use crate::drcov::{self, DEFAULT_FLAVOR};
use crate::error::Result;
use crate::module_table::{CustomRegion, Whitelist, WHITELIST_ALL};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Output path used when none is configured
pub const DEFAULT_OUTPUT: &str = "drcov.log";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Tag written on the `DRCOV FLAVOR:` line
    pub flavor: String,
    /// Destination of the coverage file
    pub output: PathBuf,
    /// Host module names to track; `"all"` tracks every module
    pub whitelist: Vec<String>,
    /// Synthetic regions appended after the host modules
    pub custom: Vec<CustomRegion>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flavor: DEFAULT_FLAVOR.to_string(),
            output: PathBuf::from(DEFAULT_OUTPUT),
            whitelist: vec![WHITELIST_ALL.to_string()],
            custom: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        drcov::validate_flavor(&config.flavor)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// An empty list keeps no host modules; `"all"` keeps every one
    pub fn whitelist(&self) -> Whitelist {
        Whitelist::from_names(self.whitelist.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoverageError;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.flavor, "frida");
        assert_eq!(config.output, PathBuf::from("drcov.log"));
        assert_eq!(config.whitelist(), Whitelist::All);
        assert!(config.custom.is_empty());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        assert_eq!(
            SessionConfig::from_toml("").unwrap(),
            SessionConfig::default()
        );
    }

    #[test]
    fn test_full_file() {
        let config = SessionConfig::from_toml(
            r#"
            flavor = "stalker"
            output = "out/cov.drcov"
            whitelist = ["target.exe"]

            [[custom]]
            base = "0x10000000"
            size = 0x4000
            path = "unpacked.bin"

            [[custom]]
            base = 536870912
            size = "4096"
            path = "shellcode"
            "#,
        )
        .unwrap();

        assert_eq!(config.flavor, "stalker");
        assert_eq!(config.output, PathBuf::from("out/cov.drcov"));
        assert!(config.whitelist().allows("target.exe"));
        assert!(!config.whitelist().allows("other.dll"));
        assert_eq!(
            config.custom,
            vec![
                CustomRegion::new(0x1000_0000, 0x4000, "unpacked.bin"),
                CustomRegion::new(0x2000_0000, 4096, "shellcode"),
            ]
        );
    }

    #[test]
    fn test_empty_whitelist_keeps_no_host_modules() {
        let config = SessionConfig::from_toml("whitelist = []").unwrap();
        let whitelist = config.whitelist();
        assert_ne!(whitelist, Whitelist::All);
        assert!(!whitelist.allows("target.exe"));
        assert!(!whitelist.allows(WHITELIST_ALL));
    }

    #[test]
    fn test_omitted_whitelist_means_all() {
        let config = SessionConfig::from_toml("flavor = \"stalker\"").unwrap();
        assert_eq!(config.whitelist(), Whitelist::All);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = SessionConfig::from_toml("flavour = \"x\"").unwrap_err();
        assert!(matches!(err, CoverageError::Config(_)));
    }

    #[test]
    fn test_invalid_flavor_rejected() {
        let err = SessionConfig::from_toml("flavor = \"\"").unwrap_err();
        assert!(matches!(err, CoverageError::InvalidFlavor(_)));
    }
}

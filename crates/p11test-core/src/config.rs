//! Suite configuration
//!
//! Settings are read from a TOML file and then overridden by command-line
//! flags and environment variables in the binary.

use std::fs;
use std::path::{Path, PathBuf};

use cryptoki_sys::{CK_SLOT_ID, CK_ULONG};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::session::SessionSettings;

/// Suite configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Path to the PKCS#11 shared library under test
    pub module: Option<PathBuf>,
    /// Slot to test; the first slot with a token when unset
    pub slot: Option<CK_SLOT_ID>,
    /// Normal user PIN
    pub user_pin: String,
    /// RSA key size for generated keypairs
    pub rsa_modulus_bits: CK_ULONG,
    /// Fixed run seed; random when unset
    #[serde(with = "seed_repr", skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Log operation outputs
    pub verbose: bool,
    /// Case filter in `pos:pos-neg:neg` form
    pub filter: Option<String>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            module: None,
            slot: None,
            user_pin: "1234".to_string(),
            rsa_modulus_bits: 1024,
            seed: None,
            verbose: false,
            filter: None,
        }
    }
}

impl SuiteConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(HarnessError::config)
    }

    /// Load an explicit file, else the default file if present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> HarnessResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Save configuration to disk
    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(HarnessError::serialization)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Per-user configuration file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "ferrohsm", "p11test")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            slot: self.slot,
            user_pin: self.user_pin.clone(),
        }
    }

    /// Name the report uses for the module under test.
    pub fn module_label(&self) -> String {
        self.module
            .as_ref()
            .map_or_else(|| "simulated".to_string(), |path| path.display().to_string())
    }
}

/// TOML integers are signed, so seeds of 2^63 and above are written as
/// decimal strings. Either form is accepted on load.
mod seed_repr {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Seed {
        Integer(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(seed: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match seed {
            None => serializer.serialize_none(),
            Some(seed) => match i64::try_from(*seed) {
                Ok(value) => serializer.serialize_some(&Seed::Integer(value)),
                Err(_) => serializer.serialize_some(&Seed::Text(seed.to_string())),
            },
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Option::<Seed>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Seed::Integer(value)) => u64::try_from(value)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("seed must not be negative, got {value}"))),
            Some(Seed::Text(text)) => text
                .parse()
                .map(Some)
                .map_err(|err| D::Error::custom(format!("invalid seed {text:?}: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("p11test.toml");
        fs::write(&path, "module = \"/usr/lib/softhsm/libsofthsm2.so\"\nseed = 7\n")
            .expect("write");
        let config = SuiteConfig::load(&path).expect("load");
        assert_eq!(
            config.module.as_deref(),
            Some(Path::new("/usr/lib/softhsm/libsofthsm2.so"))
        );
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.user_pin, "1234");
        assert_eq!(config.rsa_modulus_bits, 1024);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let config = SuiteConfig {
            slot: Some(3),
            filter: Some("Signatures/*".to_string()),
            ..SuiteConfig::default()
        };
        config.save(&path).expect("save");
        assert_eq!(SuiteConfig::load(&path).expect("load"), config);
    }

    #[test]
    fn seeds_above_i64_survive_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let config = SuiteConfig {
            seed: Some(0x9000_0000_0000_0000),
            ..SuiteConfig::default()
        };
        config.save(&path).expect("save");
        assert_eq!(SuiteConfig::load(&path).expect("load"), config);

        fs::write(&path, "seed = \"10376293541461622784\"\n").expect("write");
        assert_eq!(
            SuiteConfig::load(&path).expect("load").seed,
            Some(10_376_293_541_461_622_784)
        );
    }

    #[test]
    fn negative_seed_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "seed = -1\n").expect("write");
        assert!(matches!(
            SuiteConfig::load(&path),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        fs::write(&path, "rsa_modulus_bits = \"big\"").expect("write");
        assert!(matches!(
            SuiteConfig::load(&path),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn module_label_defaults_to_simulated() {
        assert_eq!(SuiteConfig::default().module_label(), "simulated");
    }
}

//! Layered node configuration
//!
//! Built-in defaults, then the TOML file, then `LNCHAT_*` environment
//! variables, then command-line flags. Each layer only replaces the keys it
//! sets.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::password;

/// Prefix of every configuration environment variable.
pub const ENV_PREFIX: &str = "LNCHAT_";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub server: ServerConfig,
    pub lnd: LndSection,
    pub database: DatabaseConfig,
    pub app: AppConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address handed to a management front end.
    pub address: String,
    pub user: String,
    /// Argon2 PHC string; empty disables the check.
    pub pwdhash: String,
    /// Seconds to wait for the feeds before aborting them.
    pub graceful_shutdown_timeout: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LndSection {
    /// REST gateway, `host:port` or a full URL.
    pub address: String,
    pub tls_path: Option<PathBuf>,
    pub macaroon_path: Option<PathBuf>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Snapshot file; state stays in memory when unset.
    pub db_path: Option<PathBuf>,
    /// 32-byte key sealing the snapshot.
    pub key_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub default_fee_limit_msat: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerConfig::default(),
            lnd: LndSection::default(),
            database: DatabaseConfig::default(),
            app: AppConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:10380".to_string(),
            user: String::new(),
            pwdhash: String::new(),
            graceful_shutdown_timeout: 10,
        }
    }
}

impl Default for LndSection {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            tls_path: None,
            macaroon_path: None,
            timeout_secs: 30,
        }
    }
}

/// Values given on the command line; `None` leaves the lower layers alone.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub lnd_address: Option<String>,
    pub lnd_tls_path: Option<PathBuf>,
    pub lnd_macaroon_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub db_key_path: Option<PathBuf>,
    pub default_fee_limit_msat: Option<i64>,
    pub graceful_shutdown_timeout: Option<u64>,
}

impl Config {
    /// Resolve every layer. `env` looks up one variable by full name.
    pub fn load(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
        overrides: &Overrides,
    ) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Apply `LNCHAT_<SECTION>_<KEY>` variables.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| env(&format!("{}{}", ENV_PREFIX, key));

        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("SERVER_ADDRESS") {
            self.server.address = v;
        }
        if let Some(v) = var("SERVER_USER") {
            self.server.user = v;
        }
        if let Some(v) = var("SERVER_PWDHASH") {
            self.server.pwdhash = v;
        }
        if let Some(v) = var("SERVER_GRACEFUL_SHUTDOWN_TIMEOUT") {
            self.server.graceful_shutdown_timeout = parse_number("SERVER_GRACEFUL_SHUTDOWN_TIMEOUT", &v)?;
        }
        if let Some(v) = var("LND_ADDRESS") {
            self.lnd.address = v;
        }
        if let Some(v) = var("LND_TLS_PATH") {
            self.lnd.tls_path = Some(v.into());
        }
        if let Some(v) = var("LND_MACAROON_PATH") {
            self.lnd.macaroon_path = Some(v.into());
        }
        if let Some(v) = var("LND_TIMEOUT_SECS") {
            self.lnd.timeout_secs = parse_number("LND_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("DATABASE_DB_PATH") {
            self.database.db_path = Some(v.into());
        }
        if let Some(v) = var("DATABASE_KEY_PATH") {
            self.database.key_path = Some(v.into());
        }
        if let Some(v) = var("APP_DEFAULT_FEE_LIMIT_MSAT") {
            self.app.default_fee_limit_msat = parse_number("APP_DEFAULT_FEE_LIMIT_MSAT", &v)?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(v) = &o.log_level {
            self.log_level = v.clone();
        }
        if let Some(v) = &o.lnd_address {
            self.lnd.address = v.clone();
        }
        if let Some(v) = &o.lnd_tls_path {
            self.lnd.tls_path = Some(v.clone());
        }
        if let Some(v) = &o.lnd_macaroon_path {
            self.lnd.macaroon_path = Some(v.clone());
        }
        if let Some(v) = &o.db_path {
            self.database.db_path = Some(v.clone());
        }
        if let Some(v) = &o.db_key_path {
            self.database.key_path = Some(v.clone());
        }
        if let Some(v) = o.default_fee_limit_msat {
            self.app.default_fee_limit_msat = v;
        }
        if let Some(v) = o.graceful_shutdown_timeout {
            self.server.graceful_shutdown_timeout = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.server.pwdhash.is_empty() {
            password::check_phc(&self.server.pwdhash).context("server.pwdhash")?;
        }
        if self.lnd.address.is_empty() {
            bail!("lnd.address must be set");
        }
        if self.app.default_fee_limit_msat < 0 {
            bail!("app.default_fee_limit_msat must not be negative");
        }
        if self.database.key_path.is_some() && self.database.db_path.is_none() {
            bail!("database.key_path needs database.db_path");
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{}{}={:?}: {}", ENV_PREFIX, key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::load(None, env(&[]), &Overrides::default()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.graceful_shutdown_timeout, 10);
    }

    #[test]
    fn test_layer_precedence() {
        let file = write_config(
            r#"
log_level = "debug"

[lnd]
address = "file:8080"
timeout_secs = 5

[app]
default_fee_limit_msat = 1000
"#,
        );
        let vars = env(&[
            ("LNCHAT_LND_ADDRESS", "env:8080"),
            ("LNCHAT_APP_DEFAULT_FEE_LIMIT_MSAT", "2000"),
        ]);
        let overrides = Overrides {
            default_fee_limit_msat: Some(3000),
            ..Overrides::default()
        };

        let config = Config::load(Some(file.path()), vars, &overrides).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.lnd.timeout_secs, 5);
        assert_eq!(config.lnd.address, "env:8080");
        assert_eq!(config.app.default_fee_limit_msat, 3000);
        // Untouched keys keep their defaults.
        assert_eq!(config.server.graceful_shutdown_timeout, 10);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let file = write_config("[lnd]\nadress = \"typo:1\"\n");
        assert!(Config::load(Some(file.path()), env(&[]), &Overrides::default()).is_err());
    }

    #[test]
    fn test_bad_env_number() {
        let err = Config::load(
            None,
            env(&[("LNCHAT_LND_TIMEOUT_SECS", "soon")]),
            &Overrides::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("LNCHAT_LND_TIMEOUT_SECS"));
    }

    #[test]
    fn test_pwdhash_must_be_phc() {
        let bad = env(&[("LNCHAT_SERVER_PWDHASH", "hunter2")]);
        assert!(Config::load(None, bad, &Overrides::default()).is_err());

        let hash = password::hash_password("hunter2").unwrap();
        let good = env(&[("LNCHAT_SERVER_PWDHASH", hash.as_str())]);
        assert!(Config::load(None, good, &Overrides::default()).is_ok());
    }

    #[test]
    fn test_key_without_database() {
        let overrides = Overrides {
            db_key_path: Some("key".into()),
            ..Overrides::default()
        };
        assert!(Config::load(None, env(&[]), &overrides).is_err());
    }
}

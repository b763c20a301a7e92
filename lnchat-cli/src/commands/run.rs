//! Run command - serve the node until interrupted

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use lnchat_lib::lnd::{LndConfig, LndRestClient};
use lnchat_lib::{Amount, LightningClient, MessageOptions};
use lnchat_node::{Bus, MessageService, ServiceConfig, Supervisor};
use lnchat_store::{load_key_file, KvStore, Store};

use crate::config::{Config, Overrides};
use crate::ui;

#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "lnchat_node=debug"
    #[arg(long)]
    pub log_level: Option<String>,

    /// LND REST address (host:port or URL)
    #[arg(long)]
    pub lnd_address: Option<String>,

    /// LND TLS certificate
    #[arg(long)]
    pub lnd_tls_path: Option<PathBuf>,

    /// LND macaroon
    #[arg(long)]
    pub lnd_macaroon_path: Option<PathBuf>,

    /// Database snapshot file
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Database encryption key file
    #[arg(long)]
    pub db_key_path: Option<PathBuf>,

    /// Default routing fee limit per payment, in msat
    #[arg(long)]
    pub default_fee_limit_msat: Option<i64>,

    /// Seconds to wait for a clean shutdown
    #[arg(long)]
    pub graceful_shutdown_timeout: Option<u64>,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            log_level: self.log_level.clone(),
            lnd_address: self.lnd_address.clone(),
            lnd_tls_path: self.lnd_tls_path.clone(),
            lnd_macaroon_path: self.lnd_macaroon_path.clone(),
            db_path: self.db_path.clone(),
            db_key_path: self.db_key_path.clone(),
            default_fee_limit_msat: self.default_fee_limit_msat,
            graceful_shutdown_timeout: self.graceful_shutdown_timeout,
        }
    }
}

pub async fn run(args: RunArgs) -> Result<()> {
    let config = Config::load(
        args.config.as_deref(),
        |key| std::env::var(key).ok(),
        &args.overrides(),
    )?;
    crate::init_tracing(&config.log_level);
    tracing::info!(
        lnd = %config.lnd.address,
        default_fee_limit_msat = config.app.default_fee_limit_msat,
        "configuration loaded"
    );

    let client = connect_lnd(&config)?;
    let store = open_store(&config)?;
    let service_config = ServiceConfig {
        default_options: MessageOptions::new(Amount(config.app.default_fee_limit_msat), false),
        ..ServiceConfig::default()
    };
    let service = MessageService::new(client, store, Arc::new(Bus::new()), service_config)
        .await
        .context("Failed to reach the lnd node")?;
    let service = Arc::new(service);

    ui::header("lnchat");
    ui::key_value("Node", &service.self_address().to_string());
    ui::key_value("LND", &config.lnd.address);
    ui::key_value(
        "Database",
        &config
            .database
            .db_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in memory".to_string()),
    );
    ui::separator();

    let supervisor = Supervisor::init(Arc::clone(&service));
    let mut messages = service.subscribe_messages();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                println!();
                break;
            }
            event = messages.recv() => match event {
                Some(aggregate) => ui::message(&aggregate),
                None => {
                    ui::warning("Message bus closed");
                    break;
                }
            }
        }
    }

    ui::info("Shutting down...");
    let grace = Duration::from_secs(config.server.graceful_shutdown_timeout);
    match supervisor.shutdown(grace).await {
        Ok(()) => {
            ui::success("Stopped");
            Ok(())
        }
        Err(e) => {
            ui::error(&format!("Unclean shutdown: {}", e));
            Err(e).context("Shutdown failed")
        }
    }
}

fn connect_lnd(config: &Config) -> Result<Arc<dyn LightningClient>> {
    let macaroon = config
        .lnd
        .macaroon_path
        .as_deref()
        .context("lnd.macaroon_path must be set")?;
    let lnd = LndConfig::from_files(
        rest_url(&config.lnd.address),
        macaroon,
        config.lnd.tls_path.as_deref(),
    )
    .context("Failed to load lnd credentials")?
    .with_timeout(config.lnd.timeout_secs);
    let client = LndRestClient::new(lnd).context("Failed to build lnd client")?;
    Ok(Arc::new(client))
}

fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    let Some(path) = &config.database.db_path else {
        ui::warning("No database.db_path set; state is kept in memory only");
        return Ok(Arc::new(KvStore::in_memory()));
    };
    let key = config
        .database
        .key_path
        .as_ref()
        .map(|p| load_key_file(p))
        .transpose()
        .context("Failed to load database key")?;
    let store = KvStore::open(path, key.as_deref())
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

/// `host:port` becomes an https URL; full URLs pass through.
fn rest_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("https://{}", address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_url() {
        assert_eq!(rest_url("localhost:8080"), "https://localhost:8080");
        assert_eq!(rest_url("http://10.0.0.1:8080"), "http://10.0.0.1:8080");
    }

    #[test]
    fn test_missing_macaroon() {
        let err = connect_lnd(&Config::default()).err().unwrap();
        assert!(err.to_string().contains("macaroon_path"));
    }

    #[test]
    fn test_store_without_path_is_in_memory() {
        assert!(open_store(&Config::default()).is_ok());
    }

    #[test]
    fn test_store_key_must_be_32_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("key");
        std::fs::write(&key, b"short").unwrap();

        let mut config = Config::default();
        config.database.db_path = Some(dir.path().join("db.json"));
        config.database.key_path = Some(key);
        assert!(open_store(&config).is_err());
    }
}

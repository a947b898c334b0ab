//! Command-line options shared by `simple-storage` and
//! `simple-storage-deploy`. Every host option has an environment fallback.

use std::{fs, path::PathBuf, time::Duration};

use clap::Args;
use ed25519_dalek::SigningKey;
use num_bigint::BigUint;
use tracing_subscriber::EnvFilter;

use crate::{
    contracts::parse_integer,
    driver::DriverConfig,
    host::{
        devnet::{Devnet, DevnetConfig},
        HostError,
    },
    tx::{parse_signing_key, KeyError},
};

pub const DEFAULT_LEDGER_PATH: &str = ".simple-storage/ledger.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Host(#[from] HostError),
}

#[derive(Debug, Clone, Args)]
pub struct HostOptions {
    /// Ledger file of the local devnet.
    #[arg(long, global = true, env = "SIMPLE_STORAGE_LEDGER", default_value = DEFAULT_LEDGER_PATH)]
    pub ledger: PathBuf,

    /// Keep the ledger in memory; nothing is read or written on disk.
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Ed25519 secret key, 64 hex chars. Takes precedence over --key-file.
    #[arg(long, global = true, env = "SIMPLE_STORAGE_SK_HEX", hide_env_values = true)]
    pub sk_hex: Option<String>,

    /// File holding the hex secret key, as written by `keygen`.
    #[arg(long, global = true, env = "SIMPLE_STORAGE_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Block period in milliseconds; 0 seals a block whenever a
    /// confirmation is awaited.
    #[arg(long, global = true, default_value_t = 0)]
    pub block_time_ms: u64,

    /// Give up waiting for a confirmation after this many milliseconds.
    #[arg(long, global = true)]
    pub confirmation_timeout_ms: Option<u64>,
}

impl HostOptions {
    pub fn signing_key(&self) -> Result<Option<SigningKey>, ConfigError> {
        if let Some(sk_hex) = &self.sk_hex {
            return Ok(Some(parse_signing_key(sk_hex)?));
        }
        let Some(path) = &self.key_file else {
            return Ok(None);
        };
        let sk_hex = fs::read_to_string(path).map_err(|source| ConfigError::KeyFile {
            path: path.clone(),
            source,
        })?;
        Ok(Some(parse_signing_key(&sk_hex)?))
    }

    pub fn devnet_config(&self) -> DevnetConfig {
        DevnetConfig {
            path: (!self.ephemeral).then(|| self.ledger.clone()),
            block_time: (self.block_time_ms > 0).then(|| Duration::from_millis(self.block_time_ms)),
            confirmation_timeout: self.confirmation_timeout_ms.map(Duration::from_millis),
        }
    }

    pub async fn connect(&self) -> Result<Devnet, ConfigError> {
        let signer = self.signing_key()?;
        Ok(Devnet::open(self.devnet_config(), signer).await?)
    }
}

#[derive(Debug, Clone, Args)]
pub struct DriverArgs {
    /// Value to write; repeat to write several in sequence.
    #[arg(long = "value", value_parser = parse_integer, default_value = "50")]
    pub values: Vec<BigUint>,
}

impl From<DriverArgs> for DriverConfig {
    fn from(args: DriverArgs) -> Self {
        DriverConfig {
            values: args.values,
        }
    }
}

/// Logs go to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

//! Relay configuration file handling.

use std::{fs, path::{Path, PathBuf}};

use btp_link::Direction;
use btp_types::BtpAddress;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub direction: Direction,
    /// Where per-link state is persisted.
    pub base_dir: PathBuf,
    #[serde(default)]
    pub log: LogConfig,
    pub src: ChainConfig,
    pub dst: ChainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level(), filename: None }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// Which adapter family serves a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainKind {
    #[serde(rename = "icon-btp2")]
    IconBtp2,
    #[serde(rename = "icon-bridge")]
    IconBridge,
    #[serde(rename = "eth-bridge")]
    EthBridge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub address: BtpAddress,
    pub endpoint: String,
    #[serde(rename = "type")]
    pub kind: ChainKind,
    /// Path to the signer key material: a hex key file, or for EVM chains
    /// an encrypted JSON key store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_store: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_password: Option<String>,
    /// Path whose contents override `key_password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<PathBuf>,
    #[serde(default)]
    pub options: ChainOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_limit: Option<i64>,
    /// Websocket endpoint for event-log subscription; polling otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_endpoint: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("read config {}", path.display()))?;
        toml::from_str(&raw).wrap_err_with(|| format!("parse config {}", path.display()))
    }

    /// Serializes the effective configuration.
    pub fn save(&self, path: &Path) -> eyre::Result<()> {
        let raw = toml::to_string_pretty(self).wrap_err("serialize config")?;
        fs::write(path, raw).wrap_err_with(|| format!("write config {}", path.display()))?;
        Ok(())
    }
}

impl ChainConfig {
    pub fn key_store(&self) -> eyre::Result<&Path> {
        self.key_store
            .as_deref()
            .ok_or_else(|| eyre::eyre!("{}: key_store is required to send", self.address))
    }

    /// The key-store passphrase; the secret file wins over the inline
    /// password.
    pub fn resolve_password(&self) -> eyre::Result<Option<String>> {
        if let Some(secret) = &self.key_secret {
            let raw = fs::read_to_string(secret)
                .wrap_err_with(|| format!("read key secret {}", secret.display()))?;
            return Ok(Some(raw.trim().to_owned()));
        }
        Ok(self.key_password.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
direction = "both"
base_dir = "/var/lib/btp-relay"

[log]
level = "debug"

[src]
address = "btp://0x2.icon/cx9c72cbb5a28bf5ae4fcfa63c9abab9b263be1737"
endpoint = "https://lisbon.net.solidwallet.io/api/v3"
type = "icon-btp2"
key_store = "/keys/icon.hex"

[dst]
address = "btp://0x61.bsc/0x5425a23dbf7bba5d53c93fec270b997e8b13be09"
endpoint = "https://data-seed-prebsc-1-s1.binance.org:8545"
type = "eth-bridge"
key_store = "/keys/bsc.json"
key_password = "inline"

[dst.options]
start_height = 1000
ws_endpoint = "wss://data-seed-prebsc-1-s1.binance.org:8546"
"#;

    #[test]
    fn example_config_parses() {
        let cfg: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.direction, Direction::Both);
        assert_eq!(cfg.src.kind, ChainKind::IconBtp2);
        assert_eq!(cfg.dst.kind, ChainKind::EthBridge);
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.dst.options.start_height, Some(1000));
        assert!(cfg.dst.options.ws_endpoint.is_some());
        assert_eq!(cfg.src.options.step_limit, None);
    }

    #[test]
    fn save_round_trips() {
        let cfg: Config = toml::from_str(EXAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        cfg.save(&path).unwrap();
        let back = Config::load(&path).unwrap();
        assert_eq!(back.src.address, cfg.src.address);
        assert_eq!(back.dst.kind, cfg.dst.kind);
    }

    #[test]
    fn secret_file_overrides_inline_password() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret");
        std::fs::write(&secret_path, "from-file\n").unwrap();

        let mut cfg: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.dst.resolve_password().unwrap(), Some("inline".to_owned()));
        cfg.dst.key_secret = Some(secret_path);
        assert_eq!(cfg.dst.resolve_password().unwrap(), Some("from-file".to_owned()));
    }
}

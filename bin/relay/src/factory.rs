//! Builds links out of chain configurations: the receiver comes from the
//! source chain's adapter family, the sender from the destination's.

use std::{fs, path::Path, sync::Arc};

use alloy::signers::local::PrivateKeySigner;
use btp_ethbr::{EthBridgeReceiver, EthSender};
use btp_icon::{Btp2Receiver, IconBridgeReceiver, IconClient, IconSender, IconWallet, SectionProver};
use btp_link::{Link, Receiver, Relay};
use btp_store::LinkStore;
use btp_types::Sender;
use eyre::WrapErr;

use crate::config::{ChainConfig, ChainKind, Config};

pub fn build_relay(cfg: &Config) -> eyre::Result<Relay> {
    let mut relay = Relay::new();
    match cfg.direction {
        btp_link::Direction::Front => {
            relay.add_link("front", build_link(&cfg.src, &cfg.dst, &cfg.base_dir)?);
        }
        btp_link::Direction::Reverse => {
            relay.add_link("reverse", build_link(&cfg.dst, &cfg.src, &cfg.base_dir)?);
        }
        btp_link::Direction::Both => {
            relay.add_link("front", build_link(&cfg.src, &cfg.dst, &cfg.base_dir)?);
            relay.add_link("reverse", build_link(&cfg.dst, &cfg.src, &cfg.base_dir)?);
        }
    }
    Ok(relay)
}

fn build_link(src: &ChainConfig, dst: &ChainConfig, base_dir: &Path) -> eyre::Result<Link> {
    let receiver = build_receiver(src, dst, base_dir)
        .wrap_err_with(|| format!("build receiver for {}", src.address))?;
    let sender = build_sender(src, dst)
        .wrap_err_with(|| format!("build sender for {}", dst.address))?;
    Ok(Link::new(src.address.clone(), receiver, sender))
}

fn build_receiver(
    src: &ChainConfig,
    dst: &ChainConfig,
    base_dir: &Path,
) -> eyre::Result<Box<dyn Receiver>> {
    Ok(match src.kind {
        ChainKind::IconBtp2 => Box::new(Btp2Receiver::new(
            src.address.clone(),
            dst.address.clone(),
            IconClient::new(&src.endpoint)?,
            Arc::new(SectionProver),
        )),
        ChainKind::IconBridge => Box::new(IconBridgeReceiver::new(
            src.address.clone(),
            dst.address.clone(),
            IconClient::new(&src.endpoint)?,
        )),
        ChainKind::EthBridge => {
            let store = LinkStore::open(base_dir, &src.address.network_address())
                .wrap_err("open link store")?;
            Box::new(EthBridgeReceiver::new(
                src.address.clone(),
                dst.address.clone(),
                src.endpoint.clone(),
                src.options.ws_endpoint.clone(),
                src.options.start_height.unwrap_or(0),
                store,
            ))
        }
    })
}

fn build_sender(src: &ChainConfig, dst: &ChainConfig) -> eyre::Result<Box<dyn Sender>> {
    Ok(match dst.kind {
        ChainKind::IconBtp2 | ChainKind::IconBridge => {
            let key_hex = fs::read_to_string(dst.key_store()?)
                .wrap_err("read icon key store")?;
            let wallet = IconWallet::from_key_hex(&key_hex)?;
            Box::new(IconSender::new(
                src.address.clone(),
                dst.address.clone(),
                IconClient::new(&dst.endpoint)?,
                Arc::new(wallet),
                dst.options.step_limit,
            ))
        }
        ChainKind::EthBridge => {
            let signer = load_evm_signer(dst)?;
            Box::new(EthSender::new(
                src.address.clone(),
                dst.address.clone(),
                dst.endpoint.clone(),
                signer,
            )?)
        }
    })
}

/// A hex key file, or an encrypted JSON key store unlocked with the
/// configured password.
fn load_evm_signer(dst: &ChainConfig) -> eyre::Result<PrivateKeySigner> {
    let path = dst.key_store()?;
    let raw = fs::read_to_string(path)
        .wrap_err_with(|| format!("read key store {}", path.display()))?;
    if raw.trim_start().starts_with('{') {
        let password = dst
            .resolve_password()?
            .ok_or_else(|| eyre::eyre!("{}: encrypted key store needs a password", dst.address))?;
        PrivateKeySigner::decrypt_keystore(path, password).wrap_err("decrypt key store")
    } else {
        raw.trim()
            .trim_start_matches("0x")
            .parse()
            .wrap_err("parse hex key")
    }
}

#[cfg(test)]
mod tests {
    use btp_link::Direction;
    use btp_types::BtpAddress;

    use super::*;
    use crate::config::{ChainOptions, LogConfig};

    fn chain(kind: ChainKind, address: &str, key_store: Option<&Path>) -> ChainConfig {
        ChainConfig {
            address: address.parse::<BtpAddress>().unwrap(),
            endpoint: "http://localhost:9080/api/v3".to_owned(),
            kind,
            key_store: key_store.map(Path::to_path_buf),
            key_password: None,
            key_secret: None,
            options: ChainOptions::default(),
        }
    }

    #[test]
    fn builds_links_for_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let icon_key = dir.path().join("icon.hex");
        std::fs::write(
            &icon_key,
            "47e33fc0789d4a84a0b0a56fc2c1a0a42ec63ab06c4e832d5f8d1f0f24dbbdc2",
        )
        .unwrap();
        let evm_key = dir.path().join("evm.hex");
        std::fs::write(
            &evm_key,
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        )
        .unwrap();

        let cfg = Config {
            direction: Direction::Both,
            base_dir: dir.path().join("data"),
            log: LogConfig::default(),
            src: chain(
                ChainKind::EthBridge,
                "btp://0x61.bsc/0x5425a23dbf7bba5d53c93fec270b997e8b13be09",
                Some(&evm_key),
            ),
            dst: chain(ChainKind::IconBtp2, "btp://0x2.icon/cx11", Some(&icon_key)),
        };
        build_relay(&cfg).unwrap();
    }

    #[test]
    fn missing_key_store_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            direction: Direction::Front,
            base_dir: dir.path().to_path_buf(),
            log: LogConfig::default(),
            src: chain(ChainKind::IconBridge, "btp://0x2.icon/cx11", None),
            dst: chain(
                ChainKind::EthBridge,
                "btp://0x61.bsc/0x5425a23dbf7bba5d53c93fec270b997e8b13be09",
                None,
            ),
        };
        assert!(build_relay(&cfg).is_err());
    }
}

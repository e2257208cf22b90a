//! Per-link persistent state.
//!
//! One store per link, keyed by the source network address. It remembers the
//! last observed source height and caches per-block proof payloads so a
//! replaying receiver can rebuild its observation backlog after a restart.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Heights are saved every this many source blocks; finalization events
/// flush unconditionally.
pub const SAVE_HEIGHT_INTERVAL: i64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store {path}: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid payload encoding: {0}")]
    Encoding(#[from] const_hex::FromHexError),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    last_receive_height: i64,
    /// Cached per-block payloads, hex-encoded, ordered by height.
    #[serde(default)]
    blocks: BTreeMap<i64, String>,
}

/// File-backed store for one link direction.
///
/// Writes go to `<base_dir>/<network_address>.json` via a temp-file rename,
/// so a crash mid-save leaves the previous state intact.
#[derive(Debug)]
pub struct LinkStore {
    path: PathBuf,
    state: StoreState,
    last_saved_height: i64,
}

impl LinkStore {
    pub fn open(base_dir: &Path, network_address: &str) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let path = base_dir.join(format!("{network_address}.json"));
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                StoreError::Corrupt { path: path.display().to_string(), source }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        let last_saved_height = state.last_receive_height;
        Ok(Self { path, state, last_saved_height })
    }

    pub fn last_receive_height(&self) -> i64 {
        self.state.last_receive_height
    }

    /// Records a newly observed height, persisting on the save interval.
    pub fn set_last_receive_height(&mut self, height: i64) -> Result<()> {
        self.state.last_receive_height = height;
        if height - self.last_saved_height >= SAVE_HEIGHT_INTERVAL {
            self.flush()?;
        }
        Ok(())
    }

    /// Caches the proof payload observed at `height`.
    pub fn put_block(&mut self, height: i64, payload: &[u8]) {
        self.state.blocks.insert(height, const_hex::encode(payload));
    }

    /// Cached payloads strictly above `height`, ascending.
    pub fn blocks_after(&self, height: i64) -> Result<Vec<(i64, Vec<u8>)>> {
        self.state
            .blocks
            .range(height + 1..)
            .map(|(h, hex)| Ok((*h, const_hex::decode(hex)?)))
            .collect()
    }

    /// Drops all cached payloads at or below `height` and persists.
    pub fn prune_through(&mut self, height: i64) -> Result<()> {
        self.state.blocks = self.state.blocks.split_off(&(height + 1));
        self.flush()
    }

    /// Discards everything, for a fresh start of the link.
    pub fn reset(&mut self) -> Result<()> {
        self.state = StoreState::default();
        self.flush()
    }

    /// Writes the current state out unconditionally.
    pub fn flush(&mut self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&self.state).expect("state serializes"))?;
        fs::rename(&tmp, &self.path)?;
        self.last_saved_height = self.state.last_receive_height;
        Ok(())
    }
}

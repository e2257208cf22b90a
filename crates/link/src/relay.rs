//! Runs one link per configured direction.

use std::{fmt, str::FromStr};

use btp_types::{RelayError, Result};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::link::Link;

/// Which directions to relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// src -> dst
    Front,
    /// dst -> src
    Reverse,
    Both,
}

impl FromStr for Direction {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "front" => Ok(Self::Front),
            "reverse" => Ok(Self::Reverse),
            "both" => Ok(Self::Both),
            other => Err(RelayError::Config(format!("unknown direction: {other}"))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Front => "front",
            Self::Reverse => "reverse",
            Self::Both => "both",
        })
    }
}

/// Supervises the configured links. Each runs independently; the first
/// terminal error aborts the others and propagates.
pub struct Relay {
    links: Vec<(String, Link)>,
}

impl Relay {
    pub fn new() -> Self {
        Self { links: Vec::new() }
    }

    pub fn add_link(&mut self, name: impl Into<String>, link: Link) {
        self.links.push((name.into(), link));
    }

    pub async fn run(self) -> Result<()> {
        let mut set = JoinSet::new();
        for (name, link) in self.links {
            info!(%name, "starting link");
            set.spawn(async move { (name, link.run().await) });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(%name, "link stopped"),
                Ok((name, Err(e))) => {
                    error!(%name, error = %e, "link failed, shutting down");
                    set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    set.abort_all();
                    return Err(RelayError::InvalidState(format!("link task aborted: {e}")));
                }
            }
        }
        Ok(())
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses_and_prints() {
        for (s, d) in [
            ("front", Direction::Front),
            ("reverse", Direction::Reverse),
            ("both", Direction::Both),
        ] {
            assert_eq!(s.parse::<Direction>().unwrap(), d);
            assert_eq!(d.to_string(), s);
        }
        assert!("sideways".parse::<Direction>().is_err());
    }
}

//! BTP addresses: `protocol://networkId.blockchain/contract`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Uniquely names a chain endpoint and its BMC contract.
///
/// Example: `btp://0x2.icon/cx9c72cbb5a28bf5ae4fcfa63c9abab9b263be1737`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BtpAddress {
    protocol: String,
    network_id: String,
    blockchain: String,
    contract: String,
}

impl BtpAddress {
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The network id portion, e.g. `0x2` of `0x2.icon`.
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn blockchain(&self) -> &str {
        &self.blockchain
    }

    pub fn contract_address(&self) -> &str {
        &self.contract
    }

    /// `networkId.blockchain`, the key under which per-link state is kept.
    pub fn network_address(&self) -> String {
        format!("{}.{}", self.network_id, self.blockchain)
    }
}

impl FromStr for BtpAddress {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RelayError::IllegalArgument(format!("invalid btp address: {s}"));
        let (protocol, rest) = s.split_once("://").ok_or_else(invalid)?;
        let (net, contract) = rest.split_once('/').ok_or_else(invalid)?;
        let (network_id, blockchain) = net.split_once('.').ok_or_else(invalid)?;
        if protocol.is_empty() || network_id.is_empty() || blockchain.is_empty()
            || contract.is_empty()
        {
            return Err(invalid());
        }
        Ok(Self {
            protocol: protocol.to_owned(),
            network_id: network_id.to_owned(),
            blockchain: blockchain.to_owned(),
            contract: contract.to_owned(),
        })
    }
}

impl TryFrom<String> for BtpAddress {
    type Error = RelayError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BtpAddress> for String {
    fn from(a: BtpAddress) -> Self {
        a.to_string()
    }
}

impl fmt::Display for BtpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}.{}/{}",
            self.protocol, self.network_id, self.blockchain, self.contract
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_icon_address() {
        let a: BtpAddress = "btp://0x2.icon/cx9c72cbb5a28bf5ae4fcfa63c9abab9b263be1737"
            .parse()
            .unwrap();
        assert_eq!(a.protocol(), "btp");
        assert_eq!(a.network_id(), "0x2");
        assert_eq!(a.blockchain(), "icon");
        assert_eq!(
            a.contract_address(),
            "cx9c72cbb5a28bf5ae4fcfa63c9abab9b263be1737"
        );
        assert_eq!(a.network_address(), "0x2.icon");
    }

    #[test]
    fn display_round_trips() {
        let s = "btp://0x61.bsc/0x0123456789abcdef0123456789abcdef01234567";
        let a: BtpAddress = s.parse().unwrap();
        assert_eq!(a.to_string(), s);
    }

    #[test]
    fn rejects_malformed_addresses() {
        for s in ["", "btp://icon/cx0", "btp://0x2.icon", "0x2.icon/cx0", "btp:///cx0"] {
            assert!(s.parse::<BtpAddress>().is_err(), "accepted {s:?}");
        }
    }

    #[test]
    fn serde_as_string() {
        let a: BtpAddress = "btp://0x2.icon/cx00".parse().unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"btp://0x2.icon/cx00\"");
        let back: BtpAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}

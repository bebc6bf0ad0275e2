//! Node header signing.
//!
//! Every connection opens with an `X-Lbdb-Node` value proving the sender
//! knows the cluster signature:
//!
//! ```text
//! hex(address) "." hex(hmac_sha256(signature, address "|" timestamp))
//! ```
//!
//! A rotated signature is staged with [`NodeSigner::set_next`] and becomes
//! active with [`NodeSigner::activate`]. Headers signed with either the
//! active or the staged key verify, so nodes can rotate one at a time.

use std::sync::RwLock;

use hmac::{Hmac, Mac};
use litebase_proto::constants::NODE_HEADER_MAX_SKEW_SECS;
use litebase_proto::error::{LbError, LbResult};
use litebase_proto::node::NodeAddress;
use sha2::Sha256;
use tracing::{info, warn};

struct SignerKeys {
    active: String,
    next: Option<String>,
}

/// Signs and verifies node headers with the cluster signature.
pub struct NodeSigner {
    keys: RwLock<SignerKeys>,
}

type HmacSha256 = Hmac<Sha256>;

fn header_mac(key: &str, address: &str, timestamp: u64) -> HmacSha256 {
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    };
    mac.update(address.as_bytes());
    mac.update(b"|");
    mac.update(timestamp.to_string().as_bytes());
    mac
}

fn sign_with(key: &str, address: &str, timestamp: u64) -> String {
    hex::encode(header_mac(key, address, timestamp).finalize().into_bytes())
}

fn verify_with(key: &str, address: &str, timestamp: u64, tag: &[u8]) -> bool {
    header_mac(key, address, timestamp).verify_slice(tag).is_ok()
}

impl NodeSigner {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            keys: RwLock::new(SignerKeys {
                active: signature.into(),
                next: None,
            }),
        }
    }

    /// Produce the header value for `address` at `timestamp` (unix seconds).
    pub fn sign(&self, address: &NodeAddress, timestamp: u64) -> String {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        format!(
            "{}.{}",
            hex::encode(address.as_str()),
            sign_with(&keys.active, address.as_str(), timestamp)
        )
    }

    /// Verify a header and return the sender address it names.
    pub fn verify(&self, header: &str, timestamp: u64, now: u64) -> LbResult<NodeAddress> {
        if timestamp.abs_diff(now) > NODE_HEADER_MAX_SKEW_SECS {
            warn!("signature: header timestamp skew too large ({} vs {})", timestamp, now);
            return Err(LbError::Unauthorized);
        }

        let (encoded, mac) = header.split_once('.').ok_or(LbError::Unauthorized)?;
        let raw = hex::decode(encoded).map_err(|_| LbError::Unauthorized)?;
        let address = String::from_utf8(raw).map_err(|_| LbError::Unauthorized)?;
        let tag = hex::decode(mac).map_err(|_| LbError::Unauthorized)?;

        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let matches_active = verify_with(&keys.active, &address, timestamp, &tag);
        let matches_next = keys
            .next
            .as_deref()
            .map(|next| verify_with(next, &address, timestamp, &tag))
            .unwrap_or(false);
        if !matches_active && !matches_next {
            return Err(LbError::Unauthorized);
        }

        address.parse()
    }

    /// Stage the next signature; it is accepted but not yet used for signing.
    pub fn set_next(&self, signature: impl Into<String>) {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        keys.next = Some(signature.into());
        info!("signature: next signature staged");
    }

    /// Make `signature` the active signing key.
    pub fn activate(&self, signature: impl Into<String>) {
        let signature = signature.into();
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        if keys.next.as_deref() == Some(signature.as_str()) {
            keys.next = None;
        }
        keys.active = signature;
        info!("signature: signature activated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> NodeAddress {
        NodeAddress::new("10.0.0.1", 8080)
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = NodeSigner::new("secret");
        let header = signer.sign(&addr(), 1_000);
        assert_eq!(signer.verify(&header, 1_000, 1_005).unwrap(), addr());
    }

    #[test]
    fn test_wrong_signature_rejected() {
        let signer = NodeSigner::new("secret");
        let other = NodeSigner::new("other");
        let header = other.sign(&addr(), 1_000);
        assert_eq!(signer.verify(&header, 1_000, 1_000), Err(LbError::Unauthorized));
    }

    #[test]
    fn test_skew_rejected() {
        let signer = NodeSigner::new("secret");
        let header = signer.sign(&addr(), 1_000);
        assert_eq!(signer.verify(&header, 1_000, 2_000), Err(LbError::Unauthorized));
    }

    #[test]
    fn test_tampered_timestamp_rejected() {
        let signer = NodeSigner::new("secret");
        let header = signer.sign(&addr(), 1_000);
        assert_eq!(signer.verify(&header, 1_001, 1_001), Err(LbError::Unauthorized));
    }

    #[test]
    fn test_rotation_accepts_staged_key() {
        let old_node = NodeSigner::new("v1");
        let rotated_node = NodeSigner::new("v1");
        rotated_node.set_next("v2");
        rotated_node.activate("v2");

        // The old node stages v2 and still accepts headers from the rotated node.
        old_node.set_next("v2");
        let header = rotated_node.sign(&addr(), 50);
        assert_eq!(old_node.verify(&header, 50, 50).unwrap(), addr());
    }

    #[test]
    fn test_header_carries_hmac_tag() {
        let signer = NodeSigner::new("secret");
        let header = signer.sign(&addr(), 1_000);
        let (_, tag) = header.split_once('.').unwrap();

        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"10.0.0.1:8080|1000");
        assert_eq!(tag, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn test_truncated_tag_rejected() {
        let signer = NodeSigner::new("secret");
        let header = signer.sign(&addr(), 1_000);
        let truncated = &header[..header.len() - 2];
        assert_eq!(signer.verify(truncated, 1_000, 1_000), Err(LbError::Unauthorized));
        let garbage = format!("{}zz", truncated);
        assert_eq!(signer.verify(&garbage, 1_000, 1_000), Err(LbError::Unauthorized));
    }
}

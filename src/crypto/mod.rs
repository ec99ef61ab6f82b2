//! Crypto facade: the trust boundary of the oracle.
//!
//! Everything outside this module treats keys and nonces as opaque hex
//! strings. The facade loads one signing key per process, derives child
//! public keys, derives deterministic per-(event, digit) nonce pairs, and
//! produces BIP-340 Schnorr signatures over caller-supplied nonces.
//!
//! Sharp edge: reusing a secret nonce to sign two *different* messages
//! under the same key leaks the private key. The scheduler guarantees
//! one-message-per-nonce by persisting the exact messages before the
//! first signature is made (see `scheduler`).

pub mod schnorr;
pub mod secret_file;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid entropy: {0}")]
    InvalidEntropy(String),
    #[error("key derivation failed: {0}")]
    Derivation(String),
    #[error("invalid hex input: {0}")]
    InvalidHex(String),
    #[error("signer rejected the message: {0}")]
    Signing(String),
    #[error("secret file invalid: {0}")]
    SecretFile(String),
}

/// Supported networks, with their secret-file tag byte and BIP-84 account
/// derivation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Signet,
}

impl Network {
    pub fn tag_byte(&self) -> u8 {
        match self {
            Network::Mainnet => 0,
            Network::Signet => 4,
        }
    }

    pub fn from_tag_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Network::Mainnet),
            4 => Some(Network::Signet),
            _ => None,
        }
    }

    pub fn derivation_path(&self) -> &'static str {
        match self {
            Network::Mainnet => "m/84'/0'/0'",
            Network::Signet => "m/84'/1'/0'",
        }
    }

    fn btc_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Signet => bitcoin::Network::Signet,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Signet => write!(f, "signet"),
        }
    }
}

/// The loaded signing key. Constructed exactly once per process at boot
/// and shared behind an `Arc`; all operations after `init` are read-only.
pub struct KeySigner {
    secp: Secp256k1<All>,
    account_xpriv: Xpriv,
    account_xpub: Xpub,
    network: Network,
    /// Seed for deterministic nonce derivation, bound to the account key.
    nonce_seed: [u8; 32],
}

impl KeySigner {
    /// Load the signer from raw BIP-39 entropy. The account key is
    /// derived at the network's BIP-84 path; child signing keys hang off
    /// `account/0/<index>`.
    pub fn init(entropy: &[u8], network: Network) -> Result<Self, CryptoError> {
        let secp = Secp256k1::new();

        let mnemonic = bip39::Mnemonic::from_entropy(entropy)
            .map_err(|e| CryptoError::InvalidEntropy(e.to_string()))?;
        let seed = mnemonic.to_seed("");

        let master = Xpriv::new_master(network.btc_network(), &seed)
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        let path = DerivationPath::from_str(network.derivation_path())
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        let account_xpriv = master
            .derive_priv(&secp, &path)
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        let account_xpub = Xpub::from_priv(&secp, &account_xpriv);

        let nonce_seed = sha256::Hash::hash(&account_xpriv.private_key.secret_bytes())
            .to_byte_array();

        Ok(Self {
            secp,
            account_xpriv,
            account_xpub,
            network,
            nonce_seed,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Account extended public key, as a base58 string.
    pub fn xpub(&self) -> String {
        self.account_xpub.to_string()
    }

    fn child_secret_key(&self, child_index: u32) -> Result<SecretKey, CryptoError> {
        let path = [
            ChildNumber::from_normal_idx(0)
                .map_err(|e| CryptoError::Derivation(e.to_string()))?,
            ChildNumber::from_normal_idx(child_index)
                .map_err(|e| CryptoError::Derivation(e.to_string()))?,
        ];
        let child = self
            .account_xpriv
            .derive_priv(&self.secp, &path)
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        Ok(child.private_key)
    }

    /// X-only public key of a child signing key, 64 hex chars.
    pub fn public_key(&self, child_index: u32) -> Result<String, CryptoError> {
        let sk = self.child_secret_key(child_index)?;
        let (xonly, _parity) = sk.x_only_public_key(&self.secp);
        Ok(hex::encode(xonly.serialize()))
    }

    /// Derive the deterministic nonce pair for one digit of one event.
    ///
    /// Pure function of the loaded key, the event id and the digit index:
    /// re-derivation after a restart yields byte-identical values, so a
    /// half-committed event can be resumed against the persisted rows.
    pub fn deterministic_nonce(
        &self,
        event_id: &str,
        digit_index: u32,
    ) -> Result<(String, String), CryptoError> {
        // Hash (seed, event_id, digit_index, ctr) until the digest is a
        // valid scalar. A retry is a ~2^-128 event; the counter keeps the
        // function total.
        for ctr in 0u8..=255 {
            let mut engine = sha256::Hash::engine();
            engine.input(&self.nonce_seed);
            engine.input(event_id.as_bytes());
            engine.input(&digit_index.to_be_bytes());
            engine.input(&[ctr]);
            let digest = sha256::Hash::from_engine(engine);
            if let Ok(sec) = SecretKey::from_slice(&digest.to_byte_array()) {
                let (xonly, _parity) = sec.x_only_public_key(&self.secp);
                return Ok((
                    hex::encode(sec.secret_bytes()),
                    hex::encode(xonly.serialize()),
                ));
            }
        }
        Err(CryptoError::Derivation(format!(
            "no valid nonce scalar for {event_id}:{digit_index}"
        )))
    }

    /// Schnorr-sign a message with a caller-supplied secret nonce and the
    /// given child signing key. Returns the 64-byte BIP-340 signature as
    /// 128 hex chars. Deterministic: identical inputs always produce
    /// byte-identical output.
    pub fn sign_schnorr(
        &self,
        message: &str,
        sec_nonce_hex: &str,
        child_index: u32,
    ) -> Result<String, CryptoError> {
        let nonce_bytes: [u8; 32] = hex::decode(sec_nonce_hex)
            .map_err(|e| CryptoError::InvalidHex(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::InvalidHex("nonce must be 32 bytes".to_string()))?;
        let nonce = SecretKey::from_slice(&nonce_bytes)
            .map_err(|e| CryptoError::InvalidHex(e.to_string()))?;

        let signing_key = self.child_secret_key(child_index)?;
        let msg_digest = sha256::Hash::hash(message.as_bytes()).to_byte_array();

        let sig = schnorr::sign_with_nonce(&self.secp, &msg_digest, &signing_key, &nonce)?;

        // Reject a bad signature here rather than publishing it.
        let (xonly, _parity) = signing_key.x_only_public_key(&self.secp);
        self.secp
            .verify_schnorr(&sig, &Message::from_digest(msg_digest), &xonly)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;

        Ok(hex::encode(sig.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> KeySigner {
        // entropy "01" * 16
        KeySigner::init(&[0x01; 16], Network::Signet).unwrap()
    }

    #[test]
    fn init_and_keys() {
        let signer = test_signer();
        let xpub = signer.xpub();
        assert!(xpub.starts_with("tpub"), "signet xpub: {xpub}");

        let pk0 = signer.public_key(0).unwrap();
        assert_eq!(pk0.len(), 64);

        // Same entropy, same keys on a second init.
        let signer2 = test_signer();
        assert_eq!(signer2.xpub(), xpub);
        assert_eq!(signer2.public_key(0).unwrap(), pk0);
    }

    #[test]
    fn deterministic_nonces() {
        let signer = test_signer();
        let (sec1, pub1) = signer.deterministic_nonce("event001", 1).unwrap();
        assert_eq!(sec1.len(), 64);
        assert_eq!(pub1.len(), 64);

        // Byte-identical across independent derivations and signers.
        let signer2 = test_signer();
        let (sec2, pub2) = signer2.deterministic_nonce("event001", 1).unwrap();
        assert_eq!(sec1, sec2);
        assert_eq!(pub1, pub2);

        // Distinct inputs give distinct nonces.
        let (sec3, _) = signer.deterministic_nonce("event001", 2).unwrap();
        let (sec4, _) = signer.deterministic_nonce("event002", 1).unwrap();
        assert_ne!(sec1, sec3);
        assert_ne!(sec1, sec4);
    }

    #[test]
    fn sign_is_deterministic_and_embeds_nonce() {
        let signer = test_signer();
        let (sec, nonce_pub) = signer.deterministic_nonce("event001", 1).unwrap();

        let sig1 = signer.sign_schnorr("Outcome:event001:1:7", &sec, 0).unwrap();
        let sig2 = signer.sign_schnorr("Outcome:event001:1:7", &sec, 0).unwrap();
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 128);

        // First 32 bytes of the signature are the public nonce.
        assert_eq!(&sig1[..64], nonce_pub.as_str());
    }

    #[test]
    fn rejects_bad_nonce_hex() {
        let signer = test_signer();
        assert!(signer.sign_schnorr("msg", "zz", 0).is_err());
        assert!(signer.sign_schnorr("msg", "0102", 0).is_err());
    }
}

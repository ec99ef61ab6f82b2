//! BIP-340 signing with a caller-supplied nonce.
//!
//! libsecp's `sign_schnorr` generates its own nonce; attestation requires
//! signing with the nonce that was published in advance. The signature is
//! assembled from scalar arithmetic instead: `s = k + e*d (mod n)` with
//! the BIP-340 even-Y conventions for both the nonce and the key.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::{Parity, Scalar, Secp256k1, SecretKey, Signing};

use super::CryptoError;

/// Tagged hash `H_tag("BIP0340/challenge", R.x || P.x || m)`.
fn challenge(r_x: &[u8; 32], p_x: &[u8; 32], msg: &[u8; 32]) -> [u8; 32] {
    let tag = sha256::Hash::hash(b"BIP0340/challenge").to_byte_array();
    let mut engine = sha256::Hash::engine();
    engine.input(&tag);
    engine.input(&tag);
    engine.input(r_x);
    engine.input(p_x);
    engine.input(msg);
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// Sign `msg_digest` with `signing_key`, forcing the nonce point to be
/// the one derived from `nonce`. Returns a standard 64-byte signature
/// whose first half is the x-only public nonce.
pub fn sign_with_nonce<C: Signing>(
    secp: &Secp256k1<C>,
    msg_digest: &[u8; 32],
    signing_key: &SecretKey,
    nonce: &SecretKey,
) -> Result<Signature, CryptoError> {
    // BIP-340: both R and P must have even Y; negate the secrets if not.
    let (nonce_x, nonce_parity) = nonce.x_only_public_key(secp);
    let k = if nonce_parity == Parity::Odd {
        nonce.negate()
    } else {
        *nonce
    };

    let (key_x, key_parity) = signing_key.x_only_public_key(secp);
    let d = if key_parity == Parity::Odd {
        signing_key.negate()
    } else {
        *signing_key
    };

    let e_bytes = challenge(&nonce_x.serialize(), &key_x.serialize(), msg_digest);
    let e = Scalar::from_be_bytes(e_bytes)
        .map_err(|e| CryptoError::Signing(format!("challenge out of range: {e}")))?;

    // s = k + e*d
    let s = d
        .mul_tweak(&e)
        .and_then(|ed| ed.add_tweak(&Scalar::from(k)))
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

    let mut sig = [0u8; 64];
    sig[..32].copy_from_slice(&nonce_x.serialize());
    sig[32..].copy_from_slice(&s.secret_bytes());
    Signature::from_slice(&sig).map_err(|e| CryptoError::Signing(e.to_string()))
}

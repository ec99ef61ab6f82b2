//! Attestor Backend Library
//!
//! A price-attestation oracle: publishes a schedule of future numeric
//! events, pre-commits per-digit public nonces, and signs realized prices
//! digit by digit with Schnorr signatures over the committed nonces.
//!
//! Exposes core modules for use by binaries and tests.

pub mod api;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod oracle;
pub mod price;
pub mod scheduler;
pub mod store;

// Re-export the app handle for convenience
pub use oracle::{Oracle, OracleApp};

#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

//! Key custody for a local wallet: SLIP-0010 ed25519 account derivation from BIP39 phrases,
//! a password-encrypted vault, and sessions that lock themselves after a timeout.

pub mod config;
pub mod context;
pub mod derivation;
pub mod doctor;
pub mod errors;
pub mod keystore;
pub mod observable;
pub mod paths;
pub mod session;
pub mod storage;
pub mod store;
pub mod vault;
pub mod wallet;

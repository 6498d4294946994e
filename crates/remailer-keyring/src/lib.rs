//! Server keyring subsystem for a Type-III anonymous remailer (mix)
//! node.
//!
//! Owns everything a remailer server needs to present itself to the
//! network: a long-term RSA identity key, a rolling sequence of shorter-
//! lived packet keysets with overlapping validity windows, the signed
//! descriptors advertising them, and the MMTP TLS certificate chain used
//! to authenticate incoming/outgoing connections. None of this crate
//! concerns itself with the mix algorithm, packet format, or delivery
//! modules themselves — those are external collaborators this crate
//! hands typed data to ([`keyset::KeySet::packet_key`],
//! [`keyset::KeySet::hashlog`]) or accepts typed data from
//! ([`descriptor::ModuleDescriptor`]).
//!
//! [`keyring::Keyring`] is the entry point: it loads or creates the
//! identity key, scans existing keysets from disk, and drives the
//! rotation/publication schedule through [`keyring::Keyring::update_keys`].

#![forbid(unsafe_code)]

pub mod config;
pub mod consistency;
pub mod descriptor;
pub mod hashlog;
pub mod identity;
pub mod ipguess;
pub mod keyring;
pub mod keyset;
pub mod platform;
pub mod publisher;
pub mod scheduler;
pub mod secure_delete;
pub mod tls;

pub use config::{KeyringConfig, KeyringConfigBuilder};
pub use keyring::Keyring;

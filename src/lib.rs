//! Split a secret across your own devices so that any two of them can recover it.
//!
//! - [`sharing`] / [`stringify`]: 2-of-N linear secret sharing over a 255-bit prime field
//! - [`envelope`]: signed, encrypted point-to-point transfer of a share
//! - [`identity`]: device identities and signature validation
//! - [`protocol`]: reassembly requests, responses and the ledger state machine
//! - [`manager`]: the device-side driver tying these to the relay, key store and
//!   local persistence collaborators ([`relay`], [`keys`], [`store`])

pub mod clock;
#[cfg(feature = "cli")]
pub mod cli;
pub mod codec;
#[cfg(feature = "cli")]
pub mod commands;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod keys;
pub mod manager;
pub mod protocol;
pub mod relay;
pub mod sharing;
pub mod store;
pub mod stringify;
pub mod wasm;

pub use error::{Error, ErrorKind, Result};

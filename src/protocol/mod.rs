//! Reassembly protocol types and state machine
//!
//! - [`request`]: signed requests, responses and request admission
//! - [`ledger`]: the pure per-request state machine folded from relay snapshots
//!
//! The async operations that drive these (publishing, responding, finishing) live on
//! [`SecretManager`](crate::manager::SecretManager).

pub mod ledger;
pub mod request;

pub use ledger::{
    FilledResponse, IncomingState, LedgerEvent, OutgoingState, ReassemblyLedger, ReconcileDiff,
};
pub use request::{ReassemblyRequest, ReassemblyResponse, Rejection};

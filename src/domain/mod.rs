//! Domain types for device-split secrets
//!
//! This module contains validated newtypes and configuration shared by every layer:
//! - [`DeviceId`], [`SecretId`], [`RequestId`], [`ResponseId`] - UUID identifiers
//! - [`CharsetOptions`] / [`Alphabet`] - character classes used to display a recovered secret
//! - [`ProtocolConfig`] - reassembly protocol tunables

mod charset;
mod config;
mod ids;

pub use charset::{Alphabet, CharsetOptions};
pub use config::{MAX_REQUEST_AGE, ProtocolConfig};
pub use ids::{DeviceId, RequestId, ResponseId, SecretId};

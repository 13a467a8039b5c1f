//! WASM bindings for twain
//!
//! Exposes the pure sharing math to JavaScript. Field elements cross the boundary as
//! base64 of their 32-byte little-endian encoding. Envelopes and the reassembly protocol
//! stay on the Rust side; they need key storage a browser page should not hold.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use wasm_bindgen::prelude::*;

use crate::domain::{CharsetOptions, DeviceId};
use crate::sharing::{
    FieldElement, FullSecret, SharePoint, decode_share_value, encode_share_value, participant_x,
    reassemble, split_for_devices,
};

/// Initialize panic hook for better error messages in the browser console
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

/// Use wee_alloc as the global allocator for smaller WASM binary size
#[cfg(target_arch = "wasm32")]
#[global_allocator]
static ALLOC: wee_alloc::WeeAlloc = wee_alloc::WeeAlloc::INIT;

/// One device's share (for JSON serialization)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WasmShare {
    pub device_id: String,
    /// base64 field element
    pub x: String,
    /// base64 field element
    pub y: String,
}

/// Result of a split operation (for JSON serialization)
#[derive(Debug, Serialize, Deserialize)]
pub struct SplitResult {
    pub shares: Vec<WasmShare>,
}

fn encode_element(value: &FieldElement) -> String {
    STANDARD.encode(encode_share_value(value).as_slice())
}

fn decode_element(encoded: &str) -> Result<FieldElement, String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| format!("Invalid base64: {e}"))?;
    decode_share_value(&bytes).map_err(|e| e.to_string())
}

fn parse_device(device_id: &str) -> Result<DeviceId, String> {
    device_id
        .parse()
        .map_err(|e| format!("Invalid device id {device_id:?}: {e}"))
}

fn charset(upper: bool, lower: bool, digits: bool, special: bool) -> CharsetOptions {
    CharsetOptions {
        include_upper: upper,
        include_lower: lower,
        include_digits: digits,
        include_special: special,
    }
}

fn participant_x_inner(device_id: &str) -> Result<String, String> {
    Ok(encode_element(&participant_x(&parse_device(device_id)?)))
}

fn split_inner(device_ids: &[String]) -> Result<SplitResult, String> {
    let devices = device_ids
        .iter()
        .map(|id| parse_device(id))
        .collect::<Result<Vec<_>, _>>()?;
    let shares = split_for_devices(&devices).map_err(|e| format!("Split failed: {e}"))?;

    Ok(SplitResult {
        shares: shares
            .iter()
            .map(|(device, point)| WasmShare {
                device_id: device.to_string(),
                x: encode_element(&point.x),
                y: encode_element(&point.y),
            })
            .collect(),
    })
}

fn reassemble_inner(shares_json: &str, options: CharsetOptions) -> Result<String, String> {
    let shares: Vec<WasmShare> =
        serde_json::from_str(shares_json).map_err(|e| format!("Invalid shares JSON: {e}"))?;
    let [first, second] = shares.as_slice() else {
        return Err(format!("Exactly two shares are required, got {}", shares.len()));
    };

    let point = |share: &WasmShare| -> Result<SharePoint, String> {
        Ok(SharePoint {
            x: decode_element(&share.x)?,
            y: decode_element(&share.y)?,
        })
    };
    let secret = reassemble(&point(first)?, &point(second)?)
        .map_err(|e| format!("Reassemble failed: {e}"))?;
    secret
        .stringify(options)
        .map(|shown| shown.to_string())
        .map_err(|e| e.to_string())
}

fn stringify_inner(value: &str, options: CharsetOptions) -> Result<String, String> {
    FullSecret::from(decode_element(value)?)
        .stringify(options)
        .map(|shown| shown.to_string())
        .map_err(|e| e.to_string())
}

/// Derive a device's x-coordinate on every sharing line
///
/// # Example (JavaScript)
/// ```javascript
/// const x = wasm_participant_x("6b1f0c38-4f3e-4f64-9d6f-3a7e0f4f5b9a");
/// ```
#[wasm_bindgen]
pub fn wasm_participant_x(device_id: &str) -> Result<String, JsValue> {
    participant_x_inner(device_id).map_err(|e| JsValue::from_str(&e))
}

/// Split a fresh random secret across devices
///
/// # Returns
/// JSON `{"shares": [{"deviceId", "x", "y"}, ...]}`, or an error message
///
/// # Example (JavaScript)
/// ```javascript
/// const result = JSON.parse(wasm_split([deviceA, deviceB, deviceC]));
/// console.log(`Created ${result.shares.length} shares`);
/// ```
#[wasm_bindgen]
pub fn wasm_split(device_ids: Vec<String>) -> Result<String, JsValue> {
    let result = split_inner(&device_ids).map_err(|e| JsValue::from_str(&e))?;
    serde_json::to_string(&result)
        .map_err(|e| JsValue::from_str(&format!("Serialization failed: {e}")))
}

/// Reassemble a secret from two shares and render it for display
///
/// # Example (JavaScript)
/// ```javascript
/// const shares = JSON.parse(wasm_split([deviceA, deviceB])).shares;
/// const secret = wasm_reassemble(JSON.stringify(shares), true, true, true, false);
/// ```
#[wasm_bindgen]
pub fn wasm_reassemble(
    shares_json: &str,
    include_upper: bool,
    include_lower: bool,
    include_digits: bool,
    include_special: bool,
) -> Result<String, JsValue> {
    let options = charset(include_upper, include_lower, include_digits, include_special);
    reassemble_inner(shares_json, options).map_err(|e| JsValue::from_str(&e))
}

/// Render a base64 field element over the enabled character classes
#[wasm_bindgen]
pub fn wasm_stringify(
    value: &str,
    include_upper: bool,
    include_lower: bool,
    include_digits: bool,
    include_special: bool,
) -> Result<String, JsValue> {
    let options = charset(include_upper, include_lower, include_digits, include_special);
    stringify_inner(value, options).map_err(|e| JsValue::from_str(&e))
}

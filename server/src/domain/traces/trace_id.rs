//! Hex trace and span identifiers
//!
//! Trace ids are 64 or 128 bits, written as 16 or 32 lowercase hex
//! characters. Index tables only key on the low 64 bits.

use crate::data::error::DataError;

const HEX_64: usize = 16;
const HEX_128: usize = 32;

/// Lowercase and left-pad a trace id to 16 or 32 characters.
///
/// A 128-bit id whose high half is zero collapses to its 64-bit form.
pub fn normalize(hex: &str) -> Result<String, DataError> {
    let hex = validate(hex, HEX_128, "trace id")?;
    let width = if hex.len() <= HEX_64 { HEX_64 } else { HEX_128 };
    let padded = format!("{hex:0>width$}");
    if width == HEX_128 && padded[..HEX_64].bytes().all(|b| b == b'0') {
        return Ok(padded[HEX_64..].to_string());
    }
    Ok(padded)
}

/// Lowercase and left-pad a span id to 16 characters.
pub fn normalize_span_id(hex: &str) -> Result<String, DataError> {
    let hex = validate(hex, HEX_64, "span id")?;
    Ok(format!("{hex:0>HEX_64$}"))
}

/// Low 64 bits of a (possibly 128-bit) hex trace id
pub fn lower_64_bits(hex: &str) -> Result<u64, DataError> {
    let hex = validate(hex, HEX_128, "trace id")?;
    let low = &hex[hex.len().saturating_sub(HEX_64)..];
    u64::from_str_radix(low, 16)
        .map_err(|e| DataError::invalid_argument(format!("trace id {hex}: {e}")))
}

/// Format the low 64 bits as 16 hex characters
pub fn to_hex(id: u64) -> String {
    format!("{id:016x}")
}

/// True when the id carries 128 bits
pub fn is_128_bit(hex: &str) -> bool {
    hex.len() > HEX_64
}

fn validate(hex: &str, max_len: usize, what: &str) -> Result<String, DataError> {
    let hex = hex.trim().to_ascii_lowercase();
    if hex.is_empty() || hex.len() > max_len {
        return Err(DataError::invalid_argument(format!(
            "{what} must be 1 to {max_len} hex characters: {hex:?}"
        )));
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DataError::invalid_argument(format!(
            "{what} is not hex: {hex:?}"
        )));
    }
    Ok(hex)
}

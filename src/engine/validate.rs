use crate::model::Ms;

use super::EngineError;

pub(crate) const MAX_ID_LEN: usize = 128;

/// Leases longer than this are almost certainly unit confusion.
pub(crate) const MAX_LEASE_MS: Ms = 30 * 24 * 3_600_000;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Identifiers feed the `{cart_id}:{sku}` member encoding, so `:` is
/// structurally reserved regardless of strictness.
pub(crate) fn validate_id(id: &str, strict: bool) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::BadRequest("identifier is empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::BadRequest("identifier too long"));
    }
    if id.contains(':') {
        return Err(EngineError::BadRequest("identifier may not contain ':'"));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(EngineError::BadRequest(
            "identifier contains whitespace or control characters",
        ));
    }
    if strict
        && !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return Err(EngineError::BadRequest(
            "identifier contains characters outside [A-Za-z0-9._-]",
        ));
    }
    Ok(())
}

pub(crate) fn validate_qty(qty: i64) -> Result<(), EngineError> {
    if qty <= 0 {
        return Err(EngineError::BadRequest("qty must be positive"));
    }
    Ok(())
}

/// Convert a caller-supplied duration in seconds to bounded milliseconds.
pub(crate) fn lease_ms_from_seconds(seconds: i64) -> Result<Ms, EngineError> {
    if seconds <= 0 {
        return Err(EngineError::BadRequest("duration must be positive"));
    }
    let ms = seconds
        .checked_mul(1000)
        .ok_or(EngineError::BadRequest("duration too large"))?;
    if ms > MAX_LEASE_MS {
        return Err(EngineError::BadRequest("duration too large"));
    }
    Ok(ms)
}

use serde::{Deserialize, Serialize};

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// A live lease on `qty` units of one SKU for one cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub qty: i64,
    pub expires_at: Ms,
    pub created_at: Ms,
}

/// Point-in-time view of one SKU's counters.
///
/// `available = total - reserved`. Reads are plain (unscripted), so a
/// snapshot may trail in-flight mutations by one script execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub total: i64,
    pub reserved: i64,
    pub available: i64,
}

/// Why a hold was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Manual,
    Expired,
}

impl ReleaseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseReason::Manual => "manual",
            ReleaseReason::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(ReleaseReason::Manual),
            "expired" => Some(ReleaseReason::Expired),
            _ => None,
        }
    }
}

/// Lifecycle event kinds appended by the counter-store scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    HoldCreated,
    HoldExtended,
    HoldCommitted,
    HoldReleased,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::HoldCreated => "hold_created",
            EventKind::HoldExtended => "hold_extended",
            EventKind::HoldCommitted => "hold_committed",
            EventKind::HoldReleased => "hold_released",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hold_created" => Some(EventKind::HoldCreated),
            "hold_extended" => Some(EventKind::HoldExtended),
            "hold_committed" => Some(EventKind::HoldCommitted),
            "hold_released" => Some(EventKind::HoldReleased),
            _ => None,
        }
    }
}

/// One entry from the lifecycle event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Stream entry id (Redis stream id, or a ULID for the in-memory store).
    pub id: String,
    pub ts: Ms,
    pub kind: EventKind,
    pub sku: String,
    pub cart_id: String,
    pub qty: i64,
    /// Set only for `hold_released`.
    pub reason: Option<ReleaseReason>,
}

// ── Operation results ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub hold_id: String,
    pub expires_at: Ms,
    pub available_after: i64,
    /// True when this call replayed an identical existing hold.
    pub idempotent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extension {
    pub new_expires_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Commit {
    pub consumed_qty: i64,
    pub new_total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Release {
    Released { qty: i64 },
    /// No hold existed; releasing is an idempotent no-op.
    Absent,
}

// ── Hold identity ────────────────────────────────────────────────

/// The `{cart_id}:{sku}` member used for both the hold key space and the
/// expiry index. Identifiers are validated to never contain `:`, so the
/// encoding is unambiguous.
pub fn hold_member(cart_id: &str, sku: &str) -> String {
    format!("{cart_id}:{sku}")
}

/// Split a member back into `(cart_id, sku)`.
pub fn parse_member(member: &str) -> Option<(String, String)> {
    let (cart_id, sku) = member.split_once(':')?;
    if cart_id.is_empty() || sku.is_empty() {
        return None;
    }
    Some((cart_id.to_string(), sku.to_string()))
}

use crate::counter::CounterError;
use crate::stock::StockError;

#[derive(Debug)]
pub enum EngineError {
    /// Caller violated an input constraint; never retried.
    BadRequest(&'static str),
    /// Reservation denied; carries the availability at denial time.
    Insufficient { available: i64 },
    /// Idempotency collision (reserve with a different qty, carries the
    /// existing hold's qty) or a commit race lost against external
    /// consumption of the durable total (qty absent; the hold has been
    /// auto-released).
    Conflict { existing_qty: Option<i64> },
    /// No hold exists for this `(cart, sku)`.
    NotFound,
    /// Transient store failure; the caller may retry.
    Unavailable(String),
    /// Invariant violation; operator attention, do not retry.
    Internal(String),
}

impl EngineError {
    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Insufficient { .. } => "insufficient",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound => "not_found",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Whether the caller may usefully retry the same request. A denied
    /// reservation is retryable later, once stock frees up.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Insufficient { .. } | EngineError::Unavailable(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            EngineError::Insufficient { available } => {
                write!(f, "insufficient stock: {available} available")
            }
            EngineError::Conflict { existing_qty: Some(qty) } => {
                write!(f, "conflict: hold exists with qty {qty}")
            }
            EngineError::Conflict { existing_qty: None } => {
                write!(f, "conflict: durable stock consumed elsewhere")
            }
            EngineError::NotFound => write!(f, "hold not found"),
            EngineError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<CounterError> for EngineError {
    fn from(e: CounterError) -> Self {
        match e {
            CounterError::Unavailable(msg) => EngineError::Unavailable(msg),
            CounterError::Internal(msg) => EngineError::Internal(msg),
        }
    }
}

impl From<StockError> for EngineError {
    fn from(e: StockError) -> Self {
        match e {
            StockError::Unavailable(msg) => EngineError::Unavailable(msg),
        }
    }
}

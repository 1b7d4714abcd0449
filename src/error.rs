use thiserror::Error;

/// Errors surfaced by the attribution backend.
///
/// Validation failures abort a call before any state mutation. Ledger
/// exhaustion is deliberately absent: it degrades the histogram to zeros
/// instead of raising, so out-of-budget devices stay indistinguishable from
/// devices with no matching impressions.
#[derive(Debug, Error)]
pub enum AttributionError {
    /// A site string or URL does not parse.
    #[error("invalid site or URL: {0}")]
    InvalidSyntax(String),

    /// A numeric argument is outside its declared interval.
    #[error("argument out of range: {0}")]
    OutOfRange(String),

    /// The aggregation service URL is not in the configured map.
    #[error("unknown aggregation service: {0}")]
    UnknownReference(String),

    /// An internal invariant was violated. Fatal to the call.
    #[error("invariant violated: {0}")]
    InvalidState(String),
}

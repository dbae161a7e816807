use thiserror::Error;

/// Failures that are genuinely exceptional for this crate — precondition,
/// negotiation, and config failures cross the HTTP boundary as a status
/// code instead, carried as data via [`crate::session::EventsHeader`], not
/// through this enum.
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("malformed structured field: {0}")]
    StructuredField(String),
}

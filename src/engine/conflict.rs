use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// True iff any of `existing` overlaps `candidate`. Stops at the first hit.
pub fn conflict<'a>(candidate: &Span, existing: impl IntoIterator<Item = &'a Span>) -> bool {
    existing.into_iter().any(|s| s.overlaps(candidate))
}

/// Id of the first appointment overlapping `candidate`, skipping `exclude`
/// (the appointment being rescheduled).
pub fn find_conflict(
    candidate: &Span,
    existing: impl IntoIterator<Item = (Ulid, Span)>,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    existing
        .into_iter()
        .filter(|(id, _)| Some(*id) != exclude)
        .find(|(_, span)| span.overlaps(candidate))
        .map(|(id, _)| id)
}

/// The conditional-write check: runs against live state while the caller holds
/// the doctor's write lock.
pub(crate) fn check_no_conflict(
    ds: &DoctorState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let existing = ds.overlapping(span).map(|b| (b.id, b.span));
    match find_conflict(span, existing, exclude) {
        Some(id) => Err(EngineError::Conflict(id)),
        None => Ok(()),
    }
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > Ms::from(MAX_DURATION_MINUTES) * MINUTE_MS {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

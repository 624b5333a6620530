use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Invalid(format!(
            "interval start {} must be before end {}",
            span.start, span.end
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Shape checks that need no resource: well-formed interval, non-zero
/// quantity. Used for saga line items that may target a remote resource.
pub(crate) fn validate_claim_shape(claim: &Claim) -> Result<(), EngineError> {
    match claim {
        Claim::Interval(span) => validate_span(span),
        Claim::Quantity(0) => Err(EngineError::Invalid("quantity must be positive".into())),
        Claim::Quantity(n) if *n > MAX_QUANTITY => Err(EngineError::LimitExceeded("quantity too large")),
        Claim::Quantity(_) => Ok(()),
    }
}

/// Shape checks plus claim kind against the resource's capacity kind.
pub(crate) fn validate_claim(capacity: &Capacity, claim: &Claim) -> Result<(), EngineError> {
    validate_claim_shape(claim)?;
    match (capacity.is_interval(), claim.is_interval()) {
        (true, false) => Err(EngineError::Invalid(
            "quantity claim on a time-sliced resource".into(),
        )),
        (false, true) => Err(EngineError::Invalid(
            "interval claim on a unit-counted resource".into(),
        )),
        _ => Ok(()),
    }
}

/// Admission test. Must run under the resource's write lock, in the same
/// critical section as the ledger update that follows it.
pub(crate) fn check_admission(rs: &ResourceState, claim: &Claim) -> Result<(), EngineError> {
    let limit = rs.capacity.limit();
    match claim {
        Claim::Quantity(n) => {
            if rs.held_units + u64::from(*n) > u64::from(limit) {
                return Err(EngineError::CapacityExceeded(limit));
            }
        }
        Claim::Interval(span) => {
            if limit == 0 {
                return Err(EngineError::CapacityExceeded(0));
            }
            if limit == 1 {
                // Fast path: any overlapping holder is a conflict
                if let Some(existing) = rs.overlapping(span).next() {
                    return Err(EngineError::Conflict(existing.id));
                }
                return Ok(());
            }
            // Every active holder overlapping the proposal counts, whether
            // or not the holders overlap each other.
            if overlap_count(rs, span) >= limit as usize {
                return Err(EngineError::CapacityExceeded(limit));
            }
        }
    }
    Ok(())
}

/// Active interval claims overlapping `span`.
pub(crate) fn overlap_count(rs: &ResourceState, span: &Span) -> usize {
    rs.overlapping(span).count()
}

/// Highest number of simultaneous holders anywhere inside `window`.
pub(crate) fn peak_concurrency(rs: &ResourceState, window: &Span) -> u32 {
    let mut edges: Vec<(Ms, i32)> = Vec::new();
    for interval in rs.overlapping(window) {
        edges.push((interval.span.start.max(window.start), 1));
        edges.push((interval.span.end.min(window.end), -1));
    }
    // Ends sort before starts at the same instant: half-open spans that
    // merely touch never count as concurrent.
    edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut current: i32 = 0;
    let mut peak: i32 = 0;
    for (_, delta) in edges {
        current += delta;
        peak = peak.max(current);
    }
    peak as u32
}

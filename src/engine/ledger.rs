//! Capacity ledger: what each resource has handed out and what is left.
//!
//! All methods operate on a `ResourceState` the caller has already locked.
//! `try_acquire` is the read-only admission half; `occupy` / `vacate` are
//! the bookkeeping half applied after the WAL accepted the event. Callers
//! hold the same write guard across both, so check-and-decrement is one
//! atomic step per resource.

use ulid::Ulid;

use crate::limits::MAX_ALLOCATIONS_PER_RESOURCE;
use crate::model::*;

use super::conflict::{check_admission, overlap_count, peak_concurrency, validate_claim};
use super::EngineError;

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Capacity left once the claim is held. For interval resources this is
    /// the holder slots still free over the claimed interval.
    pub remaining: u64,
}

impl ResourceState {
    pub fn try_acquire(&self, claim: &Claim) -> Result<Grant, EngineError> {
        validate_claim(&self.capacity, claim)?;
        // Released records stay for idempotency lookups but hold nothing.
        if self.live_allocations >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many allocations on resource"));
        }
        check_admission(self, claim)?;
        let requested = match claim {
            Claim::Interval(_) => 1,
            Claim::Quantity(n) => u64::from(*n),
        };
        Ok(Grant {
            remaining: self.remaining(claim).saturating_sub(requested),
        })
    }

    /// Free capacity for `claim` right now: units left, or holder slots not
    /// taken by allocations overlapping the claimed interval.
    pub fn remaining(&self, claim: &Claim) -> u64 {
        let limit = u64::from(self.capacity.limit());
        match claim {
            Claim::Quantity(_) => limit.saturating_sub(self.held_units),
            Claim::Interval(span) => limit.saturating_sub(overlap_count(self, span) as u64),
        }
    }

    /// Record an allocation and, if active, make it hold capacity.
    /// Re-recording an already active id changes nothing.
    pub(crate) fn occupy(&mut self, allocation: Allocation) {
        if self
            .allocations
            .get(&allocation.id)
            .is_some_and(|a| a.status.is_active())
        {
            return;
        }
        if allocation.status.is_active() {
            self.hold_capacity(allocation.id, &allocation.claim);
            self.live_allocations += 1;
        }
        self.allocations.insert(allocation.id, allocation);
    }

    /// Release whatever `id` holds and mark it `status`. Returns the
    /// capacity left afterwards, or `None` if nothing was held (already
    /// released, or unknown).
    pub(crate) fn vacate(&mut self, id: Ulid, status: AllocationStatus) -> Option<u64> {
        let allocation = self.allocations.get_mut(&id)?;
        if !allocation.status.is_active() {
            return None;
        }
        allocation.status = status;
        allocation.expires_at = None;
        let claim = allocation.claim;
        self.live_allocations = self.live_allocations.saturating_sub(1);
        match claim {
            Claim::Quantity(n) => {
                self.held_units = self.held_units.saturating_sub(u64::from(n));
            }
            Claim::Interval(_) => {
                self.remove_interval(id);
            }
        }
        Some(self.remaining(&claim))
    }

    fn hold_capacity(&mut self, id: Ulid, claim: &Claim) {
        match claim {
            Claim::Quantity(n) => self.held_units += u64::from(*n),
            Claim::Interval(span) => self.insert_interval(Interval { id, span: *span }),
        }
    }

    /// Peak holders across every active interval claim. Used to refuse
    /// capacity edits that would strand existing allocations.
    pub(crate) fn peak_holders(&self) -> u64 {
        match self.capacity {
            Capacity::Units(_) => self.held_units,
            _ => {
                let (Some(first), Some(last_end)) = (
                    self.intervals.first(),
                    self.intervals.iter().map(|i| i.span.end).max(),
                ) else {
                    return 0;
                };
                u64::from(peak_concurrency(
                    self,
                    &Span {
                        start: first.span.start,
                        end: last_end,
                    },
                ))
            }
        }
    }
}

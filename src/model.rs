use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// How much of a resource can be held at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capacity {
    /// One holder per instant (rooms, equipment).
    Exclusive,
    /// Up to `n` holders per instant (lecture hall seats per slot).
    Concurrent(u32),
    /// `n` fungible units with no time dimension (tickets, stock).
    Units(u32),
}

impl Capacity {
    pub fn is_interval(&self) -> bool {
        !matches!(self, Capacity::Units(_))
    }

    pub fn limit(&self) -> u32 {
        match self {
            Capacity::Exclusive => 1,
            Capacity::Concurrent(n) | Capacity::Units(n) => *n,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Capacity::Exclusive => "exclusive",
            Capacity::Concurrent(_) => "concurrent",
            Capacity::Units(_) => "units",
        }
    }
}

/// What an allocation asks for: a time slice or a number of units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Claim {
    Interval(Span),
    Quantity(u32),
}

impl Claim {
    pub fn is_interval(&self) -> bool {
        matches!(self, Claim::Interval(_))
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Claim::Interval(span) => Some(*span),
            Claim::Quantity(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Failed,
}

impl AllocationStatus {
    /// Pending and confirmed allocations hold capacity.
    pub fn is_active(&self) -> bool {
        matches!(self, AllocationStatus::Pending | AllocationStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Pending => "PENDING",
            AllocationStatus::Confirmed => "CONFIRMED",
            AllocationStatus::Cancelled => "CANCELLED",
            AllocationStatus::Failed => "FAILED",
        }
    }
}

/// A granted (or since released) claim against a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Also the intent id: repeating a reserve with this id is a no-op.
    pub id: Ulid,
    pub resource_id: Ulid,
    pub tenant: String,
    pub requester: String,
    pub claim: Claim,
    pub status: AllocationStatus,
    pub label: Option<String>,
    /// Set while the allocation is a pending hold.
    pub expires_at: Option<Ms>,
}

/// An interval claim currently holding capacity on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub parent_id: Option<Ulid>,
    pub name: Option<String>,
    pub capacity: Capacity,
    /// Active interval claims, sorted by `span.start`.
    pub intervals: Vec<Interval>,
    /// Units held by active quantity claims.
    pub held_units: u64,
    /// Every allocation recorded against this resource, active or not.
    pub allocations: HashMap<Ulid, Allocation>,
    /// How many of `allocations` are PENDING or CONFIRMED.
    pub live_allocations: usize,
    /// Set once the resource is deleted. Writers that raced the delete and
    /// still hold the `Arc` must treat it as gone.
    pub retired: bool,
}

impl ResourceState {
    pub fn new(id: Ulid, parent_id: Option<Ulid>, name: Option<String>, capacity: Capacity) -> Self {
        Self {
            id,
            parent_id,
            name,
            capacity,
            intervals: Vec::new(),
            held_units: 0,
            allocations: HashMap::new(),
            live_allocations: 0,
            retired: false,
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        if let Some(pos) = self.intervals.iter().position(|i| i.id == id) {
            Some(self.intervals.remove(pos))
        } else {
            None
        }
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn active_allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values().filter(|a| a.status.is_active())
    }
}

// ── Composite orders ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Compensating,
    Confirmed,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Confirmed | OrderStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Compensating => "COMPENSATING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

/// Progress of one saga step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    Reserved,
    Failed,
    Compensated,
    /// Cancel could not be confirmed; the recovery sweeper keeps retrying.
    Unresolved,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "PENDING",
            StepState::Reserved => "RESERVED",
            StepState::Failed => "FAILED",
            StepState::Compensated => "COMPENSATED",
            StepState::Unresolved => "UNRESOLVED",
        }
    }
}

/// A requested line of a composite order, before intents are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderItem {
    pub resource_id: Ulid,
    pub claim: Claim,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub intent_id: Ulid,
    pub resource_id: Ulid,
    pub claim: Claim,
    pub state: StepState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeOrder {
    pub id: Ulid,
    pub tenant: String,
    pub requester: String,
    pub status: OrderStatus,
    pub items: Vec<LineItem>,
    pub reason: Option<String>,
}

impl CompositeOrder {
    /// True while any step may still hold remote capacity.
    pub fn has_outstanding_holds(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i.state, StepState::Reserved | StepState::Unresolved))
    }

    /// Orders the recovery sweeper must drive: unfinished sagas and failed
    /// sagas whose compensation was never confirmed.
    pub fn needs_recovery(&self) -> bool {
        match self.status {
            OrderStatus::Pending | OrderStatus::Compensating => true,
            OrderStatus::Failed => self.items.iter().any(|i| i.state == StepState::Unresolved),
            OrderStatus::Confirmed => false,
        }
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        parent_id: Option<Ulid>,
        name: Option<String>,
        capacity: Capacity,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        capacity: Capacity,
    },
    ResourceDeleted {
        id: Ulid,
    },
    AllocationConfirmed {
        id: Ulid,
        resource_id: Ulid,
        requester: String,
        claim: Claim,
        label: Option<String>,
    },
    HoldPlaced {
        id: Ulid,
        resource_id: Ulid,
        requester: String,
        claim: Claim,
        expires_at: Ms,
    },
    HoldConfirmed {
        id: Ulid,
        resource_id: Ulid,
    },
    AllocationReleased {
        id: Ulid,
        resource_id: Ulid,
        status: AllocationStatus,
    },
    AllocationPurged {
        id: Ulid,
        resource_id: Ulid,
    },
    IntentVoided {
        id: Ulid,
    },
    OrderOpened {
        id: Ulid,
        requester: String,
        items: Vec<LineItem>,
    },
    OrderStepChanged {
        id: Ulid,
        index: u32,
        state: StepState,
    },
    OrderCompensating {
        id: Ulid,
        reason: String,
    },
    OrderConfirmed {
        id: Ulid,
    },
    OrderFailed {
        id: Ulid,
        reason: String,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub tenant: String,
    pub parent_id: Option<Ulid>,
    pub name: Option<String>,
    pub capacity: Capacity,
    pub active_allocations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(start: Ms, end: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn capacity_helpers() {
        assert_eq!(Capacity::Exclusive.limit(), 1);
        assert_eq!(Capacity::Concurrent(4).limit(), 4);
        assert_eq!(Capacity::Units(0).limit(), 0);
        assert!(Capacity::Exclusive.is_interval());
        assert!(Capacity::Concurrent(2).is_interval());
        assert!(!Capacity::Units(5).is_interval());
    }

    #[test]
    fn status_activity() {
        assert!(AllocationStatus::Pending.is_active());
        assert!(AllocationStatus::Confirmed.is_active());
        assert!(!AllocationStatus::Cancelled.is_active());
        assert!(!AllocationStatus::Failed.is_active());
    }

    #[test]
    fn interval_ordering() {
        let mut rs = ResourceState::new(Ulid::new(), None, None, Capacity::Exclusive);
        rs.insert_interval(interval(300, 400));
        rs.insert_interval(interval(100, 200));
        rs.insert_interval(interval(200, 300));
        assert_eq!(rs.intervals[0].span.start, 100);
        assert_eq!(rs.intervals[1].span.start, 200);
        assert_eq!(rs.intervals[2].span.start, 300);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = ResourceState::new(Ulid::new(), None, None, Capacity::Exclusive);
        rs.insert_interval(interval(100, 200));
        assert!(rs.remove_interval(Ulid::new()).is_none());
        assert_eq!(rs.intervals.len(), 1);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new(Ulid::new(), None, None, Capacity::Concurrent(3));
        rs.insert_interval(interval(100, 200));
        rs.insert_interval(interval(450, 600));
        rs.insert_interval(interval(1000, 1100));

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = ResourceState::new(Ulid::new(), None, None, Capacity::Exclusive);
        rs.insert_interval(interval(100, 200));
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(rs.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let mut rs = ResourceState::new(Ulid::new(), None, None, Capacity::Exclusive);
        rs.insert_interval(interval(100, 201));
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 1);
    }

    #[test]
    fn order_recovery_predicates() {
        let item = |state| LineItem {
            intent_id: Ulid::new(),
            resource_id: Ulid::new(),
            claim: Claim::Quantity(1),
            state,
        };
        let mut order = CompositeOrder {
            id: Ulid::new(),
            tenant: "campus".into(),
            requester: "alice".into(),
            status: OrderStatus::Pending,
            items: vec![item(StepState::Reserved), item(StepState::Pending)],
            reason: None,
        };
        assert!(order.needs_recovery());
        assert!(order.has_outstanding_holds());

        order.status = OrderStatus::Failed;
        order.items[0].state = StepState::Compensated;
        assert!(!order.needs_recovery());
        assert!(!order.has_outstanding_holds());

        order.items[0].state = StepState::Unresolved;
        assert!(order.needs_recovery());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::OrderOpened {
            id: Ulid::new(),
            requester: "alice".into(),
            items: vec![LineItem {
                intent_id: Ulid::new(),
                resource_id: Ulid::new(),
                claim: Claim::Interval(Span::new(1000, 2000)),
                state: StepState::Pending,
            }],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

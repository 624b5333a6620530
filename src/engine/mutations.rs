use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use ulid::Ulid;

use crate::auth::AuthContext;
use crate::limits::*;
use crate::model::*;
use crate::notify::{RESERVATION_CANCELLED, RESERVATION_CREATED, RESERVATION_EXPIRED, RESOURCE_DELETED};
use crate::observability;

use super::conflict::{now_ms, validate_claim_shape};
use super::{Engine, EngineError, WalCommand};

/// Whether a placement lands CONFIRMED straight away or as an expiring hold.
enum Placement {
    Confirmed { label: Option<String> },
    Hold { expires_at: Ms },
}

/// Requests carrying the same intent id run one at a time, whichever
/// resource they target. The entry goes once nobody else is waiting on it.
struct IntentSlot<'a> {
    intents: &'a DashMap<Ulid, Arc<Mutex<()>>>,
    id: Ulid,
}

impl Drop for IntentSlot<'_> {
    fn drop(&mut self) {
        self.intents
            .remove_if(&self.id, |_, serial| Arc::strong_count(serial) == 1);
    }
}

fn allocation_payload(a: &Allocation, remaining: Option<u64>) -> serde_json::Value {
    let mut payload = json!({
        "allocationId": a.id.to_string(),
        "resourceId": a.resource_id.to_string(),
        "tenant": a.tenant,
        "requester": a.requester,
        "status": a.status.as_str(),
    });
    match a.claim {
        Claim::Interval(span) => {
            payload["start"] = json!(span.start);
            payload["end"] = json!(span.end);
        }
        Claim::Quantity(n) => payload["quantity"] = json!(n),
    }
    if let Some(remaining) = remaining {
        payload["remaining"] = json!(remaining);
    }
    payload
}

impl Engine {
    /// Every tenant-scoped call goes through here first. A foreign tenant
    /// gets the same answer as a missing id.
    pub(super) fn check_tenant(&self, ctx: &AuthContext, id: Ulid) -> Result<(), EngineError> {
        if ctx.tenant != self.tenant {
            tracing::debug!(tenant = %ctx.tenant, engine = %self.tenant, %id, "cross-tenant access");
            return Err(EngineError::NotFound(id));
        }
        Ok(())
    }

    fn require_admin(ctx: &AuthContext, action: &'static str) -> Result<(), EngineError> {
        if !ctx.is_admin() {
            return Err(EngineError::Forbidden(action));
        }
        Ok(())
    }

    pub async fn create_resource(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        parent_id: Option<Ulid>,
        name: Option<String>,
        capacity: Capacity,
    ) -> Result<(), EngineError> {
        Self::require_admin(ctx, "creating resources requires the admin role")?;
        self.check_tenant(ctx, id)?;
        let _gate = self.compaction.read().await;

        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        validate_capacity(&capacity)?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        // The parent stays read-locked until the child is linked, so a
        // concurrent delete of the parent either sees the child or runs first.
        let parent_guard = match parent_id {
            Some(pid) => {
                if pid == id {
                    return Err(EngineError::CycleDetected(id));
                }
                let parent = self.get_resource(&pid).ok_or(EngineError::NotFound(pid))?;
                let guard = parent.read_owned().await;
                if guard.retired {
                    return Err(EngineError::NotFound(pid));
                }
                let mut depth = 1usize;
                let mut cur = guard.parent_id;
                while let Some(cid) = cur {
                    depth += 1;
                    if depth > MAX_HIERARCHY_DEPTH {
                        return Err(EngineError::LimitExceeded("hierarchy too deep"));
                    }
                    let rs = self.get_resource(&cid).ok_or(EngineError::NotFound(cid))?;
                    cur = rs.read().await.parent_id;
                }
                Some(guard)
            }
            None => None,
        };

        let event = Event::ResourceCreated {
            id,
            parent_id,
            name,
            capacity,
        };
        self.persist_engine_event(&event).await?;
        drop(parent_guard);
        tracing::info!(tenant = %self.tenant, %id, kind = capacity.kind_label(), limit = capacity.limit(), "resource created");
        Ok(())
    }

    pub async fn update_resource(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        name: Option<String>,
        capacity: Capacity,
    ) -> Result<(), EngineError> {
        Self::require_admin(ctx, "updating resources requires the admin role")?;
        self.check_tenant(ctx, id)?;
        let _gate = self.compaction.read().await;

        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        validate_capacity(&capacity)?;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        if guard.capacity.is_interval() != capacity.is_interval() {
            return Err(EngineError::Invalid(format!(
                "cannot change a {} resource into {}",
                guard.capacity.kind_label(),
                capacity.kind_label()
            )));
        }
        if guard.peak_holders() > u64::from(capacity.limit()) {
            return Err(EngineError::CapacityExceeded(capacity.limit()));
        }

        let event = Event::ResourceUpdated { id, name, capacity };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove a leaf resource. Active allocations are released first, then
    /// every allocation record is purged, then the resource itself goes.
    pub async fn delete_resource(&self, ctx: &AuthContext, id: Ulid) -> Result<(), EngineError> {
        Self::require_admin(ctx, "deleting resources requires the admin role")?;
        self.check_tenant(ctx, id)?;
        let _gate = self.compaction.read().await;

        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        // Children link under this resource's read lock, so the index is
        // settled once we hold the write lock.
        if self.children.get(&id).is_some_and(|kids| !kids.is_empty()) {
            return Err(EngineError::HasChildren(id));
        }

        let mut active: Vec<Ulid> = guard.active_allocations().map(|a| a.id).collect();
        active.sort();
        for alloc_id in active {
            let event = Event::AllocationReleased {
                id: alloc_id,
                resource_id: id,
                status: AllocationStatus::Cancelled,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            if let Some(a) = guard.allocations.get(&alloc_id) {
                self.notify.publish(RESERVATION_CANCELLED, allocation_payload(a, None));
            }
        }

        let mut records: Vec<Ulid> = guard.allocations.keys().copied().collect();
        records.sort();
        for alloc_id in records {
            let event = Event::AllocationPurged {
                id: alloc_id,
                resource_id: id,
            };
            self.persist_and_apply(&mut guard, &event).await?;
        }

        self.wal_append(&Event::ResourceDeleted { id }).await?;
        guard.retired = true;
        if let Some(pid) = guard.parent_id
            && let Some(mut kids) = self.children.get_mut(&pid)
        {
            kids.retain(|c| c != &id);
        }
        self.children.remove(&id);
        self.state.remove(&id);
        drop(guard);

        self.notify.publish(
            RESOURCE_DELETED,
            json!({ "resourceId": id.to_string(), "tenant": self.tenant }),
        );
        tracing::info!(tenant = %self.tenant, %id, "resource deleted");
        Ok(())
    }

    /// Reserve straight to CONFIRMED. `id` is the caller's intent id:
    /// repeating the same request returns the existing allocation.
    pub async fn reserve(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        resource_id: Ulid,
        claim: Claim,
        label: Option<String>,
    ) -> Result<Allocation, EngineError> {
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("label too long"));
        }
        self.place(ctx, id, resource_id, claim, Placement::Confirmed { label })
            .await
    }

    /// Place a PENDING hold that lapses to FAILED at `expires_at` unless
    /// confirmed first.
    pub async fn hold(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        resource_id: Ulid,
        claim: Claim,
        expires_at: Ms,
    ) -> Result<Allocation, EngineError> {
        if expires_at <= now_ms() {
            return Err(EngineError::Invalid("hold expiry must be in the future".into()));
        }
        self.place(ctx, id, resource_id, claim, Placement::Hold { expires_at })
            .await
    }

    async fn place(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        resource_id: Ulid,
        claim: Claim,
        placement: Placement,
    ) -> Result<Allocation, EngineError> {
        let start = std::time::Instant::now();
        let _slot = IntentSlot {
            intents: &self.intents,
            id,
        };
        let serial = self.intents.entry(id).or_default().clone();
        let _serial = serial.lock_owned().await;
        let result = self.place_inner(ctx, id, resource_id, claim, placement).await;
        let outcome = match &result {
            Ok(_) => "granted",
            Err(e) => observability::error_outcome(e),
        };
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::RESERVE_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn place_inner(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        resource_id: Ulid,
        claim: Claim,
        placement: Placement,
    ) -> Result<Allocation, EngineError> {
        self.check_tenant(ctx, resource_id)?;
        validate_claim_shape(&claim)?;
        if self.voided.contains(&id) {
            return Err(EngineError::IntentVoided(id));
        }
        let _gate = self.compaction.read().await;

        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(resource_id));
        }
        // A cancel may have voided the intent while we waited for the lock.
        if self.voided.contains(&id) {
            return Err(EngineError::IntentVoided(id));
        }

        // Same-intent requests are serialized in `place`, so this lookup
        // sees any earlier one that landed, on whatever resource.
        if let Some(existing_resource) = self.get_resource_for_entity(&id) {
            if existing_resource != resource_id {
                return Err(EngineError::AlreadyExists(id));
            }
            let existing = guard
                .allocations
                .get(&id)
                .ok_or(EngineError::AlreadyExists(id))?;
            if existing.claim != claim {
                return Err(EngineError::AlreadyExists(id));
            }
            if !existing.status.is_active() {
                return Err(EngineError::IntentVoided(id));
            }
            tracing::debug!(tenant = %self.tenant, %id, "repeat reserve, returning existing allocation");
            return Ok(existing.clone());
        }

        let grant = guard.try_acquire(&claim)?;

        let (event, confirmed) = match placement {
            Placement::Confirmed { label } => (
                Event::AllocationConfirmed {
                    id,
                    resource_id,
                    requester: ctx.requester.clone(),
                    claim,
                    label,
                },
                true,
            ),
            Placement::Hold { expires_at } => (
                Event::HoldPlaced {
                    id,
                    resource_id,
                    requester: ctx.requester.clone(),
                    claim,
                    expires_at,
                },
                false,
            ),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        if self.voided.contains(&id) {
            let release = Event::AllocationReleased {
                id,
                resource_id,
                status: AllocationStatus::Cancelled,
            };
            self.persist_and_apply(&mut guard, &release).await?;
            return Err(EngineError::IntentVoided(id));
        }

        let allocation = guard
            .allocations
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::WalError("allocation missing after apply".into()))?;
        drop(guard);

        if confirmed {
            self.notify
                .publish(RESERVATION_CREATED, allocation_payload(&allocation, Some(grant.remaining)));
        }
        tracing::debug!(
            tenant = %self.tenant,
            %id,
            %resource_id,
            status = allocation.status.as_str(),
            remaining = grant.remaining,
            "allocation granted"
        );
        Ok(allocation)
    }

    /// PENDING → CONFIRMED. Confirming an already confirmed hold is a no-op.
    /// A hold past its expiry is expired here instead of confirmed.
    pub async fn confirm_hold(&self, ctx: &AuthContext, id: Ulid) -> Result<Allocation, EngineError> {
        self.check_tenant(ctx, id)?;
        let _gate = self.compaction.read().await;
        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard
            .allocations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        match current.status {
            AllocationStatus::Confirmed => return Ok(current),
            AllocationStatus::Pending => {}
            other => {
                return Err(EngineError::InvalidState {
                    id,
                    status: other.as_str(),
                });
            }
        }

        if current.expires_at.is_some_and(|at| at <= now_ms()) {
            self.expire_locked(resource_id, &mut guard, id).await?;
            return Err(EngineError::InvalidState {
                id,
                status: AllocationStatus::Failed.as_str(),
            });
        }

        self.persist_and_apply(&mut guard, &Event::HoldConfirmed { id, resource_id })
            .await?;
        let allocation = guard
            .allocations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let remaining = guard.remaining(&allocation.claim);
        drop(guard);

        self.notify
            .publish(RESERVATION_CREATED, allocation_payload(&allocation, Some(remaining)));
        Ok(allocation)
    }

    /// Release an allocation. Cancelling an already released allocation
    /// succeeds without touching capacity. An id never seen before is
    /// tombstoned so a late reserve carrying it is refused, and the call
    /// still reports `NotFound`.
    pub async fn cancel(&self, ctx: &AuthContext, id: Ulid) -> Result<(), EngineError> {
        self.check_tenant(ctx, id)?;
        let _gate = self.compaction.read().await;

        let (resource_id, mut guard) = match self.resolve_entity_write(&id).await {
            Ok(found) => found,
            Err(EngineError::NotFound(_)) => {
                if !self.voided.contains(&id) && self.voided.len() < MAX_VOIDED_INTENTS {
                    self.persist_engine_event(&Event::IntentVoided { id }).await?;
                    tracing::info!(tenant = %self.tenant, %id, "cancel for unseen intent, tombstoned");
                }
                // A reserve that got past its tombstone check before the
                // tombstone existed has landed by now; cancel it normally.
                if self.get_resource_for_entity(&id).is_none() {
                    return Err(EngineError::NotFound(id));
                }
                self.resolve_entity_write(&id).await?
            }
            Err(e) => return Err(e),
        };

        if !guard.allocations.get(&id).is_some_and(|a| a.status.is_active()) {
            return Ok(());
        }

        let event = Event::AllocationReleased {
            id,
            resource_id,
            status: AllocationStatus::Cancelled,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if let Some(a) = guard.allocations.get(&id) {
            let remaining = guard.remaining(&a.claim);
            self.notify
                .publish(RESERVATION_CANCELLED, allocation_payload(a, Some(remaining)));
        }
        tracing::debug!(tenant = %self.tenant, %id, %resource_id, "allocation cancelled");
        Ok(())
    }

    /// Reaper entry point: expire `id` if it is still a PENDING hold past
    /// its deadline. Returns whether anything was released.
    pub async fn expire_hold(&self, id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.compaction.read().await;
        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let due = guard.allocations.get(&id).is_some_and(|a| {
            a.status == AllocationStatus::Pending && a.expires_at.is_some_and(|at| at <= now_ms())
        });
        if !due {
            return Ok(false);
        }
        self.expire_locked(resource_id, &mut guard, id).await?;
        Ok(true)
    }

    async fn expire_locked(
        &self,
        resource_id: Ulid,
        guard: &mut ResourceState,
        id: Ulid,
    ) -> Result<(), EngineError> {
        let event = Event::AllocationReleased {
            id,
            resource_id,
            status: AllocationStatus::Failed,
        };
        self.persist_and_apply(guard, &event).await?;
        if let Some(a) = guard.allocations.get(&id) {
            let remaining = guard.remaining(&a.claim);
            self.notify
                .publish(RESERVATION_EXPIRED, allocation_payload(a, Some(remaining)));
        }
        tracing::info!(tenant = %self.tenant, %id, %resource_id, "hold expired");
        Ok(())
    }

    /// `(allocation_id, resource_id)` of every PENDING hold due at `now`.
    /// Skips resources currently locked; the next sweep picks them up.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for a in guard.allocations.values() {
                    if a.status == AllocationStatus::Pending
                        && a.expires_at.is_some_and(|at| at <= now)
                    {
                        expired.push((a.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    // ── Composite order persistence (driven by the saga coordinator) ──

    /// Persist a new PENDING order with one fresh intent id per line item.
    /// An order id that already exists returns the stored order unchanged.
    pub(crate) async fn open_order(
        &self,
        ctx: &AuthContext,
        id: Ulid,
        items: &[OrderItem],
    ) -> Result<CompositeOrder, EngineError> {
        self.check_tenant(ctx, id)?;
        if let Some(existing) = self.orders.get(&id) {
            return Ok(existing.value().clone());
        }
        if items.is_empty() {
            return Err(EngineError::Invalid("order has no items".into()));
        }
        if items.len() > MAX_ORDER_ITEMS {
            return Err(EngineError::LimitExceeded("too many order items"));
        }
        for item in items {
            validate_claim_shape(&item.claim)?;
        }
        let _gate = self.compaction.read().await;

        let line_items: Vec<LineItem> = items
            .iter()
            .map(|item| LineItem {
                intent_id: Ulid::new(),
                resource_id: item.resource_id,
                claim: item.claim,
                state: StepState::Pending,
            })
            .collect();
        self.persist_engine_event(&Event::OrderOpened {
            id,
            requester: ctx.requester.clone(),
            items: line_items,
        })
        .await?;
        self.orders
            .get(&id)
            .map(|o| o.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub(crate) async fn set_step_state(
        &self,
        id: Ulid,
        index: usize,
        state: StepState,
    ) -> Result<(), EngineError> {
        if !self.orders.get(&id).is_some_and(|o| index < o.items.len()) {
            return Err(EngineError::NotFound(id));
        }
        let _gate = self.compaction.read().await;
        self.persist_engine_event(&Event::OrderStepChanged {
            id,
            index: index as u32,
            state,
        })
        .await
    }

    pub(crate) async fn begin_compensation(&self, id: Ulid, reason: &str) -> Result<(), EngineError> {
        let _gate = self.compaction.read().await;
        self.persist_engine_event(&Event::OrderCompensating {
            id,
            reason: truncate_reason(reason),
        })
        .await
    }

    pub(crate) async fn confirm_order(&self, id: Ulid) -> Result<CompositeOrder, EngineError> {
        {
            let _gate = self.compaction.read().await;
            self.persist_engine_event(&Event::OrderConfirmed { id }).await?;
        }
        self.orders
            .get(&id)
            .map(|o| o.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub(crate) async fn fail_order(&self, id: Ulid, reason: &str) -> Result<CompositeOrder, EngineError> {
        {
            let _gate = self.compaction.read().await;
            self.persist_engine_event(&Event::OrderFailed {
                id,
                reason: truncate_reason(reason),
            })
            .await?;
        }
        self.orders
            .get(&id)
            .map(|o| o.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Mutations are paused for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _pause = self.compaction.write().await;

        let mut snapshot: HashMap<Ulid, ResourceState> = HashMap::new();
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for rs in shared {
            let guard = rs.read().await;
            if !guard.retired {
                snapshot.insert(guard.id, guard.clone());
            }
        }

        let mut events = Vec::new();
        let mut ids: Vec<Ulid> = snapshot.keys().copied().collect();
        ids.sort();
        let mut emitted = HashSet::new();
        for id in ids {
            emit_resource(id, &snapshot, &mut emitted, &mut events);
        }

        let mut voided: Vec<Ulid> = self.voided.iter().map(|v| *v).collect();
        voided.sort();
        events.extend(voided.into_iter().map(|id| Event::IntentVoided { id }));

        let mut orders: Vec<CompositeOrder> = self.orders.iter().map(|o| o.value().clone()).collect();
        orders.sort_by_key(|o| o.id);
        for order in orders {
            events.push(Event::OrderOpened {
                id: order.id,
                requester: order.requester.clone(),
                items: order.items.clone(),
            });
            let reason = order.reason.clone().unwrap_or_default();
            match order.status {
                OrderStatus::Pending => {}
                OrderStatus::Compensating => events.push(Event::OrderCompensating { id: order.id, reason }),
                OrderStatus::Confirmed => events.push(Event::OrderConfirmed { id: order.id }),
                OrderStatus::Failed => events.push(Event::OrderFailed { id: order.id, reason }),
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(tenant = %self.tenant, events = count, "WAL compacted");
        Ok(())
    }
}

fn validate_capacity(capacity: &Capacity) -> Result<(), EngineError> {
    if capacity.limit() > MAX_QUANTITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    if let Capacity::Concurrent(0) = capacity {
        return Err(EngineError::Invalid("concurrent capacity must be positive".into()));
    }
    Ok(())
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_REASON_LEN {
        return reason.to_string();
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Parents before children, so replay can link each child to its parent.
fn emit_resource(
    id: Ulid,
    snapshot: &HashMap<Ulid, ResourceState>,
    emitted: &mut HashSet<Ulid>,
    events: &mut Vec<Event>,
) {
    if !emitted.insert(id) {
        return;
    }
    let Some(rs) = snapshot.get(&id) else {
        return;
    };
    if let Some(pid) = rs.parent_id {
        emit_resource(pid, snapshot, emitted, events);
    }

    events.push(Event::ResourceCreated {
        id: rs.id,
        parent_id: rs.parent_id,
        name: rs.name.clone(),
        capacity: rs.capacity,
    });

    let mut allocations: Vec<&Allocation> = rs.allocations.values().collect();
    allocations.sort_by_key(|a| a.id);
    for a in allocations {
        match (a.status, a.expires_at) {
            (AllocationStatus::Pending, Some(expires_at)) => events.push(Event::HoldPlaced {
                id: a.id,
                resource_id: rs.id,
                requester: a.requester.clone(),
                claim: a.claim,
                expires_at,
            }),
            _ => events.push(Event::AllocationConfirmed {
                id: a.id,
                resource_id: rs.id,
                requester: a.requester.clone(),
                claim: a.claim,
                label: a.label.clone(),
            }),
        }
        if !a.status.is_active() {
            events.push(Event::AllocationReleased {
                id: a.id,
                resource_id: rs.id,
                status: a.status,
            });
        }
    }
}

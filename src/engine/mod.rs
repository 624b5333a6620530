mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;

pub use availability::{compute_saturated_spans, free_spans, merge_overlapping, subtract_intervals};
pub use error::{EngineError, ErrorKind};
pub use ledger::Grant;
pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::EventPublisher;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One fsync for the whole batch, then answer every sender.
/// A non-append command ends the batch; it runs after the flush.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut trailing = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            trailing = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = trailing {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes are not
    // carried into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One tenant's reservation engine.
///
/// Each resource sits behind its own `RwLock`; admission and the ledger
/// update for a resource happen under that resource's write guard, so
/// operations on different resources never wait on each other.
pub struct Engine {
    pub tenant: String,
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<dyn EventPublisher>,
    /// Reverse lookup: allocation id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    /// Parent → children index for O(1) child lookups.
    pub(super) children: DashMap<Ulid, Vec<Ulid>>,
    /// Intent ids cancelled before any reserve was seen. A late reserve
    /// carrying one of these is refused.
    pub(super) voided: DashSet<Ulid>,
    pub(super) orders: DashMap<Ulid, CompositeOrder>,
    /// One lock per intent id with a reserve or hold in flight.
    pub(super) intents: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Shared by every mutation, taken exclusively while the WAL is
    /// compacted so the snapshot cannot miss a concurrent append.
    pub(super) compaction: RwLock<()>,
}

/// Apply an event directly to a ResourceState (caller holds the lock).
fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    tenant: &str,
    entity_map: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::AllocationConfirmed {
            id,
            resource_id,
            requester,
            claim,
            label,
        } => {
            rs.occupy(Allocation {
                id: *id,
                resource_id: *resource_id,
                tenant: tenant.to_string(),
                requester: requester.clone(),
                claim: *claim,
                status: AllocationStatus::Confirmed,
                label: label.clone(),
                expires_at: None,
            });
            entity_map.insert(*id, *resource_id);
        }
        Event::HoldPlaced {
            id,
            resource_id,
            requester,
            claim,
            expires_at,
        } => {
            rs.occupy(Allocation {
                id: *id,
                resource_id: *resource_id,
                tenant: tenant.to_string(),
                requester: requester.clone(),
                claim: *claim,
                status: AllocationStatus::Pending,
                label: None,
                expires_at: Some(*expires_at),
            });
            entity_map.insert(*id, *resource_id);
        }
        Event::HoldConfirmed { id, .. } => {
            if let Some(a) = rs.allocations.get_mut(id)
                && a.status == AllocationStatus::Pending
            {
                a.status = AllocationStatus::Confirmed;
                a.expires_at = None;
            }
        }
        Event::AllocationReleased { id, status, .. } => {
            rs.vacate(*id, *status);
        }
        Event::AllocationPurged { id, .. } => {
            rs.vacate(*id, AllocationStatus::Cancelled);
            rs.allocations.remove(id);
            entity_map.remove(id);
        }
        Event::ResourceUpdated { name, capacity, .. } => {
            rs.name = name.clone();
            rs.capacity = *capacity;
        }
        // Resource lifecycle, tombstones and orders live at the engine level
        Event::ResourceCreated { .. }
        | Event::ResourceDeleted { .. }
        | Event::IntentVoided { .. }
        | Event::OrderOpened { .. }
        | Event::OrderStepChanged { .. }
        | Event::OrderCompensating { .. }
        | Event::OrderConfirmed { .. }
        | Event::OrderFailed { .. } => {}
    }
}

impl Engine {
    pub fn new(
        tenant: impl Into<String>,
        wal_path: PathBuf,
        notify: Arc<dyn EventPublisher>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tenant: tenant.into(),
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_resource: DashMap::new(),
            children: DashMap::new(),
            voided: DashSet::new(),
            orders: DashMap::new(),
            intents: DashMap::new(),
            compaction: RwLock::new(()),
        };

        // We are the sole owner of every Arc here, so try_write never
        // contends. Never block: this may run inside an async context
        // (lazy tenant creation).
        for event in &events {
            match event_resource_id(event) {
                Some(resource_id) => {
                    let Some(rs) = engine.get_resource(&resource_id) else {
                        continue;
                    };
                    if let Ok(mut guard) = rs.try_write() {
                        apply_to_resource(&mut guard, event, &engine.tenant, &engine.entity_to_resource);
                    }
                }
                None => engine.apply_engine_event(event),
            }
        }

        tracing::debug!(
            tenant = %engine.tenant,
            events = events.len(),
            resources = engine.state.len(),
            orders = engine.orders.len(),
            "engine replayed"
        );
        Ok(engine)
    }

    /// Apply an event that is not scoped to a single resource's lock.
    fn apply_engine_event(&self, event: &Event) {
        match event {
            Event::ResourceCreated {
                id,
                parent_id,
                name,
                capacity,
            } => {
                let rs = ResourceState::new(*id, *parent_id, name.clone(), *capacity);
                self.state.insert(*id, Arc::new(RwLock::new(rs)));
                if let Some(pid) = parent_id {
                    self.children.entry(*pid).or_default().push(*id);
                }
            }
            Event::ResourceDeleted { id } => {
                if let Some((_, rs)) = self.state.remove(id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    guard.retired = true;
                    if let Some(pid) = guard.parent_id
                        && let Some(mut kids) = self.children.get_mut(&pid)
                    {
                        kids.retain(|c| c != id);
                    }
                }
                self.children.remove(id);
            }
            Event::IntentVoided { id } => {
                self.voided.insert(*id);
            }
            Event::OrderOpened {
                id,
                requester,
                items,
            } => {
                self.orders.insert(
                    *id,
                    CompositeOrder {
                        id: *id,
                        tenant: self.tenant.clone(),
                        requester: requester.clone(),
                        status: OrderStatus::Pending,
                        items: items.clone(),
                        reason: None,
                    },
                );
            }
            Event::OrderStepChanged { id, index, state } => {
                if let Some(mut order) = self.orders.get_mut(id)
                    && let Some(item) = order.items.get_mut(*index as usize)
                {
                    item.state = *state;
                }
            }
            Event::OrderCompensating { id, reason } => {
                if let Some(mut order) = self.orders.get_mut(id) {
                    order.status = OrderStatus::Compensating;
                    order.reason = Some(reason.clone());
                }
            }
            Event::OrderConfirmed { id } => {
                if let Some(mut order) = self.orders.get_mut(id) {
                    order.status = OrderStatus::Confirmed;
                }
            }
            Event::OrderFailed { id, reason } => {
                if let Some(mut order) = self.orders.get_mut(id) {
                    order.status = OrderStatus::Failed;
                    order.reason = Some(reason.clone());
                }
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append then apply, under the caller's write guard.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.tenant, &self.entity_to_resource);
        Ok(())
    }

    /// WAL-append then apply for engine-level events (resource lifecycle,
    /// tombstones, order progress).
    pub(super) async fn persist_engine_event(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_engine_event(event);
        Ok(())
    }

    /// Lookup allocation → resource, get resource, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(*entity_id));
        }
        Ok((resource_id, guard))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The resource whose lock an event is applied under, if any.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::AllocationConfirmed { resource_id, .. }
        | Event::HoldPlaced { resource_id, .. }
        | Event::HoldConfirmed { resource_id, .. }
        | Event::AllocationReleased { resource_id, .. }
        | Event::AllocationPurged { resource_id, .. } => Some(*resource_id),
        Event::ResourceUpdated { id, .. } => Some(*id),
        _ => None,
    }
}

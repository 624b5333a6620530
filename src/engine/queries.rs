use ulid::Ulid;

use crate::auth::AuthContext;
use crate::limits::*;
use crate::model::*;

use super::availability::free_spans;
use super::conflict::validate_claim;
use super::{Engine, EngineError};

impl Engine {
    /// Every resource of the caller's tenant, ordered by id.
    pub async fn list_resources(&self, ctx: &AuthContext) -> Vec<ResourceInfo> {
        if ctx.tenant != self.tenant {
            return Vec::new();
        }
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::with_capacity(shared.len());
        for rs in shared {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            result.push(ResourceInfo {
                id: guard.id,
                tenant: self.tenant.clone(),
                parent_id: guard.parent_id,
                name: guard.name.clone(),
                capacity: guard.capacity,
                active_allocations: guard.live_allocations,
            });
        }
        result.sort_by_key(|r| r.id);
        result
    }

    /// Allocations recorded against a resource (released ones included),
    /// ordered by id.
    pub async fn get_allocations(
        &self,
        ctx: &AuthContext,
        resource_id: Ulid,
    ) -> Result<Vec<Allocation>, EngineError> {
        self.check_tenant(ctx, resource_id)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(resource_id));
        }
        let mut allocations: Vec<Allocation> = guard.allocations.values().cloned().collect();
        allocations.sort_by_key(|a| a.id);
        Ok(allocations)
    }

    pub async fn get_allocation(&self, ctx: &AuthContext, id: Ulid) -> Result<Allocation, EngineError> {
        self.check_tenant(ctx, id)?;
        let resource_id = self
            .get_resource_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.allocations.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Capacity still free for `claim` on a resource.
    pub async fn remaining(
        &self,
        ctx: &AuthContext,
        resource_id: Ulid,
        claim: Claim,
    ) -> Result<u64, EngineError> {
        self.check_tenant(ctx, resource_id)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(resource_id));
        }
        validate_claim(&guard.capacity, &claim)?;
        Ok(guard.remaining(&claim))
    }

    /// Free sub-spans of `[start, end)` on an interval resource.
    pub async fn compute_availability(
        &self,
        ctx: &AuthContext,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        self.check_tenant(ctx, resource_id)?;
        let query = Span { start, end };
        if start >= end {
            return Err(EngineError::Invalid(format!(
                "window start {start} must be before end {end}"
            )));
        }
        if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if query.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(resource_id));
        }
        if !guard.capacity.is_interval() {
            return Err(EngineError::Invalid(
                "availability windows only apply to time-sliced resources".into(),
            ));
        }
        Ok(free_spans(&guard, &query))
    }

    pub fn get_order(&self, ctx: &AuthContext, id: Ulid) -> Result<CompositeOrder, EngineError> {
        self.check_tenant(ctx, id)?;
        self.order(id).ok_or(EngineError::NotFound(id))
    }

    pub(crate) fn order(&self, id: Ulid) -> Option<CompositeOrder> {
        self.orders.get(&id).map(|o| o.value().clone())
    }

    /// Ids of orders the recovery sweeper should drive, oldest first.
    pub(crate) fn orders_needing_recovery(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .orders
            .iter()
            .filter(|o| o.value().needs_recovery())
            .map(|o| *o.key())
            .collect();
        ids.sort();
        ids
    }
}

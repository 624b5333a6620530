//! Composite checkout: reserve every line item, take payment, and either
//! confirm the whole order or compensate what was reserved.
//!
//! Order progress is persisted through the tenant engine's WAL after every
//! step, so a crash mid-saga leaves a record the recovery sweeper can
//! finish. A FAILED order holds nothing except steps marked UNRESOLVED,
//! which the sweeper keeps retrying.

mod gateway;
mod payment;
mod remote;

pub use gateway::{GatewayError, LocalGateway, ReservationGateway};
pub use payment::{ApproveAll, PaymentError, PaymentGateway};
pub use remote::{PgGateway, RemoteEndpoint};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use serde_json::json;
use ulid::Ulid;

use crate::auth::AuthContext;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::notify::{ORDER_CONFIRMED, ORDER_FAILED};
use crate::observability;

#[derive(Debug, Clone)]
pub struct SagaPolicy {
    /// Bound on a single reserve or cancel call.
    pub step_timeout: Duration,
    pub payment_timeout: Duration,
    /// Cancel attempts per step before it is marked UNRESOLVED.
    pub compensation_attempts: u32,
    /// Linear backoff unit between cancel attempts.
    pub backoff: Duration,
}

impl Default for SagaPolicy {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(5),
            payment_timeout: Duration::from_secs(5),
            compensation_attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("order {0} is already being processed")]
    InProgress(Ulid),
}

impl SagaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::Engine(e) => e.kind(),
            SagaError::InProgress(_) => ErrorKind::Conflict,
        }
    }
}

/// Drives composite orders. Shared across tenants; every call names the
/// tenant engine the order lives in.
pub struct SagaCoordinator {
    gateway: Arc<dyn ReservationGateway>,
    payment: Arc<dyn PaymentGateway>,
    policy: SagaPolicy,
    /// `(tenant, order id)` pairs currently driven in this process.
    driving: Arc<DashSet<(String, Ulid)>>,
}

/// Removes an order from the in-flight set however the drive ends.
struct DrivingGuard {
    set: Arc<DashSet<(String, Ulid)>>,
    key: (String, Ulid),
}

impl Drop for DrivingGuard {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

impl SagaCoordinator {
    pub fn new(
        gateway: Arc<dyn ReservationGateway>,
        payment: Arc<dyn PaymentGateway>,
        policy: SagaPolicy,
    ) -> Self {
        Self {
            gateway,
            payment,
            policy,
            driving: Arc::new(DashSet::new()),
        }
    }

    fn claim_order(&self, tenant: &str, id: Ulid) -> Option<DrivingGuard> {
        let key = (tenant.to_string(), id);
        if !self.driving.insert(key.clone()) {
            return None;
        }
        Some(DrivingGuard {
            set: self.driving.clone(),
            key,
        })
    }

    /// Run a checkout to a terminal state. Re-submitting an order id that
    /// already exists returns the stored order without running it again.
    /// A saga that fails is still `Ok`, carrying the FAILED order.
    pub async fn checkout(
        &self,
        engine: &Engine,
        ctx: &AuthContext,
        order_id: Ulid,
        items: Vec<OrderItem>,
    ) -> Result<CompositeOrder, SagaError> {
        let Some(_driving) = self.claim_order(&ctx.tenant, order_id) else {
            return Err(SagaError::InProgress(order_id));
        };
        if let Ok(existing) = engine.get_order(ctx, order_id) {
            tracing::debug!(tenant = %ctx.tenant, order = %order_id, status = existing.status.as_str(), "checkout replay");
            return Ok(existing);
        }

        let started = Instant::now();
        let order = engine.open_order(ctx, order_id, &items).await?;
        tracing::info!(tenant = %ctx.tenant, order = %order_id, items = order.items.len(), "checkout started");

        let result = self.drive(engine, ctx, order).await;

        let outcome = match &result {
            Ok(o) if o.status == OrderStatus::Confirmed => "confirmed",
            Ok(_) => "failed",
            Err(_) => "error",
        };
        metrics::counter!(observability::SAGAS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::SAGA_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn drive(
        &self,
        engine: &Engine,
        ctx: &AuthContext,
        order: CompositeOrder,
    ) -> Result<CompositeOrder, SagaError> {
        let mut reserved: Vec<usize> = Vec::with_capacity(order.items.len());

        for (index, item) in order.items.iter().enumerate() {
            let outcome = tokio::time::timeout(
                self.policy.step_timeout,
                self.gateway
                    .reserve(ctx, item.intent_id, item.resource_id, item.claim),
            )
            .await
            .unwrap_or(Err(GatewayError::Timeout));

            match outcome {
                Ok(_) => {
                    engine.set_step_state(order.id, index, StepState::Reserved).await?;
                    reserved.push(index);
                }
                Err(e) => {
                    tracing::warn!(
                        tenant = %ctx.tenant,
                        order = %order.id,
                        step = index,
                        resource = %item.resource_id,
                        "reserve failed: {e}"
                    );
                    engine.set_step_state(order.id, index, StepState::Failed).await?;
                    // An unknown outcome may have left a reservation behind.
                    if e.outcome_unknown() {
                        reserved.push(index);
                    }
                    let reason = format!("item {} on resource {}: {e}", index + 1, item.resource_id);
                    return self.abort(engine, ctx, order.id, &reason, reserved).await;
                }
            }
        }

        let snapshot = engine.order(order.id).ok_or(EngineError::NotFound(order.id))?;
        let paid = tokio::time::timeout(self.policy.payment_timeout, self.payment.charge(ctx, &snapshot))
            .await
            .unwrap_or_else(|_| Err(PaymentError::Unavailable("payment timed out".into())));
        if let Err(e) = paid {
            tracing::warn!(tenant = %ctx.tenant, order = %order.id, "payment failed: {e}");
            return self
                .abort(engine, ctx, order.id, &e.to_string(), reserved)
                .await;
        }

        let confirmed = engine.confirm_order(order.id).await?;
        engine.notify.publish(ORDER_CONFIRMED, order_payload(&confirmed));
        tracing::info!(tenant = %ctx.tenant, order = %order.id, "order confirmed");
        Ok(confirmed)
    }

    /// COMPENSATING → FAILED. `targets` are step indices in the order they
    /// were attempted; they are cancelled newest first.
    async fn abort(
        &self,
        engine: &Engine,
        ctx: &AuthContext,
        order_id: Ulid,
        reason: &str,
        mut targets: Vec<usize>,
    ) -> Result<CompositeOrder, SagaError> {
        engine.begin_compensation(order_id, reason).await?;
        targets.reverse();
        self.compensate(engine, ctx, order_id, &targets).await?;

        let failed = engine.fail_order(order_id, reason).await?;
        engine.notify.publish(ORDER_FAILED, order_payload(&failed));
        tracing::info!(tenant = %ctx.tenant, order = %order_id, reason, "order failed");
        Ok(failed)
    }

    /// Cancel each target step, retrying with linear backoff. A step whose
    /// cancel never succeeds is marked UNRESOLVED; it does not stop the
    /// remaining steps from being compensated.
    async fn compensate(
        &self,
        engine: &Engine,
        ctx: &AuthContext,
        order_id: Ulid,
        targets: &[usize],
    ) -> Result<(), SagaError> {
        let order = engine.order(order_id).ok_or(EngineError::NotFound(order_id))?;
        for &index in targets {
            let Some(item) = order.items.get(index) else {
                continue;
            };
            let state = if self.cancel_with_retry(ctx, item.intent_id).await {
                metrics::counter!(observability::COMPENSATIONS_TOTAL).increment(1);
                StepState::Compensated
            } else {
                metrics::counter!(observability::COMPENSATION_UNRESOLVED_TOTAL).increment(1);
                tracing::error!(
                    tenant = %ctx.tenant,
                    order = %order_id,
                    step = index,
                    intent = %item.intent_id,
                    resource = %item.resource_id,
                    "compensation exhausted retries, step left unresolved"
                );
                StepState::Unresolved
            };
            engine.set_step_state(order_id, index, state).await?;
        }
        Ok(())
    }

    async fn cancel_with_retry(&self, ctx: &AuthContext, intent_id: Ulid) -> bool {
        let attempts = self.policy.compensation_attempts.max(1);
        for attempt in 1..=attempts {
            let outcome = tokio::time::timeout(self.policy.step_timeout, self.gateway.cancel(ctx, intent_id))
                .await
                .unwrap_or(Err(GatewayError::Timeout));
            match outcome {
                Ok(()) | Err(GatewayError::NotFound(_)) => return true,
                Err(e) => {
                    tracing::warn!(intent = %intent_id, attempt, "cancel failed: {e}");
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.backoff * attempt).await;
                    }
                }
            }
        }
        false
    }

    /// Finish orders a crash left behind and retry unresolved compensation.
    /// Orders this coordinator is currently driving are skipped. Returns the
    /// number of orders touched.
    pub async fn recover(&self, engine: &Engine) -> usize {
        let mut touched = 0;
        for order_id in engine.orders_needing_recovery() {
            let Some(_driving) = self.claim_order(&engine.tenant, order_id) else {
                continue;
            };
            let Some(order) = engine.order(order_id) else {
                continue;
            };
            match self.recover_order(engine, order).await {
                Ok(()) => touched += 1,
                Err(e) => tracing::warn!(tenant = %engine.tenant, order = %order_id, "recovery failed: {e}"),
            }
        }
        if touched > 0 {
            metrics::counter!(observability::SAGAS_RECOVERED_TOTAL).increment(touched as u64);
        }
        touched
    }

    async fn recover_order(&self, engine: &Engine, order: CompositeOrder) -> Result<(), SagaError> {
        let ctx = AuthContext::member(order.tenant.clone(), order.requester.clone());
        let was_failed = order.status == OrderStatus::Failed;
        let reason = order
            .reason
            .clone()
            .unwrap_or_else(|| "interrupted before completion".to_string());

        let targets: Vec<usize> = if was_failed {
            order
                .items
                .iter()
                .enumerate()
                .rev()
                .filter(|(_, i)| i.state == StepState::Unresolved)
                .map(|(idx, _)| idx)
                .collect()
        } else {
            tracing::warn!(tenant = %order.tenant, order = %order.id, status = order.status.as_str(), "recovering interrupted order");
            if order.status == OrderStatus::Pending {
                engine.begin_compensation(order.id, &reason).await?;
            }
            recovery_targets(&order)
        };

        self.compensate(engine, &ctx, order.id, &targets).await?;
        let failed = engine.fail_order(order.id, &reason).await?;
        if !was_failed {
            engine.notify.publish(ORDER_FAILED, order_payload(&failed));
        }
        Ok(())
    }
}

/// Steps of an interrupted order that may hold capacity, newest first.
/// Steps run in sequence, so nothing after the first PENDING step was ever
/// attempted; that step itself might have been in flight.
fn recovery_targets(order: &CompositeOrder) -> Vec<usize> {
    let mut targets = Vec::new();
    for (index, item) in order.items.iter().enumerate() {
        match item.state {
            StepState::Compensated => {}
            StepState::Pending => {
                targets.push(index);
                break;
            }
            StepState::Reserved | StepState::Failed | StepState::Unresolved => targets.push(index),
        }
    }
    targets.reverse();
    targets
}

fn order_payload(order: &CompositeOrder) -> serde_json::Value {
    let items: Vec<serde_json::Value> = order
        .items
        .iter()
        .map(|item| {
            let mut line = json!({
                "intentId": item.intent_id.to_string(),
                "resourceId": item.resource_id.to_string(),
                "state": item.state.as_str(),
            });
            match item.claim {
                Claim::Interval(span) => {
                    line["start"] = json!(span.start);
                    line["end"] = json!(span.end);
                }
                Claim::Quantity(n) => line["quantity"] = json!(n),
            }
            line
        })
        .collect();

    let mut payload = json!({
        "orderId": order.id.to_string(),
        "tenant": order.tenant,
        "requester": order.requester,
        "status": order.status.as_str(),
        "items": items,
    });
    if let Some(reason) = &order.reason {
        payload["reason"] = json!(reason);
    }
    payload
}

use std::sync::Arc;

use async_trait::async_trait;
use ulid::Ulid;

use crate::auth::AuthContext;
use crate::engine::{EngineError, ErrorKind};
use crate::model::Claim;
use crate::tenant::TenantManager;

/// How a reservation endpoint answered. `Unavailable` and `Timeout` leave
/// the outcome unknown: the reserve may or may not have landed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Invalid(String),
    #[error("reservation service unavailable: {0}")]
    Unavailable(String),
    #[error("reservation service timed out")]
    Timeout,
}

impl GatewayError {
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::Timeout)
    }
}

impl From<EngineError> for GatewayError {
    fn from(e: EngineError) -> Self {
        match e.kind() {
            ErrorKind::Validation | ErrorKind::Forbidden => GatewayError::Invalid(e.to_string()),
            ErrorKind::NotFound => GatewayError::NotFound(e.to_string()),
            ErrorKind::Conflict => GatewayError::Conflict(e.to_string()),
            ErrorKind::Internal => GatewayError::Unavailable(e.to_string()),
        }
    }
}

/// The reservation capability a saga step talks to. `reserve` is keyed by
/// intent id and must be idempotent on it; `cancel` must be idempotent too.
#[async_trait]
pub trait ReservationGateway: Send + Sync {
    async fn reserve(
        &self,
        ctx: &AuthContext,
        intent_id: Ulid,
        resource_id: Ulid,
        claim: Claim,
    ) -> Result<Ulid, GatewayError>;

    async fn cancel(&self, ctx: &AuthContext, intent_id: Ulid) -> Result<(), GatewayError>;
}

/// In-process gateway: calls straight into the caller's tenant engine.
pub struct LocalGateway {
    tenants: Arc<TenantManager>,
}

impl LocalGateway {
    pub fn new(tenants: Arc<TenantManager>) -> Self {
        Self { tenants }
    }
}

#[async_trait]
impl ReservationGateway for LocalGateway {
    async fn reserve(
        &self,
        ctx: &AuthContext,
        intent_id: Ulid,
        resource_id: Ulid,
        claim: Claim,
    ) -> Result<Ulid, GatewayError> {
        let engine = self
            .tenants
            .get_or_create(&ctx.tenant)
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        let ctx = ctx.clone();
        // Run detached: if the saga's step timeout fires, the engine call
        // still finishes its WAL append and in-memory apply together.
        tokio::spawn(async move {
            engine
                .reserve(&ctx, intent_id, resource_id, claim, None)
                .await
                .map(|a| a.id)
        })
        .await
        .map_err(|e| GatewayError::Unavailable(e.to_string()))?
        .map_err(GatewayError::from)
    }

    async fn cancel(&self, ctx: &AuthContext, intent_id: Ulid) -> Result<(), GatewayError> {
        let engine = self
            .tenants
            .get_or_create(&ctx.tenant)
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        let ctx = ctx.clone();
        tokio::spawn(async move { engine.cancel(&ctx, intent_id).await })
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?
            .map_err(GatewayError::from)
    }
}

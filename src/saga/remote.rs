use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

use crate::auth::AuthContext;
use crate::model::Claim;

use super::gateway::{GatewayError, ReservationGateway};

/// Where a sibling reservoir instance listens.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// Gateway to another reservoir instance over the PostgreSQL wire
/// protocol. The caller's tenant becomes the database name and the
/// requester the login user, so the remote side applies the same tenant
/// isolation as a local call.
///
/// Each attempt is bounded by `attempt_timeout`. Only outcome-unknown
/// failures are retried; reserve is safe to repeat because the remote side
/// is idempotent on the intent id.
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(100);

pub struct PgGateway {
    endpoint: RemoteEndpoint,
    attempt_timeout: Duration,
    attempts: u32,
    backoff: Duration,
    clients: DashMap<(String, String), Arc<Client>>,
}

impl PgGateway {
    pub fn new(endpoint: RemoteEndpoint, attempt_timeout: Duration, attempts: u32, backoff: Duration) -> Self {
        Self {
            endpoint,
            attempt_timeout,
            attempts: attempts.max(1),
            backoff,
            clients: DashMap::new(),
        }
    }

    /// Per-attempt timeout that lets every attempt, plus the linear backoff
    /// between them, finish inside one saga step bound. One attempt's share
    /// is left over so the last failure is reported before the step bound
    /// fires.
    pub fn attempt_timeout_within(step_timeout: Duration, attempts: u32, backoff: Duration) -> Duration {
        let attempts = attempts.max(1);
        let backoff_total = backoff * (attempts * (attempts - 1) / 2);
        (step_timeout.saturating_sub(backoff_total) / (attempts + 1)).max(MIN_ATTEMPT_TIMEOUT)
    }

    async fn client(&self, ctx: &AuthContext) -> Result<Arc<Client>, GatewayError> {
        let key = (ctx.tenant.clone(), ctx.requester.clone());
        if let Some(client) = self.clients.get(&key)
            && !client.is_closed()
        {
            return Ok(client.value().clone());
        }

        let mut config = Config::new();
        config
            .host(&self.endpoint.host)
            .port(self.endpoint.port)
            .dbname(&ctx.tenant)
            .user(&ctx.requester)
            .password(&self.endpoint.password)
            .connect_timeout(self.attempt_timeout);
        let (client, connection) = config.connect(NoTls).await.map_err(map_pg_error)?;
        let host = self.endpoint.host.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("remote connection to {host} closed: {e}");
            }
        });

        let client = Arc::new(client);
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    async fn execute(&self, ctx: &AuthContext, sql: &str) -> Result<(), GatewayError> {
        let mut last = GatewayError::Timeout;
        for attempt in 1..=self.attempts {
            let outcome = tokio::time::timeout(self.attempt_timeout, async {
                let client = self.client(ctx).await?;
                client.simple_query(sql).await.map_err(map_pg_error)?;
                Ok::<(), GatewayError>(())
            })
            .await
            .unwrap_or(Err(GatewayError::Timeout));

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.outcome_unknown() => {
                    tracing::warn!(attempt, tenant = %ctx.tenant, "remote call failed: {e}");
                    self.clients
                        .remove(&(ctx.tenant.clone(), ctx.requester.clone()));
                    last = e;
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}

#[async_trait]
impl ReservationGateway for PgGateway {
    async fn reserve(
        &self,
        ctx: &AuthContext,
        intent_id: Ulid,
        resource_id: Ulid,
        claim: Claim,
    ) -> Result<Ulid, GatewayError> {
        self.execute(ctx, &reserve_sql(intent_id, resource_id, &claim)).await?;
        Ok(intent_id)
    }

    async fn cancel(&self, ctx: &AuthContext, intent_id: Ulid) -> Result<(), GatewayError> {
        self.execute(ctx, &format!("DELETE FROM allocations WHERE id = '{intent_id}'"))
            .await
    }
}

pub(crate) fn reserve_sql(intent_id: Ulid, resource_id: Ulid, claim: &Claim) -> String {
    match claim {
        Claim::Interval(span) => format!(
            r#"INSERT INTO allocations (id, resource_id, start, "end") VALUES ('{intent_id}', '{resource_id}', {}, {})"#,
            span.start, span.end
        ),
        Claim::Quantity(n) => format!(
            "INSERT INTO allocations (id, resource_id, quantity) VALUES ('{intent_id}', '{resource_id}', {n})"
        ),
    }
}

/// SQLSTATE → gateway error. Anything without a server-side code (refused
/// connection, reset, closed) leaves the outcome unknown.
fn map_pg_error(e: tokio_postgres::Error) -> GatewayError {
    let Some(db) = e.as_db_error() else {
        return GatewayError::Unavailable(e.to_string());
    };
    let message = db.message().to_string();
    match db.code() {
        c if *c == SqlState::EXCLUSION_VIOLATION => GatewayError::Conflict(message),
        c if *c == SqlState::NO_DATA_FOUND => GatewayError::NotFound(message),
        c if *c == SqlState::INVALID_PARAMETER_VALUE
            || *c == SqlState::INSUFFICIENT_PRIVILEGE
            || *c == SqlState::SYNTAX_ERROR
            || *c == SqlState::INVALID_PASSWORD =>
        {
            GatewayError::Invalid(message)
        }
        _ => GatewayError::Unavailable(message),
    }
}

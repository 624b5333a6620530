use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use serde_json::json;
use tokio::net::TcpStream;

use crate::auth::{AuthContext, ReservoirAuthSource, RoleMap};
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::saga::{SagaCoordinator, SagaError};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct ReservoirHandler {
    tenant_manager: Arc<TenantManager>,
    saga: Arc<SagaCoordinator>,
    roles: RoleMap,
    query_parser: Arc<ReservoirQueryParser>,
}

impl ReservoirHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, saga: Arc<SagaCoordinator>, roles: RoleMap) -> Self {
        Self {
            tenant_manager,
            saga,
            roles,
            query_parser: Arc::new(ReservoirQueryParser),
        }
    }

    /// Database name selects the tenant, login user is the requester.
    fn resolve<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, AuthContext)> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let user = metadata
            .get("user")
            .cloned()
            .unwrap_or_else(|| "anonymous".to_string());
        let engine = self.tenant_manager.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })?;
        let ctx = self.roles.context(&db, &user);
        Ok((engine, ctx))
    }

    async fn run(&self, engine: &Engine, ctx: &AuthContext, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, ctx, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        ctx: &AuthContext,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertResource {
                id,
                parent_id,
                name,
                capacity,
            } => {
                engine
                    .create_resource(ctx, id, parent_id, name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateResource { id, name, capacity } => {
                engine
                    .update_resource(ctx, id, name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(ctx, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAllocation {
                id,
                resource_id,
                claim,
                label,
            } => {
                engine
                    .reserve(ctx, id, resource_id, claim, label)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertHold {
                id,
                resource_id,
                claim,
                expires_at,
            } => {
                engine
                    .hold(ctx, id, resource_id, claim, expires_at)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ConfirmHold { id } => {
                engine.confirm_hold(ctx, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteAllocation { id } => {
                engine.cancel(ctx, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertOrder { id, items } => {
                // Synchronous: the order is terminal when this returns.
                let order = self
                    .saga
                    .checkout(engine, ctx, id, items)
                    .await
                    .map_err(saga_err)?;
                tracing::debug!(order = %order.id, status = order.status.as_str(), "checkout finished");
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectResources => {
                let resources = engine.list_resources(ctx).await;
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.parent_id.map(|p| p.to_string()))?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.capacity.kind_label())?;
                        encoder.encode_field(&i64::from(r.capacity.limit()))?;
                        encoder.encode_field(&(r.active_allocations as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAllocations { resource_id } => {
                let allocations = engine
                    .get_allocations(ctx, resource_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(allocations_schema());
                let rows: Vec<PgWireResult<_>> = allocations
                    .into_iter()
                    .map(|a| {
                        let (start, end, quantity) = match a.claim {
                            Claim::Interval(span) => (Some(span.start), Some(span.end), None),
                            Claim::Quantity(n) => (None, None, Some(i64::from(n))),
                        };
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.resource_id.to_string())?;
                        encoder.encode_field(&a.requester)?;
                        encoder.encode_field(&a.status.as_str())?;
                        encoder.encode_field(&start)?;
                        encoder.encode_field(&end)?;
                        encoder.encode_field(&quantity)?;
                        encoder.encode_field(&a.label)?;
                        encoder.encode_field(&a.expires_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectOrder { id } => {
                let order = engine.get_order(ctx, id).map_err(engine_err)?;
                let schema = Arc::new(orders_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&order.id.to_string())?;
                encoder.encode_field(&order.requester)?;
                encoder.encode_field(&order.status.as_str())?;
                encoder.encode_field(&order.reason)?;
                encoder.encode_field(&items_json(&order))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailability {
                resource_id,
                start,
                end,
            } => {
                let slots = engine
                    .compute_availability(ctx, resource_id, start, end)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rid_str = resource_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectRemaining { resource_id, claim } => {
                let remaining = engine
                    .remaining(ctx, resource_id, claim)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(remaining_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&resource_id.to_string())?;
                encoder.encode_field(&i64::try_from(remaining).unwrap_or(i64::MAX))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn items_json(order: &CompositeOrder) -> String {
    let items: Vec<serde_json::Value> = order
        .items
        .iter()
        .map(|item| {
            let mut line = json!({
                "intent_id": item.intent_id.to_string(),
                "resource_id": item.resource_id.to_string(),
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
    serde_json::Value::Array(items).to_string()
}

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("parent_id"),
        text("name"),
        text("kind"),
        int8("capacity"),
        int8("active_allocations"),
    ]
}

fn allocations_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("resource_id"),
        text("requester"),
        text("status"),
        int8("start"),
        int8("end"),
        int8("quantity"),
        text("label"),
        int8("expires_at"),
    ]
}

fn orders_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("requester"), text("status"), text("reason"), text("items")]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("resource_id"), int8("start"), int8("end")]
}

fn remaining_schema() -> Vec<FieldInfo> {
    vec![text("resource_id"), int8("remaining")]
}

/// Result columns for a statement, judged from the table after FROM so
/// parameterized statements can be described before binding.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut tokens = lower.split_whitespace();
    if tokens.next() != Some("select") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == ';' || c == '"'));
    match table {
        Some("resources") => resources_schema(),
        Some("allocations") => allocations_schema(),
        Some("orders") => orders_schema(),
        Some("availability") => availability_schema(),
        Some("remaining") => remaining_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ReservoirHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, ctx) = self.resolve(client)?;
        Ok(vec![self.run(&engine, &ctx, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReservoirQueryParser;

#[async_trait]
impl QueryParser for ReservoirQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservoirHandler {
    type Statement = String;
    type QueryParser = ReservoirQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, ctx) = self.resolve(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &ctx, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservoirFactory {
    handler: Arc<ReservoirHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ReservoirAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ReservoirFactory {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        saga: Arc<SagaCoordinator>,
        roles: RoleMap,
        password: String,
    ) -> Self {
        let auth_source = ReservoirAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservoirHandler::new(tenant_manager, saga, roles)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservoirFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    saga: Arc<SagaCoordinator>,
    roles: RoleMap,
    password: String,
) -> std::io::Result<()> {
    let factory = ReservoirFactory::new(tenant_manager, saga, roles, password);
    pgwire::tokio::process_socket(socket, None, Arc::new(factory)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => "23P01",
        ErrorKind::Forbidden => "42501",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.kind() == ErrorKind::Internal {
        tracing::error!("engine error: {e}");
    }
    user_error(sqlstate(e.kind()), e.to_string())
}

fn saga_err(e: SagaError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_sqlstates() {
        let cases = [
            (EngineError::Invalid("start >= end".into()), "22023"),
            (EngineError::LimitExceeded("label too long"), "22023"),
            (EngineError::NotFound(ulid::Ulid::new()), "P0002"),
            (EngineError::Conflict(ulid::Ulid::new()), "23P01"),
            (EngineError::CapacityExceeded(3), "23P01"),
            (EngineError::IntentVoided(ulid::Ulid::new()), "23P01"),
            (EngineError::Forbidden("admin only"), "42501"),
            (EngineError::WalError("disk full".into()), "XX000"),
        ];
        for (err, code) in cases {
            assert_eq!(sqlstate(err.kind()), code, "{err}");
        }
        assert_eq!(sqlstate(SagaError::InProgress(ulid::Ulid::new()).kind()), "23P01");
    }

    #[test]
    fn result_schema_follows_from_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("SELECT * FROM availability WHERE resource_id = $1 AND start >= $2 AND \"end\" <= $3"),
            vec!["resource_id", "start", "end"]
        );
        assert_eq!(names("select * from remaining where resource_id = $1 and quantity = 1")[1], "remaining");
        assert_eq!(names("SELECT * FROM orders WHERE id = $1").len(), 5);
        assert_eq!(names("SELECT * FROM resources;").len(), 6);
        assert!(names("INSERT INTO allocations (id) VALUES ($1)").is_empty());
    }

    #[test]
    fn count_params_takes_highest_index() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("INSERT INTO holds (id, resource_id) VALUES ($1, $2)"), 2);
        assert_eq!(count_params("VALUES ($10, $2)"), 10);
    }

    #[test]
    fn order_items_json_lists_steps() {
        let order = CompositeOrder {
            id: ulid::Ulid::new(),
            tenant: "campus".into(),
            requester: "alice".into(),
            status: OrderStatus::Failed,
            items: vec![LineItem {
                intent_id: ulid::Ulid::new(),
                resource_id: ulid::Ulid::new(),
                claim: Claim::Quantity(2),
                state: StepState::Compensated,
            }],
            reason: Some("conflict".into()),
        };
        let parsed: serde_json::Value = serde_json::from_str(&items_json(&order)).unwrap();
        assert_eq!(parsed[0]["state"], "COMPENSATED");
        assert_eq!(parsed[0]["quantity"], 2);
    }
}

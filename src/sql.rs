use std::collections::HashMap;

use serde::Deserialize;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        parent_id: Option<Ulid>,
        name: Option<String>,
        capacity: Capacity,
    },
    UpdateResource {
        id: Ulid,
        name: Option<String>,
        capacity: Capacity,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertAllocation {
        id: Ulid,
        resource_id: Ulid,
        claim: Claim,
        label: Option<String>,
    },
    InsertHold {
        id: Ulid,
        resource_id: Ulid,
        claim: Claim,
        expires_at: Ms,
    },
    ConfirmHold {
        id: Ulid,
    },
    DeleteAllocation {
        id: Ulid,
    },
    InsertOrder {
        id: Ulid,
        items: Vec<OrderItem>,
    },
    SelectResources,
    SelectAllocations {
        resource_id: Ulid,
    },
    SelectOrder {
        id: Ulid,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectRemaining {
        resource_id: Ulid,
        claim: Claim,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column name to value for the first VALUES row. Columns must be named.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn get(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.values.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn has(&self, col: &str) -> bool {
        self.values.contains_key(col)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.get(col)?)
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        match self.values.get(col) {
            Some(expr) => parse_ulid_or_null(expr),
            None => Ok(None),
        }
    }

    fn opt_string(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        match self.values.get(col) {
            Some(expr) => parse_string_or_null(expr),
            None => Ok(None),
        }
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64(self.get(col)?)
    }

    /// `quantity` for unit claims, otherwise `start` + `"end"`.
    fn claim(&self) -> Result<Claim, SqlError> {
        if self.has("quantity") {
            return Ok(Claim::Quantity(parse_u32(self.get("quantity")?)?));
        }
        Ok(Claim::Interval(Span {
            start: self.i64("start")?,
            end: self.i64("end")?,
        }))
    }

    fn capacity(&self) -> Result<Capacity, SqlError> {
        let kind = match self.values.get("kind") {
            Some(expr) => parse_string_or_null(expr)?,
            None => None,
        };
        let count = match self.values.get("capacity") {
            Some(expr) => Some(parse_u32(expr)?),
            None => None,
        };
        capacity_from(kind.as_deref(), count)
    }
}

fn capacity_from(kind: Option<&str>, count: Option<u32>) -> Result<Capacity, SqlError> {
    match (kind.map(str::to_lowercase).as_deref(), count) {
        (None | Some("exclusive"), None) => Ok(Capacity::Exclusive),
        (Some("exclusive"), Some(1)) => Ok(Capacity::Exclusive),
        (Some("exclusive"), Some(n)) => Err(SqlError::Parse(format!(
            "exclusive resources have capacity 1, got {n}"
        ))),
        (None | Some("concurrent"), Some(n)) => Ok(Capacity::Concurrent(n)),
        (Some("units"), Some(n)) => Ok(Capacity::Units(n)),
        (Some(k @ ("concurrent" | "units")), None) => {
            Err(SqlError::Parse(format!("{k} resources need a capacity")))
        }
        (Some(other), _) => Err(SqlError::Parse(format!("unknown resource kind: {other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let table: &'static str = match table.as_str() {
        "resources" => "resources",
        "resource_updates" => "resource_updates",
        "allocations" => "allocations",
        "holds" => "holds",
        "confirmations" => "confirmations",
        "orders" => "orders",
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, table)?;

    match table {
        "resources" => Ok(Command::InsertResource {
            id: row.ulid("id")?,
            parent_id: row.opt_ulid("parent_id")?,
            name: row.opt_string("name")?,
            capacity: row.capacity()?,
        }),
        "resource_updates" => Ok(Command::UpdateResource {
            id: row.ulid("id")?,
            name: row.opt_string("name")?,
            capacity: row.capacity()?,
        }),
        "allocations" => Ok(Command::InsertAllocation {
            id: row.ulid("id")?,
            resource_id: row.ulid("resource_id")?,
            claim: row.claim()?,
            label: row.opt_string("label")?,
        }),
        "holds" => Ok(Command::InsertHold {
            id: row.ulid("id")?,
            resource_id: row.ulid("resource_id")?,
            claim: row.claim()?,
            expires_at: row.i64("expires_at")?,
        }),
        "confirmations" => Ok(Command::ConfirmHold { id: row.ulid("id")? }),
        _ => {
            let raw = parse_string_or_null(row.get("items")?)?
                .ok_or(SqlError::MissingColumn("orders", "items"))?;
            Ok(Command::InsertOrder {
                id: row.ulid("id")?,
                items: parse_order_items(&raw)?,
            })
        }
    }
}

#[derive(Deserialize)]
struct ItemJson {
    resource_id: Ulid,
    #[serde(default)]
    quantity: Option<u32>,
    #[serde(default)]
    start: Option<Ms>,
    #[serde(default)]
    end: Option<Ms>,
}

/// `[{"resource_id": "...", "quantity": 2}, {"resource_id": "...", "start": 0, "end": 10}]`
pub fn parse_order_items(raw: &str) -> Result<Vec<OrderItem>, SqlError> {
    let items: Vec<ItemJson> =
        serde_json::from_str(raw).map_err(|e| SqlError::Parse(format!("bad order items: {e}")))?;
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let claim = match (item.quantity, item.start, item.end) {
                (Some(n), None, None) => Claim::Quantity(n),
                (None, Some(start), Some(end)) => Claim::Interval(Span { start, end }),
                _ => {
                    return Err(SqlError::Parse(format!(
                        "item {i}: expected quantity or start/end"
                    )));
                }
            };
            Ok(OrderItem {
                resource_id: item.resource_id,
                claim,
            })
        })
        .collect()
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "allocations" | "holds" => Ok(Command::DeleteAllocation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    resource_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    quantity: Option<u32>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut f)?;
    }

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "allocations" => Ok(Command::SelectAllocations {
            resource_id: f.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
        }),
        "orders" => Ok(Command::SelectOrder {
            id: f.id.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            resource_id: f.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "remaining" => {
            let resource_id = f.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?;
            let claim = match (f.quantity, f.start, f.end) {
                (Some(n), _, _) => Claim::Quantity(n),
                (None, Some(start), Some(end)) => Claim::Interval(Span { start, end }),
                _ => return Err(SqlError::MissingFilter("quantity")),
            };
            Ok(Command::SelectRemaining { resource_id, claim })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        let col = expr_column_name(left);
        match (op, col.as_deref()) {
            (ast::BinaryOperator::And, _) => {
                extract_filters(left, f)?;
                extract_filters(right, f)?;
            }
            (ast::BinaryOperator::Eq, Some("id")) => f.id = Some(parse_ulid(right)?),
            (ast::BinaryOperator::Eq, Some("resource_id")) => {
                f.resource_id = Some(parse_ulid(right)?)
            }
            (ast::BinaryOperator::Eq, Some("quantity")) => f.quantity = Some(parse_u32(right)?),
            (ast::BinaryOperator::GtEq | ast::BinaryOperator::Eq, Some("start")) => {
                f.start = Some(parse_i64(right)?)
            }
            (ast::BinaryOperator::LtEq | ast::BinaryOperator::Eq, Some("end")) => {
                f.end = Some(parse_i64(right)?)
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn insert_row(insert: &ast::Insert, table: &'static str) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let first = match body.body.as_ref() {
        SetExpr::Values(values) => values
            .rows
            .first()
            .ok_or(SqlError::Parse("empty VALUES".into()))?,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("{table}: column list required")));
    }
    if insert.columns.len() != first.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), first.len()));
    }
    let values = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .zip(first.iter().cloned())
        .collect();
    Ok(Row { table, values })
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

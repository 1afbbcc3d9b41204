use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use ulid::Ulid;

use crate::model::{Amount, RequestStatus};

/// Staff verdict on a change or cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

/// Parsed command from SQL input. Dates stay as text so the engine reports
/// malformed ones with its own reason.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVan {
        id: Ulid,
        name: String,
        daily_rate: Amount,
        capacity: u32,
    },
    UpdateVanRate {
        id: Ulid,
        daily_rate: Amount,
    },
    SelectVans,
    InsertBooking {
        id: Ulid,
        van_id: Ulid,
        requester_id: Ulid,
        start: String,
        end: String,
    },
    UpdateBookingDates {
        id: Ulid,
        requester_id: Ulid,
        start: String,
        end: String,
    },
    /// Self-service cancel. The row stays; its status changes.
    DeleteBooking {
        id: Ulid,
        requester_id: Ulid,
    },
    SelectBookings {
        requester_id: Ulid,
        id: Option<Ulid>,
    },
    InsertChangeRequest {
        id: Ulid,
        booking_id: Ulid,
        requester_id: Ulid,
        start: String,
        end: String,
    },
    DecideChangeRequest {
        id: Ulid,
        decision: Decision,
    },
    SelectChangeRequests {
        pending_only: bool,
    },
    InsertCancellationRequest {
        id: Ulid,
        booking_id: Ulid,
        requester_id: Ulid,
    },
    DecideCancellationRequest {
        id: Ulid,
        decision: Decision,
    },
    SelectCancellationRequests {
        pending_only: bool,
    },
    SelectFreeWindows {
        van_id: Ulid,
        from: String,
        to: String,
    },
    SelectAvailabilityCheck {
        van_id: Ulid,
        start: String,
        end: String,
    },
    SelectCheckout {
        booking_id: Ulid,
        requester_id: Ulid,
    },
}

impl Command {
    /// Statements only the staff role may run.
    pub fn requires_staff(&self) -> bool {
        matches!(
            self,
            Command::InsertVan { .. }
                | Command::UpdateVanRate { .. }
                | Command::DecideChangeRequest { .. }
                | Command::SelectChangeRequests { .. }
                | Command::DecideCancellationRequest { .. }
                | Command::SelectCancellationRequests { .. }
        )
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() || trimmed == ";" {
        return Err(SqlError::Empty);
    }
    if trimmed
        .get(..6)
        .is_some_and(|kw| kw.eq_ignore_ascii_case("update"))
    {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.as_slice() {
        [] => Err(SqlError::Empty),
        [stmt] => match stmt {
            Statement::Insert(insert) => parse_insert(insert),
            Statement::Delete(delete) => parse_delete(delete),
            Statement::Query(query) => parse_select(query),
            other => Err(SqlError::Unsupported(format!("{other}"))),
        },
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "vans" => {
            let v = insert_values(insert, "vans", &["id", "name", "daily_rate", "capacity"])?;
            Ok(Command::InsertVan {
                id: parse_ulid(&v[0])?,
                name: parse_text(&v[1])?,
                daily_rate: parse_i64(&v[2])?,
                capacity: parse_u32(&v[3])?,
            })
        }
        "bookings" => {
            let v = insert_values(
                insert,
                "bookings",
                &["id", "van_id", "requester_id", "start_date", "end_date"],
            )?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&v[0])?,
                van_id: parse_ulid(&v[1])?,
                requester_id: parse_ulid(&v[2])?,
                start: parse_text(&v[3])?,
                end: parse_text(&v[4])?,
            })
        }
        "change_requests" => {
            let v = insert_values(
                insert,
                "change_requests",
                &["id", "booking_id", "requester_id", "start_date", "end_date"],
            )?;
            Ok(Command::InsertChangeRequest {
                id: parse_ulid(&v[0])?,
                booking_id: parse_ulid(&v[1])?,
                requester_id: parse_ulid(&v[2])?,
                start: parse_text(&v[3])?,
                end: parse_text(&v[4])?,
            })
        }
        "cancellation_requests" => {
            let v = insert_values(insert, "cancellation_requests", &["id", "booking_id", "requester_id"])?;
            Ok(Command::InsertCancellationRequest {
                id: parse_ulid(&v[0])?,
                booking_id: parse_ulid(&v[1])?,
                requester_id: parse_ulid(&v[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// The single VALUES row, reordered to `expected`. Without a column list the
/// row is read positionally.
fn insert_values(
    insert: &ast::Insert,
    table: &'static str,
    expected: &[&'static str],
) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let row = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row,
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };

    if insert.columns.is_empty() {
        if row.len() < expected.len() {
            return Err(SqlError::MissingColumn(table, expected[row.len()]));
        }
        return Ok(row[..expected.len()].to_vec());
    }
    if insert.columns.len() != row.len() {
        return Err(SqlError::Parse(format!(
            "{table}: {} columns but {} values",
            insert.columns.len(),
            row.len()
        )));
    }
    expected
        .iter()
        .map(|col| {
            insert
                .columns
                .iter()
                .position(|c| c.value.eq_ignore_ascii_case(col))
                .map(|i| row[i].clone())
                .ok_or(SqlError::MissingColumn(table, col))
        })
        .collect()
}

// ── UPDATE ────────────────────────────────────────────────────

/// UPDATE is read piecewise with the parser's own building blocks:
/// `UPDATE <table> SET <assignments> WHERE <expr>`.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let perr = |e: sqlparser::parser::ParserError| SqlError::Parse(e.to_string());
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(perr)?;

    parser.expect_keyword(Keyword::UPDATE).map_err(perr)?;
    let table_name = parser.parse_object_name(false).map_err(perr)?;
    let table = object_name_last(&table_name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    parser.expect_keyword(Keyword::SET).map_err(perr)?;
    let assignments = parser
        .parse_comma_separated(|p| p.parse_assignment())
        .map_err(perr)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(perr)?)
    } else {
        None
    };
    parser.consume_token(&Token::SemiColon);
    if parser.peek_token().token != Token::EOF {
        return Err(SqlError::Unsupported("trailing clause after WHERE".into()));
    }

    let mut set: Vec<(String, Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((col, a.value));
    }
    let conds = conditions(selection.as_ref())?;

    match table.as_str() {
        "vans" => Ok(Command::UpdateVanRate {
            id: parse_ulid(require_eq(&conds, "id")?)?,
            daily_rate: parse_i64(assigned(&set, "vans", "daily_rate")?)?,
        }),
        "bookings" => Ok(Command::UpdateBookingDates {
            id: parse_ulid(require_eq(&conds, "id")?)?,
            requester_id: parse_ulid(require_eq(&conds, "requester_id")?)?,
            start: parse_text(assigned(&set, "bookings", "start_date")?)?,
            end: parse_text(assigned(&set, "bookings", "end_date")?)?,
        }),
        "change_requests" => Ok(Command::DecideChangeRequest {
            id: parse_ulid(require_eq(&conds, "id")?)?,
            decision: parse_decision(assigned(&set, "change_requests", "status")?)?,
        }),
        "cancellation_requests" => Ok(Command::DecideCancellationRequest {
            id: parse_ulid(require_eq(&conds, "id")?)?,
            decision: parse_decision(assigned(&set, "cancellation_requests", "status")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assigned<'a>(set: &'a [(String, Expr)], table: &'static str, col: &'static str) -> Result<&'a Expr, SqlError> {
    set.iter()
        .find(|(c, _)| c == col)
        .map(|(_, e)| e)
        .ok_or(SqlError::MissingColumn(table, col))
}

fn parse_decision(expr: &Expr) -> Result<Decision, SqlError> {
    let raw = parse_text(expr)?;
    match RequestStatus::parse(&raw) {
        Some(RequestStatus::Approved) => Ok(Decision::Approve),
        Some(RequestStatus::Rejected) => Ok(Decision::Reject),
        _ => Err(SqlError::Unsupported(format!(
            "status can only be set to 'approved' or 'rejected', got {raw:?}"
        ))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let conds = conditions(delete.selection.as_ref())?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: parse_ulid(require_eq(&conds, "id")?)?,
            requester_id: parse_ulid(require_eq(&conds, "requester_id")?)?,
        }),
        "vans" | "change_requests" | "cancellation_requests" => Err(SqlError::Unsupported(format!(
            "DELETE on {table}"
        ))),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let conds = conditions(select.selection.as_ref())?;

    match table.as_str() {
        "vans" => Ok(Command::SelectVans),
        "bookings" => Ok(Command::SelectBookings {
            requester_id: parse_ulid(require_eq(&conds, "requester_id")?)?,
            id: find(&conds, "id", BinaryOperator::Eq).map(parse_ulid).transpose()?,
        }),
        "change_requests" => Ok(Command::SelectChangeRequests {
            pending_only: pending_filter(&conds)?,
        }),
        "cancellation_requests" => Ok(Command::SelectCancellationRequests {
            pending_only: pending_filter(&conds)?,
        }),
        "availability" => Ok(Command::SelectFreeWindows {
            van_id: parse_ulid(require_eq(&conds, "van_id")?)?,
            from: parse_text(
                find(&conds, "start_date", BinaryOperator::GtEq).ok_or(SqlError::MissingFilter("start_date"))?,
            )?,
            to: parse_text(
                find(&conds, "end_date", BinaryOperator::LtEq).ok_or(SqlError::MissingFilter("end_date"))?,
            )?,
        }),
        "availability_check" => Ok(Command::SelectAvailabilityCheck {
            van_id: parse_ulid(require_eq(&conds, "van_id")?)?,
            start: parse_text(require_eq(&conds, "start_date")?)?,
            end: parse_text(require_eq(&conds, "end_date")?)?,
        }),
        "checkout" => Ok(Command::SelectCheckout {
            booking_id: parse_ulid(require_eq(&conds, "booking_id")?)?,
            requester_id: parse_ulid(require_eq(&conds, "requester_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn pending_filter(conds: &[Condition<'_>]) -> Result<bool, SqlError> {
    match find(conds, "status", BinaryOperator::Eq) {
        None => Ok(false),
        Some(expr) => match RequestStatus::parse(&parse_text(expr)?) {
            Some(RequestStatus::Pending) => Ok(true),
            _ => Err(SqlError::Unsupported("only status = 'pending' can be filtered".into())),
        },
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// `column <op> value`, one per AND-ed comparison.
type Condition<'a> = (String, BinaryOperator, &'a Expr);

fn conditions(selection: Option<&Expr>) -> Result<Vec<Condition<'_>>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_conditions(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_conditions<'a>(expr: &'a Expr, out: &mut Vec<Condition<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_conditions(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_conditions(left, out)?;
            collect_conditions(right, out)
        }
        Expr::BinaryOp { left, op, right }
            if matches!(op, BinaryOperator::Eq | BinaryOperator::GtEq | BinaryOperator::LtEq) =>
        {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("comparison on {left}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

fn find<'a>(conds: &[Condition<'a>], col: &str, op: BinaryOperator) -> Option<&'a Expr> {
    conds.iter().find(|(c, o, _)| c == col && *o == op).map(|(_, _, e)| *e)
}

fn require_eq<'a>(conds: &[Condition<'a>], col: &'static str) -> Result<&'a Expr, SqlError> {
    find(conds, col, BinaryOperator::Eq).ok_or(SqlError::MissingFilter(col))
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// String literal, or a bare number read as text.
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
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
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

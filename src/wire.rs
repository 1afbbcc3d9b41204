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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{Credentials, Role, VanbookAuthSource};
use crate::engine::{Engine, EngineError};
use crate::observability::{self, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, Decision};

pub struct VanbookHandler {
    engine: Arc<Engine>,
    credentials: Credentials,
    query_parser: Arc<VanbookQueryParser>,
}

impl VanbookHandler {
    pub fn new(engine: Arc<Engine>, credentials: Credentials) -> Self {
        Self {
            engine,
            credentials,
            query_parser: Arc::new(VanbookQueryParser),
        }
    }

    fn role<C: ClientInfo>(&self, client: &C) -> Role {
        self.credentials
            .role_of(client.metadata().get("user").map(String::as_str))
    }

    async fn run(&self, role: Role, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        if cmd.requires_staff() && role != Role::Staff {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            return Err(user_error("42501", format!("permission denied: {label} requires the staff role")));
        }

        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertVan {
                id,
                name,
                daily_rate,
                capacity,
            } => {
                engine
                    .create_van(id, name, daily_rate, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateVanRate { id, daily_rate } => {
                engine.reprice_van(id, daily_rate).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectVans => {
                let vans = engine.list_vans().await;
                Ok(query_response(table_schema("vans"), vans, |enc, van| {
                    enc.encode_field(&van.id.to_string())?;
                    enc.encode_field(&van.name)?;
                    enc.encode_field(&van.daily_rate)?;
                    enc.encode_field(&i64::from(van.capacity))
                }))
            }
            Command::InsertBooking {
                id,
                van_id,
                requester_id,
                start,
                end,
            } => {
                engine
                    .create_booking(id, van_id, requester_id, &start, &end)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateBookingDates {
                id,
                requester_id,
                start,
                end,
            } => {
                engine
                    .edit_booking(id, requester_id, &start, &end)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id, requester_id } => {
                engine.cancel_booking(id, requester_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { requester_id, id } => {
                let bookings = match id {
                    Some(id) => match engine.booking_for(requester_id, id).await {
                        Ok(info) => vec![info],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine.bookings_for_requester(requester_id).await,
                };
                Ok(query_response(table_schema("bookings"), bookings, |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.van_id.to_string())?;
                    enc.encode_field(&b.van_name)?;
                    enc.encode_field(&b.requester_id.to_string())?;
                    enc.encode_field(&b.stay.start.to_string())?;
                    enc.encode_field(&b.stay.end.to_string())?;
                    enc.encode_field(&b.stay.nights())?;
                    enc.encode_field(&b.total_price)?;
                    enc.encode_field(&b.status.as_str().to_string())?;
                    enc.encode_field(&b.cancellation_pending)?;
                    enc.encode_field(&b.created_at.to_rfc3339())
                }))
            }
            Command::InsertChangeRequest {
                id,
                booking_id,
                requester_id,
                start,
                end,
            } => {
                engine
                    .request_change(id, booking_id, requester_id, &start, &end)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DecideChangeRequest { id, decision } => {
                match decision {
                    Decision::Approve => engine.approve_change(id).await.map(|_| ()),
                    Decision::Reject => engine.reject_change(id).await.map(|_| ()),
                }
                .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectChangeRequests { pending_only } => {
                let requests = engine.change_requests(pending_only).await;
                Ok(query_response(table_schema("change_requests"), requests, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.booking_id.to_string())?;
                    enc.encode_field(&r.van_id.to_string())?;
                    enc.encode_field(&r.requester_id.to_string())?;
                    enc.encode_field(&r.current.start.to_string())?;
                    enc.encode_field(&r.current.end.to_string())?;
                    enc.encode_field(&r.proposed.start.to_string())?;
                    enc.encode_field(&r.proposed.end.to_string())?;
                    enc.encode_field(&r.status.as_str().to_string())?;
                    enc.encode_field(&r.created_at.to_rfc3339())
                }))
            }
            Command::InsertCancellationRequest {
                id,
                booking_id,
                requester_id,
            } => {
                engine
                    .request_cancellation(id, booking_id, requester_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DecideCancellationRequest { id, decision } => {
                match decision {
                    Decision::Approve => engine.approve_cancellation(id).await.map(|_| ()),
                    Decision::Reject => engine.reject_cancellation(id).await.map(|_| ()),
                }
                .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectCancellationRequests { pending_only } => {
                let requests = engine.cancellation_requests(pending_only).await;
                Ok(query_response(table_schema("cancellation_requests"), requests, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.booking_id.to_string())?;
                    enc.encode_field(&r.van_id.to_string())?;
                    enc.encode_field(&r.requester_id.to_string())?;
                    enc.encode_field(&r.stay.start.to_string())?;
                    enc.encode_field(&r.stay.end.to_string())?;
                    enc.encode_field(&r.status.as_str().to_string())?;
                    enc.encode_field(&r.created_at.to_rfc3339())
                }))
            }
            Command::SelectFreeWindows { van_id, from, to } => {
                let windows = engine.free_windows(van_id, &from, &to).await.map_err(engine_err)?;
                let vid = van_id.to_string();
                Ok(query_response(table_schema("availability"), windows, |enc, w| {
                    enc.encode_field(&vid)?;
                    enc.encode_field(&w.start.to_string())?;
                    enc.encode_field(&w.end.to_string())
                }))
            }
            Command::SelectAvailabilityCheck { van_id, start, end } => {
                let available = engine
                    .check_availability(van_id, &start, &end)
                    .await
                    .map_err(engine_err)?;
                let row = (van_id.to_string(), start, end, available);
                Ok(query_response(table_schema("availability_check"), vec![row], |enc, r| {
                    enc.encode_field(&r.0)?;
                    enc.encode_field(&r.1)?;
                    enc.encode_field(&r.2)?;
                    enc.encode_field(&r.3)
                }))
            }
            Command::SelectCheckout {
                booking_id,
                requester_id,
            } => {
                let quote = engine
                    .begin_checkout(booking_id, requester_id)
                    .await
                    .map_err(engine_err)?;
                Ok(query_response(table_schema("checkout"), vec![quote], |enc, q| {
                    enc.encode_field(&q.booking_id.to_string())?;
                    enc.encode_field(&q.van_name)?;
                    enc.encode_field(&q.stay.start.to_string())?;
                    enc.encode_field(&q.stay.end.to_string())?;
                    enc.encode_field(&q.stay.nights())?;
                    enc.encode_field(&q.amount)
                }))
            }
        }
    }
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Result columns of each readable table. Dates travel as `YYYY-MM-DD` text.
fn table_schema(table: &str) -> Vec<FieldInfo> {
    match table {
        "vans" => vec![
            field("id", Type::VARCHAR),
            field("name", Type::VARCHAR),
            field("daily_rate", Type::INT8),
            field("capacity", Type::INT8),
        ],
        "bookings" => vec![
            field("id", Type::VARCHAR),
            field("van_id", Type::VARCHAR),
            field("van_name", Type::VARCHAR),
            field("requester_id", Type::VARCHAR),
            field("start_date", Type::VARCHAR),
            field("end_date", Type::VARCHAR),
            field("nights", Type::INT8),
            field("total_price", Type::INT8),
            field("status", Type::VARCHAR),
            field("cancellation_pending", Type::BOOL),
            field("created_at", Type::VARCHAR),
        ],
        "change_requests" => vec![
            field("id", Type::VARCHAR),
            field("booking_id", Type::VARCHAR),
            field("van_id", Type::VARCHAR),
            field("requester_id", Type::VARCHAR),
            field("current_start", Type::VARCHAR),
            field("current_end", Type::VARCHAR),
            field("proposed_start", Type::VARCHAR),
            field("proposed_end", Type::VARCHAR),
            field("status", Type::VARCHAR),
            field("created_at", Type::VARCHAR),
        ],
        "cancellation_requests" => vec![
            field("id", Type::VARCHAR),
            field("booking_id", Type::VARCHAR),
            field("van_id", Type::VARCHAR),
            field("requester_id", Type::VARCHAR),
            field("start_date", Type::VARCHAR),
            field("end_date", Type::VARCHAR),
            field("status", Type::VARCHAR),
            field("created_at", Type::VARCHAR),
        ],
        "availability" => vec![
            field("van_id", Type::VARCHAR),
            field("start_date", Type::VARCHAR),
            field("end_date", Type::VARCHAR),
        ],
        "availability_check" => vec![
            field("van_id", Type::VARCHAR),
            field("start_date", Type::VARCHAR),
            field("end_date", Type::VARCHAR),
            field("available", Type::BOOL),
        ],
        "checkout" => vec![
            field("booking_id", Type::VARCHAR),
            field("van_name", Type::VARCHAR),
            field("start_date", Type::VARCHAR),
            field("end_date", Type::VARCHAR),
            field("nights", Type::INT8),
            field("amount", Type::INT8),
        ],
        _ => vec![],
    }
}

/// Schema for a statement that has not been bound yet: the table after FROM
/// in a SELECT, nothing for writes.
fn describe_schema(sql: &str) -> Vec<FieldInfo> {
    select_table(sql).map(|t| table_schema(&t)).unwrap_or_default()
}

fn select_table(sql: &str) -> Option<String> {
    let mut words = sql.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("select") {
        return None;
    }
    words
        .skip_while(|w| !w.eq_ignore_ascii_case("from"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').to_lowercase())
}

#[async_trait]
impl SimpleQueryHandler for VanbookHandler {
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
        let role = self.role(client);
        Ok(vec![self.run(role, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VanbookQueryParser;

#[async_trait]
impl QueryParser for VanbookQueryParser {
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
        Ok(describe_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for VanbookHandler {
    type Statement = String;
    type QueryParser = VanbookQueryParser;

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
        let role = self.role(client);
        let sql = substitute_params(portal);
        self.run(role, &sql).await
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
            describe_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
        )))
    }
}

enum Segment<'a> {
    Text(&'a str),
    /// `$N` with its index and its raw text.
    Param(usize, &'a str),
}

/// Split SQL into text and `$N` placeholders. A `$` inside a single-quoted
/// literal is text.
fn segments(sql: &str) -> Vec<Segment<'_>> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut text_start = 0;
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            in_literal = !in_literal;
        } else if bytes[i] == b'$' && !in_literal {
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                out.push(Segment::Text(&sql[text_start..i]));
                out.push(Segment::Param(n, &sql[i..end]));
                text_start = end;
                i = end;
                continue;
            }
        }
        i += 1;
    }
    out.push(Segment::Text(&sql[text_start..]));
    out
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    segments(sql)
        .iter()
        .filter_map(|s| match s {
            Segment::Param(n, _) => Some(*n),
            Segment::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_text_params(&portal.statement.statement, &params)
}

/// One pass over the statement text; bound values are never rescanned.
fn bind_text_params(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    for segment in segments(sql) {
        match segment {
            Segment::Text(text) => result.push_str(text),
            Segment::Param(n, raw) => match n.checked_sub(1).and_then(|i| params.get(i)) {
                Some(Some(text)) => {
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                Some(None) => result.push_str("NULL"),
                None => result.push_str(raw),
            },
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct VanbookFactory {
    handler: Arc<VanbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<VanbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VanbookFactory {
    pub fn new(engine: Arc<Engine>, credentials: Credentials) -> Self {
        let auth_source = VanbookAuthSource::new(credentials.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(VanbookHandler::new(engine, credentials)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VanbookFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<VanbookFactory>,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine refusal. The message keeps the reason name first.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidDateFormat(_) => "22007",
        EngineError::InvalidDateRange | EngineError::DateInPast { .. } => "22008",
        EngineError::Invalid(_) => "22023",
        EngineError::NotAvailable => "23P01",
        EngineError::DuplicatePending(_) | EngineError::AlreadyExists(_) => "23505",
        EngineError::NotPending(_)
        | EngineError::NotConfirmed(_)
        | EngineError::AlreadyCancelled(_)
        | EngineError::OngoingOrPast(_)
        | EngineError::RequiresApproval(_) => "55000",
        EngineError::NotFound(_) => "02000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

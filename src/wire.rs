use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{Instrument, error, info_span, warn};

use crate::engine::{Engine, StorageError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ResultShape, SqlError};

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password, checked in cleartext.
#[derive(Debug)]
pub struct HoldfastAuthSource {
    password: String,
}

impl HoldfastAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for HoldfastAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Query handling ───────────────────────────────────────────────

pub struct HoldfastHandler {
    engine: Arc<Engine>,
    query_parser: Arc<HoldfastQueryParser>,
}

impl HoldfastHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(HoldfastQueryParser),
        }
    }

    async fn run(&self, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self
            .execute_command(cmd, format)
            .instrument(info_span!("command", command = label))
            .await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertIntervals { spans } => {
                // Built without Span::new so inverted pairs reach validation.
                let spans: Vec<Span> = spans
                    .into_iter()
                    .map(|(start, end)| Span { start, end })
                    .collect();
                let report = engine.insert_intervals(&spans).await.map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(report.inserted),
                ))
            }
            Command::SelectIntervals { after } => {
                let now = after.unwrap_or_else(|| engine.now_ms());
                let slots = engine.list_bookable(now).await;
                let schema = Arc::new(intervals_schema(format));
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.id.to_string())?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        encoder.encode_field(&slot.hold_expiry)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                )))
            }
            Command::AcquireHold { slot_id } => {
                let token = engine.acquire_hold(slot_id).await.map_err(engine_err)?;
                let token = token.map(|t| t.as_str().to_string());
                one_row(text_column("acquire_hold", format), |e| {
                    e.encode_field(&token)
                })
            }
            Command::ExtendHold { slot_id, token } => {
                let ok = engine
                    .extend_hold(slot_id, &HoldToken::from(token))
                    .await
                    .map_err(engine_err)?;
                flag_row("extend_hold", format, ok)
            }
            Command::ReleaseHold { slot_id, token } => {
                let ok = engine
                    .release_hold(slot_id, &HoldToken::from(token))
                    .await
                    .map_err(engine_err)?;
                flag_row("release_hold", format, ok)
            }
            Command::MarkBooked {
                start,
                end,
                reference,
                hold_token,
            } => {
                let hold_token = hold_token.map(HoldToken::from);
                let outcome = engine
                    .mark_booked(Span { start, end }, &reference, hold_token.as_ref())
                    .await
                    .map_err(engine_err)?;
                flag_row("mark_booked", format, outcome == BookOutcome::Booked)
            }
            Command::CheckOrInsertFulfillment {
                reference,
                metadata,
                initial_status,
            } => {
                let status = engine
                    .check_or_insert_fulfillment(&reference, &metadata, initial_status)
                    .await
                    .map_err(engine_err)?;
                flag_row("check_or_insert_fulfillment", format, status)
            }
            Command::InsertFulfillment {
                reference,
                metadata,
                status,
            } => {
                let inserted = engine
                    .insert_fulfillment(&reference, &metadata, status)
                    .await
                    .map_err(engine_err)?;
                flag_row("insert_fulfillment", format, inserted)
            }
            Command::SelectFulfillments { is_fulfilled } => {
                let records = engine
                    .list_fulfillments(is_fulfilled == Some(false))
                    .await
                    .into_iter()
                    .filter(|r| is_fulfilled.is_none_or(|want| r.is_fulfilled == want));
                let schema = Arc::new(fulfillments_schema(format));
                let rows: Vec<PgWireResult<_>> = records
                    .map(|record| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&record.reference)?;
                        encoder.encode_field(&record.metadata)?;
                        encoder.encode_field(&record.is_fulfilled)?;
                        encoder.encode_field(&record.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                )))
            }
        }
    }
}

fn one_row(
    field: FieldInfo,
    encode: impl FnOnce(&mut DataRowEncoder) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(vec![field]);
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode(&mut encoder)?;
    let row = encoder.take_row();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(vec![Ok(row)]),
    )))
}

fn flag_row(name: &str, format: &Format, value: bool) -> PgWireResult<Response> {
    one_row(bool_column(name, format), |e| e.encode_field(&value))
}

/// Columns in order, each encoded as the client asked for that position.
fn columns(fields: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    fields
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn text_column(name: &str, format: &Format) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::TEXT, format.format_for(0))
}

fn bool_column(name: &str, format: &Format) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, format.format_for(0))
}

fn intervals_schema(format: &Format) -> Vec<FieldInfo> {
    columns(
        &[
            ("id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("hold_expiry", Type::INT8),
        ],
        format,
    )
}

fn fulfillments_schema(format: &Format) -> Vec<FieldInfo> {
    columns(
        &[
            ("client_reference", Type::VARCHAR),
            ("metadata", Type::TEXT),
            ("is_fulfilled", Type::BOOL),
            ("created_at", Type::INT8),
        ],
        format,
    )
}

fn schema_for(sql: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::result_shape(sql) {
        ResultShape::Intervals => intervals_schema(format),
        ResultShape::Fulfillments => fulfillments_schema(format),
        ResultShape::Token(name) => vec![text_column(name, format)],
        ResultShape::Flag(name) => vec![bool_column(name, format)],
        ResultShape::NoRows => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for HoldfastHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct HoldfastQueryParser;

#[async_trait]
impl QueryParser for HoldfastQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for HoldfastHandler {
    type Statement = String;
    type QueryParser = HoldfastQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql, &portal.result_column_format).await
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
            schema_for(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// `$N` placeholders outside string literals, as (byte range, N).
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote toggles twice, which keeps us inside.
            b'\'' => in_literal = !in_literal,
            b'$' if !in_literal => {
                let digits = i + 1;
                let mut j = digits;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                if let Ok(n) = sql[digits..j].parse::<usize>() {
                    found.push((i..j, n));
                    i = j;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in `sql`.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Bind parameters as quoted text in one pass over the statement. Bound
/// values are copied, never rescanned, so a `$1` inside a value stays put.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct HoldfastFactory {
    handler: Arc<HoldfastHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<HoldfastAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl HoldfastFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(HoldfastHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                HoldfastAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for HoldfastFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(HoldfastFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Logged inside the command span, so the line names the operation.
fn engine_err(e: StorageError) -> PgWireError {
    match &e {
        StorageError::WalError(_) => error!(error = %e, "storage failure"),
        _ => warn!(error = %e, "command rejected"),
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

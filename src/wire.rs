use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::engine::{with_conflict_retry, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ReservationKey, ResultShape, SqlError};
use crate::tenant::TenantManager;

/// Attempts for a mutation that keeps hitting lock contention.
const CONFLICT_ATTEMPTS: u32 = 3;

/// Serve one client connection until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
) -> std::io::Result<()> {
    let factory = Arc::new(MenajeFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, None, factory).await
}

pub struct MenajeHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<MenajeQueryParser>,
}

impl MenajeHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(MenajeQueryParser),
        }
    }

    /// One engine per database name.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }
}

async fn execute_command(engine: &Engine, cmd: Command) -> Result<Response, EngineError> {
    match cmd {
        Command::SelectItems => {
            let items = engine.list_items().await;
            let schema = Arc::new(items_schema());
            let rows = items.iter().map(|item| item_row(&schema, item)).collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectItem { id } => {
            let item = engine.get_item(&id).await?;
            let schema = Arc::new(items_schema());
            let rows = vec![item_row(&schema, &item)];
            Ok(query_response(schema, rows))
        }
        Command::UpsertItem { item } => {
            with_conflict_retry(CONFLICT_ATTEMPTS, || engine.upsert_item(item.clone())).await?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::GetOrCreateReservation { evento_id, fecha } => {
            let reservation = with_conflict_retry(CONFLICT_ATTEMPTS, || {
                engine.get_or_create_reservation(evento_id, fecha)
            })
            .await?;
            Ok(reservation_response(&[reservation]))
        }
        Command::SelectReservation { key } => {
            let reservation = match key {
                ReservationKey::Id(id) => Some(engine.read_reservation(&id).await?.reservation),
                ReservationKey::Evento(evento_id) => {
                    engine.reservation_for_evento(&evento_id).await
                }
            };
            Ok(reservation_response(reservation.as_slice()))
        }
        Command::SelectLines { reserva_id } => {
            let detail = engine.read_reservation(&reserva_id).await?;
            let schema = Arc::new(lines_schema());
            let rows = detail
                .lines
                .iter()
                .map(|line| line_row(&schema, &reserva_id, line))
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectAvailability { window, exclude } => {
            let availability = engine.availability(window, exclude).await?;
            let names: HashMap<ItemId, String> = engine
                .list_items()
                .await
                .into_iter()
                .map(|item| (item.id, item.nombre))
                .collect();
            let schema = Arc::new(availability_schema());
            let rows = availability
                .values()
                .map(|a| {
                    let nombre = names.get(&a.menaje_id).map_or("", String::as_str);
                    availability_row(&schema, a, nombre)
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SaveLines { reserva_id, lines } => {
            let saved = with_conflict_retry(CONFLICT_ATTEMPTS, || {
                engine.save_reservation_lines(reserva_id, lines.clone())
            })
            .await?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(saved.len())))
        }
        Command::ClearLines { reserva_id } => {
            let before = engine.read_reservation(&reserva_id).await?.lines.len();
            with_conflict_retry(CONFLICT_ATTEMPTS, || {
                engine.save_reservation_lines(reserva_id, Vec::new())
            })
            .await?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(before)))
        }
        Command::SetEstado { reserva_id, estado } => {
            let reservation = with_conflict_retry(CONFLICT_ATTEMPTS, || {
                engine.set_estado(reserva_id, estado)
            })
            .await?;
            Ok(reservation_response(&[reservation]))
        }
    }
}

// ── Row shapes ───────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn items_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("nombre"),
        text_field("unidad"),
        int_field("stock_total"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("evento_id"),
        text_field("fecha_inicio"),
        text_field("fecha_fin"),
        text_field("estado"),
        text_field("created_at"),
    ]
}

fn lines_schema() -> Vec<FieldInfo> {
    vec![
        text_field("reserva_id"),
        text_field("menaje_id"),
        text_field("nombre"),
        text_field("unidad"),
        int_field("cantidad"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("menaje_id"),
        text_field("nombre"),
        int_field("stock_total"),
        int_field("reservado"),
        int_field("disponible"),
    ]
}

fn schema_for(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Items => items_schema(),
        ResultShape::Reservation => reservation_schema(),
        ResultShape::Lines => lines_schema(),
        ResultShape::Availability => availability_schema(),
        ResultShape::None => Vec::new(),
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn item_row(schema: &Arc<Vec<FieldInfo>>, item: &InventoryItem) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&item.id.to_string())?;
    encoder.encode_field(&item.nombre)?;
    encoder.encode_field(&item.unidad.to_string())?;
    encoder.encode_field(&i64::from(item.stock_total))?;
    Ok(encoder.take_row())
}

fn reservation_response(reservations: &[Reservation]) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.evento_id.to_string())?;
            encoder.encode_field(&r.window.start.to_string())?;
            encoder.encode_field(&r.window.end.to_string())?;
            encoder.encode_field(&r.estado.to_string())?;
            encoder.encode_field(&r.created_at.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn line_row(
    schema: &Arc<Vec<FieldInfo>>,
    reserva_id: &ReservationId,
    line: &LineDetail,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&reserva_id.to_string())?;
    encoder.encode_field(&line.menaje_id.to_string())?;
    encoder.encode_field(&line.nombre)?;
    encoder.encode_field(&line.unidad.to_string())?;
    encoder.encode_field(&i64::from(line.cantidad))?;
    Ok(encoder.take_row())
}

fn availability_row(
    schema: &Arc<Vec<FieldInfo>>,
    a: &ItemAvailability,
    nombre: &str,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.menaje_id.to_string())?;
    encoder.encode_field(&nombre.to_string())?;
    encoder.encode_field(&i64::from(a.stock_total))?;
    encoder.encode_field(&i64::from(a.reservado))?;
    encoder.encode_field(&i64::from(a.disponible))?;
    Ok(encoder.take_row())
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for MenajeHandler {
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
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MenajeQueryParser;

#[async_trait]
impl QueryParser for MenajeQueryParser {
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
        Ok(schema_for(sql::result_shape_of(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for MenajeHandler {
    type Statement = String;
    type QueryParser = MenajeQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = inline_params(&portal.statement.statement, &portal.parameters);
        self.run(&engine, &sql).await
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
        let fields = schema_for(sql::result_shape_of(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let fields = schema_for(sql::result_shape_of(&target.statement.statement));
        Ok(DescribePortalResponse::new(fields))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as (byte range, N).
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves the state unchanged.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one pass, so text that
/// came from a parameter is never rescanned for placeholders.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
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

/// Every login uses the one shared password.
#[derive(Debug)]
pub struct SharedPassword(String);

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.0.as_bytes().to_vec()))
    }
}

pub struct MenajeFactory {
    handler: Arc<MenajeHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl MenajeFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(MenajeHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MenajeFactory {
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

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::InsufficientStock(_) => "23P01",
        EngineError::ConcurrencyConflict => "40001",
        EngineError::InvalidTransition { .. } | EngineError::Returned(_) => "55000",
        EngineError::DuplicateLine(_) => "23505",
        EngineError::InvalidWindow | EngineError::StockBelowCommitted { .. } => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

/// Client-facing message. Stock rejections carry their violations as JSON.
fn error_message(e: &EngineError) -> String {
    match e {
        EngineError::InsufficientStock(violations) => {
            let json = serde_json::to_string(violations).unwrap_or_else(|_| "[]".into());
            format!("insufficient stock: {json}")
        }
        other => other.to_string(),
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), error_message(&e))
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

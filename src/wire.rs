use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::auth::{self, SlotbookAuthSource};
use crate::engine::Engine;
use crate::error::{BookingError, ErrorKind};
use crate::model::*;
use crate::notify::Notifier;
use crate::observability;
use crate::report::Stats;
use crate::session::Session;
use crate::sql::{self, Command, ExportKind};
use crate::tenant::StudioManager;

/// Settings shared by every connection to one server.
#[derive(Clone)]
pub struct ServerContext {
    pub studios: Arc<StudioManager>,
    pub password: String,
    pub admin_user: String,
    pub notifier: Arc<dyn Notifier>,
}

/// One connection's handler. The session is opened on the first query, once
/// the startup handshake has filled in the user and database.
pub struct SlotbookHandler {
    ctx: ServerContext,
    session: Mutex<Option<Session<Engine>>>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx,
            session: Mutex::new(None),
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    async fn open_session<C: ClientInfo>(&self, client: &C) -> PgWireResult<Session<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let user = client.metadata().get("user").cloned().unwrap_or_default();

        let engine = self.ctx.studios.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("studio error: {e}"),
            )))
        })?;
        let principal = auth::resolve_principal(engine.as_ref(), &user, &self.ctx.admin_user)
            .await
            .map_err(|e| {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!("login {user:?} to studio {db:?} refused: {e}");
                booking_err(e)
            })?;
        tracing::debug!("session opened for {user} ({}) in {db}", principal.role);
        Ok(Session::new(principal, engine, self.ctx.notifier.clone()))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let mut slot = self.session.lock().await;
        let session = match slot.take() {
            Some(session) => session,
            None => self.open_session(client).await?,
        };
        let session = slot.insert(session);
        // A wire client has no way to ask for a refresh, so every SELECT is a fresh load.
        if cmd.is_query() {
            session.invalidate();
        }
        let result = execute_command(session, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(booking_err)
    }
}

async fn execute_command(session: &mut Session<Engine>, cmd: Command) -> Result<Vec<Response>, BookingError> {
    let response = match cmd {
        Command::InsertProfile { id, email, name, role } => {
            session.register_profile(NewProfile { id, email, name, role }).await?;
            inserted()
        }
        Command::VerifyProfile { id } => {
            session.verify_profile(id).await?;
            updated()
        }
        Command::InsertSubject { id, name } => {
            session.create_subject(id, name).await?;
            inserted()
        }
        Command::InsertShift {
            id,
            date,
            start_time,
            end_time,
            subject_ids,
            teacher_id,
        } => {
            let teacher_id = teacher_id.unwrap_or(session.principal().id);
            session
                .create_shift(NewShift {
                    id,
                    teacher_id,
                    date,
                    start_time,
                    end_time,
                    subject_ids,
                })
                .await?;
            inserted()
        }
        Command::UpdateShift {
            id,
            date,
            start_time,
            end_time,
            subject_ids,
        } => {
            let changes = ShiftChanges {
                date,
                start_time,
                end_time,
                subject_ids,
            };
            session.update_shift(id, changes).await?;
            updated()
        }
        Command::DeleteShift { id } => {
            session.delete_shift(id).await?;
            Response::Execution(Tag::new("DELETE").with_rows(1))
        }
        Command::InsertReservation {
            id,
            shift_id,
            subject_id,
            notes,
        } => {
            let student_id = session.principal().id;
            session
                .reserve(NewReservation {
                    id,
                    student_id,
                    shift_id,
                    subject_id,
                    notes,
                })
                .await?;
            inserted()
        }
        Command::UpdateReservation { id, status } => {
            session.transition(id, status).await?;
            updated()
        }
        Command::SelectAvailability(query) => {
            let shifts = session.available(&query).await?;
            shift_rows(&shifts)
        }
        Command::SelectShifts => shift_rows(&session.visible_shifts().await?),
        Command::SelectProfiles => profile_rows(&session.profiles().await?),
        Command::SelectSubjects => subject_rows(&session.subjects().await?),
        Command::SelectReservations => reservation_rows(&session.visible_reservations().await?),
        Command::SelectStats => stats_rows(&session.stats().await?),
        Command::SelectExport(kind) => {
            let csv = match kind {
                ExportKind::Reservations => session.export_reservations_csv().await?,
                ExportKind::Shifts => session.export_shifts_csv().await?,
            };
            export_rows(csv)
        }
    };
    Ok(vec![response])
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn shift_schema() -> Vec<FieldInfo> {
    ["id", "teacher_id", "date", "start_time", "end_time", "subjects"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn profile_schema() -> Vec<FieldInfo> {
    ["id", "email", "name", "role", "verified_at"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn subject_schema() -> Vec<FieldInfo> {
    ["id", "name"].into_iter().map(text_field).collect()
}

fn reservation_schema() -> Vec<FieldInfo> {
    [
        "id",
        "student_id",
        "shift_id",
        "subject_id",
        "date",
        "start_time",
        "end_time",
        "status",
        "notes",
        "created_at",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn stats_schema() -> Vec<FieldInfo> {
    [
        "total_shifts",
        "active_reservations",
        "completed_reservations",
        "cancelled_reservations",
        "occupancy_rate",
    ]
    .into_iter()
    .map(int_field)
    .collect()
}

fn export_schema() -> Vec<FieldInfo> {
    vec![text_field("csv")]
}

/// Schema of the rows a SELECT on `table` returns, if it is one we serve.
fn schema_for_table(table: &str) -> Option<Vec<FieldInfo>> {
    match table {
        "availability" | "shifts" => Some(shift_schema()),
        "profiles" => Some(profile_schema()),
        "subjects" => Some(subject_schema()),
        "reservations" => Some(reservation_schema()),
        "stats" => Some(stats_schema()),
        "export" => Some(export_schema()),
        _ => None,
    }
}

/// Result schema for a statement that may still contain `$n` placeholders.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let mut tokens = sql.split_whitespace();
    let is_select = tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("SELECT"));
    if !is_select {
        return Vec::new();
    }
    tokens
        .skip_while(|t| !t.eq_ignore_ascii_case("FROM"))
        .nth(1)
        .and_then(|table| schema_for_table(&table.trim_end_matches(';').to_lowercase()))
        .unwrap_or_default()
}

fn hhmm(t: chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn query_response(
    schema: Vec<FieldInfo>,
    rows: impl IntoIterator<Item = Vec<Option<String>>>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|values| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for value in &values {
                encoder.encode_field(value)?;
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn shift_rows(shifts: &[Shift]) -> Response {
    query_response(
        shift_schema(),
        shifts.iter().map(|s| {
            let subjects = s
                .subject_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            vec![
                Some(s.id.to_string()),
                Some(s.teacher_id.to_string()),
                Some(s.date.to_string()),
                Some(hhmm(s.start_time)),
                Some(hhmm(s.end_time)),
                Some(subjects),
            ]
        }),
    )
}

fn profile_rows(profiles: &[Profile]) -> Response {
    query_response(
        profile_schema(),
        profiles.iter().map(|p| {
            vec![
                Some(p.id.to_string()),
                Some(p.email.clone()),
                Some(p.name.clone()),
                Some(p.role.to_string()),
                p.verified_at.map(|at| at.to_rfc3339()),
            ]
        }),
    )
}

fn subject_rows(subjects: &[Subject]) -> Response {
    query_response(
        subject_schema(),
        subjects
            .iter()
            .map(|s| vec![Some(s.id.to_string()), Some(s.name.clone())]),
    )
}

fn reservation_rows(reservations: &[Reservation]) -> Response {
    query_response(
        reservation_schema(),
        reservations.iter().map(|r| {
            vec![
                Some(r.id.to_string()),
                Some(r.student_id.to_string()),
                Some(r.shift_id.to_string()),
                Some(r.subject_id.to_string()),
                Some(r.date.to_string()),
                Some(hhmm(r.start_time)),
                Some(hhmm(r.end_time)),
                Some(r.status.to_string()),
                Some(r.notes.clone()),
                Some(r.created_at.to_rfc3339()),
            ]
        }),
    )
}

fn stats_rows(stats: &Stats) -> Response {
    let schema = Arc::new(stats_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = [
        stats.total_shifts as i64,
        stats.active_reservations as i64,
        stats.completed_reservations as i64,
        stats.cancelled_reservations as i64,
        i64::from(stats.occupancy_rate),
    ]
    .iter()
    .try_for_each(|v| encoder.encode_field(v))
    .map(|()| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn export_rows(csv: String) -> Response {
    query_response(export_schema(), [vec![Some(csv)]])
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| sql_err(sql::SqlError::Empty))
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
        Ok(DescribeStatementResponse::new(param_types, schema_for_sql(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for_sql(&target.statement.statement)))
    }
}

/// Highest `$n` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    sql.split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(ctx: ServerContext) -> Self {
        let auth_source = SlotbookAuthSource::new(ctx.password.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(ctx)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

/// Serve one client. Each connection gets its own handler and therefore its
/// own session and read cache.
pub async fn process_connection(
    socket: TcpStream,
    ctx: ServerContext,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(ctx));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "P0002",
        ErrorKind::InvalidState => "55000",
        ErrorKind::Conflict => "23P01",
        ErrorKind::Validation => "22023",
        ErrorKind::Unauthorized => "42501",
        ErrorKind::RemoteUnavailable => "08006",
        ErrorKind::LimitExceeded => "54000",
        ErrorKind::Storage => "58030",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(e.kind()).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::SlotbookAuthSource;
use crate::engine::{EngineError, Scheduler};
use crate::limits::*;
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, AppointmentFilter, Command, SqlError};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    scheduler: Scheduler,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(scheduler, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct SlotbookHandler {
    scheduler: Scheduler,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, EngineError> {
        let sched = &self.scheduler;
        match cmd {
            Command::InsertDoctor {
                id,
                name,
                specialization,
                working_start,
                working_end,
            } => {
                let doctor = Doctor::new(
                    id.unwrap_or_else(Ulid::new),
                    name,
                    specialization,
                    working_start,
                    working_end,
                )?;
                let doctor = sched.register_doctor(doctor).await?;
                Ok(doctor_rows(vec![doctor]))
            }
            Command::SelectDoctors { id: Some(id) } => Ok(doctor_rows(vec![sched.doctor(id).await?])),
            Command::SelectDoctors { id: None } => Ok(doctor_rows(sched.doctors().await?)),
            Command::InsertAppointment { request } => {
                let appointment = sched.book(request).await?;
                Ok(appointment_rows(vec![appointment]))
            }
            Command::UpdateAppointment { id, patch } => {
                let appointment = sched.update(id, patch).await?;
                Ok(appointment_rows(vec![appointment]))
            }
            Command::DeleteAppointment { id } => {
                sched.cancel(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAppointments {
                filter: AppointmentFilter::ById(id),
            } => Ok(appointment_rows(vec![sched.appointment(id).await?])),
            Command::SelectAppointments {
                filter: AppointmentFilter::ByDoctor { doctor_id, from, to },
            } => {
                let window = match (from, to) {
                    (None, None) => None,
                    (from, to) => Some(Span {
                        start: from.map_or(MIN_VALID_TIMESTAMP_MS, to_ms),
                        end: to.map_or(MAX_VALID_TIMESTAMP_MS, to_ms),
                    }),
                };
                Ok(appointment_rows(sched.appointments(doctor_id, window).await?))
            }
            Command::SelectSlots {
                doctor_id,
                date,
                granularity,
            } => {
                let slots = sched.available_slots(doctor_id, &date, granularity).await?;
                let minutes = granularity.unwrap_or(sched.config().slot_minutes);
                let doctor_id = doctor_id.to_string();
                let schema = Arc::new(slot_schema());
                let rows = slots
                    .into_iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&doctor_id)?;
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&format_slot(t))?;
                        encoder.encode_field(&(minutes as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(slot_schema(), rows))
            }
        }
    }
}

fn query_response(schema: Vec<FieldInfo>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(Arc::new(schema), stream::iter(rows)))
}

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int4(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn doctor_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("specialization"),
        text("working_start"),
        text("working_end"),
    ]
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("doctor_id"),
        text("start"),
        text("end"),
        int4("duration"),
        text("appointment_type"),
        text("patient_name"),
        text("notes"),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![text("doctor_id"), text("date"), text("start"), int4("duration")]
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn doctor_rows(doctors: Vec<Doctor>) -> Response {
    let schema = Arc::new(doctor_schema());
    let rows = doctors
        .into_iter()
        .map(|d| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&d.id.to_string())?;
            encoder.encode_field(&d.name)?;
            encoder.encode_field(&d.specialization)?;
            encoder.encode_field(&format_slot(d.working_start))?;
            encoder.encode_field(&format_slot(d.working_end))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(doctor_schema(), rows)
}

fn appointment_rows(appointments: Vec<Appointment>) -> Response {
    let schema = Arc::new(appointment_schema());
    let rows = appointments
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.doctor_id.to_string())?;
            encoder.encode_field(&rfc3339(a.start))?;
            encoder.encode_field(&rfc3339(a.end()))?;
            encoder.encode_field(&(a.duration_minutes as i32))?;
            encoder.encode_field(&a.appointment_type)?;
            encoder.encode_field(&a.patient_name)?;
            encoder.encode_field(&a.notes)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(appointment_schema(), rows)
}

/// Result columns of a statement, decided from its text alone so that
/// statements with unbound `$n` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("DELETE") {
        vec![]
    } else if upper.contains("FROM SLOTS") {
        slot_schema()
    } else if upper.contains("APPOINTMENTS") {
        appointment_schema()
    } else if upper.contains("DOCTORS") {
        doctor_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        self.run(&substitute_params(portal)).await
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
        Ok(DescribeStatementResponse::new(
            vec![Type::VARCHAR; count_params(&target.statement)],
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

/// Highest `$n` placeholder in `sql`.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if let Ok(n) = rest[..digits].parse::<usize>() {
            max = max.max(n);
        }
        rest = &rest[digits..];
    }
    max
}

/// Inline bound parameters (text format) as quoted literals, highest index
/// first so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(scheduler: Scheduler, password: String) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(scheduler)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
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

fn user_error(sqlstate: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

/// Bad values inside well-formed SQL keep the scheduler's code.
fn sql_state(e: &SqlError) -> &'static str {
    match e {
        SqlError::Invalid(inner) => inner.sqlstate(),
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_state(&e), e.to_string())
}

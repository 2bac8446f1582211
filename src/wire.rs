use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::model::{Reservation, TIMESTAMP_FORMAT};
use crate::observability::{self, command_label};
use crate::service::{ReservationError, Service};
use crate::sql::{self, Command};

pub struct RoomdHandler {
    service: Arc<Service>,
    request_timeout: Duration,
    query_parser: Arc<RoomdQueryParser>,
}

impl RoomdHandler {
    pub fn new(service: Arc<Service>, request_timeout: Duration) -> Self {
        Self {
            service,
            request_timeout,
            query_parser: Arc::new(RoomdQueryParser),
        }
    }

    /// Run one command under the request deadline and record its metrics.
    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = match tokio::time::timeout(self.request_timeout, self.run_command(cmd)).await {
            Ok(result) => result,
            Err(_) => Err(user_error(
                "57014",
                format!(
                    "canceling statement due to request timeout ({} ms)",
                    self.request_timeout.as_millis()
                ),
            )),
        };
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn run_command(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertReservation { room_id, start, end } => {
                self.service
                    .reserve_room(&room_id, start, end)
                    .await
                    .map_err(reservation_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectReservations { room_id } => {
                let reservations = self
                    .service
                    .list_by_room(&room_id)
                    .await
                    .map_err(reservation_err)?;

                let schema = Arc::new(reservation_schema());
                let rows: Vec<PgWireResult<_>> = reservations
                    .iter()
                    .map(|r| encode_reservation(&schema, r))
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn encode_reservation(
    schema: &Arc<Vec<FieldInfo>>,
    r: &Reservation,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id)?;
    encoder.encode_field(&r.room_id.as_str())?;
    encoder.encode_field(&r.interval.start().format(TIMESTAMP_FORMAT).to_string())?;
    encoder.encode_field(&r.interval.end().format(TIMESTAMP_FORMAT).to_string())?;
    Ok(encoder.take_row())
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("room_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("start_time".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("end_time".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn returns_rows(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    upper.trim_start().starts_with("SELECT") && upper.contains("RESERVATIONS")
}

#[async_trait]
impl SimpleQueryHandler for RoomdHandler {
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
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomdQueryParser;

#[async_trait]
impl QueryParser for RoomdQueryParser {
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
        if returns_rows(stmt) {
            Ok(reservation_schema())
        } else {
            Ok(vec![])
        }
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomdHandler {
    type Statement = String;
    type QueryParser = RoomdQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(cmd).await
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
        let fields = if returns_rows(&target.statement) {
            reservation_schema()
        } else {
            vec![]
        };
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
        if returns_rows(&target.statement.statement) {
            Ok(DescribePortalResponse::new(reservation_schema()))
        } else {
            Ok(DescribePortalResponse::new(vec![]))
        }
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute `$1, $2, ...` with bound parameter values as quoted text, in
/// one pass so text inside a substituted value is never rescanned.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            out.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    out.push('\'');
                    out.push_str(&String::from_utf8_lossy(value.as_ref()).replace('\'', "''"));
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            }
            copied = end;
        }
        i = end.max(i + 1);
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Auth ─────────────────────────────────────────────────────────

/// One shared cleartext password, whatever the user name.
#[derive(Debug)]
pub struct RoomdAuthSource {
    password: String,
}

#[async_trait]
impl AuthSource for RoomdAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomdFactory {
    handler: Arc<RoomdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomdFactory {
    pub fn new(service: Arc<Service>, password: String, request_timeout: Duration) -> Self {
        Self {
            handler: Arc::new(RoomdHandler::new(service, request_timeout)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                RoomdAuthSource { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomdFactory {
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
    service: Arc<Service>,
    password: String,
    tls: Option<TlsAcceptor>,
    request_timeout: Duration,
) -> io::Result<()> {
    let factory = RoomdFactory::new(service, password, request_timeout);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for a reservation failure.
fn sqlstate(e: &ReservationError) -> &'static str {
    match e {
        ReservationError::Validation(_) => "22023",
        ReservationError::Conflict { .. } => "23P01",
        ReservationError::Store(s) if s.is_serialization_failure() => "40001",
        ReservationError::Store(_) => "XX000",
    }
}

fn reservation_err(e: ReservationError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceId, TimeInterval, ValidationError};
    use crate::store::StoreError;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM reservations"), 0);
        assert_eq!(count_params("INSERT INTO reservations VALUES ($1, $3, $2)"), 3);
        assert_eq!(count_params("SELECT $12"), 12);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO reservations (room_id, start_time, end_time) VALUES ($1, $2, $3)";
        let params = [Some(b"a$1".to_vec()), Some(b"$1 o'clock".to_vec()), None];
        assert_eq!(
            bind_params(sql, &params),
            "INSERT INTO reservations (room_id, start_time, end_time) VALUES ('a$1', '$1 o''clock', NULL)"
        );
    }

    #[test]
    fn placeholders_past_the_bound_count_stay() {
        let params = [Some(b"x".to_vec())];
        assert_eq!(bind_params("SELECT $1, $10, '$'", &params), "SELECT 'x', $10, '$'");
    }

    #[test]
    fn sqlstate_mapping() {
        let interval = TimeInterval::from_unix(0, 60).unwrap();
        assert_eq!(sqlstate(&ReservationError::Validation(ValidationError::EmptyResourceId)), "22023");
        assert_eq!(
            sqlstate(&ReservationError::Conflict {
                room_id: ResourceId::new("a").unwrap(),
                requested: interval,
                existing: interval,
            }),
            "23P01"
        );
        assert_eq!(
            sqlstate(&ReservationError::Store(StoreError::SerializationFailure(
                ResourceId::new("a").unwrap()
            ))),
            "40001"
        );
        assert_eq!(sqlstate(&ReservationError::Store(StoreError::Closed)), "XX000");
    }

    #[test]
    fn select_detection() {
        assert!(returns_rows("select * from reservations where room_id = $1"));
        assert!(!returns_rows("INSERT INTO reservations VALUES ($1, $2, $3)"));
    }
}

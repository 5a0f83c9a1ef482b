use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

pub struct SlotMatchHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotMatchQueryParser>,
}

impl SlotMatchHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotMatchQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let shape = ResultShape::of_command(&cmd);
        let schema = Arc::new(shape.schema(format));
        match cmd {
            Command::SelectCalendar { filter } => {
                let entries = self.engine.calendar(&filter).await.map_err(engine_err)?;
                Ok(encode_rows(schema, &entries, |encoder, entry| {
                    encoder.encode_field(&format_instant(entry.start))?;
                    encoder.encode_field(&(entry.available_count as i64))
                }))
            }
            Command::InsertBooking { request } => {
                let booking_id = self.engine.assign(&request).await.map_err(engine_err)?;
                Ok(encode_rows(schema, &[booking_id], |encoder, id| {
                    encoder.encode_field(id)
                }))
            }
            Command::InsertManagers { managers } => {
                let count = self.engine.add_managers(&managers).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::InsertSlots { slots } => {
                let count = self.engine.add_slots(&slots).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::SelectManagers => {
                let managers = self.engine.list_managers().await.map_err(engine_err)?;
                Ok(encode_rows(schema, &managers, |encoder, m| {
                    encoder.encode_field(&m.id)?;
                    encoder.encode_field(&m.name)?;
                    encoder.encode_field(&format_text_array(&m.languages))?;
                    encoder.encode_field(&format_text_array(&m.products))?;
                    encoder.encode_field(&format_text_array(&m.customer_ratings))?;
                    encoder.encode_field(&m.current_load)
                }))
            }
            Command::SelectSlots { manager_id } => {
                let slots = self.engine.list_slots(manager_id).await.map_err(engine_err)?;
                Ok(encode_rows(schema, &slots, |encoder, s| {
                    encoder.encode_field(&s.id)?;
                    encoder.encode_field(&s.manager_id)?;
                    encoder.encode_field(&format_instant(s.span.start))?;
                    encoder.encode_field(&format_instant(s.span.end))?;
                    encoder.encode_field(&s.booked)
                }))
            }
            Command::SelectBookings { manager_id } => {
                let bookings = self.engine.list_bookings(manager_id).await.map_err(engine_err)?;
                Ok(encode_rows(schema, &bookings, |encoder, b| {
                    encoder.encode_field(&b.id)?;
                    encoder.encode_field(&b.manager_id)?;
                    encoder.encode_field(&format_instant(b.span.start))?;
                    encoder.encode_field(&format_instant(b.span.end))?;
                    encoder.encode_field(&b.customer_id)
                }))
            }
        }
    }
}

fn encode_rows<T>(
    schema: Arc<Vec<FieldInfo>>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

/// Row shape a statement produces, known before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultShape {
    Calendar,
    BookingId,
    Managers,
    Slots,
    Bookings,
    Empty,
}

impl ResultShape {
    fn of_command(cmd: &Command) -> Self {
        match cmd {
            Command::SelectCalendar { .. } => ResultShape::Calendar,
            Command::InsertBooking { .. } => ResultShape::BookingId,
            Command::SelectManagers => ResultShape::Managers,
            Command::SelectSlots { .. } => ResultShape::Slots,
            Command::SelectBookings { .. } => ResultShape::Bookings,
            Command::InsertManagers { .. } | Command::InsertSlots { .. } => ResultShape::Empty,
        }
    }

    /// Keyword scan used to describe a statement whose parameters are not bound yet.
    fn of_sql(sql: &str) -> Self {
        let upper = sql.to_uppercase();
        let words: Vec<&str> = upper
            .split(|c: char| c.is_whitespace() || c == '(' || c == ';' || c == ',')
            .filter(|w| !w.is_empty())
            .collect();
        let after = |keyword: &str| {
            words
                .windows(2)
                .find(|pair| pair[0] == keyword)
                .map(|pair| pair[1].trim_matches('"'))
        };
        match words.first().copied() {
            Some("SELECT") => match after("FROM") {
                Some("CALENDAR") => ResultShape::Calendar,
                Some("SALES_MANAGERS") => ResultShape::Managers,
                Some("SLOTS") => ResultShape::Slots,
                Some("BOOKINGS") => ResultShape::Bookings,
                _ => ResultShape::Empty,
            },
            Some("INSERT") if after("INTO") == Some("BOOKINGS") => ResultShape::BookingId,
            _ => ResultShape::Empty,
        }
    }

    fn schema(self, format: &Format) -> Vec<FieldInfo> {
        let columns: Vec<(&str, Type)> = match self {
            ResultShape::Calendar => vec![("start_date", Type::VARCHAR), ("available_count", Type::INT8)],
            ResultShape::BookingId => vec![("booking_id", Type::INT8)],
            ResultShape::Managers => vec![
                ("id", Type::INT8),
                ("name", Type::VARCHAR),
                ("languages", Type::VARCHAR),
                ("products", Type::VARCHAR),
                ("customer_ratings", Type::VARCHAR),
                ("current_load", Type::INT8),
            ],
            ResultShape::Slots => vec![
                ("id", Type::INT8),
                ("sales_manager_id", Type::INT8),
                ("start_date", Type::VARCHAR),
                ("end_date", Type::VARCHAR),
                ("booked", Type::BOOL),
            ],
            ResultShape::Bookings => vec![
                ("id", Type::INT8),
                ("sales_manager_id", Type::INT8),
                ("start_date", Type::VARCHAR),
                ("end_date", Type::VARCHAR),
                ("customer_id", Type::INT8),
            ],
            ResultShape::Empty => vec![],
        };
        columns
            .into_iter()
            .enumerate()
            .map(|(i, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(i)))
            .collect()
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotMatchHandler {
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
pub struct SlotMatchQueryParser;

#[async_trait]
impl QueryParser for SlotMatchQueryParser {
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
        let format = column_format.unwrap_or(&Format::UnifiedText);
        Ok(ResultShape::of_sql(stmt).schema(format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotMatchHandler {
    type Statement = String;
    type QueryParser = SlotMatchQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
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
        let fields = ResultShape::of_sql(&target.statement).schema(&Format::UnifiedText);
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
        let fields = ResultShape::of_sql(&target.statement.statement)
            .schema(&target.result_column_format);
        Ok(DescribePortalResponse::new(fields))
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format)
/// in one left-to-right pass. Placeholders inside quoted literals or identifiers
/// stay as they are, and substituted values are never scanned again.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            // A doubled quote closes and reopens, which copies through unchanged.
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                let bound = sql[i + 1..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                match bound {
                    Some(Some(bytes)) => {
                        let text = String::from_utf8_lossy(bytes.as_ref());
                        out.push('\'');
                        out.push_str(&text.replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => out.push_str(&sql[i..end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotMatchFactory {
    handler: Arc<SlotMatchHandler>,
    noop: Arc<NoopHandler>,
}

impl SlotMatchFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(SlotMatchHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotMatchFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> std::io::Result<()> {
    let factory = Arc::new(SlotMatchFactory::new(engine));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound => "P0002",
        EngineError::Conflict { .. } => "23P01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Persistence(_) if e.is_transient() => "40001",
        EngineError::Persistence(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Persistence(inner) = &e {
        tracing::error!("store failure: {inner}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::time::Duration;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("SELECT * FROM slots WHERE sales_manager_id = $1"), 1);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($2, $1, $10)"), 10);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "SELECT * FROM calendar WHERE language = $1 AND rating = $2";
        assert_eq!(
            substitute_params(sql, &[Some("German"), Some("Plan $1")]),
            "SELECT * FROM calendar WHERE language = 'German' AND rating = 'Plan $1'"
        );
    }

    #[test]
    fn substitution_escapes_quotes_and_binds_nulls() {
        let mut params = vec![Some("it's".to_string()), None];
        params.extend((3..=10).map(|n| Some(format!("v{n}"))));
        assert_eq!(
            substitute_params("INSERT INTO bookings VALUES ($1, $2, $10)", &params),
            "INSERT INTO bookings VALUES ('it''s', NULL, 'v10')"
        );
    }

    #[test]
    fn quoted_and_unbound_placeholders_are_kept() {
        let sql = r#"SELECT * FROM slots WHERE "a$1" = '$1 and ''$2''' AND x = $1 AND y = $3"#;
        assert_eq!(
            substitute_params(sql, &[Some("v")]),
            r#"SELECT * FROM slots WHERE "a$1" = '$1 and ''$2''' AND x = 'v' AND y = $3"#
        );
    }

    #[test]
    fn bound_calendar_query_keeps_dollar_values() {
        let sql = r#"SELECT * FROM calendar WHERE "date" = $1 AND products = $2 AND language = $3 AND rating = $4"#;
        let params = [Some("2024-05-03"), Some("{SolarPanels}"), Some("$2"), Some("Plan $1")];
        match sql::parse_sql(&substitute_params(sql, &params)).unwrap() {
            Command::SelectCalendar { filter } => {
                assert_eq!(filter.language, "$2");
                assert_eq!(filter.rating, "Plan $1");
                assert_eq!(filter.products, vec!["SolarPanels".to_string()]);
            }
            other => panic!("expected SelectCalendar, got {other:?}"),
        }
    }

    #[test]
    fn shape_from_sql() {
        assert_eq!(
            ResultShape::of_sql(r#"SELECT * FROM calendar WHERE "date" = $1"#),
            ResultShape::Calendar
        );
        assert_eq!(
            ResultShape::of_sql("select id from \"sales_managers\""),
            ResultShape::Managers
        );
        assert_eq!(ResultShape::of_sql("SELECT * FROM slots;"), ResultShape::Slots);
        assert_eq!(
            ResultShape::of_sql("INSERT INTO bookings(\"date\") VALUES ($1)"),
            ResultShape::BookingId
        );
        assert_eq!(
            ResultShape::of_sql("INSERT INTO slots VALUES (1, 1, $1, false)"),
            ResultShape::Empty
        );
        assert_eq!(ResultShape::of_sql("SELECT * FROM bookings"), ResultShape::Bookings);
    }

    #[test]
    fn schemas_have_expected_columns() {
        let names = |shape: ResultShape| -> Vec<String> {
            shape
                .schema(&Format::UnifiedText)
                .iter()
                .map(|f| f.name().to_string())
                .collect()
        };
        assert_eq!(names(ResultShape::Calendar), vec!["start_date", "available_count"]);
        assert_eq!(names(ResultShape::BookingId), vec!["booking_id"]);
        assert_eq!(names(ResultShape::Slots).len(), 5);
        assert!(names(ResultShape::Empty).is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstates() {
        assert_eq!(sqlstate(&EngineError::NotFound), "P0002");
        assert_eq!(sqlstate(&EngineError::Conflict { desired_start: 0 }), "23P01");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("too many products")), "54000");
        assert_eq!(
            sqlstate(&EngineError::Persistence(StoreError::LockTimeout(Duration::from_secs(2)))),
            "40001"
        );
        assert_eq!(
            sqlstate(&EngineError::Persistence(StoreError::MissingRow {
                table: "slots",
                id: 1
            })),
            "58000"
        );
    }
}

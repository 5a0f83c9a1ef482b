use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectCalendar {
        filter: SlotFilter,
    },
    InsertBooking {
        request: BookingRequest,
    },
    InsertManagers {
        managers: Vec<SalesManager>,
    },
    InsertSlots {
        slots: Vec<Slot>,
    },
    SelectManagers,
    SelectSlots {
        manager_id: Option<ManagerId>,
    },
    SelectBookings {
        manager_id: Option<ManagerId>,
    },
}

const BOOKING_COLUMNS: &[&str] = &[
    "date",
    "products",
    "language",
    "rating",
    "desired_start_date",
    "customer_id",
];
const MANAGER_COLUMNS: &[&str] = &["id", "name", "languages", "products", "customer_ratings"];
const SLOT_COLUMNS: &[&str] = &["id", "sales_manager_id", "start_date", "booked"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row, addressed by column name.
struct InsertRow<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> InsertRow<'a> {
    fn find(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.find(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults): (&'static str, &[&str]) = match table.as_str() {
        "bookings" => ("bookings", BOOKING_COLUMNS),
        "sales_managers" => ("sales_managers", MANAGER_COLUMNS),
        "slots" => ("slots", SLOT_COLUMNS),
        _ => return Err(SqlError::UnknownTable(table)),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|c| c.to_string().trim_matches('"').to_lowercase())
            .collect()
    };
    let all_rows = extract_all_insert_rows(insert)?;
    let mut rows = Vec::with_capacity(all_rows.len());
    for values in &all_rows {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        rows.push(InsertRow {
            table,
            columns: &columns,
            values,
        });
    }

    match table {
        "bookings" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported("multi-row INSERT INTO bookings".into()));
            }
            Ok(Command::InsertBooking {
                request: booking_request(&rows[0])?,
            })
        }
        "sales_managers" => Ok(Command::InsertManagers {
            managers: collect_rows(&rows, sales_manager)?,
        }),
        _ => Ok(Command::InsertSlots {
            slots: collect_rows(&rows, slot)?,
        }),
    }
}

fn collect_rows<T>(
    rows: &[InsertRow<'_>],
    parse: impl Fn(&InsertRow<'_>) -> Result<T, SqlError>,
) -> Result<Vec<T>, SqlError> {
    if rows.len() == 1 {
        return Ok(vec![parse(&rows[0])?]);
    }
    rows.iter()
        .enumerate()
        .map(|(i, row)| parse(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}"))))
        .collect()
}

fn booking_request(row: &InsertRow<'_>) -> Result<BookingRequest, SqlError> {
    Ok(BookingRequest {
        criteria: SlotFilter {
            date: parse_date_expr(row.get("date")?)?,
            language: parse_text(row.get("language")?)?,
            rating: parse_text(row.get("rating")?)?,
            products: parse_text_list(row.get("products")?)?,
        },
        desired_start: parse_instant_expr(row.get("desired_start_date")?)?,
        customer_id: parse_i64(row.get("customer_id")?)?,
    })
}

fn sales_manager(row: &InsertRow<'_>) -> Result<SalesManager, SqlError> {
    let name = match row.find("name") {
        Some(expr) => parse_text_or_null(expr)?,
        None => None,
    };
    Ok(SalesManager::new(
        parse_i64(row.get("id")?)?,
        name,
        parse_text_list(row.get("languages")?)?,
        parse_text_list(row.get("products")?)?,
        parse_text_list(row.get("customer_ratings")?)?,
    ))
}

fn slot(row: &InsertRow<'_>) -> Result<Slot, SqlError> {
    let start = parse_instant_expr(row.get("start_date")?)?;
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(SqlError::Parse(format!("start_date out of range: {start}")));
    }
    if let Some(end) = row.find("end_date") {
        let end = parse_instant_expr(end)?;
        if end.checked_sub(start) != Some(SLOT_DURATION_MS) {
            return Err(SqlError::Parse("slots must be exactly one hour long".into()));
        }
    }
    let booked = match row.find("booked") {
        Some(expr) => parse_bool(expr)?,
        None => false,
    };
    Ok(Slot::new(
        parse_i64(row.get("id")?)?,
        parse_i64(row.get("sales_manager_id")?)?,
        start,
        booked,
    ))
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "calendar" => {
            let mut filters = CalendarFilters::default();
            if let Some(selection) = &select.selection {
                extract_calendar_filters(selection, &mut filters)?;
            }
            Ok(Command::SelectCalendar {
                filter: SlotFilter {
                    date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
                    language: filters.language.ok_or(SqlError::MissingFilter("language"))?,
                    rating: filters.rating.ok_or(SqlError::MissingFilter("rating"))?,
                    products: filters.products.ok_or(SqlError::MissingFilter("products"))?,
                },
            })
        }
        "sales_managers" => match &select.selection {
            None => Ok(Command::SelectManagers),
            Some(other) => Err(SqlError::Unsupported(format!("filter on sales_managers: {other}"))),
        },
        "slots" => Ok(Command::SelectSlots {
            manager_id: extract_manager_filter(&select.selection)?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            manager_id: extract_manager_filter(&select.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct CalendarFilters {
    date: Option<NaiveDate>,
    language: Option<String>,
    rating: Option<String>,
    products: Option<Vec<String>>,
}

fn extract_calendar_filters(expr: &Expr, filters: &mut CalendarFilters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_calendar_filters(inner, filters),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_calendar_filters(left, filters)?;
            extract_calendar_filters(right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            match expr_column_name(left).as_deref() {
                Some("date") => filters.date = Some(parse_date_expr(right)?),
                Some("language") => filters.language = Some(parse_text(right)?),
                Some("rating") => filters.rating = Some(parse_text(right)?),
                Some("products") => filters.products = Some(parse_text_list(right)?),
                _ => return Err(SqlError::Unsupported(format!("calendar filter: {expr}"))),
            }
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("calendar filter: {other}"))),
    }
}

/// `WHERE sales_manager_id = n`, or no WHERE at all.
fn extract_manager_filter(selection: &Option<Expr>) -> Result<Option<ManagerId>, SqlError> {
    let Some(sel) = selection else {
        return Ok(None);
    };
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("sales_manager_id") => {
            Ok(Some(parse_i64(right)?))
        }
        _ => Err(SqlError::MissingFilter("sales_manager_id")),
    }
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Look through `::type` casts and parentheses.
fn strip_cast(expr: &Expr) -> &Expr {
    match expr {
        Expr::Cast { expr, .. } | Expr::Nested(expr) => strip_cast(expr),
        _ => expr,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match strip_cast(expr) {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(Some),
    }
}

/// `'{A,B}'` or `ARRAY['A', 'B']`.
fn parse_text_list(expr: &Expr) -> Result<Vec<String>, SqlError> {
    match strip_cast(expr) {
        Expr::Array(array) => array.elem.iter().map(parse_text).collect(),
        _ => parse_text(expr).map(|s| parse_text_array(&s)),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = strip_cast(expr)
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

/// ISO-8601 text with any offset, or epoch milliseconds.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            parse_instant(s).ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
        }
        _ => parse_i64(expr),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date: {s}")))
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

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use sqlparser::ast::{
    self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// INSERT INTO policies, or UPDATE policies — both replace wholesale.
    ConfigurePolicy {
        organizer_id: Ulid,
        policy: AvailabilityPolicy,
    },
    SelectPolicies {
        organizer_id: Option<Ulid>,
    },
    SelectSlots {
        organizer_id: Ulid,
        display_timezone: Option<Tz>,
    },
    InsertBooking {
        /// Server-generated when the client omits the column.
        id: Option<Ulid>,
        organizer_id: Ulid,
        invitee_name: String,
        invitee_email: String,
        invitee_timezone: String,
        start: DateTime<Utc>,
    },
    RescheduleBooking {
        id: Ulid,
        new_start: DateTime<Utc>,
        expected_version: u32,
    },
    CancelBooking {
        id: Ulid,
    },
    SelectBookings {
        organizer_id: Ulid,
        status: Option<BookingStatus>,
        limit: Option<usize>,
        offset: usize,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Positional column order used when an INSERT carries no column list.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "policies" => &[
            "organizer_id",
            "timezone",
            "working_hours",
            "meeting_duration",
            "buffer_before",
            "buffer_after",
            "minimum_notice",
            "blackout_dates",
        ],
        "bookings" => &[
            "id",
            "organizer_id",
            "invitee_name",
            "invitee_email",
            "invitee_timezone",
            "start_time",
        ],
        _ => &[],
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(&table)
            .iter()
            .take(values.len())
            .map(|c| c.to_string())
            .collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("insert", columns.len(), values.len()));
    }
    let fields: Vec<(String, &Expr)> = columns.into_iter().zip(values.iter()).collect();

    match table.as_str() {
        "policies" => {
            let organizer_id = parse_ulid_expr(require_field(&fields, "organizer_id")?)?;
            let policy = build_policy(&fields)?;
            Ok(Command::ConfigurePolicy { organizer_id, policy })
        }
        "bookings" => {
            let id = match find_field(&fields, "id") {
                Some(expr) => Some(parse_ulid_expr(expr)?),
                None => None,
            };
            Ok(Command::InsertBooking {
                id,
                organizer_id: parse_ulid_expr(require_field(&fields, "organizer_id")?)?,
                invitee_name: parse_string_expr(require_field(&fields, "invitee_name")?)?,
                invitee_email: parse_string_expr(require_field(&fields, "invitee_email")?)?,
                invitee_timezone: parse_string_expr(require_field(&fields, "invitee_timezone")?)?,
                start: parse_timestamp_expr(require_field(&fields, "start_time")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let fields: Vec<(String, &Expr)> = assignments
        .iter()
        .filter_map(|a| assignment_column(a).map(|c| (c, &a.value)))
        .collect();

    match table.as_str() {
        "policies" => {
            let organizer_id = extract_where_eq(selection, "organizer_id")?
                .ok_or(SqlError::MissingFilter("organizer_id"))?;
            let organizer_id = parse_ulid_expr(organizer_id)?;
            let policy = build_policy(&fields)?;
            Ok(Command::ConfigurePolicy { organizer_id, policy })
        }
        "bookings" => {
            let id = extract_where_eq(selection, "id")?.ok_or(SqlError::MissingFilter("id"))?;
            let id = parse_ulid_expr(id)?;

            if let Some(status) = find_field(&fields, "status") {
                if parse_status_expr(status)? != BookingStatus::Cancelled {
                    return Err(SqlError::Unsupported(
                        "only status = 'cancelled' is accepted".into(),
                    ));
                }
                return Ok(Command::CancelBooking { id });
            }

            let new_start = parse_timestamp_expr(require_field(&fields, "start_time")?)?;
            let version = extract_where_eq(selection, "version")?
                .ok_or(SqlError::MissingFilter("version"))?;
            let expected_version = u32::try_from(parse_i64_expr(version)?)
                .map_err(|_| SqlError::Parse("version out of range".into()))?;
            Ok(Command::RescheduleBooking { id, new_start, expected_version })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

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
        "slots" => {
            let organizer_id = extract_where_eq(&select.selection, "organizer_id")?
                .ok_or(SqlError::MissingFilter("organizer_id"))?;
            let display_timezone = match extract_where_eq(&select.selection, "display_timezone")? {
                Some(expr) => Some(parse_timezone_expr(expr)?),
                None => None,
            };
            Ok(Command::SelectSlots {
                organizer_id: parse_ulid_expr(organizer_id)?,
                display_timezone,
            })
        }
        "bookings" => {
            let organizer_id = extract_where_eq(&select.selection, "organizer_id")?
                .ok_or(SqlError::MissingFilter("organizer_id"))?;
            let status = match extract_where_eq(&select.selection, "status")? {
                Some(expr) => Some(parse_status_expr(expr)?),
                None => None,
            };
            let (limit, offset) = extract_limit_offset(query)?;
            Ok(Command::SelectBookings {
                organizer_id: parse_ulid_expr(organizer_id)?,
                status,
                limit,
                offset,
            })
        }
        "policies" => {
            let organizer_id = match extract_where_eq(&select.selection, "organizer_id")? {
                Some(expr) => Some(parse_ulid_expr(expr)?),
                None => None,
            };
            Ok(Command::SelectPolicies { organizer_id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Assemble an AvailabilityPolicy from named column expressions. Optional
/// columns default: buffers and notice to zero, blackout dates to empty.
fn build_policy(fields: &[(String, &Expr)]) -> Result<AvailabilityPolicy, SqlError> {
    let timezone = parse_timezone_expr(require_field(fields, "timezone")?)?;
    let working_hours = parse_working_hours_json(&parse_string_expr(require_field(
        fields,
        "working_hours",
    )?)?)?;
    let meeting_duration = parse_u32_expr(require_field(fields, "meeting_duration")?)?;

    let buffer_before = match find_field(fields, "buffer_before") {
        Some(expr) => parse_u32_expr(expr)?,
        None => 0,
    };
    let buffer_after = match find_field(fields, "buffer_after") {
        Some(expr) => parse_u32_expr(expr)?,
        None => 0,
    };
    let minimum_notice = match find_field(fields, "minimum_notice") {
        Some(expr) => parse_u32_expr(expr)?,
        None => 0,
    };
    let blackout_dates = match find_field(fields, "blackout_dates") {
        Some(expr) => parse_blackout_json(&parse_string_expr(expr)?)?,
        None => BTreeSet::new(),
    };

    Ok(AvailabilityPolicy {
        timezone,
        working_hours,
        meeting_duration,
        buffer_before,
        buffer_after,
        minimum_notice,
        blackout_dates,
    })
}

// ── JSON column payloads ─────────────────────────────────

#[derive(serde::Deserialize)]
struct WorkingHoursJson {
    weekday: String,
    start: String,
    end: String,
}

fn parse_working_hours_json(s: &str) -> Result<Vec<WorkingHours>, SqlError> {
    let entries: Vec<WorkingHoursJson> =
        serde_json::from_str(s).map_err(|e| SqlError::Parse(format!("bad working_hours: {e}")))?;
    entries
        .into_iter()
        .map(|e| {
            Ok(WorkingHours {
                weekday: e
                    .weekday
                    .parse()
                    .map_err(|_| SqlError::Parse(format!("bad weekday: {}", e.weekday)))?,
                start: parse_wall_time(&e.start)?,
                end: parse_wall_time(&e.end)?,
            })
        })
        .collect()
}

fn parse_wall_time(s: &str) -> Result<NaiveTime, SqlError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time '{s}': {e}")))
}

fn parse_blackout_json(s: &str) -> Result<BTreeSet<NaiveDate>, SqlError> {
    let dates: Vec<String> =
        serde_json::from_str(s).map_err(|e| SqlError::Parse(format!("bad blackout_dates: {e}")))?;
    dates
        .into_iter()
        .map(|d| {
            d.parse()
                .map_err(|e| SqlError::Parse(format!("bad date '{d}': {e}")))
        })
        .collect()
}

// ── Helpers ───────────────────────────────────────────────────

fn find_field<'a>(fields: &'a [(String, &'a Expr)], name: &str) -> Option<&'a Expr> {
    fields.iter().find(|(c, _)| c == name).map(|(_, e)| *e)
}

fn require_field<'a>(fields: &'a [(String, &'a Expr)], name: &'static str) -> Result<&'a Expr, SqlError> {
    find_field(fields, name).ok_or(SqlError::MissingColumn(name))
}

fn assignment_column(a: &ast::Assignment) -> Option<String> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.len() {
            0 => Err(SqlError::Parse("empty VALUES".into())),
            1 => Ok(values.rows[0].clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Walk an AND-tree of a WHERE clause looking for `column = <expr>`.
fn extract_where_eq<'a>(
    selection: &'a Option<Expr>,
    column: &str,
) -> Result<Option<&'a Expr>, SqlError> {
    fn walk<'a>(expr: &'a Expr, column: &str) -> Option<&'a Expr> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    walk(left, column).or_else(|| walk(right, column))
                }
                ast::BinaryOperator::Eq => {
                    if expr_column_name(left).as_deref() == Some(column) {
                        Some(right)
                    } else {
                        None
                    }
                }
                _ => None,
            },
            Expr::Nested(inner) => walk(inner, column),
            _ => None,
        }
    }
    Ok(selection.as_ref().and_then(|sel| walk(sel, column)))
}

fn extract_limit_offset(query: &ast::Query) -> Result<(Option<usize>, usize), SqlError> {
    let Some(clause) = &query.limit_clause else {
        return Ok((None, 0));
    };
    match clause {
        ast::LimitClause::LimitOffset { limit, offset, .. } => {
            let limit = match limit {
                Some(expr) => Some(parse_usize_expr(expr)?),
                None => None,
            };
            let offset = match offset {
                Some(o) => parse_usize_expr(&o.value)?,
                None => 0,
            };
            Ok((limit, offset))
        }
        ast::LimitClause::OffsetCommaLimit { offset, limit } => {
            Ok((Some(parse_usize_expr(limit)?), parse_usize_expr(offset)?))
        }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM[:SS]` read as UTC.
fn parse_timestamp_expr(expr: &Expr) -> Result<DateTime<Utc>, SqlError> {
    let s = parse_string_expr(expr)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M"))
        .map(|naive| naive.and_utc())
        .map_err(|e| SqlError::Parse(format!("bad timestamp '{s}': {e}")))
}

fn parse_timezone_expr(expr: &Expr) -> Result<Tz, SqlError> {
    let s = parse_string_expr(expr)?;
    s.parse()
        .map_err(|_| SqlError::Parse(format!("unknown timezone '{s}'")))
}

fn parse_status_expr(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string_expr(expr)?;
    match s.to_lowercase().as_str() {
        "confirmed" => Ok(BookingStatus::Confirmed),
        "cancelled" => Ok(BookingStatus::Cancelled),
        _ => Err(SqlError::Parse(format!("bad status '{s}'"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32_expr(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_usize_expr(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

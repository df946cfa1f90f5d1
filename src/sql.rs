use std::collections::{BTreeSet, HashMap};

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::AvailabilityQuery;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Reservations,
    Shifts,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProfile {
        id: Ulid,
        email: String,
        name: String,
        role: Role,
    },
    VerifyProfile {
        id: Ulid,
    },
    InsertSubject {
        id: Ulid,
        name: String,
    },
    InsertShift {
        id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        subject_ids: BTreeSet<Ulid>,
        /// Defaults to the caller; admins name the teacher explicitly.
        teacher_id: Option<Ulid>,
    },
    /// Columns left out of the SET list keep their current values.
    UpdateShift {
        id: Ulid,
        date: Option<NaiveDate>,
        start_time: Option<NaiveTime>,
        end_time: Option<NaiveTime>,
        subject_ids: Option<BTreeSet<Ulid>>,
    },
    DeleteShift {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        shift_id: Ulid,
        subject_id: Ulid,
        notes: String,
    },
    UpdateReservation {
        id: Ulid,
        status: ReservationStatus,
    },
    SelectAvailability(AvailabilityQuery),
    SelectProfiles,
    SelectSubjects,
    SelectShifts,
    SelectReservations,
    SelectStats,
    SelectExport(ExportKind),
}

impl Command {
    /// True for statements that only read.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Command::SelectAvailability(_)
                | Command::SelectProfiles
                | Command::SelectSubjects
                | Command::SelectShifts
                | Command::SelectReservations
                | Command::SelectStats
                | Command::SelectExport(_)
        )
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("one statement per query".into()));
    }

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const PROFILE_COLUMNS: &[&str] = &["id", "email", "name", "role"];
const SUBJECT_COLUMNS: &[&str] = &["id", "name"];
const SHIFT_COLUMNS: &[&str] = &["id", "date", "start_time", "end_time", "subjects", "teacher_id"];
const RESERVATION_COLUMNS: &[&str] = &["id", "shift_id", "subject_id", "notes"];

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .get(column)
            .copied()
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }

    /// Client-supplied id, or a fresh one when the column is omitted or NULL.
    fn id_or_new(&self) -> Result<Ulid, SqlError> {
        match self.optional("id") {
            Some(expr) => Ok(parse_ulid_or_null(expr)?.unwrap_or_else(Ulid::new)),
            None => Ok(Ulid::new()),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "profiles" => {
            let row = insert_row(insert, "profiles", PROFILE_COLUMNS)?;
            Ok(Command::InsertProfile {
                id: row.id_or_new()?,
                email: parse_string(row.required("email")?)?,
                name: parse_string(row.required("name")?)?,
                role: parse_string(row.required("role")?)?
                    .parse()
                    .map_err(|_| SqlError::Parse("role must be student, teacher or admin".into()))?,
            })
        }
        "subjects" => {
            let row = insert_row(insert, "subjects", SUBJECT_COLUMNS)?;
            Ok(Command::InsertSubject {
                id: row.id_or_new()?,
                name: parse_string(row.required("name")?)?,
            })
        }
        "shifts" => {
            let row = insert_row(insert, "shifts", SHIFT_COLUMNS)?;
            Ok(Command::InsertShift {
                id: row.id_or_new()?,
                date: parse_date(row.required("date")?)?,
                start_time: parse_time(row.required("start_time")?)?,
                end_time: parse_time(row.required("end_time")?)?,
                subject_ids: parse_ulid_list(row.required("subjects")?)?,
                teacher_id: row.optional("teacher_id").map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "reservations" => {
            let row = insert_row(insert, "reservations", RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                id: row.id_or_new()?,
                shift_id: parse_ulid(row.required("shift_id")?)?,
                subject_id: parse_ulid(row.required("subject_id")?)?,
                notes: row
                    .optional("notes")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or_default(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Pair the first VALUES row with the column list, or with `canonical` when
/// the statement names no columns.
fn insert_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    canonical: &[&str],
) -> Result<Row<'a>, SqlError> {
    let rows = extract_insert_rows(insert)?;
    if rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let values = &rows[0];

    let columns: Vec<String> = if insert.columns.is_empty() {
        canonical.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() || (!insert.columns.is_empty() && values.len() != columns.len()) {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    for column in &columns {
        if !canonical.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(table, column.clone()));
        }
    }

    Ok(Row {
        table,
        values: columns.into_iter().zip(values.iter()).collect(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set: HashMap<String, &Expr> = HashMap::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(column) => object_name_last(column),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(column, &assignment.value);
    }

    match name.as_str() {
        "profiles" => {
            let verified = set.get("verified").ok_or(SqlError::MissingColumn("profiles", "verified"))?;
            if !parse_bool(verified)? {
                return Err(SqlError::Unsupported("verification cannot be revoked".into()));
            }
            Ok(Command::VerifyProfile { id })
        }
        "shifts" => {
            if let Some(column) = set.keys().find(|c| !["date", "start_time", "end_time", "subjects"].contains(&c.as_str())) {
                return Err(SqlError::UnknownColumn("shifts", column.clone()));
            }
            Ok(Command::UpdateShift {
                id,
                date: set.get("date").map(|e| parse_date(e)).transpose()?,
                start_time: set.get("start_time").map(|e| parse_time(e)).transpose()?,
                end_time: set.get("end_time").map(|e| parse_time(e)).transpose()?,
                subject_ids: set.get("subjects").map(|e| parse_ulid_list(e)).transpose()?,
            })
        }
        "reservations" => {
            let status = set.get("status").ok_or(SqlError::MissingColumn("reservations", "status"))?;
            Ok(Command::UpdateReservation {
                id,
                status: parse_string(status)?
                    .parse()
                    .map_err(|_| SqlError::Parse("unknown reservation status".into()))?,
            })
        }
        _ => Err(SqlError::UnknownTable(name)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "shifts" => Ok(Command::DeleteShift { id }),
        "reservations" => Err(SqlError::Unsupported(
            "reservations are never deleted; set status = 'cancelled'".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "availability" => {
            let date = filters.get("date").map(|e| parse_date(e)).transpose()?;
            let subject = filters.get("subject_id").map(|e| parse_ulid(e)).transpose()?;
            let query = match (subject, date) {
                (Some(subject_id), date) => AvailabilityQuery::Subject { subject_id, date },
                (None, Some(date)) => AvailabilityQuery::Date(date),
                (None, None) => return Err(SqlError::MissingFilter("date or subject_id")),
            };
            Ok(Command::SelectAvailability(query))
        }
        "profiles" => Ok(Command::SelectProfiles),
        "subjects" => Ok(Command::SelectSubjects),
        "shifts" => Ok(Command::SelectShifts),
        "reservations" => Ok(Command::SelectReservations),
        "stats" => Ok(Command::SelectStats),
        "export" => {
            let kind = filters.get("kind").ok_or(SqlError::MissingFilter("kind"))?;
            match parse_string(kind)?.to_lowercase().as_str() {
                "reservations" => Ok(Command::SelectExport(ExportKind::Reservations)),
                "shifts" => Ok(Command::SelectExport(ExportKind::Shifts)),
                other => Err(SqlError::Parse(format!("unknown export kind: {other}"))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Gather `column = value` terms joined by AND. Other predicates are rejected.
fn collect_eq_filters<'a>(expr: &'a Expr, filters: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, filters)?;
            collect_eq_filters(right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            filters.insert(column, right.as_ref());
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, filters),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let mut filters = HashMap::new();
    if let Some(sel) = selection {
        collect_eq_filters(sel, &mut filters)?;
    }
    let id = filters.get("id").ok_or(SqlError::MissingFilter("id"))?;
    parse_ulid(id)
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

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    parse_string_or_null(expr)?
        .map(|s| Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .transpose()
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

/// Comma-separated ULIDs in one string: `'01H..., 01H...'`.
fn parse_ulid_list(expr: &Expr) -> Result<BTreeSet<Ulid>, SqlError> {
    parse_string(expr)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .collect()
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    let trimmed = s.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
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
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

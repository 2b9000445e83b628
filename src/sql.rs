use chrono::{DateTime, NaiveTime, Utc};
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{AppointmentUpdate, BookingRequest, EngineError};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertDoctor {
        /// Server-assigned when absent.
        id: Option<Ulid>,
        name: String,
        specialization: String,
        working_start: NaiveTime,
        working_end: NaiveTime,
    },
    SelectDoctors {
        id: Option<Ulid>,
    },
    InsertAppointment {
        request: BookingRequest,
    },
    UpdateAppointment {
        id: Ulid,
        patch: AppointmentUpdate,
    },
    DeleteAppointment {
        id: Ulid,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    SelectSlots {
        doctor_id: Ulid,
        date: String,
        granularity: Option<u32>,
    },
}

#[derive(Debug, PartialEq)]
pub enum AppointmentFilter {
    ById(Ulid),
    /// Appointments overlapping `[from, to)`; open ends are unbounded.
    ByDoctor {
        doctor_id: Ulid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    },
}

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
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the scheduler rejects.
    #[error(transparent)]
    Invalid(#[from] EngineError),
}

const DOCTOR_COLUMNS: &[&str] = &["id", "name", "specialization", "working_start", "working_end"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "doctor_id",
    "start",
    "duration",
    "appointment_type",
    "patient_name",
    "notes",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row {
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn insert_row(insert: &ast::Insert, known: &[&str]) -> Result<Row, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let values = match source.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let names: Vec<String> = if insert.columns.is_empty() {
        known.iter().take(row.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if names.len() != row.len() {
        return Err(SqlError::Parse(format!(
            "{} columns but {} values",
            names.len(),
            row.len()
        )));
    }
    if let Some(bad) = names.iter().find(|n| !known.contains(&n.as_str())) {
        return Err(SqlError::UnknownColumn(bad.clone()));
    }
    Ok(Row {
        cells: names.into_iter().zip(row.iter().cloned()).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "doctors" => {
            let row = insert_row(insert, DOCTOR_COLUMNS)?;
            Ok(Command::InsertDoctor {
                id: row.get("id").map(parse_ulid_or_null).transpose()?.flatten(),
                name: parse_string(row.require("name")?)?,
                specialization: parse_string(row.require("specialization")?)?,
                working_start: parse_time_expr(row.require("working_start")?)?,
                working_end: parse_time_expr(row.require("working_end")?)?,
            })
        }
        "appointments" => {
            let row = insert_row(insert, APPOINTMENT_COLUMNS)?;
            let request = BookingRequest {
                doctor_id: parse_ulid(row.require("doctor_id")?)?,
                start: parse_instant_expr(row.require("start")?)?,
                duration_minutes: parse_u32(row.require("duration")?)?,
                appointment_type: parse_string(row.require("appointment_type")?)?,
                patient_name: parse_string(row.require("patient_name")?)?,
                notes: row.get("notes").map(parse_string_or_null).transpose()?.flatten(),
            };
            Ok(Command::InsertAppointment { request })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE / DELETE ───────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut patch = AppointmentUpdate::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let value = &assignment.value;
        match column.as_str() {
            "start" => patch.start = Some(parse_instant_expr(value)?),
            "duration" => patch.duration_minutes = Some(parse_u32(value)?),
            "appointment_type" => patch.appointment_type = Some(parse_string(value)?),
            "patient_name" => patch.patient_name = Some(parse_string(value)?),
            "notes" => patch.notes = Some(parse_string_or_null(value)?),
            "id" | "doctor_id" => {
                return Err(SqlError::Unsupported(format!("{column} cannot be changed")));
            }
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    Ok(Command::UpdateAppointment { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    Ok(Command::DeleteAppointment {
        id: extract_where_id(&delete.selection)?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

/// `column op value` conjuncts of a WHERE clause.
type Filters<'a> = Vec<(String, &'a BinaryOperator, &'a Expr)>;

fn collect_filters<'a>(expr: &'a Expr, out: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, op, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn find_filter<'a>(filters: &Filters<'a>, column: &str, op: BinaryOperator) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|(c, o, _)| c == column && **o == op)
        .map(|(_, _, e)| *e)
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let eq = |col: &str| find_filter(&filters, col, BinaryOperator::Eq);

    match table.as_str() {
        "doctors" => Ok(Command::SelectDoctors {
            id: eq("id").map(parse_ulid).transpose()?,
        }),
        "appointments" => {
            if let Some(id) = eq("id") {
                return Ok(Command::SelectAppointments {
                    filter: AppointmentFilter::ById(parse_ulid(id)?),
                });
            }
            let doctor_id = parse_ulid(eq("doctor_id").ok_or(SqlError::MissingFilter("doctor_id"))?)?;
            let from = find_filter(&filters, "start", BinaryOperator::GtEq)
                .map(parse_instant_expr)
                .transpose()?;
            let to = find_filter(&filters, "end", BinaryOperator::LtEq)
                .map(parse_instant_expr)
                .transpose()?;
            Ok(Command::SelectAppointments {
                filter: AppointmentFilter::ByDoctor { doctor_id, from, to },
            })
        }
        "slots" => Ok(Command::SelectSlots {
            doctor_id: parse_ulid(eq("doctor_id").ok_or(SqlError::MissingFilter("doctor_id"))?)?,
            date: parse_string(eq("date").ok_or(SqlError::MissingFilter("date"))?)?,
            granularity: eq("granularity").map(parse_u32).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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

/// Text of a literal. Numbers come back as their digits, since bound
/// parameters of the extended protocol always arrive quoted.
fn literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => Ok(literal(expr)?.map(|s| format!("-{s}"))),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    literal(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    literal(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    literal(expr)?
        .map(|s| Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}"))))
        .transpose()
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL id".into()))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = parse_string(expr)?;
    s.trim()
        .parse::<u32>()
        .map_err(|_| EngineError::InvalidArgument(format!("expected a non-negative integer, got '{s}'")).into())
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    Ok(parse_time_of_day(&parse_string(expr)?)?)
}

/// RFC 3339 text, or Unix milliseconds.
fn parse_instant_expr(expr: &Expr) -> Result<DateTime<Utc>, SqlError> {
    let s = parse_string(expr)?;
    match s.trim().parse::<Ms>() {
        Ok(ms) => DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| EngineError::InvalidArgument(format!("instant {ms} out of range")).into()),
        Err(_) => Ok(parse_instant(&s)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "01HV4Z00000000000000000D0C";
    const APPT: &str = "01HV4Z000000000000000APPT1";

    fn doc() -> Ulid {
        Ulid::from_string(DOC).unwrap()
    }

    #[test]
    fn insert_doctor_with_columns() {
        let sql = format!(
            "INSERT INTO doctors (id, name, specialization, working_start, working_end) \
             VALUES ('{DOC}', 'Dr. Grey', 'surgery', '09:00', '17:30')"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertDoctor {
                id: Some(doc()),
                name: "Dr. Grey".into(),
                specialization: "surgery".into(),
                working_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                working_end: NaiveTime::from_hms_opt(17, 30, 0).unwrap(),
            }
        );
    }

    #[test]
    fn insert_doctor_without_id() {
        let sql = "INSERT INTO doctors (name, specialization, working_start, working_end) \
                   VALUES ('Dr. Who', 'gp', '08:00', '12:00')";
        match parse_sql(sql).unwrap() {
            Command::InsertDoctor { id, name, .. } => {
                assert_eq!(id, None);
                assert_eq!(name, "Dr. Who");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn insert_doctor_positional_null_id() {
        let sql = "INSERT INTO doctors VALUES (NULL, 'Dr. Who', 'gp', '08:00', '12:00')";
        assert!(matches!(
            parse_sql(sql).unwrap(),
            Command::InsertDoctor { id: None, .. }
        ));
    }

    #[test]
    fn insert_doctor_bad_time_is_invalid_argument() {
        let sql = "INSERT INTO doctors (name, specialization, working_start, working_end) \
                   VALUES ('Dr. Who', 'gp', '25:00', '12:00')";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::Invalid(EngineError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn insert_appointment() {
        let sql = format!(
            "INSERT INTO appointments (doctor_id, start, duration, appointment_type, patient_name, notes) \
             VALUES ('{DOC}', '2025-03-10T09:00:00Z', 30, 'checkup', 'Ada', NULL)"
        );
        let Command::InsertAppointment { request } = parse_sql(&sql).unwrap() else {
            panic!("expected insert");
        };
        assert_eq!(request.doctor_id, doc());
        assert_eq!(request.start, parse_instant("2025-03-10T09:00:00Z").unwrap());
        assert_eq!(request.duration_minutes, 30);
        assert_eq!(request.notes, None);
    }

    #[test]
    fn insert_appointment_accepts_millis_and_quoted_numbers() {
        let sql = format!(
            "INSERT INTO appointments (doctor_id, start, duration, appointment_type, patient_name) \
             VALUES ('{DOC}', '1741597200000', '45', 'consult', 'Bob')"
        );
        let Command::InsertAppointment { request } = parse_sql(&sql).unwrap() else {
            panic!("expected insert");
        };
        assert_eq!(request.start, parse_instant("2025-03-10T09:00:00Z").unwrap());
        assert_eq!(request.duration_minutes, 45);
    }

    #[test]
    fn insert_appointment_missing_column() {
        let sql = format!(
            "INSERT INTO appointments (doctor_id, start, appointment_type, patient_name) \
             VALUES ('{DOC}', '2025-03-10T09:00:00Z', 'checkup', 'Ada')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("duration"))));
    }

    #[test]
    fn insert_unknown_column() {
        let sql = format!(
            "INSERT INTO appointments (doctor_id, room) VALUES ('{DOC}', 'B12')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "room"));
    }

    #[test]
    fn negative_duration_is_invalid() {
        let sql = format!(
            "INSERT INTO appointments VALUES ('{DOC}', '2025-03-10T09:00:00Z', -30, 'checkup', 'Ada')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Invalid(_))));
    }

    #[test]
    fn update_appointment_patch() {
        let sql = format!(
            "UPDATE appointments SET start = '2025-03-10T11:00:00Z', notes = NULL WHERE id = '{APPT}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::UpdateAppointment {
                id: Ulid::from_string(APPT).unwrap(),
                patch: AppointmentUpdate {
                    start: Some(parse_instant("2025-03-10T11:00:00Z").unwrap()),
                    notes: Some(None),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn update_doctor_id_rejected() {
        let sql = format!("UPDATE appointments SET doctor_id = '{DOC}' WHERE id = '{APPT}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_without_id_filter() {
        let sql = "UPDATE appointments SET duration = 15";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn delete_appointment() {
        let sql = format!("DELETE FROM appointments WHERE id = '{APPT}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteAppointment {
                id: Ulid::from_string(APPT).unwrap()
            }
        );
    }

    #[test]
    fn delete_from_doctors_unsupported_table() {
        let sql = format!("DELETE FROM doctors WHERE id = '{DOC}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn select_doctors() {
        assert_eq!(
            parse_sql("SELECT * FROM doctors").unwrap(),
            Command::SelectDoctors { id: None }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM doctors WHERE id = '{DOC}'")).unwrap(),
            Command::SelectDoctors { id: Some(doc()) }
        );
    }

    #[test]
    fn select_appointments_by_doctor_window() {
        let sql = format!(
            "SELECT * FROM appointments WHERE doctor_id = '{DOC}' \
             AND start >= '2025-03-10T00:00:00Z' AND \"end\" <= '2025-03-11T00:00:00Z'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAppointments {
                filter: AppointmentFilter::ByDoctor {
                    doctor_id: doc(),
                    from: Some(parse_instant("2025-03-10T00:00:00Z").unwrap()),
                    to: Some(parse_instant("2025-03-11T00:00:00Z").unwrap()),
                },
            }
        );
    }

    #[test]
    fn select_appointments_needs_a_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM appointments"),
            Err(SqlError::MissingFilter("doctor_id"))
        ));
    }

    #[test]
    fn select_slots() {
        let sql = format!(
            "SELECT * FROM slots WHERE doctor_id = '{DOC}' AND date = '2025-03-10' AND granularity = 15"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlots {
                doctor_id: doc(),
                date: "2025-03-10".into(),
                granularity: Some(15),
            }
        );
    }

    #[test]
    fn select_slots_requires_date() {
        let sql = format!("SELECT * FROM slots WHERE doctor_id = '{DOC}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn bad_ulid_is_parse_error() {
        let sql = "SELECT * FROM doctors WHERE id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn unknown_table() {
        assert!(matches!(
            parse_sql("SELECT * FROM rooms"),
            Err(SqlError::UnknownTable(t)) if t == "rooms"
        ));
    }

    #[test]
    fn empty_and_garbage() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("BOOK ME PLEASE"), Err(SqlError::Parse(_))));
    }
}

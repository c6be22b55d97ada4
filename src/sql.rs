use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `SELECT * FROM menaje`
    SelectItems,
    /// `SELECT * FROM menaje WHERE id = ...`
    SelectItem {
        id: ItemId,
    },
    /// `INSERT INTO menaje (id, nombre, unidad, stock_total) VALUES (...)`
    UpsertItem {
        item: InventoryItem,
    },
    /// `INSERT INTO reservas (evento_id, fecha) VALUES (...)`
    GetOrCreateReservation {
        evento_id: EventoId,
        fecha: NaiveDate,
    },
    /// `SELECT * FROM reservas WHERE id = ... | evento_id = ...`
    SelectReservation {
        key: ReservationKey,
    },
    /// `SELECT * FROM reserva_lineas WHERE reserva_id = ...`
    SelectLines {
        reserva_id: ReservationId,
    },
    /// `SELECT * FROM disponibilidad WHERE fecha_inicio = ... AND fecha_fin = ... [AND excluir_reserva = ...]`
    SelectAvailability {
        window: DateRange,
        exclude: Option<ReservationId>,
    },
    /// `INSERT INTO reserva_lineas (reserva_id, menaje_id, cantidad) VALUES (...), ...`
    SaveLines {
        reserva_id: ReservationId,
        lines: Vec<ReservationLine>,
    },
    /// `DELETE FROM reserva_lineas WHERE reserva_id = ...`
    ClearLines {
        reserva_id: ReservationId,
    },
    /// `INSERT INTO reserva_estados (reserva_id, estado) VALUES (...)`
    SetEstado {
        reserva_id: ReservationId,
        estado: Estado,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationKey {
    Id(ReservationId),
    Evento(EventoId),
}

/// Shape of the rows a command returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Items,
    Reservation,
    Lines,
    Availability,
    /// Command tag only.
    None,
}

impl Command {
    pub fn result_shape(&self) -> ResultShape {
        match self {
            Command::SelectItems | Command::SelectItem { .. } => ResultShape::Items,
            Command::GetOrCreateReservation { .. }
            | Command::SelectReservation { .. }
            | Command::SetEstado { .. } => ResultShape::Reservation,
            Command::SelectLines { .. } => ResultShape::Lines,
            Command::SelectAvailability { .. } => ResultShape::Availability,
            Command::UpsertItem { .. } | Command::SaveLines { .. } | Command::ClearLines { .. } => {
                ResultShape::None
            }
        }
    }
}

/// Row shape of a statement without binding its parameters, from the target table alone.
pub fn result_shape_of(sql: &str) -> ResultShape {
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return ResultShape::None;
    };
    let table = match stmts.first() {
        Some(Statement::Insert(insert)) => insert_table_name(insert).ok(),
        Some(Statement::Query(query)) => select_table_name(query).ok(),
        _ => None,
    };
    match table.as_deref() {
        Some("menaje") if matches!(stmts.first(), Some(Statement::Query(_))) => ResultShape::Items,
        Some("reservas") | Some("reserva_estados") => ResultShape::Reservation,
        Some("reserva_lineas") if matches!(stmts.first(), Some(Statement::Query(_))) => {
            ResultShape::Lines
        }
        Some("disponibilidad") => ResultShape::Availability,
        _ => ResultShape::None,
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > crate::limits::MAX_SQL_LEN {
        return Err(SqlError::Unsupported("statement too long".into()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.first() {
        None => Err(SqlError::Empty),
        Some(Statement::Insert(insert)) => parse_insert(insert),
        Some(Statement::Delete(delete)) => parse_delete(delete),
        Some(Statement::Query(query)) => parse_select(query),
        Some(other) => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(table: &'static str, columns: &'a [String], values: &'a [Expr]) -> Self {
        Self { table, columns, values }
    }

    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults): (&'static str, &[&str]) = match table.as_str() {
        "menaje" => ("menaje", &["id", "nombre", "unidad", "stock_total"]),
        "reservas" => ("reservas", &["evento_id", "fecha"]),
        "reserva_lineas" => ("reserva_lineas", &["reserva_id", "menaje_id", "cantidad"]),
        "reserva_estados" => ("reserva_estados", &["reserva_id", "estado"]),
        _ => return Err(SqlError::UnknownTable(table)),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let rows = extract_insert_rows(insert)?;
    for values in &rows {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
    }
    let row = |values| Row::new(table, &columns, values);

    if table != "reserva_lineas" && rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }

    match table {
        "menaje" => {
            let r = row(&rows[0]);
            Ok(Command::UpsertItem {
                item: InventoryItem {
                    id: parse_ulid(r.get("id")?)?,
                    nombre: parse_string(r.get("nombre")?)?,
                    unidad: parse_string(r.get("unidad")?)?
                        .parse()
                        .map_err(SqlError::Parse)?,
                    stock_total: parse_u32(r.get("stock_total")?)?,
                },
            })
        }
        "reservas" => {
            let r = row(&rows[0]);
            Ok(Command::GetOrCreateReservation {
                evento_id: parse_ulid(r.get("evento_id")?)?,
                fecha: parse_date(r.get("fecha")?)?,
            })
        }
        "reserva_estados" => {
            let r = row(&rows[0]);
            Ok(Command::SetEstado {
                reserva_id: parse_ulid(r.get("reserva_id")?)?,
                estado: parse_string(r.get("estado")?)?
                    .parse()
                    .map_err(SqlError::Parse)?,
            })
        }
        _ => {
            let mut reserva_id = None;
            let mut lines = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let r = row(values);
                let at = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
                let rid = parse_ulid(r.get("reserva_id")?).map_err(at)?;
                match reserva_id {
                    None => reserva_id = Some(rid),
                    Some(first) if first != rid => return Err(SqlError::MixedReservations),
                    Some(_) => {}
                }
                lines.push(ReservationLine {
                    menaje_id: parse_ulid(r.get("menaje_id")?).map_err(at)?,
                    cantidad: parse_u32(r.get("cantidad")?).map_err(at)?,
                });
            }
            let reserva_id = reserva_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::SaveLines { reserva_id, lines })
        }
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reserva_lineas" {
        return Err(SqlError::Unsupported(format!("DELETE FROM {table}")));
    }
    let mut filters = Filters::default();
    if let Some(selection) = &delete.selection {
        collect_filters(selection, &mut filters)?;
    }
    Ok(Command::ClearLines {
        reserva_id: filters.reserva_id.ok_or(SqlError::MissingFilter("reserva_id"))?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn select_table_name(query: &ast::Query) -> Result<String, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    table_factor_name(&from.relation)
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let table = select_table_name(query)?;
    let mut filters = Filters::default();
    if let SetExpr::Select(select) = query.body.as_ref()
        && let Some(selection) = &select.selection
    {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "menaje" => {
            let other_filter = filters.evento_id.is_some()
                || filters.reserva_id.is_some()
                || filters.excluir_reserva.is_some()
                || filters.fecha_inicio.is_some()
                || filters.fecha_fin.is_some();
            if other_filter {
                return Err(SqlError::Unsupported("menaje filters other than id".into()));
            }
            Ok(filters.id.map_or(Command::SelectItems, |id| Command::SelectItem { id }))
        }
        "reservas" => {
            let key = match (filters.id, filters.evento_id) {
                (Some(id), _) => ReservationKey::Id(id),
                (None, Some(evento)) => ReservationKey::Evento(evento),
                (None, None) => return Err(SqlError::MissingFilter("id")),
            };
            Ok(Command::SelectReservation { key })
        }
        "reserva_lineas" => Ok(Command::SelectLines {
            reserva_id: filters.reserva_id.ok_or(SqlError::MissingFilter("reserva_id"))?,
        }),
        "disponibilidad" => {
            let start = filters.fecha_inicio.ok_or(SqlError::MissingFilter("fecha_inicio"))?;
            let end = filters.fecha_fin.ok_or(SqlError::MissingFilter("fecha_fin"))?;
            Ok(Command::SelectAvailability {
                window: DateRange { start, end },
                exclude: filters.excluir_reserva,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters recognised in WHERE clauses, joined by AND.
#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    evento_id: Option<Ulid>,
    reserva_id: Option<Ulid>,
    excluir_reserva: Option<Ulid>,
    fecha_inicio: Option<NaiveDate>,
    fecha_fin: Option<NaiveDate>,
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return Err(SqlError::Unsupported(format!("WHERE {expr}")));
    };
    match op {
        ast::BinaryOperator::And => {
            collect_filters(left, filters)?;
            collect_filters(right, filters)
        }
        ast::BinaryOperator::Eq | ast::BinaryOperator::GtEq | ast::BinaryOperator::LtEq => {
            let Some(col) = expr_column_name(left) else {
                return Err(SqlError::Unsupported(format!("WHERE {expr}")));
            };
            let is_eq = matches!(op, ast::BinaryOperator::Eq);
            match (col.as_str(), op) {
                ("id", _) if is_eq => filters.id = Some(parse_ulid(right)?),
                ("evento_id", _) if is_eq => filters.evento_id = Some(parse_ulid(right)?),
                ("reserva_id", _) if is_eq => filters.reserva_id = Some(parse_ulid(right)?),
                ("excluir_reserva", _) if is_eq => {
                    filters.excluir_reserva = parse_ulid_or_null(right)?
                }
                ("fecha_inicio", ast::BinaryOperator::Eq | ast::BinaryOperator::GtEq) => {
                    filters.fecha_inicio = Some(parse_date(right)?)
                }
                ("fecha_fin", ast::BinaryOperator::Eq | ast::BinaryOperator::LtEq) => {
                    filters.fecha_fin = Some(parse_date(right)?)
                }
                _ => return Err(SqlError::Unsupported(format!("filter on {col}"))),
            }
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
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
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?} (expected YYYY-MM-DD): {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => match expr {
            Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => Ok(-parse_i64(expr)?),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must be a non-negative integer")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    /// A line batch named more than one reservation.
    MixedReservations,
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
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MixedReservations => {
                write!(f, "reserva_lineas: every row must share one reserva_id")
            }
        }
    }
}

impl std::error::Error for SqlError {}

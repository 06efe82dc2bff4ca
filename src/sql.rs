use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{BookingFilter, CatalogKind, NewBooking};
use crate::model::{Contact, ProposalStatus};

/// The one channel clients can LISTEN on; it carries the session user's
/// own notifications.
pub const NOTIFY_CHANNEL: &str = "tourdesk";

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    CreateBooking(NewBooking),
    CancelBooking {
        id: Ulid,
    },
    DecideBooking {
        booking_id: Ulid,
        accept: bool,
    },
    AssignGuide {
        booking_id: Ulid,
        guide_id: Ulid,
    },
    ConfirmPayment {
        booking_id: Ulid,
        reference: String,
    },
    CompleteBooking {
        booking_id: Ulid,
    },
    /// An operator settled a pending refund outside the gateway.
    RecordRefund {
        booking_id: Ulid,
    },
    /// `body` is the JSON draft, decoded by the engine.
    SubmitProposal {
        id: Ulid,
        body: String,
    },
    ReviewProposal {
        proposal_id: Ulid,
        approve: bool,
        notes: Option<String>,
    },
    AddBusyMarker {
        id: Ulid,
        guide_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        note: Option<String>,
    },
    RemoveBusyMarker {
        id: Ulid,
    },
    RegisterCatalogEntry {
        kind: CatalogKind,
        id: Ulid,
        name: String,
    },
    RemoveCatalogEntry {
        kind: CatalogKind,
        id: Ulid,
    },
    SelectCapacity {
        tour_id: Ulid,
        date: NaiveDate,
    },
    SelectBookings(BookingFilter),
    SelectProposals {
        status: Option<ProposalStatus>,
    },
    SelectTours,
    SelectCheckout {
        booking_id: Ulid,
    },
    SelectBusyMarkers {
        guide_id: Option<Ulid>,
    },
    SelectCatalog(CatalogKind),
    Listen {
        channel: String,
    },
    /// `None` is `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_listen(trimmed)? {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_listen(sql: &str) -> Result<Option<Command>, SqlError> {
    let Some((keyword, rest)) = sql.split_once(char::is_whitespace) else {
        return Ok(None);
    };
    let channel = rest.trim().trim_matches('"').to_string();
    if keyword.eq_ignore_ascii_case("LISTEN") {
        if channel != NOTIFY_CHANNEL {
            return Err(SqlError::UnknownChannel(channel));
        }
        return Ok(Some(Command::Listen { channel }));
    }
    if keyword.eq_ignore_ascii_case("UNLISTEN") {
        let channel = (channel != "*").then_some(channel);
        return Ok(Some(Command::Unlisten { channel }));
    }
    Ok(None)
}

// ── Tables ────────────────────────────────────────────────────

/// Writable tables and their positional column order when an INSERT omits
/// the column list.
fn insert_columns(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    Some(match table {
        "bookings" => (
            "bookings",
            &["id", "tour_id", "start_date", "adults", "children", "guide_id", "full_name", "email", "phone", "note"],
        ),
        "booking_decisions" => ("booking_decisions", &["booking_id", "accept"]),
        "booking_assignments" => ("booking_assignments", &["booking_id", "guide_id"]),
        "payments" => ("payments", &["booking_id", "reference"]),
        "completions" => ("completions", &["booking_id"]),
        "refunds" => ("refunds", &["booking_id"]),
        "proposals" => ("proposals", &["id", "body"]),
        "proposal_reviews" => ("proposal_reviews", &["proposal_id", "decision", "notes"]),
        "busy_markers" => ("busy_markers", &["id", "guide_id", "start_date", "end_date", "note"]),
        "locations" => ("locations", &["id", "name"]),
        "categories" => ("categories", &["id", "name"]),
        _ => return None,
    })
}

fn catalog_kind(table: &str) -> Option<CatalogKind> {
    match table {
        "locations" => Some(CatalogKind::Location),
        "categories" => Some(CatalogKind::Category),
        _ => None,
    }
}

/// One INSERT row, values keyed by column name.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn new(table: &'static str, known: &[&str], columns: &[String], exprs: &'a [Expr]) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            known.iter().take(exprs.len()).map(|c| c.to_string()).collect()
        } else {
            columns.to_vec()
        };
        if names.len() != exprs.len() || exprs.len() > known.len() {
            return Err(SqlError::WrongArity(table, names.len().max(known.len()), exprs.len()));
        }
        let mut values = HashMap::with_capacity(names.len());
        for (name, expr) in names.into_iter().zip(exprs) {
            if !known.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn { table, column: name });
            }
            values.insert(name, expr);
        }
        Ok(Self { table, values })
    }

    /// The column's value, `None` when absent or NULL.
    fn get(&self, column: &'static str) -> Option<&'a Expr> {
        self.values
            .get(column)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(column, self.required(column)?)
    }

    fn opt_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(|e| parse_ulid(column, e)).transpose()
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_text(column, self.required(column)?)
    }

    fn opt_text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.get(column).map(|e| parse_text(column, e)).transpose()
    }

    fn date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(column, self.required(column)?)
    }

    fn u32_or(&self, column: &'static str, default: u32) -> Result<u32, SqlError> {
        self.get(column).map_or(Ok(default), |e| parse_u32(column, e))
    }

    fn bool(&self, column: &'static str) -> Result<bool, SqlError> {
        parse_bool(column, self.required(column)?)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let (table, known) = insert_columns(&name).ok_or(SqlError::UnknownTable(name))?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let exprs = single_values_row(insert)?;
    let row = Row::new(table, known, &columns, exprs)?;

    match table {
        "bookings" => Ok(Command::CreateBooking(NewBooking {
            id: row.ulid("id")?,
            tour_id: row.ulid("tour_id")?,
            start_date: row.date("start_date")?,
            adults: row.u32_or("adults", 1)?,
            children: row.u32_or("children", 0)?,
            guide_id: row.opt_ulid("guide_id")?,
            contact: Contact {
                full_name: row.text("full_name")?,
                email: row.text("email")?,
                phone: row.text("phone")?,
                note: row.opt_text("note")?,
            },
        })),
        "booking_decisions" => Ok(Command::DecideBooking {
            booking_id: row.ulid("booking_id")?,
            accept: row.bool("accept")?,
        }),
        "booking_assignments" => Ok(Command::AssignGuide {
            booking_id: row.ulid("booking_id")?,
            guide_id: row.ulid("guide_id")?,
        }),
        "payments" => Ok(Command::ConfirmPayment {
            booking_id: row.ulid("booking_id")?,
            reference: row.text("reference")?,
        }),
        "completions" => Ok(Command::CompleteBooking {
            booking_id: row.ulid("booking_id")?,
        }),
        "refunds" => Ok(Command::RecordRefund {
            booking_id: row.ulid("booking_id")?,
        }),
        "proposals" => Ok(Command::SubmitProposal {
            id: row.ulid("id")?,
            body: row.text("body")?,
        }),
        "proposal_reviews" => {
            let decision = row.text("decision")?;
            let approve = match decision.to_lowercase().as_str() {
                "approve" | "approved" => true,
                "reject" | "rejected" => false,
                _ => {
                    return Err(SqlError::BadValue {
                        column: "decision",
                        reason: format!("expected 'approve' or 'reject', got '{decision}'"),
                    });
                }
            };
            Ok(Command::ReviewProposal {
                proposal_id: row.ulid("proposal_id")?,
                approve,
                notes: row.opt_text("notes")?,
            })
        }
        "busy_markers" => {
            let start_date = row.date("start_date")?;
            let end_date = match row.get("end_date") {
                Some(e) => parse_date("end_date", e)?,
                None => start_date,
            };
            Ok(Command::AddBusyMarker {
                id: row.ulid("id")?,
                guide_id: row.ulid("guide_id")?,
                start_date,
                end_date,
                note: row.opt_text("note")?,
            })
        }
        _ => match catalog_kind(table) {
            Some(kind) => Ok(Command::RegisterCatalogEntry {
                kind,
                id: row.ulid("id")?,
                name: row.text("name")?,
            }),
            None => Err(SqlError::UnknownTable(table.to_string())),
        },
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;
    let id = match filters.get("id") {
        Some(expr) => parse_ulid("id", expr)?,
        None => return Err(SqlError::MissingFilter("id")),
    };
    if let Some(column) = filters.keys().find(|c| c.as_str() != "id") {
        return Err(SqlError::UnsupportedFilter(column.clone()));
    }

    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking { id }),
        "busy_markers" => Ok(Command::RemoveBusyMarker { id }),
        other => match catalog_kind(other) {
            Some(kind) => Ok(Command::RemoveCatalogEntry { kind, id }),
            None => Err(SqlError::UnknownTable(table)),
        },
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let filters = collect_filters(select.selection.as_ref())?;

    let allowed: &[&str] = match table.as_str() {
        "capacity" => &["tour_id", "date"],
        "bookings" => &["tour_id", "id"],
        "proposals" => &["status"],
        "checkout" => &["booking_id"],
        "busy_markers" => &["guide_id"],
        "tours" | "locations" | "categories" => &[],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    if let Some(column) = filters.keys().find(|c| !allowed.contains(&c.as_str())) {
        return Err(SqlError::UnsupportedFilter(column.clone()));
    }
    let ulid_filter = |column: &'static str| -> Result<Option<Ulid>, SqlError> {
        filters.get(column).map(|e| parse_ulid(column, e)).transpose()
    };

    match table.as_str() {
        "capacity" => Ok(Command::SelectCapacity {
            tour_id: ulid_filter("tour_id")?.ok_or(SqlError::MissingFilter("tour_id"))?,
            date: match filters.get("date") {
                Some(e) => parse_date("date", e)?,
                None => return Err(SqlError::MissingFilter("date")),
            },
        }),
        "bookings" => Ok(Command::SelectBookings(BookingFilter {
            tour_id: ulid_filter("tour_id")?,
            booking_id: ulid_filter("id")?,
        })),
        "proposals" => {
            let status = match filters.get("status") {
                Some(e) => {
                    let s = parse_text("status", e)?;
                    Some(ProposalStatus::parse(&s.to_lowercase()).ok_or(SqlError::BadValue {
                        column: "status",
                        reason: format!("unknown proposal status '{s}'"),
                    })?)
                }
                None => None,
            };
            Ok(Command::SelectProposals { status })
        }
        "checkout" => Ok(Command::SelectCheckout {
            booking_id: ulid_filter("booking_id")?.ok_or(SqlError::MissingFilter("booking_id"))?,
        }),
        "busy_markers" => Ok(Command::SelectBusyMarkers {
            guide_id: ulid_filter("guide_id")?,
        }),
        "tours" => Ok(Command::SelectTours),
        other => match catalog_kind(other) {
            Some(kind) => Ok(Command::SelectCatalog(kind)),
            None => Err(SqlError::UnknownTable(table)),
        },
    }
}

/// `col = value [AND col = value ...]` into a column map. Anything else in
/// a WHERE clause is rejected.
fn collect_filters(selection: Option<&Expr>) -> Result<HashMap<String, &Expr>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(column, right);
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
        }
    }
    let mut out = HashMap::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
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
    match tables_with_joins.first() {
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

fn single_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
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

fn bad(column: &'static str, reason: impl Into<String>) -> SqlError {
    SqlError::BadValue { column, reason: reason.into() }
}

/// String-ish literal: quoted, dollar-quoted or a bare number.
fn literal_text<'a>(column: &'static str, expr: &'a Expr) -> Result<&'a str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s))
        | Some(Value::EscapedStringLiteral(s))
        | Some(Value::Number(s, _)) => Ok(s),
        Some(Value::DollarQuotedString(d)) => Ok(&d.value),
        Some(other) => Err(bad(column, format!("expected a literal, got {other}"))),
        None => Err(bad(column, format!("expected a literal, got {expr}"))),
    }
}

fn parse_text(column: &'static str, expr: &Expr) -> Result<String, SqlError> {
    literal_text(column, expr).map(str::to_string)
}

fn parse_ulid(column: &'static str, expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(column, expr)?;
    Ulid::from_string(s).map_err(|e| bad(column, format!("bad ULID: {e}")))
}

fn parse_date(column: &'static str, expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(column, expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| bad(column, format!("bad date '{s}': {e}")))
}

fn parse_u32(column: &'static str, expr: &Expr) -> Result<u32, SqlError> {
    let s = literal_text(column, expr)?;
    s.trim()
        .parse()
        .map_err(|_| bad(column, format!("expected a non-negative integer, got '{s}'")))
}

fn parse_bool(column: &'static str, expr: &Expr) -> Result<bool, SqlError> {
    if let Some(Value::Boolean(b)) = extract_value(expr) {
        return Ok(*b);
    }
    let s = literal_text(column, expr)?;
    match s.to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Ok(true),
        "false" | "f" | "0" | "no" => Ok(false),
        _ => Err(bad(column, format!("bad bool: {s}"))),
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
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{0}: expected at most {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("unsupported filter column: {0}")]
    UnsupportedFilter(String),
    #[error("bad value for {column}: {reason}")]
    BadValue { column: &'static str, reason: String },
    #[error("unknown channel {0}; LISTEN tourdesk")]
    UnknownChannel(String),
}

use sqlparser::ast::{
    self, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, ObjectNamePart, SelectItem,
    SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `(start, end)` pairs, unvalidated.
    InsertIntervals {
        spans: Vec<(Ms, Ms)>,
    },
    /// `after` is the `start > N` filter; without it the server clock is used.
    SelectIntervals {
        after: Option<Ms>,
    },
    AcquireHold {
        slot_id: Ulid,
    },
    ExtendHold {
        slot_id: Ulid,
        token: String,
    },
    ReleaseHold {
        slot_id: Ulid,
        token: String,
    },
    MarkBooked {
        start: Ms,
        end: Ms,
        reference: String,
        /// Required when the slot is under a live hold.
        hold_token: Option<String>,
    },
    CheckOrInsertFulfillment {
        reference: String,
        metadata: String,
        initial_status: bool,
    },
    InsertFulfillment {
        reference: String,
        metadata: String,
        status: bool,
    },
    SelectFulfillments {
        is_fulfilled: Option<bool>,
    },
}

/// Row layout a statement will produce, guessed from its text alone so the
/// extended protocol can describe statements before parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Intervals,
    Fulfillments,
    /// One nullable text column named after the function.
    Token(&'static str),
    /// One boolean column named after the function.
    Flag(&'static str),
    NoRows,
}

const FLAG_FUNCTIONS: [&str; 5] = [
    "extend_hold",
    "release_hold",
    "mark_booked",
    "check_or_insert_fulfillment",
    "insert_fulfillment",
];

pub fn result_shape(sql: &str) -> ResultShape {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return ResultShape::NoRows;
    }
    if lower.contains("acquire_hold") {
        return ResultShape::Token("acquire_hold");
    }
    if let Some(name) = FLAG_FUNCTIONS.iter().find(|f| lower.contains(*f)) {
        return ResultShape::Flag(*name);
    }
    if lower.contains("fulfillments") {
        ResultShape::Fulfillments
    } else if lower.contains("intervals") {
        ResultShape::Intervals
    } else {
        ResultShape::NoRows
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "intervals" {
        return Err(SqlError::UnknownTable(table));
    }

    // Column list picks the order; none means (start, "end").
    let (start_idx, end_idx) = if insert.columns.is_empty() {
        (0, 1)
    } else {
        let position = |name: &str| {
            insert
                .columns
                .iter()
                .position(|c| c.value.eq_ignore_ascii_case(name))
        };
        (
            position("start").ok_or(SqlError::MissingColumn("start"))?,
            position("end").ok_or(SqlError::MissingColumn("end"))?,
        )
    };
    let width = start_idx.max(end_idx) + 1;

    let rows = extract_insert_rows(insert)?;
    let mut spans = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if row.len() < width {
            return Err(SqlError::WrongArity("intervals", width, row.len()));
        }
        let start = parse_i64_expr(&row[start_idx])
            .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
        let end = parse_i64_expr(&row[end_idx])
            .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
        spans.push((start, end));
    }
    Ok(Command::InsertIntervals { spans })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return parse_function_call(&select.projection);
    };
    let table = table_factor_name(&from.relation)?;
    match table.as_str() {
        "intervals" => {
            let after = match &select.selection {
                None => None,
                Some(expr) => Some(extract_start_after(expr)?),
            };
            Ok(Command::SelectIntervals { after })
        }
        "fulfillments" => {
            let is_fulfilled = match &select.selection {
                None => None,
                Some(expr) => Some(extract_is_fulfilled(expr)?),
            };
            Ok(Command::SelectFulfillments { is_fulfilled })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `SELECT fn(args...)` with no FROM clause.
fn parse_function_call(projection: &[SelectItem]) -> Result<Command, SqlError> {
    let expr = match projection.first() {
        Some(SelectItem::UnnamedExpr(expr)) | Some(SelectItem::ExprWithAlias { expr, .. }) => expr,
        _ => return Err(SqlError::Unsupported("expected a function call".into())),
    };
    let Expr::Function(func) = expr else {
        return Err(SqlError::Unsupported("expected a function call".into()));
    };
    let name = object_name_last(&func.name)
        .ok_or_else(|| SqlError::Parse("empty function name".into()))?;
    let args = function_args(&func.args)?;
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(SqlError::WrongArity("function", n, args.len()))
        }
    };

    match name.as_str() {
        "acquire_hold" => {
            arity(1)?;
            Ok(Command::AcquireHold {
                slot_id: parse_ulid_expr(args[0])?,
            })
        }
        "extend_hold" => {
            arity(2)?;
            Ok(Command::ExtendHold {
                slot_id: parse_ulid_expr(args[0])?,
                token: parse_string_expr(args[1])?,
            })
        }
        "release_hold" => {
            arity(2)?;
            Ok(Command::ReleaseHold {
                slot_id: parse_ulid_expr(args[0])?,
                token: parse_string_expr(args[1])?,
            })
        }
        "mark_booked" => {
            if args.len() != 4 {
                arity(3)?;
            }
            Ok(Command::MarkBooked {
                start: parse_i64_expr(args[0])?,
                end: parse_i64_expr(args[1])?,
                reference: parse_string_expr(args[2])?,
                hold_token: args.get(3).map(|e| parse_string_expr(e)).transpose()?,
            })
        }
        "check_or_insert_fulfillment" => {
            if args.len() != 2 {
                arity(3)?;
            }
            Ok(Command::CheckOrInsertFulfillment {
                reference: parse_string_expr(args[0])?,
                metadata: parse_string_expr(args[1])?,
                initial_status: match args.get(2) {
                    Some(e) => parse_bool(e)?,
                    None => false,
                },
            })
        }
        "insert_fulfillment" => {
            arity(3)?;
            Ok(Command::InsertFulfillment {
                reference: parse_string_expr(args[0])?,
                metadata: parse_string_expr(args[1])?,
                status: parse_bool(args[2])?,
            })
        }
        _ => Err(SqlError::UnknownFunction(name)),
    }
}

fn function_args(args: &FunctionArguments) -> Result<Vec<&Expr>, SqlError> {
    match args {
        FunctionArguments::None => Ok(Vec::new()),
        FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Ok(e),
                _ => Err(SqlError::Unsupported("named or wildcard argument".into())),
            })
            .collect(),
        FunctionArguments::Subquery(_) => Err(SqlError::Unsupported("subquery argument".into())),
    }
}

fn extract_start_after(expr: &Expr) -> Result<Ms, SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Gt,
            right,
        } if expr_column_name(left).as_deref() == Some("start") => parse_i64_expr(right),
        Expr::Nested(inner) => extract_start_after(inner),
        _ => Err(SqlError::Unsupported(
            "intervals filter must be `start > <ms>`".into(),
        )),
    }
}

fn extract_is_fulfilled(expr: &Expr) -> Result<bool, SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("is_fulfilled") => parse_bool(right),
        Expr::Nested(inner) => extract_is_fulfilled(inner),
        _ => Err(SqlError::Unsupported(
            "fulfillments filter must be `is_fulfilled = <bool>`".into(),
        )),
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

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Literal value, looking through `::type` casts.
fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        Expr::Cast { expr, .. } => extract_value(expr),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::EscapedStringLiteral(s)) => Ok(s.clone()),
        Some(Value::DollarQuotedString(d)) => Ok(d.value.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
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

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownFunction(String),
    MissingColumn(&'static str),
    WrongArity(&'static str, usize, usize),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownFunction(name) => write!(f, "unknown function: {name}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::WrongArity(what, expected, got) => {
                write!(f, "{what}: expected {expected} values, got {got}")
            }
        }
    }
}

impl std::error::Error for SqlError {}

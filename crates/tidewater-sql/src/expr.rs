//! Expression trees
//!
//! Projections, predicates and key expressions are trees of literals, path
//! references, record metadata, function calls and binary operators.
//!
//! ## Null handling
//!
//! Nulls propagate: arithmetic, comparison and concatenation with a null operand
//! yield null. `AND`/`OR` follow three-valued logic (`false AND null` is false,
//! `true OR null` is true). Only genuinely incompatible operands, such as
//! comparing text with a number or concatenating a struct, raise
//! `EvaluationError`.
//!
//! ## Configuration form
//!
//! Expressions deserialize from externally tagged maps:
//!
//! ```toml
//! expr = { binary = { op = "gt", left = { path = "reading.value" }, right = { literal = 0.5 } } }
//! ```

use crate::error::SqlError;
use crate::functions::Function;
use crate::path::FieldPath;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tidewater_catalog::{Field, FieldType, Schema};
use tidewater_core::Value;

/// Record metadata addressable from expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaColumn {
    /// Event time of the input record
    Rowtime,
    /// Key of the input record, as text
    Rowkey,
    Rowpartition,
    Rowoffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Concat,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Concat => "||",
        }
    }

    fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }
}

/// One input record as seen by an expression
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub value: &'a Value,
    pub timestamp: i64,
    pub key: Option<&'a [u8]>,
    pub partition: u32,
    pub offset: u64,
}

impl<'a> RowContext<'a> {
    /// Context with no metadata, for evaluating against a bare value
    pub fn of(value: &'a Value) -> Self {
        Self {
            value,
            timestamp: 0,
            key: None,
            partition: 0,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Literal(Value),
    Path(FieldPath),
    Meta(MetaColumn),
    Call {
        function: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull(Box<Expr>),
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Path reference parsed from text
    pub fn path(text: &str) -> Result<Self> {
        FieldPath::parse(text).map(Expr::Path)
    }

    pub fn call(function: &str, args: Vec<Expr>) -> Self {
        Expr::Call {
            function: function.to_string(),
            args,
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Check every function exists and is called with its arity
    pub fn validate(&self) -> Result<()> {
        match self {
            Expr::Literal(_) | Expr::Path(_) | Expr::Meta(_) => Ok(()),
            Expr::Call { function, args } => {
                Function::lookup(function)?.check_arity(args.len())?;
                args.iter().try_for_each(Expr::validate)
            }
            Expr::Binary { left, right, .. } => {
                left.validate()?;
                right.validate()
            }
            Expr::Not(inner) | Expr::IsNull(inner) => inner.validate(),
        }
    }

    /// Evaluate against one record
    pub fn evaluate(&self, row: &RowContext<'_>) -> Result<Value> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(path) => Ok(path.resolve(row.value).clone()),
            Expr::Meta(column) => Ok(match column {
                MetaColumn::Rowtime => Value::Int(row.timestamp),
                MetaColumn::Rowkey => row
                    .key
                    .map(|k| Value::Text(String::from_utf8_lossy(k).into_owned()))
                    .unwrap_or(Value::Null),
                MetaColumn::Rowpartition => Value::Int(row.partition as i64),
                MetaColumn::Rowoffset => Value::Int(row.offset as i64),
            }),
            Expr::Call { function, args } => {
                let function = Function::lookup(function)?;
                let values = args
                    .iter()
                    .map(|arg| arg.evaluate(row))
                    .collect::<Result<Vec<_>>>()?;
                function.invoke(&values)
            }
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = truth(left.evaluate(row)?, op.symbol())?;
                    if l == Some(false) {
                        return Ok(Value::Bool(false));
                    }
                    let r = truth(right.evaluate(row)?, op.symbol())?;
                    Ok(match (l, r) {
                        (_, Some(false)) => Value::Bool(false),
                        (Some(true), Some(true)) => Value::Bool(true),
                        _ => Value::Null,
                    })
                }
                BinaryOp::Or => {
                    let l = truth(left.evaluate(row)?, op.symbol())?;
                    if l == Some(true) {
                        return Ok(Value::Bool(true));
                    }
                    let r = truth(right.evaluate(row)?, op.symbol())?;
                    Ok(match (l, r) {
                        (_, Some(true)) => Value::Bool(true),
                        (Some(false), Some(false)) => Value::Bool(false),
                        _ => Value::Null,
                    })
                }
                _ => apply(*op, left.evaluate(row)?, right.evaluate(row)?),
            },
            Expr::Not(inner) => Ok(match truth(inner.evaluate(row)?, "NOT")? {
                Some(b) => Value::Bool(!b),
                None => Value::Null,
            }),
            Expr::IsNull(inner) => Ok(Value::Bool(inner.evaluate(row)?.is_null())),
        }
    }

    /// Static type of the expression's result over records of `schema`.
    ///
    /// `None` when the schema does not pin the type: a path that leaves the
    /// schema or a null literal always evaluates to null, and arithmetic over
    /// such an operand does too.
    pub fn output_type(&self, schema: &Schema) -> Option<FieldType> {
        match self {
            Expr::Literal(Value::Null) => None,
            Expr::Literal(value) => Some(literal_type(value)),
            Expr::Path(path) => path.resolve_type(schema),
            Expr::Meta(MetaColumn::Rowkey) => Some(FieldType::Text),
            Expr::Meta(_) => Some(FieldType::Integer),
            Expr::Call { function, .. } => Function::lookup(function).ok().map(|f| f.return_type()),
            Expr::Binary { op, left, right } => match op {
                op if op.is_comparison() => Some(FieldType::Boolean),
                BinaryOp::And | BinaryOp::Or => Some(FieldType::Boolean),
                BinaryOp::Concat => Some(FieldType::Text),
                _ => match (left.output_type(schema)?, right.output_type(schema)?) {
                    (FieldType::Integer, FieldType::Integer) => Some(FieldType::Integer),
                    _ => Some(FieldType::Double),
                },
            },
            Expr::Not(_) | Expr::IsNull(_) => Some(FieldType::Boolean),
        }
    }

    /// Output column name when a projection gives none
    pub fn default_name(&self) -> Option<String> {
        match self {
            Expr::Path(path) => path.leaf_name().map(str::to_string),
            Expr::Meta(column) => Some(
                match column {
                    MetaColumn::Rowtime => "ROWTIME",
                    MetaColumn::Rowkey => "ROWKEY",
                    MetaColumn::Rowpartition => "ROWPARTITION",
                    MetaColumn::Rowoffset => "ROWOFFSET",
                }
                .to_string(),
            ),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::Text(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Path(path) => write!(f, "{path}"),
            Expr::Meta(column) => write!(f, "{}", format!("{column:?}").to_uppercase()),
            Expr::Call { function, args } => {
                write!(f, "{}(", function.to_uppercase())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Not(inner) => write!(f, "NOT {inner}"),
            Expr::IsNull(inner) => write!(f, "{inner} IS NULL"),
        }
    }
}

fn literal_type(value: &Value) -> FieldType {
    match value {
        Value::Null | Value::Text(_) => FieldType::Text,
        Value::Bool(_) => FieldType::Boolean,
        Value::Int(_) => FieldType::Integer,
        Value::Double(_) => FieldType::Double,
        Value::Struct(fields) => FieldType::Struct {
            fields: fields
                .iter()
                .map(|(name, v)| Field::new(name.clone(), literal_type(v)))
                .collect(),
        },
        Value::Seq(items) => {
            FieldType::array_of(items.first().map(literal_type).unwrap_or(FieldType::Text))
        }
    }
}

fn truth(value: Value, operator: &str) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b)),
        other => Err(SqlError::EvaluationError(format!(
            "{operator} expects boolean operands, got {}",
            other.type_name()
        ))),
    }
}

fn incompatible(op: BinaryOp, left: &Value, right: &Value) -> SqlError {
    SqlError::EvaluationError(format!(
        "cannot apply {} to {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Ordering> {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
            let (a, b) = (left.as_f64(), right.as_f64());
            a.zip(b).and_then(|(a, b)| a.partial_cmp(&b))
        }
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => return Err(incompatible(op, left, right)),
    };
    // NaN compares unequal to everything
    ordering.ok_or_else(|| SqlError::EvaluationError("cannot compare NaN".to_string()))
}

fn apply(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        if left.is_structured() || right.is_structured() {
            return Err(incompatible(op, &left, &right));
        }
        return Ok(Value::Null);
    }

    if op.is_comparison() {
        let ord = compare(op, &left, &right)?;
        let result = match op {
            BinaryOp::Eq => ord == Ordering::Equal,
            BinaryOp::NotEq => ord != Ordering::Equal,
            BinaryOp::Lt => ord == Ordering::Less,
            BinaryOp::LtEq => ord != Ordering::Greater,
            BinaryOp::Gt => ord == Ordering::Greater,
            _ => ord != Ordering::Less,
        };
        return Ok(Value::Bool(result));
    }

    if op == BinaryOp::Concat {
        if left.is_structured() || right.is_structured() {
            return Err(incompatible(op, &left, &right));
        }
        return Ok(Value::Text(format!("{left}{right}")));
    }

    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                BinaryOp::Plus => a.checked_add(b),
                BinaryOp::Minus => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                BinaryOp::Divide | BinaryOp::Modulo if b == 0 => return Ok(Value::Null),
                BinaryOp::Divide => a.checked_div(b),
                _ => a.checked_rem(b),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| SqlError::EvaluationError(format!("integer overflow in {}", op.symbol())))
        }
        (Value::Int(_) | Value::Double(_), Value::Int(_) | Value::Double(_)) => {
            let (a, b) = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(incompatible(op, &left, &right)),
            };
            Ok(Value::Double(match op {
                BinaryOp::Plus => a + b,
                BinaryOp::Minus => a - b,
                BinaryOp::Multiply => a * b,
                BinaryOp::Divide => a / b,
                _ => a % b,
            }))
        }
        _ => Err(incompatible(op, &left, &right)),
    }
}

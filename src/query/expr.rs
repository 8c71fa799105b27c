//! SQL expression AST.
//!
//! A closed tagged union with exhaustive-match rendering; every variant
//! carries only its own fields. The compiler enforces that `render`
//! handles every kind.

use serde::{Deserialize, Serialize};

use super::{Query, QueryResult};
use crate::algebra::{FromClause, Path};
use crate::model::Schema;
use crate::value::Value;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    And,
    Or,
    Plus,
    Minus,
    Mul,
    Div,
    Concat,
    Like,
}

impl BinaryOp {
    fn sql(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Lte => "<=",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Concat => "||",
            BinaryOp::Like => "LIKE",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    IsNull,
    IsNotNull,
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Max,
    Min,
    Avg,
}

impl AggFunc {
    fn sql(&self) -> &'static str {
        match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Max => "MAX",
            AggFunc::Min => "MIN",
            AggFunc::Avg => "AVG",
        }
    }
}

/// A SQL expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// An attribute reached through a path.
    Attr(Path),

    /// Literal value.
    Literal(Value),

    /// Unary operation.
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// Binary operation.
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// N-ary function call.
    Func { name: String, args: Vec<Expr> },

    /// Aggregate over an expression.
    Aggregate {
        func: AggFunc,
        expr: Box<Expr>,
        distinct: bool,
    },

    /// Row identity for a basis entity: the primary key combined with the
    /// query's content hash, giving downstream transforms a stable handle
    /// even when joins fan rows out.
    Identity { entity: String },

    /// Correlated-free scalar subquery.
    Subquery(Box<Query>),
}

/// Shared state threaded through rendering.
pub(crate) struct RenderCtx<'a> {
    pub schema: &'a Schema,
    pub from: &'a mut FromClause,
    /// Content hash of the enclosing query, baked into identity values.
    pub query_hash: &'a str,
    /// Inside GROUP BY the identity expression is rewritten to the bare
    /// primary key, since the hash is functionally determined by it.
    pub identity_as_pk: bool,
}

impl Expr {
    pub(crate) fn render(&self, ctx: &mut RenderCtx<'_>) -> QueryResult<String> {
        match self {
            Expr::Attr(path) => {
                let (alias, column) = path.column(ctx.schema, ctx.from)?;
                Ok(format!("{}.{}", alias, column))
            }
            Expr::Literal(value) => Ok(value.sql_literal()),
            Expr::Unary { op, expr } => {
                let inner = expr.render(ctx)?;
                Ok(match op {
                    UnaryOp::Not => format!("NOT ({})", inner),
                    UnaryOp::Neg => format!("-({})", inner),
                    UnaryOp::IsNull => format!("({}) IS NULL", inner),
                    UnaryOp::IsNotNull => format!("({}) IS NOT NULL", inner),
                })
            }
            Expr::Binary { left, op, right } => {
                let l = left.render(ctx)?;
                let r = right.render(ctx)?;
                Ok(format!("({} {} {})", l, op.sql(), r))
            }
            Expr::Func { name, args } => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|a| a.render(ctx))
                    .collect::<QueryResult<_>>()?;
                Ok(format!("{}({})", name, rendered.join(", ")))
            }
            Expr::Aggregate {
                func,
                expr,
                distinct,
            } => {
                let inner = expr.render(ctx)?;
                if *distinct {
                    Ok(format!("{}(DISTINCT {})", func.sql(), inner))
                } else {
                    Ok(format!("{}({})", func.sql(), inner))
                }
            }
            Expr::Identity { entity } => {
                let pk = ctx.schema.entity(entity)?.pk_column().to_string();
                ctx.from.basis(entity);
                if ctx.identity_as_pk {
                    Ok(format!("{}.{}", entity, pk))
                } else {
                    let tag: String = ctx.query_hash.chars().take(8).collect();
                    Ok(format!("({}.{} || ':{}')", entity, pk, tag))
                }
            }
            Expr::Subquery(query) => {
                let compiled = query.compile(ctx.schema)?;
                Ok(format!("({})", compiled.sql))
            }
        }
    }

    /// True when the expression aggregates (not looking into subqueries).
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Attr(_) | Expr::Literal(_) | Expr::Identity { .. } | Expr::Subquery(_) => false,
            Expr::Unary { expr, .. } => expr.is_aggregate(),
            Expr::Binary { left, right, .. } => left.is_aggregate() || right.is_aggregate(),
            Expr::Func { args, .. } => args.iter().any(Expr::is_aggregate),
        }
    }

    /// Collect every attribute path mentioned in the expression tree.
    pub fn collect_paths(&self, out: &mut Vec<Path>) {
        match self {
            Expr::Attr(path) => out.push(path.clone()),
            Expr::Literal(_) | Expr::Identity { .. } | Expr::Subquery(_) => {}
            Expr::Unary { expr, .. } => expr.collect_paths(out),
            Expr::Binary { left, right, .. } => {
                left.collect_paths(out);
                right.collect_paths(out);
            }
            Expr::Func { args, .. } => {
                for arg in args {
                    arg.collect_paths(out);
                }
            }
            Expr::Aggregate { expr, .. } => expr.collect_paths(out),
        }
    }

    /// Collect the scalar subqueries nested in the expression tree, one
    /// level down. They compile their own FROM, but footprint inference
    /// still has to see what they read.
    pub fn collect_subqueries<'a>(&'a self, out: &mut Vec<&'a Query>) {
        match self {
            Expr::Subquery(query) => out.push(query),
            Expr::Attr(_) | Expr::Literal(_) | Expr::Identity { .. } => {}
            Expr::Unary { expr, .. } => expr.collect_subqueries(out),
            Expr::Binary { left, right, .. } => {
                left.collect_subqueries(out);
                right.collect_subqueries(out);
            }
            Expr::Func { args, .. } => {
                for arg in args {
                    arg.collect_subqueries(out);
                }
            }
            Expr::Aggregate { expr, .. } => expr.collect_subqueries(out),
        }
    }

    // Combinator-style constructors.

    pub fn eq(self, other: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(self),
            op: BinaryOp::Eq,
            right: Box::new(other),
        }
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(self),
            op: BinaryOp::And,
            right: Box::new(other),
        }
    }

    pub fn gt(self, other: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(self),
            op: BinaryOp::Gt,
            right: Box::new(other),
        }
    }
}

/// Attribute path expression.
pub fn col(path: Path) -> Expr {
    Expr::Attr(path)
}

/// Literal expression.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

/// `COUNT(expr)`.
pub fn count(expr: Expr) -> Expr {
    Expr::Aggregate {
        func: AggFunc::Count,
        expr: Box::new(expr),
        distinct: false,
    }
}

/// `SUM(expr)`.
pub fn sum(expr: Expr) -> Expr {
    Expr::Aggregate {
        func: AggFunc::Sum,
        expr: Box::new(expr),
        distinct: false,
    }
}

/// `MAX(expr)`.
pub fn max(expr: Expr) -> Expr {
    Expr::Aggregate {
        func: AggFunc::Max,
        expr: Box::new(expr),
        distinct: false,
    }
}

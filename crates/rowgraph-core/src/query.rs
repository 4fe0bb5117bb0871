//! Row-level query model handed to a [`QueryExecutor`](crate::QueryExecutor).
//!
//! Queries here are already translated to tables and columns. The executor
//! owns SQL generation; this module only describes which rows to return.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::relationship::JoinStep;
use crate::value::Value;

/// Prefix under which rows returned for a [`Qualifier::Related`] query carry
/// the echoed anchor columns, e.g. `$anchor.ARTIST_ID`.
pub const ANCHOR_PREFIX: &str = "$anchor.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub const fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Row filter over the columns of the queried table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Qualifier {
    /// Every row.
    All,
    /// `column <op> value`; comparisons with NULL are never true.
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    IsNull(String),
    NotNull(String),
    /// Row's `columns` tuple is one of `tuples`.
    In {
        columns: Vec<String>,
        tuples: Vec<Vec<Value>>,
    },
    /// Rows reachable through `path` from a row of the path's final table
    /// that satisfies `anchor`. Each (row, anchor row) pair is returned once,
    /// with the anchor row's `echo` columns copied under [`ANCHOR_PREFIX`].
    Related {
        path: Vec<JoinStep>,
        anchor: Box<Qualifier>,
        echo: Vec<String>,
    },
    And(Vec<Qualifier>),
    Or(Vec<Qualifier>),
    Not(Box<Qualifier>),
}

impl Qualifier {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Qualifier::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Conjunction that drops `All` terms and flattens nested `And`s.
    #[must_use]
    pub fn and(self, other: Qualifier) -> Qualifier {
        let mut terms = Vec::new();
        for q in [self, other] {
            match q {
                Qualifier::All => {}
                Qualifier::And(inner) => terms.extend(inner),
                q => terms.push(q),
            }
        }
        match terms.len() {
            0 => Qualifier::All,
            1 => terms.pop().unwrap_or(Qualifier::All),
            _ => Qualifier::And(terms),
        }
    }

    /// Match on several columns at once; NULL values become `IS NULL`.
    pub fn matching<'a, I>(pairs: I) -> Qualifier
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        pairs.into_iter().fold(Qualifier::All, |acc, (column, value)| {
            let term = if value.is_null() {
                Qualifier::IsNull(column.clone())
            } else {
                Qualifier::eq(column.clone(), value.clone())
            };
            acc.and(term)
        })
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qualifier::All => write!(f, "TRUE"),
            Qualifier::Compare { column, op, value } => {
                write!(f, "{} {} {}", column, op.as_sql(), value)
            }
            Qualifier::IsNull(c) => write!(f, "{} IS NULL", c),
            Qualifier::NotNull(c) => write!(f, "{} IS NOT NULL", c),
            Qualifier::In { columns, tuples } => {
                write!(f, "({}) IN (", columns.join(", "))?;
                for (i, tuple) in tuples.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    let parts: Vec<String> = tuple.iter().map(ToString::to_string).collect();
                    write!(f, "({})", parts.join(", "))?;
                }
                write!(f, ")")
            }
            Qualifier::Related { path, anchor, .. } => {
                let tables: Vec<&str> = path.iter().map(|s| s.target_table.as_str()).collect();
                write!(f, "EXISTS via {} WHERE {}", tables.join(" -> "), anchor)
            }
            Qualifier::And(terms) => write_joined(f, terms, " AND "),
            Qualifier::Or(terms) => write_joined(f, terms, " OR "),
            Qualifier::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, terms: &[Qualifier], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", term)?;
    }
    write!(f, ")")
}

/// Sort key of a row query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// Outer join carried by a single query for joint prefetching.
///
/// Columns of the joined table are returned as `{prefix}{COLUMN}`; a parent
/// with no match contributes one row whose prefixed columns are all NULL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointJoin {
    /// Prefix of the row this join starts from; empty for the root table.
    pub parent_prefix: String,
    /// Prefix for columns of the joined table, e.g. `paintings.`.
    pub prefix: String,
    /// Path from the parent's table to the joined table.
    pub path: Vec<JoinStep>,
}

/// A translated select against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowQuery {
    pub table: String,
    pub qualifier: Qualifier,
    pub ordering: Vec<OrderBy>,
    /// Maximum number of root rows.
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub joints: Vec<JointJoin>,
    /// Root columns to return; empty for every column.
    pub columns: Vec<String>,
}

impl RowQuery {
    pub fn new(table: impl Into<String>, qualifier: Qualifier) -> Self {
        Self {
            table: table.into(),
            qualifier,
            ordering: Vec::new(),
            limit: None,
            offset: None,
            joints: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Restrict the result to `columns`.
    #[must_use]
    pub fn project<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Display for RowQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.columns.is_empty() {
            write!(f, "SELECT FROM {} WHERE {}", self.table, self.qualifier)?;
        } else {
            write!(
                f,
                "SELECT {} FROM {} WHERE {}",
                self.columns.join(", "),
                self.table,
                self.qualifier
            )?;
        }
        for joint in &self.joints {
            write!(f, " JOIN {}", joint.prefix)?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_and_flattens_and_drops_all() {
        let q = Qualifier::All.and(Qualifier::eq("A", 1));
        assert_eq!(q, Qualifier::eq("A", 1));
        let q = q.and(Qualifier::eq("B", 2)).and(Qualifier::IsNull("C".into()));
        match q {
            Qualifier::And(terms) => assert_eq!(terms.len(), 3),
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn test_matching_uses_is_null_for_nulls() {
        let mut key = BTreeMap::new();
        key.insert("ID".to_string(), Value::BigInt(1));
        key.insert("LOCK".to_string(), Value::Null);
        let q = Qualifier::matching(&key);
        assert_eq!(q.to_string(), "(ID = 1 AND LOCK IS NULL)");
    }

    #[test]
    fn test_row_query_display() {
        let mut q = RowQuery::new("ARTIST", Qualifier::eq("ARTIST_NAME", "x"));
        q.limit = Some(2);
        assert_eq!(q.to_string(), "SELECT FROM ARTIST WHERE ARTIST_NAME = 'x' LIMIT 2");

        let ids = RowQuery::new("ARTIST", Qualifier::All).project(["ARTIST_ID"]);
        assert_eq!(ids.to_string(), "SELECT ARTIST_ID FROM ARTIST WHERE TRUE");
    }
}

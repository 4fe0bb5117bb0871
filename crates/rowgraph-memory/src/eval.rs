//! Qualifier evaluation and join expansion over in-memory tables.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use rowgraph_core::{
    ANCHOR_PREFIX, CompareOp, DataRow, Error, JoinStep, PATH_SEPARATOR, QueryErrorKind, Qualifier,
    Result, RowQuery, Value,
};

pub(crate) type Tables = BTreeMap<String, Vec<DataRow>>;

/// Extra columns a matching row picks up from `Related` anchors.
type Binding = BTreeMap<String, Value>;

/// Run a select against `tables`.
pub(crate) fn select(tables: &Tables, query: &RowQuery) -> Result<Vec<DataRow>> {
    let rows = tables.get(&query.table).ok_or_else(|| {
        Error::query(
            QueryErrorKind::NotFound,
            format!("no such table '{}'", query.table),
        )
    })?;

    let mut matched: Vec<Binding> = Vec::new();
    for row in rows {
        for binding in bindings(tables, row, &query.qualifier) {
            let mut values = row.values().clone();
            values.extend(binding);
            matched.push(values);
        }
    }

    if !query.ordering.is_empty() {
        matched.sort_by(|a, b| {
            for key in &query.ordering {
                let left = a.get(&key.column).unwrap_or(&Value::Null);
                let right = b.get(&key.column).unwrap_or(&Value::Null);
                let ord = left.compare(right).unwrap_or(Ordering::Equal);
                let ord = if key.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(usize::MAX);
    let mut combined: Vec<Binding> = matched.into_iter().skip(offset).take(limit).collect();

    let mut prefixes: HashSet<&str> = HashSet::new();
    prefixes.insert("");
    for joint in &query.joints {
        if !prefixes.contains(joint.parent_prefix.as_str()) {
            return Err(Error::query(
                QueryErrorKind::Database,
                format!("joint '{}' references unknown prefix '{}'", joint.prefix, joint.parent_prefix),
            ));
        }
        let Some(target_table) = joint.path.last().map(|s| s.target_table.as_str()) else {
            continue;
        };
        let columns = table_columns(tables, target_table);

        let mut expanded = Vec::with_capacity(combined.len());
        for values in combined {
            let parent = level_columns(&values, &joint.parent_prefix);
            let targets = walk(tables, parent, &joint.path);
            if targets.is_empty() {
                let mut row = values;
                for column in &columns {
                    row.insert(format!("{}{}", joint.prefix, column), Value::Null);
                }
                expanded.push(row);
            } else {
                for target in targets {
                    let mut row = values.clone();
                    for (column, value) in target.iter() {
                        row.insert(format!("{}{}", joint.prefix, column), value.clone());
                    }
                    expanded.push(row);
                }
            }
        }
        combined = expanded;
        prefixes.insert(joint.prefix.as_str());
    }

    if !query.columns.is_empty() {
        for values in &mut combined {
            values.retain(|column, _| {
                column.contains(PATH_SEPARATOR) || query.columns.iter().any(|c| c == column)
            });
        }
    }

    Ok(combined.into_iter().map(DataRow::from_pairs).collect())
}

/// Every way `row` satisfies `qualifier`; empty when it does not match.
pub(crate) fn bindings(tables: &Tables, row: &DataRow, qualifier: &Qualifier) -> Vec<Binding> {
    match qualifier {
        Qualifier::All => vec![Binding::new()],
        Qualifier::Compare { column, op, value } => {
            let current = row.get(column).unwrap_or(&Value::Null);
            truth(compare(current, *op, value))
        }
        Qualifier::IsNull(column) => truth(row.get(column).is_none_or(Value::is_null)),
        Qualifier::NotNull(column) => truth(row.get(column).is_some_and(|v| !v.is_null())),
        Qualifier::In { columns, tuples } => truth(tuples.iter().any(|tuple| {
            columns.iter().zip(tuple).all(|(column, expected)| {
                row.get(column)
                    .is_some_and(|v| v.sql_eq(expected).unwrap_or(false))
            })
        })),
        Qualifier::Related { path, anchor, echo } => {
            let mut found: Vec<Binding> = Vec::new();
            for candidate in walk(tables, row.values().clone(), path) {
                let anchor_row = DataRow::from_pairs(candidate);
                if bindings(tables, &anchor_row, anchor).is_empty() {
                    continue;
                }
                let binding: Binding = echo
                    .iter()
                    .map(|column| {
                        (
                            format!("{}{}", ANCHOR_PREFIX, column),
                            anchor_row.get(column).cloned().unwrap_or(Value::Null),
                        )
                    })
                    .collect();
                if !found.contains(&binding) {
                    found.push(binding);
                }
            }
            found
        }
        Qualifier::And(terms) => {
            let mut acc = vec![Binding::new()];
            for term in terms {
                let next = bindings(tables, row, term);
                if next.is_empty() {
                    return Vec::new();
                }
                let mut product = Vec::with_capacity(acc.len() * next.len());
                for left in &acc {
                    for right in &next {
                        let mut merged = left.clone();
                        merged.extend(right.iter().map(|(k, v)| (k.clone(), v.clone())));
                        if !product.contains(&merged) {
                            product.push(merged);
                        }
                    }
                }
                acc = product;
            }
            acc
        }
        Qualifier::Or(terms) => {
            let mut acc: Vec<Binding> = Vec::new();
            for term in terms {
                for binding in bindings(tables, row, term) {
                    if !acc.contains(&binding) {
                        acc.push(binding);
                    }
                }
            }
            acc
        }
        Qualifier::Not(inner) => truth(bindings(tables, row, inner).is_empty()),
    }
}

fn truth(matched: bool) -> Vec<Binding> {
    if matched { vec![Binding::new()] } else { Vec::new() }
}

fn compare(current: &Value, op: CompareOp, expected: &Value) -> bool {
    if current.is_null() || expected.is_null() {
        return false;
    }
    match op {
        CompareOp::Eq => current.sql_eq(expected) == Some(true),
        CompareOp::Ne => current.sql_eq(expected) == Some(false),
        CompareOp::Lt => current.compare(expected) == Some(Ordering::Less),
        CompareOp::Le => matches!(current.compare(expected), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => current.compare(expected) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(current.compare(expected), Some(Ordering::Greater | Ordering::Equal)),
    }
}

/// Rows reached by following `path` from a row with `start` values.
pub(crate) fn walk(tables: &Tables, start: Binding, path: &[JoinStep]) -> Vec<Binding> {
    let mut current = vec![start];
    for step in path {
        let Some(candidates) = tables.get(&step.target_table) else {
            return Vec::new();
        };
        current = candidates
            .iter()
            .filter(|candidate| {
                current.iter().any(|from| {
                    step.pairs.iter().all(|pair| {
                        match (from.get(&pair.source), candidate.get(&pair.target)) {
                            (Some(a), Some(b)) => a.sql_eq(b).unwrap_or(false),
                            _ => false,
                        }
                    })
                })
            })
            .map(|candidate| candidate.values().clone())
            .collect();
        if current.is_empty() {
            break;
        }
    }
    current
}

/// Columns of one joint level: those directly under `prefix`.
fn level_columns(values: &Binding, prefix: &str) -> Binding {
    values
        .iter()
        .filter_map(|(column, value)| {
            let rest = column.strip_prefix(prefix)?;
            (!rest.contains(PATH_SEPARATOR) && !rest.starts_with('$')).then(|| (rest.to_string(), value.clone()))
        })
        .collect()
}

fn table_columns(tables: &Tables, table: &str) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in tables.get(table).into_iter().flatten() {
        for column in row.column_names() {
            if !columns.iter().any(|c| c == column) {
                columns.push(column.to_string());
            }
        }
    }
    columns
}

/// NULL-aware match of `row` against a WHERE column list.
pub(crate) fn row_matches(row: &DataRow, columns: &[String], values: &[Value]) -> bool {
    columns
        .iter()
        .zip(values)
        .all(|(column, expected)| row.get(column).unwrap_or(&Value::Null).matches(expected))
}

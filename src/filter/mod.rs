//! C4 Filter Compiler: turns a `(column, operator, value)` triple from a GraphQL `filter`
//! argument into a parameterised SQL predicate fragment. No value is ever interpolated as
//! literal SQL text — every operand travels as a bound [`ParamValue`], numbered by the caller.

use crate::dialect::{Dialect, ParamValue};
use crate::error::CoreError;

/// A scalar or list value lifted out of a GraphQL input object, still dialect-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<FilterValue>),
}

impl FilterValue {
    fn into_param(self) -> ParamValue {
        match self {
            FilterValue::Null => ParamValue::Null,
            FilterValue::Bool(b) => ParamValue::Bool(b),
            FilterValue::Int(i) => ParamValue::Int(i),
            FilterValue::Float(f) => ParamValue::Float(f),
            FilterValue::Text(s) => ParamValue::Text(s),
            FilterValue::List(_) => ParamValue::Null,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            FilterValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A compiled predicate: SQL text referencing placeholders the caller already allocated,
/// plus the bound values in the same order the placeholders appear.
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    pub sql: String,
    pub params: Vec<ParamValue>,
}

/// Compile one `<column>_<op>: <value>` filter entry into a predicate. `column_sql` must
/// already be a fully quoted, possibly table-qualified identifier. `alloc_placeholder` is
/// called once per bound parameter this predicate needs and must return that parameter's
/// rendered placeholder (`$3`, `@p2`, ...) in the order the caller will push it.
pub fn compile_condition(
    dialect: &dyn Dialect,
    column_sql: &str,
    operator: &str,
    value: FilterValue,
    mut alloc_placeholder: impl FnMut() -> String,
) -> Result<CompiledPredicate, CoreError> {
    let mut bind = |v: FilterValue, params: &mut Vec<ParamValue>| -> String {
        let placeholder = alloc_placeholder();
        params.push(v.into_param());
        placeholder
    };

    let mut params = Vec::new();

    let sql = match operator {
        "_eq" => match value {
            FilterValue::Null => format!("{column_sql} IS NULL"),
            v => format!("{column_sql} = {}", bind(v, &mut params)),
        },
        "_neq" => match value {
            FilterValue::Null => format!("{column_sql} IS NOT NULL"),
            v => format!("{column_sql} <> {}", bind(v, &mut params)),
        },
        "_lt" => format!("{column_sql} < {}", bind(value, &mut params)),
        "_lte" => format!("{column_sql} <= {}", bind(value, &mut params)),
        "_gt" => format!("{column_sql} > {}", bind(value, &mut params)),
        "_gte" => format!("{column_sql} >= {}", bind(value, &mut params)),
        "_contains" => wrap_like(dialect, column_sql, value, false, WildcardPosition::Both, &mut params, &mut alloc_placeholder)?,
        "_ncontains" => wrap_like(dialect, column_sql, value, true, WildcardPosition::Both, &mut params, &mut alloc_placeholder)?,
        "_starts_with" => wrap_like(dialect, column_sql, value, false, WildcardPosition::Suffix, &mut params, &mut alloc_placeholder)?,
        "_nstarts_with" => wrap_like(dialect, column_sql, value, true, WildcardPosition::Suffix, &mut params, &mut alloc_placeholder)?,
        "_ends_with" => wrap_like(dialect, column_sql, value, false, WildcardPosition::Prefix, &mut params, &mut alloc_placeholder)?,
        "_nends_with" => wrap_like(dialect, column_sql, value, true, WildcardPosition::Prefix, &mut params, &mut alloc_placeholder)?,
        "_in" => in_list(column_sql, value, false, &mut params, &mut alloc_placeholder)?,
        "_nin" => in_list(column_sql, value, true, &mut params, &mut alloc_placeholder)?,
        "_between" => between(column_sql, value, false, &mut params, &mut alloc_placeholder)?,
        "_nbetween" => between(column_sql, value, true, &mut params, &mut alloc_placeholder)?,
        other => return Err(CoreError::validation(format!("unknown filter operator `{other}`"))),
    };

    Ok(CompiledPredicate { sql, params })
}

enum WildcardPosition {
    Both,
    Prefix,
    Suffix,
}

/// Wraps `value` with `%` wildcards per `position` and emits a `LIKE`/`ILIKE` predicate.
///
/// `%`/`_` inside the supplied value are *not* escaped — a value containing a literal percent
/// sign behaves as a wildcard. This mirrors the source system's behaviour and is intentional,
/// not an oversight; see the `_contains` unit tests below.
fn wrap_like(
    dialect: &dyn Dialect,
    column_sql: &str,
    value: FilterValue,
    negated: bool,
    position: WildcardPosition,
    params: &mut Vec<ParamValue>,
    alloc_placeholder: &mut impl FnMut() -> String,
) -> Result<String, CoreError> {
    let text = value
        .as_text()
        .ok_or_else(|| CoreError::validation("LIKE-family operators require a string value"))?
        .to_string();
    let wrapped = match position {
        WildcardPosition::Both => format!("%{text}%"),
        WildcardPosition::Prefix => format!("%{text}"),
        WildcardPosition::Suffix => format!("{text}%"),
    };
    let placeholder = alloc_placeholder();
    params.push(ParamValue::Text(wrapped));
    Ok(format!("{column_sql} {} {placeholder}", dialect.like_operator(negated)))
}

fn in_list(
    column_sql: &str,
    value: FilterValue,
    negated: bool,
    params: &mut Vec<ParamValue>,
    alloc_placeholder: &mut impl FnMut() -> String,
) -> Result<String, CoreError> {
    let FilterValue::List(items) = value else {
        return Err(CoreError::validation("_in/_nin require a list value"));
    };
    if items.is_empty() {
        // An empty IN-list is never true; NOT IN over nothing is vacuously true.
        return Ok(if negated { "1 = 1".to_string() } else { "1 = 0".to_string() });
    }
    let placeholders: Vec<String> = items
        .into_iter()
        .map(|item| {
            let p = alloc_placeholder();
            params.push(item.into_param());
            p
        })
        .collect();
    let op = if negated { "NOT IN" } else { "IN" };
    Ok(format!("{column_sql} {op} ({})", placeholders.join(", ")))
}

fn between(
    column_sql: &str,
    value: FilterValue,
    negated: bool,
    params: &mut Vec<ParamValue>,
    alloc_placeholder: &mut impl FnMut() -> String,
) -> Result<String, CoreError> {
    let FilterValue::List(items) = value else {
        return Err(CoreError::validation("_between/_nbetween require a two-element list"));
    };
    let [lo, hi]: [FilterValue; 2] = items
        .try_into()
        .map_err(|_| CoreError::validation("_between/_nbetween require exactly two values"))?;
    let lo_p = alloc_placeholder();
    params.push(lo.into_param());
    let hi_p = alloc_placeholder();
    params.push(hi.into_param());
    let op = if negated { "NOT BETWEEN" } else { "BETWEEN" };
    Ok(format!("{column_sql} {op} {lo_p} AND {hi_p}"))
}

/// Every recognised filter operator suffix, used by the Plan Builder to split a field name
/// like `Age_gte` into `(column = "Age", operator = "_gte")`.
pub const OPERATORS: &[&str] = &[
    "_eq",
    "_neq",
    "_lt",
    "_lte",
    "_gt",
    "_gte",
    "_contains",
    "_ncontains",
    "_starts_with",
    "_nstarts_with",
    "_ends_with",
    "_nends_with",
    "_in",
    "_nin",
    "_between",
    "_nbetween",
];

/// Split `field_name` (e.g. `Age_gte`) into its column and operator, trying the longest
/// operator suffixes first so `_nbetween` isn't mistaken for a column ending in `_between`
/// after truncation. Unknown suffixes are a validation error, not a silent fallback to `_eq`.
pub fn split_field_operator(field_name: &str) -> Result<(&str, &str), CoreError> {
    let mut candidates: Vec<&&str> = OPERATORS.iter().collect();
    candidates.sort_by_key(|op| std::cmp::Reverse(op.len()));
    for op in candidates {
        if let Some(column) = field_name.strip_suffix(op) {
            if !column.is_empty() {
                return Ok((column, op));
            }
        }
    }
    Err(CoreError::validation(format!(
        "`{field_name}` does not end in a recognised filter operator"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;

    fn placeholders(dialect: &dyn Dialect, start: usize) -> impl FnMut() -> String + '_ {
        let mut n = start;
        move || {
            let p = dialect.param_placeholder(n);
            n += 1;
            p
        }
    }

    #[test]
    fn eq_null_becomes_is_null_with_no_params() {
        let dialect = PostgresDialect;
        let pred = compile_condition(&dialect, "\"Age\"", "_eq", FilterValue::Null, placeholders(&dialect, 0)).unwrap();
        assert_eq!(pred.sql, "\"Age\" IS NULL");
        assert!(pred.params.is_empty());
    }

    #[test]
    fn eq_value_binds_one_param() {
        let dialect = PostgresDialect;
        let pred = compile_condition(&dialect, "\"Name\"", "_eq", FilterValue::Text("Alice".into()), placeholders(&dialect, 0)).unwrap();
        assert_eq!(pred.sql, "\"Name\" = $1");
        assert_eq!(pred.params, vec![ParamValue::Text("Alice".into())]);
    }

    #[test]
    fn contains_does_not_escape_percent_signs() {
        let dialect = PostgresDialect;
        let pred = compile_condition(&dialect, "\"Name\"", "_contains", FilterValue::Text("50%off".into()), placeholders(&dialect, 0)).unwrap();
        assert_eq!(pred.params, vec![ParamValue::Text("%50%off%".into())]);
    }

    #[test]
    fn between_requires_exactly_two_values() {
        let dialect = PostgresDialect;
        let err = compile_condition(
            &dialect,
            "\"Age\"",
            "_between",
            FilterValue::List(vec![FilterValue::Int(1)]),
            placeholders(&dialect, 0),
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation-error");
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let dialect = PostgresDialect;
        let err = compile_condition(&dialect, "\"Age\"", "_wat", FilterValue::Null, placeholders(&dialect, 0)).unwrap_err();
        assert_eq!(err.code(), "validation-error");
    }

    #[test]
    fn split_prefers_longest_operator_suffix() {
        let (column, op) = split_field_operator("Age_nbetween").unwrap();
        assert_eq!(column, "Age");
        assert_eq!(op, "_nbetween");
    }

    #[test]
    fn empty_in_list_is_always_false() {
        let dialect = PostgresDialect;
        let pred = compile_condition(&dialect, "\"Id\"", "_in", FilterValue::List(vec![]), placeholders(&dialect, 0)).unwrap();
        assert_eq!(pred.sql, "1 = 0");
    }
}

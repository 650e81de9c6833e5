//! C7 Row Graph: the materialised result of a batch of SQL statements, keyed by join-name
//! chain and navigable without re-querying the database.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CoreError;

/// One column's value in one row. `DateTime`/`DateTimeOffset` columns are carried as their
/// ISO-8601 text rendering rather than a dedicated variant, matching how the wire format
/// (JSON over `async-graphql`) represents them anyway.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// The dotted chain of join names from the query root to a result set, e.g. `"root"` or
/// `"root.Department"` or `"root.Orders.Items"`. See the glossary entry for "Join name chain".
pub type JoinKey = String;

/// One statement's result: a column-name index plus its rows.
#[derive(Debug, Clone)]
pub struct ResultSet {
    column_index: HashMap<String, usize>,
    rows: Vec<Vec<CellValue>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        let column_index = columns.into_iter().enumerate().map(|(i, c)| (c, i)).collect();
        Self { column_index, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&CellValue> {
        self.column_index.get(column).and_then(|&i| self.rows[row].get(i))
    }
}

/// The full materialised response: every [`ResultSet`] the SQL Emitter's batch produced,
/// keyed by join name chain.
#[derive(Debug, Clone, Default)]
pub struct RowGraph {
    sets: HashMap<JoinKey, ResultSet>,
}

impl RowGraph {
    pub fn new(sets: HashMap<JoinKey, ResultSet>) -> Self {
        Self { sets }
    }

    pub fn root(&self) -> &ResultSet {
        self.sets
            .get("root")
            .expect("the SQL Emitter always produces a \"root\" result set")
    }

    /// Look up a result set by its join-name chain. A plan that references a join never
    /// reflected in the emitted batch is a programming error in the Plan Builder/SQL Emitter
    /// pairing, surfaced as `join-not-found` rather than panicking.
    pub fn set(&self, key: &str) -> Result<&ResultSet, CoreError> {
        self.sets
            .get(key)
            .ok_or_else(|| CoreError::JoinNotFound(key.to_string()))
    }

    /// Rows of `child_key` whose `join_column` matches `parent_value`, for `_join_` (list)
    /// fields. A null parent join value yields an empty list, never an error.
    pub fn child_rows(
        &self,
        child_key: &str,
        join_column: &str,
        parent_value: &CellValue,
    ) -> Result<Vec<usize>, CoreError> {
        if matches!(parent_value, CellValue::Null) {
            return Ok(Vec::new());
        }
        let set = self.set(child_key)?;
        Ok((0..set.len())
            .filter(|&row| set.cell(row, join_column) == Some(parent_value))
            .collect())
    }

    /// The single matching row for `_single_` fields, or `None` if the parent join value is
    /// null or no child row matches.
    pub fn single_child_row(
        &self,
        child_key: &str,
        join_column: &str,
        parent_value: &CellValue,
    ) -> Result<Option<usize>, CoreError> {
        Ok(self.child_rows(child_key, join_column, parent_value)?.into_iter().next())
    }
}

/// A resolver-time handle into a [`RowGraph`]: which result set, which row. Cheap to clone
/// and pass into `async-graphql` `FieldValue::owned_any` boxes.
#[derive(Debug, Clone)]
pub struct RowCursor {
    pub graph: Arc<RowGraph>,
    pub key: JoinKey,
    pub row: usize,
}

impl RowCursor {
    pub fn get(&self, field: &str) -> Result<Option<&CellValue>, CoreError> {
        Ok(self.graph.set(&self.key)?.cell(self.row, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> RowGraph {
        let root = ResultSet::new(
            vec!["Id".into(), "Name".into()],
            vec![vec![CellValue::Int(1), CellValue::Text("Alice".into())]],
        );
        let departments = ResultSet::new(
            vec!["Id".into(), "UserId".into(), "Name".into()],
            vec![
                vec![CellValue::Int(10), CellValue::Int(1), CellValue::Text("Eng".into())],
                vec![CellValue::Int(11), CellValue::Int(1), CellValue::Text("Ops".into())],
                vec![CellValue::Int(12), CellValue::Int(2), CellValue::Text("Sales".into())],
            ],
        );
        let mut sets = HashMap::new();
        sets.insert("root".to_string(), root);
        sets.insert("root.Departments".to_string(), departments);
        RowGraph::new(sets)
    }

    #[test]
    fn child_rows_filters_by_join_column() {
        let graph = sample_graph();
        let rows = graph
            .child_rows("root.Departments", "UserId", &CellValue::Int(1))
            .unwrap();
        assert_eq!(rows, vec![0, 1]);
    }

    #[test]
    fn null_parent_value_yields_empty_list_not_error() {
        let graph = sample_graph();
        let rows = graph.child_rows("root.Departments", "UserId", &CellValue::Null).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn missing_join_table_is_fatal() {
        let graph = sample_graph();
        let err = graph.set("root.Nonexistent").unwrap_err();
        assert_eq!(err.code(), "join-not-found");
    }

    #[test]
    fn single_child_row_takes_first_match() {
        let graph = sample_graph();
        let row = graph
            .single_child_row("root.Departments", "UserId", &CellValue::Int(1))
            .unwrap();
        assert_eq!(row, Some(0));
    }
}

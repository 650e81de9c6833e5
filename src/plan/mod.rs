//! C5 Plan Builder: walks the incoming GraphQL selection (via `async-graphql`'s dynamic
//! schema `look_ahead`) and turns it into an arena of [`TableSql`] nodes — one per table
//! reachable through `_join_`/`_single_` fields, with every filter/sort/limit/offset argument
//! already resolved. The SQL Emitter (C6) only has to turn each node into one statement; it
//! never has to think about GraphQL again.

use async_graphql::{Lookahead, Name, Value as GqlValue};
use indexmap::IndexMap;

use crate::error::CoreError;
use crate::filter::FilterValue;
use crate::model::{JoinKind, Model, TableId};

/// Index into [`Plan::nodes`]. Table references form cycles through FK joins, so the plan is
/// an arena addressed by index rather than an owned tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableSqlId(pub usize);

#[derive(Debug, Clone)]
pub struct TableFilter {
    pub column: String,
    pub operator: String,
    pub value: FilterValue,
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone)]
pub struct TableJoin {
    pub child: TableSqlId,
    pub kind: JoinKind,
    pub field_name: String,
    /// Column on *this* node's result set used to correlate with the child.
    pub own_column: String,
    /// Column on the child's result set that must equal `own_column`'s value.
    pub other_column: String,
}

#[derive(Debug, Clone)]
pub struct TableSql {
    pub id: TableSqlId,
    pub table: TableId,
    /// Dotted join-name chain, matching `RowGraph`'s `JoinKey` (`"root"`, `"root.Orders"`, ...).
    pub join_name: String,
    pub requested_columns: Vec<String>,
    pub filters: Vec<TableFilter>,
    pub sort: Vec<SortKey>,
    pub limit: Option<i64>,
    pub offset: i64,
    pub joins: Vec<TableJoin>,
    pub parent: Option<TableSqlId>,
}

/// An arena of `TableSql` nodes rooted at index 0.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub nodes: Vec<TableSql>,
}

impl Plan {
    pub(crate) fn alloc(&mut self, table: TableId, join_name: String, parent: Option<TableSqlId>) -> TableSqlId {
        let id = TableSqlId(self.nodes.len());
        self.nodes.push(TableSql {
            id,
            table,
            join_name,
            requested_columns: Vec::new(),
            filters: Vec::new(),
            sort: Vec::new(),
            limit: None,
            offset: 0,
            joins: Vec::new(),
            parent,
        });
        id
    }

    pub fn node(&self, id: TableSqlId) -> &TableSql {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: TableSqlId) -> &mut TableSql {
        &mut self.nodes[id.0]
    }

    pub fn root(&self) -> &TableSql {
        &self.nodes[0]
    }
}

/// Where a raw `async_graphql::Value` came from, so it's converted the same way whether it's
/// a plain scalar filter value, a field inside a filter input object, or an element of an
/// `_in`/`_between` list.
#[derive(Debug, Clone)]
pub enum ValueSink {
    RootFilterColumn(String),
    ObjectField(String),
    ListElement,
}

pub fn gql_value_to_filter_value(value: &GqlValue, sink: &ValueSink) -> Result<FilterValue, CoreError> {
    match value {
        GqlValue::Null => Ok(FilterValue::Null),
        GqlValue::Boolean(b) => Ok(FilterValue::Bool(*b)),
        GqlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(FilterValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(FilterValue::Float(f))
            } else {
                Err(CoreError::validation("unsupported numeric filter value"))
            }
        }
        GqlValue::String(s) => Ok(FilterValue::Text(s.clone())),
        GqlValue::Enum(e) => Ok(FilterValue::Text(e.to_string())),
        GqlValue::List(items) => Ok(FilterValue::List(
            items
                .iter()
                .map(|item| gql_value_to_filter_value(item, &ValueSink::ListElement))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        GqlValue::Object(_) => Err(CoreError::validation(format!(
            "{sink:?}: nested objects are not valid filter values"
        ))),
        GqlValue::Binary(_) => Err(CoreError::validation(format!("{sink:?}: binary values are not supported"))),
    }
}

/// Build a plan rooted at `root_table`, from the root field's already-resolved arguments and
/// its `look_ahead` selection (used only to decide which columns/joins are actually needed;
/// argument values for nested joins are pulled from each `Lookahead::field`'s own arguments).
pub fn build_plan(
    model: &Model,
    root_table: TableId,
    root_args: &IndexMap<Name, GqlValue>,
    lookahead: &Lookahead<'_>,
) -> Result<Plan, CoreError> {
    let mut plan = Plan::default();
    let root_id = plan.alloc(root_table, "root".to_string(), None);
    apply_row_args(&mut plan, root_id, root_args)?;
    expand_selection(model, &mut plan, root_id, lookahead)?;
    Ok(plan)
}

fn expand_selection(
    model: &Model,
    plan: &mut Plan,
    parent_id: TableSqlId,
    lookahead: &Lookahead<'_>,
) -> Result<(), CoreError> {
    let table_id = plan.node(parent_id).table;
    let table = model.table(table_id);

    for column in &table.columns {
        if lookahead.field(&column.name).exists() {
            plan.node_mut(parent_id).requested_columns.push(column.name.clone());
        }
    }

    // `_join_<child>`: this table is the referenced ("one") side of the FK.
    for edge in model.join_edges_from(table_id).to_vec() {
        let child_table = model.table(edge.child_table);
        let field_name = format!("_join_{}", child_table.graphql_name);
        let nested = lookahead.field(&field_name);
        if !nested.exists() {
            continue;
        }
        let join_name = format!("{}.{}", plan.node(parent_id).join_name, child_table.graphql_name);
        let child_id = plan.alloc(edge.child_table, join_name, Some(parent_id));
        plan.node_mut(parent_id).joins.push(TableJoin {
            child: child_id,
            kind: JoinKind::Multi,
            field_name,
            own_column: edge.parent_column.clone(),
            other_column: edge.child_column.clone(),
        });
        apply_nested_args(&mut plan, child_id, &nested)?;
        expand_selection(model, plan, child_id, &nested)?;
    }

    // `_single_<parent>`: this table holds the FK and points at one parent row.
    for edge in model.join_edges_to(table_id) {
        let parent_table = model.table(edge.parent_table);
        let field_name = format!("_single_{}", parent_table.graphql_name);
        let nested = lookahead.field(&field_name);
        if !nested.exists() {
            continue;
        }
        let join_name = format!("{}.{}", plan.node(parent_id).join_name, parent_table.graphql_name);
        let child_id = plan.alloc(edge.parent_table, join_name, Some(parent_id));
        plan.node_mut(parent_id).joins.push(TableJoin {
            child: child_id,
            kind: JoinKind::Single,
            field_name,
            own_column: edge.child_column.clone(),
            other_column: edge.parent_column.clone(),
        });
        apply_nested_args(&mut plan, child_id, &nested)?;
        expand_selection(model, plan, child_id, &nested)?;
    }

    Ok(())
}

fn apply_nested_args(plan: &mut Plan, node: TableSqlId, lookahead: &Lookahead<'_>) -> Result<(), CoreError> {
    let args = lookahead
        .arguments()
        .map_err(|e| CoreError::validation(format!("reading join arguments: {e}")))?;
    apply_row_args(plan, node, &args)?;
    if let Some(GqlValue::Object(on)) = args.get(&Name::new("on")) {
        for (key, value) in on {
            let fv = gql_value_to_filter_value(value, &ValueSink::ObjectField(key.to_string()))?;
            push_filter(plan, node, key.as_str().to_string(), "_eq".to_string(), fv)?;
        }
    }
    Ok(())
}

fn apply_row_args(plan: &mut Plan, node: TableSqlId, args: &IndexMap<Name, GqlValue>) -> Result<(), CoreError> {
    if let Some(GqlValue::Object(filter)) = args.get(&Name::new("filter")) {
        for (column, ops) in filter {
            let GqlValue::Object(ops) = ops else {
                return Err(CoreError::validation(format!(
                    "filter.{column}: expected an object of {{operator: value}} pairs"
                )));
            };
            // Every operator on a column AND-combines (e.g. {_gte: 10, _lt: 100}); push_filter
            // appends rather than replaces, so multiple entries here just add more predicates.
            for (operator, value) in ops {
                let fv = gql_value_to_filter_value(value, &ValueSink::ObjectField(format!("{column}.{operator}")))?;
                push_filter(plan, node, column.as_str().to_string(), operator.as_str().to_string(), fv)?;
            }
        }
    }

    if let Some(GqlValue::List(sort)) = args.get(&Name::new("sort")) {
        for entry in sort {
            if let GqlValue::String(s) | GqlValue::Enum(s) = entry {
                let s = s.trim();
                let mut parts = s.splitn(2, char::is_whitespace);
                let column = parts.next().unwrap_or(s).to_string();
                let ascending = !matches!(parts.next().map(|d| d.trim().to_ascii_lowercase()).as_deref(), Some("desc"));
                plan.node_mut(node).sort.push(SortKey { column, ascending });
            }
        }
    }

    if let Some(GqlValue::Number(n)) = args.get(&Name::new("limit")) {
        plan.node_mut(node).limit = n.as_i64();
    }
    if let Some(GqlValue::Number(n)) = args.get(&Name::new("offset")) {
        plan.node_mut(node).offset = n.as_i64().unwrap_or(0);
    }

    Ok(())
}

/// Push `(column, operator)` onto a node's filter list, keeping only the first occurrence of
/// any duplicate pair — a GraphQL input object can't literally repeat a key, but a `filter`
/// merged from multiple fragments can, and first-wins is the documented, tested behaviour.
fn push_filter(
    plan: &mut Plan,
    node: TableSqlId,
    column: String,
    operator: String,
    value: FilterValue,
) -> Result<(), CoreError> {
    let node = plan.node_mut(node);
    if node.filters.iter().any(|f| f.column == column && f.operator == operator) {
        return Ok(());
    }
    node.filters.push(TableFilter { column, operator, value });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gql_number_converts_to_int_when_whole() {
        let v = gql_value_to_filter_value(&GqlValue::Number(5.into()), &ValueSink::ListElement).unwrap();
        assert_eq!(v, FilterValue::Int(5));
    }

    #[test]
    fn gql_object_is_rejected_as_a_leaf_value() {
        let err = gql_value_to_filter_value(
            &GqlValue::Object(Default::default()),
            &ValueSink::RootFilterColumn("Age".into()),
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation-error");
    }

    #[test]
    fn duplicate_filter_pair_keeps_first() {
        let mut plan = Plan::default();
        let id = plan.alloc(TableId(0), "root".to_string(), None);
        push_filter(&mut plan, id, "Age".into(), "_gte".into(), FilterValue::Int(1)).unwrap();
        push_filter(&mut plan, id, "Age".into(), "_gte".into(), FilterValue::Int(99)).unwrap();
        assert_eq!(plan.node(id).filters.len(), 1);
        assert_eq!(plan.node(id).filters[0].value, FilterValue::Int(1));
    }

    #[test]
    fn multiple_operators_on_one_column_and_combine() {
        let mut plan = Plan::default();
        let id = plan.alloc(TableId(0), "root".to_string(), None);

        let mut ops = IndexMap::new();
        ops.insert(Name::new("_gte"), GqlValue::Number(10.into()));
        ops.insert(Name::new("_lt"), GqlValue::Number(100.into()));
        let mut filter = IndexMap::new();
        filter.insert(Name::new("Age"), GqlValue::Object(ops));
        let mut args = IndexMap::new();
        args.insert(Name::new("filter"), GqlValue::Object(filter));

        apply_row_args(&mut plan, id, &args).unwrap();

        let filters = &plan.node(id).filters;
        assert_eq!(filters.len(), 2);
        assert!(filters.iter().any(|f| f.column == "Age" && f.operator == "_gte" && f.value == FilterValue::Int(10)));
        assert!(filters.iter().any(|f| f.column == "Age" && f.operator == "_lt" && f.value == FilterValue::Int(100)));
    }
}

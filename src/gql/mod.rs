//! C-glue: assembles the dynamic `async-graphql` schema that ties the introspected [`Model`]
//! to the Plan Builder (C5), SQL Emitter (C6), Row Graph (C7) and Mutation Compiler (C8).
//!
//! One [`Object`] node type and one root `Query` field are generated per visible table; row
//! resolvers never issue SQL themselves — they read from the [`RowGraph`] the root field's
//! resolver already built. Mutation fields compile straight to [`mutation::execute`] (a single
//! action) or [`mutation::execute_batch`] (a `batch` list, sharing one transaction).

use std::sync::Arc;

use async_graphql::dynamic::{
    Field, FieldFuture, FieldValue, InputObject, InputValue, Object, ResolverContext, Scalar, Schema, SchemaError,
    TypeRef,
};
use async_graphql::{Name, Value as GqlValue};
use indexmap::IndexMap;

use crate::db::DbPool;
use crate::dialect::{Dialect, ParamValue};
use crate::error::CoreError;
use crate::filter::FilterValue;
use crate::model::{Column, JoinEdge, Model, Table, TableId};
use crate::mutation::{self, MutationAction, MutationOutcome, RowValues};
use crate::plan::{self, gql_value_to_filter_value, ValueSink};
use crate::rowgraph::RowCursor;
use crate::services::auth::AuthContext;
use crate::sql;

/// Scalar type names the column mapping table ever produces, plus the custom ones that need
/// registering (`Int`/`Float`/`Boolean`/`String` are async-graphql built-ins already known to
/// the schema).
const CUSTOM_SCALARS: [&str; 3] = ["BigInt", "DateTime", "DateTimeOffset"];
const ALL_SCALARS: [&str; 7] = ["Int", "BigInt", "Float", "Boolean", "DateTime", "DateTimeOffset", "String"];

const BASE_OPERATORS: [&str; 6] = ["_eq", "_neq", "_lt", "_lte", "_gt", "_gte"];
const LIKE_OPERATORS: [&str; 6] = ["_contains", "_ncontains", "_starts_with", "_nstarts_with", "_ends_with", "_nends_with"];

/// Builds the complete schema: one node type, one filter input, one `on` input, one insert/
/// update/upsert/batch input and one mutation-result type per visible table, plus the shared
/// per-scalar comparison inputs every table's filter input references.
pub fn build_schema(db: DbPool, model: Arc<Model>) -> Result<Schema, SchemaError> {
    let dialect = db.dialect();
    let mut builder = Schema::build("Query", Some("Mutation"), None);

    for name in CUSTOM_SCALARS {
        builder = builder.register(Scalar::new(name));
    }
    for scalar in ALL_SCALARS {
        builder = builder.register(comparison_input(scalar));
    }

    let mut query = Object::new("Query");
    let mut mutation_root = Object::new("Mutation");

    for (table_id, table) in model.visible_tables() {
        builder = builder
            .register(node_object(&model, table_id, table))
            .register(table_filter_input(table))
            .register(table_on_input(table))
            .register(insert_input(table))
            .register(update_input(table))
            .register(upsert_input(table))
            .register(batch_item_input(table))
            .register(mutation_result_object(table));

        query = query.field(root_query_field(model.clone(), db.clone(), dialect.clone(), table_id, table));

        mutation_root = mutation_root
            .field(mutation_field(
                model.clone(),
                db.clone(),
                dialect.clone(),
                table_id,
                table,
                table.graphql_name.clone(),
            ))
            .field(mutation_field(
                model.clone(),
                db.clone(),
                dialect.clone(),
                table_id,
                table,
                format!("insert_{}", table.graphql_name),
            ));
    }

    builder.register(query).register(mutation_root).finish()
}

fn node_type_name(table: &Table) -> String {
    format!("{}Node", table.graphql_name)
}

fn result_object_name(table: &Table) -> String {
    format!("{}MutationResult", table.graphql_name)
}

fn require_auth(ctx: &ResolverContext<'_>) -> Result<(), CoreError> {
    match ctx.data_opt::<AuthContext>() {
        Some(auth) if auth.required && auth.user.is_none() => Err(CoreError::AuthRequired),
        _ => Ok(()),
    }
}

fn cell_to_gql_value(v: &crate::rowgraph::CellValue) -> GqlValue {
    use crate::rowgraph::CellValue;
    match v {
        CellValue::Null => GqlValue::Null,
        CellValue::Bool(b) => GqlValue::Boolean(*b),
        CellValue::Int(i) => GqlValue::Number((*i).into()),
        CellValue::Float(f) => async_graphql::Number::from_f64(*f).map(GqlValue::Number).unwrap_or(GqlValue::Null),
        CellValue::Text(s) => GqlValue::String(s.clone()),
    }
}

fn param_value_to_string(p: &ParamValue) -> String {
    match p {
        ParamValue::Null => String::new(),
        ParamValue::Bool(b) => b.to_string(),
        ParamValue::Int(i) => i.to_string(),
        ParamValue::Float(f) => f.to_string(),
        ParamValue::Text(s) => s.clone(),
    }
}

fn column_type_ref(column: &Column) -> TypeRef {
    let scalar = column.data_type.graphql_type_name();
    if column.is_nullable {
        TypeRef::named(scalar)
    } else {
        TypeRef::named_nn(scalar)
    }
}

fn column_field(column: &Column) -> Field {
    let name = column.name.clone();
    Field::new(name.clone(), column_type_ref(column), move |ctx| {
        let name = name.clone();
        FieldFuture::new(async move {
            let cursor = ctx.parent_value.try_downcast_ref::<RowCursor>()?;
            let value = cursor.get(&name)?;
            Ok(value.map(|v| FieldValue::value(cell_to_gql_value(v))))
        })
    })
}

/// `_join_<child>`: the parent is the referenced ("one") side of the FK, so resolving it means
/// finding every child row whose FK column equals the parent row's key — no SQL involved, the
/// Row Graph already holds both result sets.
fn join_field(edge: &JoinEdge, child_table: &Table) -> Field {
    let field_name = format!("_join_{}", child_table.graphql_name);
    let own_column = edge.parent_column.clone();
    let other_column = edge.child_column.clone();
    let child_node_type = node_type_name(child_table);
    let child_graphql_name = child_table.graphql_name.clone();

    Field::new(field_name, TypeRef::named_nn_list(child_node_type), move |ctx| {
        let own_column = own_column.clone();
        let other_column = other_column.clone();
        let child_graphql_name = child_graphql_name.clone();
        FieldFuture::new(async move {
            let cursor = ctx.parent_value.try_downcast_ref::<RowCursor>()?;
            let Some(parent_value) = cursor.get(&own_column)? else {
                return Ok(Some(FieldValue::list(Vec::<FieldValue>::new())));
            };
            let parent_value = parent_value.clone();
            let child_key = format!("{}.{}", cursor.key, child_graphql_name);
            let rows = cursor.graph.child_rows(&child_key, &other_column, &parent_value)?;
            let graph = cursor.graph.clone();
            let items: Vec<FieldValue> = rows
                .into_iter()
                .map(|row| FieldValue::owned_any(RowCursor { graph: graph.clone(), key: child_key.clone(), row }))
                .collect();
            Ok(Some(FieldValue::list(items)))
        })
    })
    .argument(InputValue::new("filter", TypeRef::named(format!("{}Filter", child_table.graphql_name))))
    .argument(InputValue::new("sort", TypeRef::named_nn_list(TypeRef::STRING)))
    .argument(InputValue::new("limit", TypeRef::named(TypeRef::INT)))
    .argument(InputValue::new("offset", TypeRef::named(TypeRef::INT)))
    .argument(InputValue::new("on", TypeRef::named(format!("{}OnInput", child_table.graphql_name))))
}

/// `_single_<parent>`: this table holds the FK and points at exactly one parent row.
fn single_field(edge: &JoinEdge, parent_table: &Table) -> Field {
    let field_name = format!("_single_{}", parent_table.graphql_name);
    let own_column = edge.child_column.clone();
    let other_column = edge.parent_column.clone();
    let parent_node_type = node_type_name(parent_table);
    let parent_graphql_name = parent_table.graphql_name.clone();

    Field::new(field_name, TypeRef::named(parent_node_type), move |ctx| {
        let own_column = own_column.clone();
        let other_column = other_column.clone();
        let parent_graphql_name = parent_graphql_name.clone();
        FieldFuture::new(async move {
            let cursor = ctx.parent_value.try_downcast_ref::<RowCursor>()?;
            let Some(own_value) = cursor.get(&own_column)? else {
                return Ok(None);
            };
            let own_value = own_value.clone();
            let parent_key = format!("{}.{}", cursor.key, parent_graphql_name);
            let row = cursor.graph.single_child_row(&parent_key, &other_column, &own_value)?;
            Ok(row.map(|row| FieldValue::owned_any(RowCursor { graph: cursor.graph.clone(), key: parent_key, row })))
        })
    })
    .argument(InputValue::new("on", TypeRef::named(format!("{}OnInput", parent_table.graphql_name))))
}

fn node_object(model: &Model, table_id: TableId, table: &Table) -> Object {
    let mut obj = Object::new(node_type_name(table));
    for column in &table.columns {
        obj = obj.field(column_field(column));
    }
    for edge in model.join_edges_from(table_id) {
        obj = obj.field(join_field(edge, model.table(edge.child_table)));
    }
    for edge in model.join_edges_to(table_id) {
        obj = obj.field(single_field(edge, model.table(edge.parent_table)));
    }
    obj
}

/// Per-scalar comparison input (`IntFilter`, `StringFilter`, …), shared by every table's
/// per-column filter field. LIKE-family operators are only meaningful on `String`.
fn comparison_input(scalar: &str) -> InputObject {
    let mut input = InputObject::new(format!("{scalar}Filter"));
    for op in BASE_OPERATORS {
        input = input.field(InputValue::new(op, TypeRef::named(scalar)));
    }
    input = input
        .field(InputValue::new("_in", TypeRef::named_nn_list(scalar)))
        .field(InputValue::new("_nin", TypeRef::named_nn_list(scalar)))
        .field(InputValue::new("_between", TypeRef::named_nn_list(scalar)))
        .field(InputValue::new("_nbetween", TypeRef::named_nn_list(scalar)));
    if scalar == "String" {
        for op in LIKE_OPERATORS {
            input = input.field(InputValue::new(op, TypeRef::named(scalar)));
        }
    }
    input
}

fn table_filter_input(table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}Filter", table.graphql_name));
    for column in &table.columns {
        let scalar = column.data_type.graphql_type_name();
        input = input.field(InputValue::new(column.name.clone(), TypeRef::named(format!("{scalar}Filter"))));
    }
    input
}

/// Direct-equality shorthand used by the `on` argument (see `plan::apply_nested_args`): every
/// column, its own scalar type, no operator wrapper.
fn table_on_input(table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}OnInput", table.graphql_name));
    for column in &table.columns {
        input = input.field(InputValue::new(column.name.clone(), TypeRef::named(column.data_type.graphql_type_name())));
    }
    input
}

fn pk_scalar(table: &Table) -> &'static str {
    table.primary_key().map(|pk| pk.data_type.graphql_type_name()).unwrap_or("String")
}

fn insert_input(table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}InsertInput", table.graphql_name));
    for column in &table.columns {
        if column.is_identity {
            continue;
        }
        let scalar = column.data_type.graphql_type_name();
        let type_ref = if column.is_nullable { TypeRef::named(scalar) } else { TypeRef::named_nn(scalar) };
        input = input.field(InputValue::new(column.name.clone(), type_ref));
    }
    input
}

/// Every column optional except the primary key, which is required so the row can be located.
fn update_input(table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}UpdateInput", table.graphql_name));
    let pk_name = table.primary_key().map(|pk| pk.name.clone());
    for column in &table.columns {
        let scalar = column.data_type.graphql_type_name();
        let required = pk_name.as_deref() == Some(column.name.as_str());
        let type_ref = if required { TypeRef::named_nn(scalar) } else { TypeRef::named(scalar) };
        input = input.field(InputValue::new(column.name.clone(), type_ref));
    }
    input
}

/// Same shape as update, but the primary key is optional too: its presence decides whether the
/// compiled action becomes an update or an insert.
fn upsert_input(table: &Table) -> InputObject {
    let mut input = InputObject::new(format!("{}UpsertInput", table.graphql_name));
    for column in &table.columns {
        input = input.field(InputValue::new(column.name.clone(), TypeRef::named(column.data_type.graphql_type_name())));
    }
    input
}

fn batch_item_input(table: &Table) -> InputObject {
    InputObject::new(format!("{}BatchItem", table.graphql_name))
        .field(InputValue::new("insert", TypeRef::named(format!("{}InsertInput", table.graphql_name))))
        .field(InputValue::new("update", TypeRef::named(format!("{}UpdateInput", table.graphql_name))))
        .field(InputValue::new("upsert", TypeRef::named(format!("{}UpsertInput", table.graphql_name))))
        .field(InputValue::new("delete", TypeRef::named(pk_scalar(table))))
}

fn mutation_result_object(table: &Table) -> Object {
    Object::new(result_object_name(table))
        .field(Field::new("rows_affected", TypeRef::named_nn(TypeRef::INT), |ctx| {
            FieldFuture::new(async move {
                let outcome = ctx.parent_value.try_downcast_ref::<MutationOutcome>()?;
                Ok(Some(FieldValue::value(GqlValue::Number(outcome.rows_affected.into()))))
            })
        }))
        .field(Field::new("identities", TypeRef::named_list_nn(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move {
                let outcome = ctx.parent_value.try_downcast_ref::<MutationOutcome>()?;
                let items: Vec<FieldValue> = outcome
                    .identities
                    .iter()
                    .map(|ident| match ident {
                        Some(p) => FieldValue::value(GqlValue::String(param_value_to_string(p))),
                        None => FieldValue::NULL,
                    })
                    .collect();
                Ok(Some(FieldValue::list(items)))
            })
        }))
}

fn root_query_field(model: Arc<Model>, db: DbPool, dialect: Arc<dyn Dialect>, table_id: TableId, table: &Table) -> Field {
    let node_type = node_type_name(table);
    Field::new(table.graphql_name.clone(), TypeRef::named_nn_list_nn(node_type), move |ctx| {
        let model = model.clone();
        let db = db.clone();
        let dialect = dialect.clone();
        FieldFuture::new(async move {
            require_auth(&ctx)?;
            let args = ctx.args.as_index_map().clone();
            let lookahead = ctx.look_ahead();
            let plan = plan::build_plan(&model, table_id, &args, &lookahead)?;
            let batch = sql::emit_batch(&model, dialect.as_ref(), &plan)?;
            let graph = Arc::new(sql::execute_batch(&db, batch).await?);
            let count = graph.root().len();
            let items: Vec<FieldValue> = (0..count)
                .map(|row| FieldValue::owned_any(RowCursor { graph: graph.clone(), key: "root".to_string(), row }))
                .collect();
            Ok(Some(FieldValue::list(items)))
        })
    })
    .argument(InputValue::new("filter", TypeRef::named(format!("{}Filter", table.graphql_name))))
    .argument(InputValue::new("sort", TypeRef::named_nn_list(TypeRef::STRING)))
    .argument(InputValue::new("limit", TypeRef::named(TypeRef::INT)))
    .argument(InputValue::new("offset", TypeRef::named(TypeRef::INT)))
}

fn pk_name(table: &Table) -> Result<String, CoreError> {
    table
        .primary_key()
        .map(|c| c.name.clone())
        .ok_or_else(|| CoreError::validation(format!("{} has no single-column primary key", table.graphql_name)))
}

fn row_values_from_object(obj: &IndexMap<Name, GqlValue>) -> Result<RowValues, CoreError> {
    let mut row = RowValues::new();
    for (key, value) in obj {
        row.insert(key.to_string(), gql_value_to_filter_value(value, &ValueSink::ObjectField(key.to_string()))?);
    }
    Ok(row)
}

/// Splits an update/upsert input object into its primary-key value and the remaining
/// column assignments.
fn split_key_and_set(table: &Table, obj: &IndexMap<Name, GqlValue>, key_required: bool) -> Result<(FilterValue, RowValues), CoreError> {
    let pk = table
        .primary_key()
        .ok_or_else(|| CoreError::validation(format!("{} has no single-column primary key", table.graphql_name)))?;
    let mut set = RowValues::new();
    let mut key_value = None;
    for (key, value) in obj {
        let fv = gql_value_to_filter_value(value, &ValueSink::ObjectField(key.to_string()))?;
        if key.as_str() == pk.name {
            key_value = Some(fv);
        } else {
            set.insert(key.to_string(), fv);
        }
    }
    match key_value {
        Some(v) => Ok((v, set)),
        None if key_required => Err(CoreError::validation(format!("{}.update requires `{}`", table.graphql_name, pk.name))),
        None => Err(CoreError::validation(format!("{}.upsert requires `{}`", table.graphql_name, pk.name))),
    }
}

/// Reads whichever of {insert, update, upsert, delete} is present in `args` and compiles the
/// corresponding [`MutationAction`]. Used both for the top-level mutation field's arguments and
/// for each element of a `batch` list, which shares the same four-key shape.
fn single_action_from_args(table: &Table, args: &IndexMap<Name, GqlValue>) -> Result<MutationAction, CoreError> {
    if let Some(GqlValue::Object(obj)) = args.get(&Name::new("insert")) {
        return Ok(MutationAction::Insert { rows: vec![row_values_from_object(obj)?] });
    }
    if let Some(GqlValue::Object(obj)) = args.get(&Name::new("update")) {
        let (key_value, set) = split_key_and_set(table, obj, true)?;
        return Ok(MutationAction::Update { key_column: pk_name(table)?, key_value, set });
    }
    if let Some(GqlValue::Object(obj)) = args.get(&Name::new("upsert")) {
        let (key_value, set) = split_key_and_set(table, obj, false)?;
        return Ok(MutationAction::Upsert { key_column: pk_name(table)?, key_value, set });
    }
    if let Some(delete_value) = args.get(&Name::new("delete")) {
        let key_value = gql_value_to_filter_value(delete_value, &ValueSink::ObjectField("delete".to_string()))?;
        return Ok(MutationAction::Delete { key_column: pk_name(table)?, key_value });
    }
    Err(CoreError::validation(format!(
        "{}: exactly one of insert, update, upsert, delete, batch must be given",
        table.graphql_name
    )))
}

/// Compiles a heterogeneous batch and executes it as one shared transaction (see
/// [`mutation::execute_batch`]): every element observes the ones before it in list order,
/// and the first failing element rolls back everything already applied in the batch.
async fn run_batch(db: &DbPool, dialect: &dyn Dialect, table: &Table, items: &[GqlValue]) -> Result<MutationOutcome, CoreError> {
    let max = table.batch_max_size();
    if items.len() > max {
        return Err(CoreError::validation(format!(
            "batch of {} actions exceeds {}'s batch-max-size of {max}",
            items.len(),
            table.graphql_name
        )));
    }
    let actions = items
        .iter()
        .map(|item| {
            let GqlValue::Object(obj) = item else {
                return Err(CoreError::validation("batch item must be an object"));
            };
            single_action_from_args(table, obj)
        })
        .collect::<Result<Vec<_>, _>>()?;
    mutation::execute_batch(db, dialect, table, actions).await
}

async fn run_mutation(db: &DbPool, dialect: &dyn Dialect, table: &Table, args: &IndexMap<Name, GqlValue>) -> Result<MutationOutcome, CoreError> {
    if let Some(GqlValue::List(items)) = args.get(&Name::new("batch")) {
        return run_batch(db, dialect, table, items).await;
    }
    mutation::execute(db, dialect, table, single_action_from_args(table, args)?).await
}

fn mutation_field(
    model: Arc<Model>,
    db: DbPool,
    dialect: Arc<dyn Dialect>,
    table_id: TableId,
    table: &Table,
    field_name: String,
) -> Field {
    let result_type = result_object_name(table);
    Field::new(field_name, TypeRef::named(result_type), move |ctx| {
        let model = model.clone();
        let db = db.clone();
        let dialect = dialect.clone();
        FieldFuture::new(async move {
            require_auth(&ctx)?;
            let table = model.table(table_id);
            let args = ctx.args.as_index_map().clone();
            let outcome = run_mutation(&db, dialect.as_ref(), table, &args).await?;
            Ok(Some(FieldValue::owned_any(outcome)))
        })
    })
    .argument(InputValue::new("insert", TypeRef::named(format!("{}InsertInput", table.graphql_name))))
    .argument(InputValue::new("update", TypeRef::named(format!("{}UpdateInput", table.graphql_name))))
    .argument(InputValue::new("upsert", TypeRef::named(format!("{}UpsertInput", table.graphql_name))))
    .argument(InputValue::new("delete", TypeRef::named(pk_scalar(table))))
    .argument(InputValue::new("batch", TypeRef::named_nn_list_nn(format!("{}BatchItem", table.graphql_name))))
}

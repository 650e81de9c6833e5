//! C6 SQL Emitter: turns a [`Plan`](crate::plan::Plan) into one SELECT per table. No statement's
//! parameters depend on another's result, so the batch is dispatched as concurrent, independent
//! queries against the pool rather than one chained multi-statement round trip — sqlx and
//! tiberius expose no common batching primitive across Postgres and SQL Server, so concurrent
//! dispatch is how this crate gets the same parallelism without pool-specific batch syntax.
//! Joins are resolved afterwards, in memory, by the [`RowGraph`](crate::rowgraph::RowGraph)
//! matching `own_column`/`other_column` pairs.

use futures::future::try_join_all;
use indexmap::IndexMap;

use crate::db::DbPool;
use crate::dialect::{Dialect, ParamValue};
use crate::error::CoreError;
use crate::filter::compile_condition;
use crate::model::{DataType, Model};
use crate::plan::{Plan, TableSql};
use crate::rowgraph::{CellValue, ResultSet, RowGraph};

#[derive(Debug, Clone)]
pub struct EmittedStatement {
    pub sql: String,
    pub params: Vec<ParamValue>,
    pub column_types: Vec<DataType>,
}

/// Build one statement per plan node, keyed by the node's join-name chain — the same keys
/// [`RowGraph`] will be indexed by once the batch executes.
pub fn emit_batch(model: &Model, dialect: &dyn Dialect, plan: &Plan) -> Result<IndexMap<String, EmittedStatement>, CoreError> {
    let mut out = IndexMap::new();
    for node in &plan.nodes {
        out.insert(node.join_name.clone(), emit_statement(model, dialect, plan, node)?);
    }
    Ok(out)
}

/// Columns a node's SELECT must carry: what GraphQL asked for, plus whatever correlation
/// columns its joins (as either parent or child side) need for in-memory matching.
fn required_columns(plan: &Plan, node: &TableSql) -> Vec<String> {
    let mut cols = node.requested_columns.clone();
    for join in &node.joins {
        if !cols.contains(&join.own_column) {
            cols.push(join.own_column.clone());
        }
    }
    for join in plan.nodes.iter().flat_map(|n| n.joins.iter()).filter(|j| j.child == node.id) {
        if !cols.contains(&join.other_column) {
            cols.push(join.other_column.clone());
        }
    }
    cols
}

fn emit_statement(model: &Model, dialect: &dyn Dialect, plan: &Plan, node: &TableSql) -> Result<EmittedStatement, CoreError> {
    let table = model.table(node.table);
    let mut cols = required_columns(plan, node);
    if cols.is_empty() {
        if let Some(pk) = table.primary_key() {
            cols.push(pk.name.clone());
        } else if let Some(first) = table.columns.first() {
            cols.push(first.name.clone());
        }
    }

    let column_types: Vec<DataType> = cols
        .iter()
        .map(|name| table.column(name).map(|c| c.data_type).unwrap_or(DataType::Varchar))
        .collect();

    let select_list = cols
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let table_sql = format!(
        "{}.{}",
        dialect.quote_ident(&table.db_schema),
        dialect.quote_ident(&table.db_name)
    );

    let mut params = Vec::new();
    let mut next_index = 0usize;
    let mut where_clauses = Vec::new();

    for filter in &node.filters {
        let column_sql = dialect.quote_ident(&filter.column);
        let pred = compile_condition(dialect, &column_sql, &filter.operator, filter.value.clone(), || {
            let p = dialect.param_placeholder(next_index);
            next_index += 1;
            p
        })?;
        where_clauses.push(pred.sql);
        params.extend(pred.params);
    }

    let mut sql = format!("SELECT {select_list} FROM {table_sql}");
    if !where_clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clauses.join(" AND "));
    }

    sql.push_str(" ORDER BY ");
    if node.sort.is_empty() {
        sql.push_str(dialect.deterministic_order_by());
    } else {
        let order = node
            .sort
            .iter()
            .map(|s| format!("{} {}", dialect.quote_ident(&s.column), if s.ascending { "ASC" } else { "DESC" }))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&order);
    }

    sql.push(' ');
    sql.push_str(&dialect.limit_offset_clause(node.limit, node.offset));

    Ok(EmittedStatement { sql, params, column_types })
}

/// Execute every statement in the batch and assemble the results into one [`RowGraph`].
pub async fn execute_batch(db: &DbPool, statements: IndexMap<String, EmittedStatement>) -> Result<RowGraph, CoreError> {
    let tasks = statements.into_iter().map(|(key, stmt)| async move {
        let result_set = run_one(db, &stmt).await?;
        Ok::<_, CoreError>((key, result_set))
    });
    let sets = try_join_all(tasks).await?;
    Ok(RowGraph::new(sets.into_iter().collect()))
}

async fn run_one(db: &DbPool, stmt: &EmittedStatement) -> Result<ResultSet, CoreError> {
    match db {
        DbPool::Postgres(pool) => run_postgres(pool, stmt).await,
        #[cfg(feature = "mssql")]
        DbPool::Mssql(pool) => run_mssql(pool, stmt).await,
    }
}

async fn run_postgres(pool: &sqlx::PgPool, stmt: &EmittedStatement) -> Result<ResultSet, CoreError> {
    use sqlx::{Arguments, Row};

    let mut args = sqlx::postgres::PgArguments::default();
    for p in &stmt.params {
        match p {
            ParamValue::Null => args.add(Option::<String>::None),
            ParamValue::Bool(b) => args.add(*b),
            ParamValue::Int(i) => args.add(*i),
            ParamValue::Float(f) => args.add(*f),
            ParamValue::Text(s) => args.add(s.clone()),
        }
        .map_err(|e| CoreError::Internal(anyhow::anyhow!(e.to_string())))?;
    }

    let rows = sqlx::query_with(&stmt.sql, args)
        .fetch_all(pool)
        .await
        .map_err(CoreError::Database)?;

    let columns: Vec<String> = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut out_rows = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut cells = Vec::with_capacity(stmt.column_types.len());
        for (i, data_type) in stmt.column_types.iter().enumerate() {
            cells.push(decode_pg_cell(row, i, *data_type)?);
        }
        out_rows.push(cells);
    }
    Ok(ResultSet::new(columns, out_rows))
}

fn decode_pg_cell(row: &sqlx::postgres::PgRow, idx: usize, data_type: DataType) -> Result<CellValue, CoreError> {
    use sqlx::Row;
    let wrap = |e: sqlx::Error| CoreError::Database(e);
    Ok(match data_type {
        DataType::Bit => row.try_get::<Option<bool>, _>(idx).map_err(wrap)?.map(CellValue::Bool).unwrap_or(CellValue::Null),
        DataType::Int | DataType::SmallInt | DataType::TinyInt | DataType::BigInt => row
            .try_get::<Option<i64>, _>(idx)
            .map_err(wrap)?
            .map(CellValue::Int)
            .unwrap_or(CellValue::Null),
        DataType::Decimal | DataType::Money | DataType::Float | DataType::Real => row
            .try_get::<Option<f64>, _>(idx)
            .map_err(wrap)?
            .map(CellValue::Float)
            .unwrap_or(CellValue::Null),
        DataType::DateTime | DataType::DateTime2 => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .map_err(wrap)?
            .map(|dt| CellValue::Text(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(CellValue::Null),
        DataType::DateTimeOffset => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .map_err(wrap)?
            .map(|dt| CellValue::Text(dt.to_rfc3339()))
            .unwrap_or(CellValue::Null),
        DataType::UniqueIdentifier => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map_err(wrap)?
            .map(|u| CellValue::Text(u.to_string()))
            .unwrap_or(CellValue::Null),
        // Blob columns aren't materialised into cell values; no field in the generated schema
        // ever requests one.
        DataType::Binary | DataType::VarBinary | DataType::Image => CellValue::Null,
        _ => row
            .try_get::<Option<String>, _>(idx)
            .map_err(wrap)?
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
    })
}

#[cfg(feature = "mssql")]
pub(crate) enum MssqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[cfg(feature = "mssql")]
impl From<&ParamValue> for MssqlParam {
    fn from(v: &ParamValue) -> Self {
        match v {
            ParamValue::Null => MssqlParam::Null,
            ParamValue::Bool(b) => MssqlParam::Bool(*b),
            ParamValue::Int(i) => MssqlParam::Int(*i),
            ParamValue::Float(f) => MssqlParam::Float(*f),
            ParamValue::Text(s) => MssqlParam::Text(s.clone()),
        }
    }
}

#[cfg(feature = "mssql")]
impl tiberius::ToSql for MssqlParam {
    fn to_sql(&self) -> tiberius::ColumnData<'_> {
        match self {
            MssqlParam::Null => tiberius::ColumnData::I32(None),
            MssqlParam::Bool(b) => tiberius::ColumnData::Bit(Some(*b)),
            MssqlParam::Int(i) => tiberius::ColumnData::I64(Some(*i)),
            MssqlParam::Float(f) => tiberius::ColumnData::F64(Some(*f)),
            MssqlParam::Text(s) => tiberius::ColumnData::String(Some(s.as_str().into())),
        }
    }
}

#[cfg(feature = "mssql")]
async fn run_mssql(pool: &crate::db::MssqlPool, stmt: &EmittedStatement) -> Result<ResultSet, CoreError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| CoreError::Internal(anyhow::anyhow!(e.to_string())))?;

    let owned: Vec<MssqlParam> = stmt.params.iter().map(MssqlParam::from).collect();
    let refs: Vec<&dyn tiberius::ToSql> = owned.iter().map(|p| p as &dyn tiberius::ToSql).collect();

    let stream = conn
        .query(&stmt.sql, &refs)
        .await
        .map_err(|e| CoreError::Internal(e.into()))?;
    let rows = stream
        .into_first_result()
        .await
        .map_err(|e| CoreError::Internal(e.into()))?;

    let columns: Vec<String> = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut out_rows = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut cells = Vec::with_capacity(stmt.column_types.len());
        for (i, data_type) in stmt.column_types.iter().enumerate() {
            cells.push(decode_mssql_cell(row, i, *data_type));
        }
        out_rows.push(cells);
    }
    Ok(ResultSet::new(columns, out_rows))
}

#[cfg(feature = "mssql")]
fn decode_mssql_cell(row: &tiberius::Row, idx: usize, data_type: DataType) -> CellValue {
    match data_type {
        DataType::Bit => row.get::<bool, _>(idx).map(CellValue::Bool).unwrap_or(CellValue::Null),
        DataType::Int | DataType::SmallInt | DataType::TinyInt => {
            row.get::<i32, _>(idx).map(|v| CellValue::Int(v as i64)).unwrap_or(CellValue::Null)
        }
        DataType::BigInt => row.get::<i64, _>(idx).map(CellValue::Int).unwrap_or(CellValue::Null),
        DataType::Decimal | DataType::Money | DataType::Float | DataType::Real => {
            row.get::<f64, _>(idx).map(CellValue::Float).unwrap_or(CellValue::Null)
        }
        DataType::DateTime | DataType::DateTime2 => row
            .get::<chrono::NaiveDateTime, _>(idx)
            .map(|dt| CellValue::Text(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(CellValue::Null),
        DataType::DateTimeOffset => row
            .get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|dt| CellValue::Text(dt.to_rfc3339()))
            .unwrap_or(CellValue::Null),
        DataType::UniqueIdentifier => row
            .get::<uuid::Uuid, _>(idx)
            .map(|u| CellValue::Text(u.to_string()))
            .unwrap_or(CellValue::Null),
        DataType::Binary | DataType::VarBinary | DataType::Image => CellValue::Null,
        _ => row.get::<&str, _>(idx).map(|s| CellValue::Text(s.to_string())).unwrap_or(CellValue::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;
    use crate::filter::FilterValue;
    use crate::model::{Column, Metadata, Table, TableId};
    use crate::plan::{Plan, TableFilter};

    fn sample_model() -> Model {
        let users = Table {
            db_schema: "public".into(),
            db_name: "Users".into(),
            graphql_name: "Users".into(),
            columns: vec![
                Column { name: "Id".into(), data_type: DataType::Int, is_nullable: false, is_identity: true, is_primary_key: true, metadata: Metadata::new() },
                Column { name: "Name".into(), data_type: DataType::Varchar, is_nullable: false, is_identity: false, is_primary_key: false, metadata: Metadata::new() },
            ],
            join_edges: vec![],
            metadata: Metadata::new(),
        };
        Model::new(vec![users], Metadata::new())
    }

    #[test]
    fn emits_parameterised_where_clause_for_simple_filter() {
        let model = sample_model();
        let dialect = PostgresDialect;
        let mut plan = Plan::default();
        let root = plan.alloc(TableId(0), "root".to_string(), None);
        plan.node_mut(root).requested_columns.push("Name".into());
        plan.node_mut(root).filters.push(TableFilter {
            column: "Name".into(),
            operator: "_eq".into(),
            value: FilterValue::Text("Alice".into()),
        });

        let batch = emit_batch(&model, &dialect, &plan).unwrap();
        let root_stmt = &batch["root"];
        assert!(root_stmt.sql.contains("WHERE \"Name\" = $1"));
        assert_eq!(root_stmt.params, vec![ParamValue::Text("Alice".into())]);
    }

    #[test]
    fn emits_deterministic_order_by_when_no_sort_given() {
        let model = sample_model();
        let dialect = PostgresDialect;
        let mut plan = Plan::default();
        plan.alloc(TableId(0), "root".to_string(), None);
        let batch = emit_batch(&model, &dialect, &plan).unwrap();
        assert!(batch["root"].sql.contains("ORDER BY (SELECT 1)"));
    }
}

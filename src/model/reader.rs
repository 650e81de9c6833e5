//! C2 Schema Reader: turns `information_schema` (plus SQL Server's `sys.*` views, which carry
//! identity/FK detail `information_schema` omits) into the immutable [`Model`](super::Model).
//!
//! A read failure is fatal — the caller (see `services::database`) treats `Err` from
//! [`SchemaReader::read`] as a startup abort, never a degraded-mode fallback.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};

use crate::db::DbPool;
use crate::dialect::{Dialect, PostgresDialect, SqlServerDialect};

use super::{Column, DataType, JoinEdge, Metadata, Model, Table, TableId, db_name_to_graphql_name};

type TableRow = (String, String);
type ColumnRow = (String, String, String, String, String, Option<String>);
type PkRow = (String, String, String);
type FkRow = (String, String, String, String, String, String);

pub struct SchemaReader;

impl SchemaReader {
    pub async fn read(db: &DbPool) -> Result<Model> {
        let model = match db {
            DbPool::Postgres(pool) => read_postgres(pool).await,
            #[cfg(feature = "mssql")]
            DbPool::Mssql(pool) => read_mssql(pool).await,
        }
        .context("schema introspection failed")?;

        if model.tables().next().is_none() {
            anyhow::bail!("schema introspection returned zero tables");
        }
        Ok(model)
    }
}

async fn read_postgres(pool: &sqlx::PgPool) -> Result<Model> {
    let dialect = PostgresDialect;

    let tables: Vec<TableRow> = sqlx::query_as(
        "SELECT table_schema, table_name FROM information_schema.tables \
         WHERE table_type = 'BASE TABLE' \
           AND table_schema NOT IN ('pg_catalog', 'information_schema')",
    )
    .fetch_all(pool)
    .await
    .context("listing postgres tables")?;

    let columns: Vec<ColumnRow> = sqlx::query_as(
        "SELECT table_schema, table_name, column_name, data_type, is_nullable, column_default \
         FROM information_schema.columns \
         WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
         ORDER BY table_schema, table_name, ordinal_position",
    )
    .fetch_all(pool)
    .await
    .context("listing postgres columns")?;

    let primary_keys: Vec<PkRow> = sqlx::query_as(
        "SELECT tc.table_schema, tc.table_name, kcu.column_name \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
         WHERE tc.constraint_type = 'PRIMARY KEY'",
    )
    .fetch_all(pool)
    .await
    .context("listing postgres primary keys")?;

    let foreign_keys: Vec<FkRow> = sqlx::query_as(
        "SELECT kcu.table_schema, kcu.table_name, kcu.column_name, \
                ccu.table_schema, ccu.table_name, ccu.column_name \
         FROM information_schema.referential_constraints rc \
         JOIN information_schema.key_column_usage kcu \
           ON rc.constraint_name = kcu.constraint_name AND rc.constraint_schema = kcu.table_schema \
         JOIN information_schema.constraint_column_usage ccu \
           ON rc.unique_constraint_name = ccu.constraint_name \
              AND rc.unique_constraint_schema = ccu.table_schema",
    )
    .fetch_all(pool)
    .await
    .context("listing postgres foreign keys")?;

    build_model(&dialect, tables, columns, primary_keys, foreign_keys, &HashMap::new())
}

#[cfg(feature = "mssql")]
async fn read_mssql(pool: &crate::db::MssqlPool) -> Result<Model> {
    use crate::db::mssql_pool::MssqlClient;

    async fn fetch_rows(conn: &mut MssqlClient, sql: &str, arity: usize) -> Result<Vec<Vec<Option<String>>>> {
        let stream = conn.simple_query(sql).await.context("running introspection query")?;
        let rows = stream.into_first_result().await.context("collecting introspection rows")?;
        Ok(rows
            .into_iter()
            .map(|row| (0..arity).map(|i| row.get::<&str, _>(i).map(str::to_owned)).collect())
            .collect())
    }

    fn req(row: &[Option<String>], i: usize) -> String {
        row.get(i).cloned().flatten().unwrap_or_default()
    }

    let dialect = SqlServerDialect;
    let mut conn = pool.get().await.context("acquiring sql server connection")?;

    let tables: Vec<TableRow> = fetch_rows(
        &mut conn,
        "SELECT table_schema, table_name FROM information_schema.tables \
         WHERE table_type = 'BASE TABLE' AND table_schema NOT IN ('sys', 'INFORMATION_SCHEMA')",
        2,
    )
    .await?
    .into_iter()
    .map(|r| (req(&r, 0), req(&r, 1)))
    .collect();

    let columns: Vec<ColumnRow> = fetch_rows(
        &mut conn,
        "SELECT table_schema, table_name, column_name, data_type, is_nullable, column_default \
         FROM information_schema.columns \
         WHERE table_schema NOT IN ('sys', 'INFORMATION_SCHEMA') \
         ORDER BY table_schema, table_name, ordinal_position",
        6,
    )
    .await?
    .into_iter()
    .map(|r| (req(&r, 0), req(&r, 1), req(&r, 2), req(&r, 3), req(&r, 4), r.get(5).cloned().flatten()))
    .collect();

    let primary_keys: Vec<PkRow> = fetch_rows(
        &mut conn,
        "SELECT tc.table_schema, tc.table_name, kcu.column_name \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
         WHERE tc.constraint_type = 'PRIMARY KEY'",
        3,
    )
    .await?
    .into_iter()
    .map(|r| (req(&r, 0), req(&r, 1), req(&r, 2)))
    .collect();

    let foreign_keys: Vec<FkRow> = fetch_rows(
        &mut conn,
        "SELECT fk_schema.name, fk_tab.name, fk_col.name, pk_schema.name, pk_tab.name, pk_col.name \
         FROM sys.foreign_key_columns fkc \
         JOIN sys.tables fk_tab ON fkc.parent_object_id = fk_tab.object_id \
         JOIN sys.schemas fk_schema ON fk_tab.schema_id = fk_schema.schema_id \
         JOIN sys.columns fk_col \
           ON fkc.parent_object_id = fk_col.object_id AND fkc.parent_column_id = fk_col.column_id \
         JOIN sys.tables pk_tab ON fkc.referenced_object_id = pk_tab.object_id \
         JOIN sys.schemas pk_schema ON pk_tab.schema_id = pk_schema.schema_id \
         JOIN sys.columns pk_col \
           ON fkc.referenced_object_id = pk_col.object_id AND fkc.referenced_column_id = pk_col.column_id",
        6,
    )
    .await?
    .into_iter()
    .map(|r| (req(&r, 0), req(&r, 1), req(&r, 2), req(&r, 3), req(&r, 4), req(&r, 5)))
    .collect();

    let identity_extra: HashMap<(String, String), String> = fetch_rows(
        &mut conn,
        "SELECT t.name, c.name, CAST(COLUMNPROPERTY(c.object_id, c.name, 'IsIdentity') AS VARCHAR) \
         FROM sys.columns c JOIN sys.tables t ON c.object_id = t.object_id",
        3,
    )
    .await?
    .into_iter()
    .map(|r| ((req(&r, 0), req(&r, 1)), req(&r, 2)))
    .collect();

    build_model(&dialect, tables, columns, primary_keys, foreign_keys, &identity_extra)
}

/// Assemble a [`Model`] from raw introspection rows. Shared by both backends so the
/// dialect-specific readers differ only in how they fetch rows, never in how they're folded.
fn build_model(
    dialect: &dyn Dialect,
    tables: Vec<TableRow>,
    columns: Vec<ColumnRow>,
    primary_keys: Vec<PkRow>,
    foreign_keys: Vec<FkRow>,
    identity_extra: &HashMap<(String, String), String>,
) -> Result<Model> {
    let pk_set: HashSet<(String, String, String)> = primary_keys.into_iter().collect();
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut built: Vec<Table> = Vec::with_capacity(tables.len());

    for (schema, name) in &tables {
        index.insert((schema.clone(), name.clone()), built.len());
        built.push(Table {
            db_schema: schema.clone(),
            db_name: name.clone(),
            graphql_name: db_name_to_graphql_name(name),
            columns: Vec::new(),
            join_edges: Vec::new(),
            metadata: Metadata::new(),
        });
    }

    for (schema, table, column, data_type, is_nullable, column_default) in columns {
        let Some(&idx) = index.get(&(schema.clone(), table.clone())) else {
            continue;
        };
        let is_primary_key = pk_set.contains(&(schema.clone(), table.clone(), column.clone()));
        let extra = identity_extra.get(&(table.clone(), column.clone())).map(String::as_str);
        let is_identity = dialect.is_identity_column(column_default.as_deref(), extra);
        built[idx].columns.push(Column {
            name: column,
            data_type: DataType::from_sql_type_name(&data_type),
            is_nullable: is_nullable.eq_ignore_ascii_case("yes"),
            is_identity,
            is_primary_key,
            metadata: Metadata::new(),
        });
    }

    for (schema, table, column, ref_schema, ref_table, ref_column) in foreign_keys {
        let (Some(&child_idx), Some(&parent_idx)) = (
            index.get(&(schema, table)),
            index.get(&(ref_schema, ref_table)),
        ) else {
            continue;
        };
        built[parent_idx].join_edges.push(JoinEdge {
            parent_table: TableId(parent_idx),
            parent_column: ref_column,
            child_table: TableId(child_idx),
            child_column: column,
        });
    }

    Ok(Model::new(built, Metadata::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_model_wires_fk_as_parent_join_edge() {
        let dialect = PostgresDialect;
        let tables = vec![("public".to_string(), "Users".to_string()), ("public".to_string(), "Departments".to_string())];
        let columns = vec![
            ("public".to_string(), "Users".to_string(), "Id".to_string(), "int".to_string(), "NO".to_string(), Some("nextval('users_id_seq')".to_string())),
            ("public".to_string(), "Users".to_string(), "DepartmentId".to_string(), "int".to_string(), "YES".to_string(), None),
            ("public".to_string(), "Departments".to_string(), "Id".to_string(), "int".to_string(), "NO".to_string(), Some("nextval('departments_id_seq')".to_string())),
        ];
        let pks = vec![
            ("public".to_string(), "Users".to_string(), "Id".to_string()),
            ("public".to_string(), "Departments".to_string(), "Id".to_string()),
        ];
        let fks = vec![(
            "public".to_string(),
            "Users".to_string(),
            "DepartmentId".to_string(),
            "public".to_string(),
            "Departments".to_string(),
            "Id".to_string(),
        )];

        let model = build_model(&dialect, tables, columns, pks, fks, &HashMap::new()).unwrap();
        let (dept_id, dept) = model.table_by_db_name("Departments").unwrap();
        assert_eq!(dept.join_edges.len(), 1);
        assert_eq!(dept.join_edges[0].parent_table, dept_id);
        let (_, users) = model.table_by_db_name("Users").unwrap();
        assert!(users.primary_key().unwrap().is_identity);
    }

    #[test]
    fn columns_for_unknown_table_are_skipped() {
        let dialect = PostgresDialect;
        let tables = vec![("public".to_string(), "Users".to_string())];
        let columns = vec![(
            "public".to_string(),
            "Ghost".to_string(),
            "Id".to_string(),
            "int".to_string(),
            "NO".to_string(),
            None,
        )];
        let model = build_model(&dialect, tables, columns, vec![], vec![], &HashMap::new()).unwrap();
        let (_, users) = model.table_by_db_name("Users").unwrap();
        assert!(users.columns.is_empty());
    }
}

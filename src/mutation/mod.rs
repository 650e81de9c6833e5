//! C8 Mutation Compiler: insert/update/upsert/delete a table (optionally as a batch, in one
//! transaction, rolling back on any row's failure), emitting parameterised SQL the same way
//! the Filter Compiler and SQL Emitter do — no value is ever interpolated as literal text.

use indexmap::IndexMap;

use crate::db::DbPool;
use crate::dialect::{Dialect, ParamValue};
use crate::error::CoreError;
use crate::filter::FilterValue;
use crate::model::Table;

/// One row's column -> value assignment for insert/update.
pub type RowValues = IndexMap<String, FilterValue>;

#[derive(Debug, Clone)]
pub enum MutationAction {
    Insert { rows: Vec<RowValues> },
    Update { key_column: String, key_value: FilterValue, set: RowValues },
    Upsert { key_column: String, key_value: FilterValue, set: RowValues },
    Delete { key_column: String, key_value: FilterValue },
}

#[derive(Debug, Clone, Default)]
pub struct MutationOutcome {
    /// One entry per affected row, in input order; `None` when the action has no identity to
    /// report back (update/delete, or insert into a table without a single-column PK).
    pub identities: Vec<Option<ParamValue>>,
    pub rows_affected: u64,
}

/// Compiles and executes a single `action` against `table` in its own transaction.
pub async fn execute(db: &DbPool, dialect: &dyn Dialect, table: &Table, action: MutationAction) -> Result<MutationOutcome, CoreError> {
    with_transaction(db, |tx| Box::pin(async move { execute_action_tx(tx, dialect, table, action).await })).await
}

/// Executes every action in `actions` inside one shared transaction, in order, rolling back
/// all of them if any fails — the caller (batch mutations) observes the whole list as one
/// atomic unit, and earlier items in the list are visible to later ones via normal read-your-
/// writes transaction semantics.
pub async fn execute_batch(db: &DbPool, dialect: &dyn Dialect, table: &Table, actions: Vec<MutationAction>) -> Result<MutationOutcome, CoreError> {
    with_transaction(db, |tx| {
        Box::pin(async move {
            let mut outcome = MutationOutcome::default();
            for action in actions {
                let item_outcome = execute_action_tx(tx, dialect, table, action).await?;
                outcome.identities.extend(item_outcome.identities);
                outcome.rows_affected += item_outcome.rows_affected;
            }
            Ok(outcome)
        })
    })
    .await
}

async fn execute_action_tx(tx: &mut dyn Tx, dialect: &dyn Dialect, table: &Table, action: MutationAction) -> Result<MutationOutcome, CoreError> {
    match action {
        MutationAction::Insert { rows } => execute_insert_tx(tx, dialect, table, rows).await,
        MutationAction::Update { key_column, key_value, set } => {
            execute_update_tx(tx, dialect, table, &key_column, key_value, set).await
        }
        MutationAction::Upsert { key_column, key_value, set } => {
            execute_upsert_tx(tx, dialect, table, &key_column, key_value, set).await
        }
        MutationAction::Delete { key_column, key_value } => execute_delete_tx(tx, dialect, table, &key_column, key_value).await,
    }
}

fn compile_insert_one(dialect: &dyn Dialect, table: &Table, row: &RowValues) -> Result<(String, Vec<ParamValue>), CoreError> {
    if row.is_empty() {
        return Err(CoreError::validation(format!("insert into {} has no column values", table.graphql_name)));
    }
    let mut cols = Vec::with_capacity(row.len());
    let mut placeholders = Vec::with_capacity(row.len());
    let mut params = Vec::with_capacity(row.len());
    for (i, (col, val)) in row.iter().enumerate() {
        if table.column(col).is_none() {
            return Err(CoreError::validation(format!("unknown column `{col}` on {}", table.graphql_name)));
        }
        cols.push(dialect.quote_ident(col));
        placeholders.push(dialect.param_placeholder(i));
        params.push(filter_value_to_param(val.clone()));
    }
    let sql = format!(
        "INSERT INTO {}.{} ({}) VALUES ({})",
        dialect.quote_ident(&table.db_schema),
        dialect.quote_ident(&table.db_name),
        cols.join(", "),
        placeholders.join(", ")
    );
    Ok((sql, params))
}

async fn execute_insert_tx(tx: &mut dyn Tx, dialect: &dyn Dialect, table: &Table, rows: Vec<RowValues>) -> Result<MutationOutcome, CoreError> {
    let max = table.batch_max_size();
    if rows.len() > max {
        return Err(CoreError::validation(format!(
            "batch of {} rows exceeds {}'s batch-max-size of {max}",
            rows.len(),
            table.graphql_name
        )));
    }

    let identity_column = table.primary_key().filter(|c| c.is_identity).map(|c| c.name.clone());
    let mut outcome = MutationOutcome::default();

    for row in &rows {
        let (sql, params) = compile_insert_one(dialect, table, row)?;
        tx.execute(&sql, &params).await?;
        let identity = if identity_column.is_some() {
            tx.execute_scalar(dialect.last_identity_expr(), &[]).await?
        } else {
            None
        };
        outcome.identities.push(identity);
        outcome.rows_affected += 1;
    }

    Ok(outcome)
}

async fn execute_update_tx(
    tx: &mut dyn Tx,
    dialect: &dyn Dialect,
    table: &Table,
    key_column: &str,
    key_value: FilterValue,
    set: RowValues,
) -> Result<MutationOutcome, CoreError> {
    if set.is_empty() {
        return Err(CoreError::validation(format!("update on {} sets no columns", table.graphql_name)));
    }
    let not_found_msg = format!("{}.{key_column} = {key_value:?}", table.graphql_name);
    let mut assignments = Vec::with_capacity(set.len());
    let mut params = Vec::with_capacity(set.len() + 1);
    for (i, (col, val)) in set.iter().enumerate() {
        if table.column(col).is_none() {
            return Err(CoreError::validation(format!("unknown column `{col}` on {}", table.graphql_name)));
        }
        assignments.push(format!("{} = {}", dialect.quote_ident(col), dialect.param_placeholder(i)));
        params.push(filter_value_to_param(val.clone()));
    }
    let key_placeholder = dialect.param_placeholder(params.len());
    params.push(filter_value_to_param(key_value));
    let sql = format!(
        "UPDATE {}.{} SET {} WHERE {} = {key_placeholder}",
        dialect.quote_ident(&table.db_schema),
        dialect.quote_ident(&table.db_name),
        assignments.join(", "),
        dialect.quote_ident(key_column),
    );

    let rows_affected = tx.execute(&sql, &params).await?;
    if rows_affected == 0 {
        return Err(CoreError::NotFound(not_found_msg));
    }
    Ok(MutationOutcome { identities: vec![None], rows_affected })
}

async fn execute_upsert_tx(
    tx: &mut dyn Tx,
    dialect: &dyn Dialect,
    table: &Table,
    key_column: &str,
    key_value: FilterValue,
    set: RowValues,
) -> Result<MutationOutcome, CoreError> {
    let exists_sql = format!(
        "SELECT 1 FROM {}.{} WHERE {} = {}",
        dialect.quote_ident(&table.db_schema),
        dialect.quote_ident(&table.db_name),
        dialect.quote_ident(key_column),
        dialect.param_placeholder(0),
    );
    let key_param = filter_value_to_param(key_value.clone());
    let found = tx.execute_scalar(&exists_sql, &[key_param]).await?.is_some();

    if found {
        execute_update_tx(tx, dialect, table, key_column, key_value, set).await
    } else {
        let mut row = set;
        row.insert(key_column.to_string(), key_value);
        execute_insert_tx(tx, dialect, table, vec![row]).await
    }
}

async fn execute_delete_tx(
    tx: &mut dyn Tx,
    dialect: &dyn Dialect,
    table: &Table,
    key_column: &str,
    key_value: FilterValue,
) -> Result<MutationOutcome, CoreError> {
    let not_found_msg = format!("{}.{key_column} = {key_value:?}", table.graphql_name);
    let sql = format!(
        "DELETE FROM {}.{} WHERE {} = {}",
        dialect.quote_ident(&table.db_schema),
        dialect.quote_ident(&table.db_name),
        dialect.quote_ident(key_column),
        dialect.param_placeholder(0),
    );
    let param = filter_value_to_param(key_value);
    let rows_affected = tx.execute(&sql, &[param]).await?;
    if rows_affected == 0 {
        return Err(CoreError::NotFound(not_found_msg));
    }
    Ok(MutationOutcome { identities: vec![None], rows_affected })
}

fn filter_value_to_param(v: FilterValue) -> ParamValue {
    match v {
        FilterValue::Null => ParamValue::Null,
        FilterValue::Bool(b) => ParamValue::Bool(b),
        FilterValue::Int(i) => ParamValue::Int(i),
        FilterValue::Float(f) => ParamValue::Float(f),
        FilterValue::Text(s) => ParamValue::Text(s),
        FilterValue::List(_) => ParamValue::Null,
    }
}

/// A single open transaction, abstracted over both backends so the mutation-action functions
/// above never branch on which database they're talking to.
pub(crate) trait Tx {
    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [ParamValue]) -> futures::future::BoxFuture<'a, Result<u64, CoreError>>;
    fn execute_scalar<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [ParamValue],
    ) -> futures::future::BoxFuture<'a, Result<Option<ParamValue>, CoreError>>;
}

/// Runs `body` inside one transaction, committing on `Ok` and rolling back on `Err` — the
/// whole point of batching mutations is that a failure partway through undoes everything
/// already applied in that batch.
async fn with_transaction<F, T>(db: &DbPool, body: F) -> Result<T, CoreError>
where
    F: for<'a> FnOnce(&'a mut dyn Tx) -> futures::future::BoxFuture<'a, Result<T, CoreError>>,
{
    match db {
        DbPool::Postgres(pool) => {
            let mut pg_tx = pool.begin().await.map_err(CoreError::Database)?;
            let mut wrapper = PgTx { tx: &mut pg_tx };
            let result = body(&mut wrapper).await;
            match result {
                Ok(value) => {
                    pg_tx.commit().await.map_err(CoreError::Database)?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = pg_tx.rollback().await;
                    Err(e)
                }
            }
        }
        #[cfg(feature = "mssql")]
        DbPool::Mssql(pool) => {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| CoreError::Internal(anyhow::anyhow!(e.to_string())))?;
            conn.simple_query("BEGIN TRANSACTION")
                .await
                .map_err(|e| CoreError::Internal(e.into()))?
                .into_results()
                .await
                .map_err(|e| CoreError::Internal(e.into()))?;
            let mut wrapper = MssqlTx { conn: &mut conn };
            let result = body(&mut wrapper).await;
            let finish = if result.is_ok() { "COMMIT TRANSACTION" } else { "ROLLBACK TRANSACTION" };
            conn.simple_query(finish)
                .await
                .map_err(|e| CoreError::Internal(e.into()))?
                .into_results()
                .await
                .map_err(|e| CoreError::Internal(e.into()))?;
            result
        }
    }
}

struct PgTx<'c> {
    tx: &'c mut sqlx::Transaction<'static, sqlx::Postgres>,
}

impl Tx for PgTx<'_> {
    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [ParamValue]) -> futures::future::BoxFuture<'a, Result<u64, CoreError>> {
        Box::pin(async move {
            use sqlx::Arguments;
            let mut args = sqlx::postgres::PgArguments::default();
            for p in params {
                bind_pg(&mut args, p)?;
            }
            let result = sqlx::query_with(sql, args)
                .execute(&mut **self.tx)
                .await
                .map_err(CoreError::Database)?;
            Ok(result.rows_affected())
        })
    }

    fn execute_scalar<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [ParamValue],
    ) -> futures::future::BoxFuture<'a, Result<Option<ParamValue>, CoreError>> {
        Box::pin(async move {
            use sqlx::{Arguments, Row};
            let mut args = sqlx::postgres::PgArguments::default();
            for p in params {
                bind_pg(&mut args, p)?;
            }
            let row = sqlx::query_with(sql, args)
                .fetch_optional(&mut **self.tx)
                .await
                .map_err(CoreError::Database)?;
            Ok(match row {
                Some(r) => r.try_get::<Option<i64>, _>(0).map_err(CoreError::Database)?.map(ParamValue::Int),
                None => None,
            })
        })
    }
}

fn bind_pg(args: &mut sqlx::postgres::PgArguments, p: &ParamValue) -> Result<(), CoreError> {
    use sqlx::Arguments;
    match p {
        ParamValue::Null => args.add(Option::<String>::None),
        ParamValue::Bool(b) => args.add(*b),
        ParamValue::Int(i) => args.add(*i),
        ParamValue::Float(f) => args.add(*f),
        ParamValue::Text(s) => args.add(s.clone()),
    }
    .map_err(|e| CoreError::Internal(anyhow::anyhow!(e.to_string())))
}

#[cfg(feature = "mssql")]
struct MssqlTx<'c> {
    conn: &'c mut crate::db::mssql_pool::MssqlClient,
}

#[cfg(feature = "mssql")]
impl Tx for MssqlTx<'_> {
    fn execute<'a>(&'a mut self, sql: &'a str, params: &'a [ParamValue]) -> futures::future::BoxFuture<'a, Result<u64, CoreError>> {
        Box::pin(async move {
            let owned: Vec<crate::sql::MssqlParam> = params.iter().map(crate::sql::MssqlParam::from).collect();
            let refs: Vec<&dyn tiberius::ToSql> = owned.iter().map(|p| p as &dyn tiberius::ToSql).collect();
            let result = self.conn.execute(sql, &refs).await.map_err(|e| CoreError::Internal(e.into()))?;
            Ok(result.total())
        })
    }

    fn execute_scalar<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [ParamValue],
    ) -> futures::future::BoxFuture<'a, Result<Option<ParamValue>, CoreError>> {
        Box::pin(async move {
            let owned: Vec<crate::sql::MssqlParam> = params.iter().map(crate::sql::MssqlParam::from).collect();
            let refs: Vec<&dyn tiberius::ToSql> = owned.iter().map(|p| p as &dyn tiberius::ToSql).collect();
            let stream = self.conn.query(sql, &refs).await.map_err(|e| CoreError::Internal(e.into()))?;
            let rows = stream.into_first_result().await.map_err(|e| CoreError::Internal(e.into()))?;
            Ok(rows.first().and_then(|r| r.get::<i64, _>(0)).map(ParamValue::Int))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;
    use crate::model::{Column, DataType, Metadata, Table};

    fn sample_table() -> Table {
        Table {
            db_schema: "public".into(),
            db_name: "Users".into(),
            graphql_name: "Users".into(),
            columns: vec![
                Column { name: "Id".into(), data_type: DataType::Int, is_nullable: false, is_identity: true, is_primary_key: true, metadata: Metadata::new() },
                Column { name: "Name".into(), data_type: DataType::Varchar, is_nullable: false, is_identity: false, is_primary_key: false, metadata: Metadata::new() },
            ],
            join_edges: vec![],
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn compile_insert_rejects_unknown_column() {
        let dialect = PostgresDialect;
        let table = sample_table();
        let mut row = RowValues::new();
        row.insert("Nope".into(), FilterValue::Text("x".into()));
        let err = compile_insert_one(&dialect, &table, &row).unwrap_err();
        assert_eq!(err.code(), "validation-error");
    }

    #[test]
    fn compile_insert_binds_every_column() {
        let dialect = PostgresDialect;
        let table = sample_table();
        let mut row = RowValues::new();
        row.insert("Name".into(), FilterValue::Text("Alice".into()));
        let (sql, params) = compile_insert_one(&dialect, &table, &row).unwrap();
        assert_eq!(sql, "INSERT INTO \"public\".\"Users\" (\"Name\") VALUES ($1)");
        assert_eq!(params, vec![ParamValue::Text("Alice".into())]);
    }

    /// Scripted in-memory [`Tx`] for exercising the `_tx` functions without a real database —
    /// `execute` replies with the next queued row count, `execute_scalar` with the next queued
    /// scalar.
    #[derive(Default)]
    struct FakeTx {
        execute_replies: std::collections::VecDeque<u64>,
        scalar_replies: std::collections::VecDeque<Option<ParamValue>>,
    }

    impl Tx for FakeTx {
        fn execute<'a>(&'a mut self, _sql: &'a str, _params: &'a [ParamValue]) -> futures::future::BoxFuture<'a, Result<u64, CoreError>> {
            Box::pin(async move { Ok(self.execute_replies.pop_front().unwrap_or(0)) })
        }

        fn execute_scalar<'a>(
            &'a mut self,
            _sql: &'a str,
            _params: &'a [ParamValue],
        ) -> futures::future::BoxFuture<'a, Result<Option<ParamValue>, CoreError>> {
            Box::pin(async move { Ok(self.scalar_replies.pop_front().flatten()) })
        }
    }

    #[tokio::test]
    async fn update_on_zero_matched_rows_is_not_found() {
        let dialect = PostgresDialect;
        let table = sample_table();
        let mut tx = FakeTx { execute_replies: [0].into(), ..Default::default() };
        let mut set = RowValues::new();
        set.insert("Name".into(), FilterValue::Text("Bob".into()));
        let err = execute_update_tx(&mut tx, &dialect, &table, "Id", FilterValue::Int(404), set).await.unwrap_err();
        assert_eq!(err.code(), "not-found");
    }

    #[tokio::test]
    async fn delete_on_zero_matched_rows_is_not_found() {
        let dialect = PostgresDialect;
        let table = sample_table();
        let mut tx = FakeTx { execute_replies: [0].into(), ..Default::default() };
        let err = execute_delete_tx(&mut tx, &dialect, &table, "Id", FilterValue::Int(404)).await.unwrap_err();
        assert_eq!(err.code(), "not-found");
    }

    #[tokio::test]
    async fn upsert_updates_in_place_when_the_row_already_exists() {
        let dialect = PostgresDialect;
        let table = sample_table();
        let mut tx = FakeTx { scalar_replies: [Some(ParamValue::Int(1))].into(), execute_replies: [1].into() };
        let mut set = RowValues::new();
        set.insert("Name".into(), FilterValue::Text("Bob".into()));
        let outcome = execute_upsert_tx(&mut tx, &dialect, &table, "Id", FilterValue::Int(1), set).await.unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(outcome.identities, vec![None]);
    }

    #[tokio::test]
    async fn upsert_inserts_when_no_row_matches_the_key() {
        let dialect = PostgresDialect;
        let table = sample_table();
        let mut tx = FakeTx { scalar_replies: [None].into(), execute_replies: [1].into() };
        let mut set = RowValues::new();
        set.insert("Name".into(), FilterValue::Text("Bob".into()));
        let outcome = execute_upsert_tx(&mut tx, &dialect, &table, "Id", FilterValue::Int(7), set).await.unwrap();
        assert_eq!(outcome.rows_affected, 1);
    }
}

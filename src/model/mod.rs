//! C2/C3: Schema Reader and Model — the immutable, introspected view of the database.
//!
//! Join edges form cycles (A -> B -> A), so tables are addressed by index (`TableId`)
//! into an arena rather than through owning references, per the cyclic-model-references
//! design note.

mod reader;

pub use reader::SchemaReader;

use std::collections::HashMap;

/// Index into `Model::tables`. Never dereferenced without going through the `Model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub usize);

/// Normalised column data type, independent of the source dialect's spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int,
    SmallInt,
    TinyInt,
    BigInt,
    Decimal,
    Float,
    Real,
    DateTime,
    DateTime2,
    DateTimeOffset,
    Bit,
    Varchar,
    NVarchar,
    Char,
    NChar,
    Binary,
    VarBinary,
    Text,
    NText,
    Image,
    Money,
    UniqueIdentifier,
}

impl DataType {
    /// Map a raw `information_schema.columns.data_type` string to a normalised tag.
    /// Unknown types map to `Varchar` (surfaced as GraphQL `String`), per the data model.
    pub fn from_sql_type_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "int" | "integer" => DataType::Int,
            "smallint" => DataType::SmallInt,
            "tinyint" => DataType::TinyInt,
            "bigint" => DataType::BigInt,
            "decimal" | "numeric" => DataType::Decimal,
            "float" | "double precision" => DataType::Float,
            "real" => DataType::Real,
            "datetime" | "smalldatetime" | "timestamp" | "timestamp without time zone" => {
                DataType::DateTime
            }
            "datetime2" => DataType::DateTime2,
            "datetimeoffset" | "timestamp with time zone" => DataType::DateTimeOffset,
            "bit" | "boolean" | "bool" => DataType::Bit,
            "varchar" | "character varying" => DataType::Varchar,
            "nvarchar" => DataType::NVarchar,
            "char" | "character" => DataType::Char,
            "nchar" => DataType::NChar,
            "binary" => DataType::Binary,
            "varbinary" | "bytea" => DataType::VarBinary,
            "text" => DataType::Text,
            "ntext" => DataType::NText,
            "image" => DataType::Image,
            "money" | "smallmoney" => DataType::Money,
            "uniqueidentifier" | "uuid" => DataType::UniqueIdentifier,
            _ => DataType::Varchar,
        }
    }

    /// GraphQL scalar type name per the column-to-GraphQL type mapping table.
    pub fn graphql_type_name(&self) -> &'static str {
        match self {
            DataType::Int | DataType::SmallInt | DataType::TinyInt | DataType::Money | DataType::Decimal => "Int",
            DataType::BigInt => "BigInt",
            DataType::Float | DataType::Real => "Float",
            DataType::Bit => "Boolean",
            DataType::DateTime | DataType::DateTime2 => "DateTime",
            DataType::DateTimeOffset => "DateTimeOffset",
            DataType::Varchar
            | DataType::NVarchar
            | DataType::Char
            | DataType::NChar
            | DataType::Binary
            | DataType::VarBinary
            | DataType::Text
            | DataType::NText
            | DataType::Image
            | DataType::UniqueIdentifier => "String",
        }
    }
}

/// Case-insensitive string-keyed metadata dictionary (per-table, per-column, or process-wide).
#[derive(Debug, Clone, Default)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub is_nullable: bool,
    pub is_identity: bool,
    pub is_primary_key: bool,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub db_schema: String,
    pub db_name: String,
    pub graphql_name: String,
    pub columns: Vec<Column>,
    /// Outgoing FK edges, i.e. this table is the child side.
    pub join_edges: Vec<JoinEdge>,
    pub metadata: Metadata,
}

impl Table {
    pub fn is_hidden(&self) -> bool {
        self.db_name.starts_with('_')
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// The single-column primary key, if the table has exactly one PK column.
    /// Composite PKs are treated as "no primary key" for insert-identity purposes.
    pub fn primary_key(&self) -> Option<&Column> {
        let mut pks = self.columns.iter().filter(|c| c.is_primary_key);
        let first = pks.next()?;
        if pks.next().is_some() {
            None
        } else {
            Some(first)
        }
    }

    pub fn batch_max_size(&self) -> usize {
        self.metadata.get_usize("batch-max-size", 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Multi,
    Single,
}

/// A foreign-key derived edge: `parent_table.parent_column -> child_table.child_column`.
/// Stored on the *parent* table; `table_id` fields are indices into `Model::tables`.
#[derive(Debug, Clone)]
pub struct JoinEdge {
    pub parent_table: TableId,
    pub parent_column: String,
    pub child_table: TableId,
    pub child_column: String,
}

/// Immutable, introspected schema. Shared via `Arc<Model>`; never mutated after Schema Reader
/// builds it at startup.
#[derive(Debug, Clone, Default)]
pub struct Model {
    tables: Vec<Table>,
    by_graphql_name: HashMap<String, TableId>,
    by_db_name: HashMap<String, TableId>,
    pub metadata: Metadata,
}

impl Model {
    pub fn new(tables: Vec<Table>, metadata: Metadata) -> Self {
        let mut by_graphql_name = HashMap::new();
        let mut by_db_name = HashMap::new();
        for (i, t) in tables.iter().enumerate() {
            by_graphql_name.insert(t.graphql_name.clone(), TableId(i));
            by_db_name.insert(t.db_name.clone(), TableId(i));
        }
        Self {
            tables,
            by_graphql_name,
            by_db_name,
            metadata,
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableId, &Table)> {
        self.tables.iter().enumerate().map(|(i, t)| (TableId(i), t))
    }

    pub fn visible_tables(&self) -> impl Iterator<Item = (TableId, &Table)> {
        self.tables().filter(|(_, t)| !t.is_hidden())
    }

    pub fn table(&self, id: TableId) -> &Table {
        &self.tables[id.0]
    }

    pub fn table_by_graphql_name(&self, name: &str) -> Option<(TableId, &Table)> {
        self.by_graphql_name.get(name).map(|id| (*id, self.table(*id)))
    }

    pub fn table_by_db_name(&self, name: &str) -> Option<(TableId, &Table)> {
        self.by_db_name.get(name).map(|id| (*id, self.table(*id)))
    }

    /// Edges where `table` is the parent (the "one" side) — drives `_join_<child>` fields.
    pub fn join_edges_from(&self, table: TableId) -> &[JoinEdge] {
        &self.table(table).join_edges
    }

    /// Edges where `table` is the child (the FK-holding "many" side) — drives
    /// `_single_<parent>` fields. Computed on demand; schemas are small and this runs once
    /// per plan build, not per row.
    pub fn join_edges_to(&self, table: TableId) -> Vec<&JoinEdge> {
        self.tables
            .iter()
            .flat_map(|t| t.join_edges.iter())
            .filter(|e| e.child_table == table)
            .collect()
    }
}

/// `<dbName>` with spaces replaced by `__`, per the data model.
pub fn db_name_to_graphql_name(db_name: &str) -> String {
    db_name.replace(' ', "__")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> Model {
        let users = Table {
            db_schema: "dbo".into(),
            db_name: "Users".into(),
            graphql_name: "Users".into(),
            columns: vec![
                Column {
                    name: "Id".into(),
                    data_type: DataType::Int,
                    is_nullable: false,
                    is_identity: true,
                    is_primary_key: true,
                    metadata: Metadata::new(),
                },
                Column {
                    name: "DepartmentId".into(),
                    data_type: DataType::Int,
                    is_nullable: true,
                    is_identity: false,
                    is_primary_key: false,
                    metadata: Metadata::new(),
                },
            ],
            join_edges: vec![JoinEdge {
                parent_table: TableId(0),
                parent_column: "DepartmentId".into(),
                child_table: TableId(1),
                child_column: "Id".into(),
            }],
            metadata: Metadata::new(),
        };
        let departments = Table {
            db_schema: "dbo".into(),
            db_name: "Departments".into(),
            graphql_name: "Departments".into(),
            columns: vec![Column {
                name: "Id".into(),
                data_type: DataType::Int,
                is_nullable: false,
                is_identity: true,
                is_primary_key: true,
                metadata: Metadata::new(),
            }],
            join_edges: vec![],
            metadata: Metadata::new(),
        };
        Model::new(vec![users, departments], Metadata::new())
    }

    #[test]
    fn resolves_tables_by_name() {
        let model = sample_model();
        let (id, table) = model.table_by_graphql_name("Users").unwrap();
        assert_eq!(id, TableId(0));
        assert_eq!(table.db_name, "Users");
    }

    #[test]
    fn single_column_pk_detected() {
        let model = sample_model();
        let (_, users) = model.table_by_graphql_name("Users").unwrap();
        assert_eq!(users.primary_key().unwrap().name, "Id");
    }

    #[test]
    fn hidden_tables_start_with_underscore() {
        let mut t = sample_model().table(TableId(0)).clone();
        t.db_name = "_Migrations".into();
        assert!(t.is_hidden());
    }

    #[test]
    fn graphql_name_replaces_spaces() {
        assert_eq!(db_name_to_graphql_name("Order Items"), "Order__Items");
    }
}

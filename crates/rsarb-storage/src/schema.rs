//! Versioned descriptor of the three store tables.
//!
//! Existing store files are validated column by column against these
//! descriptors: name, declared type, not-null flag and primary-key flag, in
//! declaration order.

use sqlx::{Row, SqlitePool};

use crate::StoreError;

/// Written to `PRAGMA user_version` when a store is created.
pub const SCHEMA_VERSION: i64 = 1;

pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the SQLite database header.
pub const SQLITE_HEADER_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub declared_type: &'static str,
    pub not_null: bool,
    pub primary_key: bool,
}

impl ColumnSpec {
    const fn key(name: &'static str) -> Self {
        Self {
            name,
            declared_type: "INTEGER",
            not_null: false,
            primary_key: true,
        }
    }

    const fn text(name: &'static str, not_null: bool) -> Self {
        Self {
            name,
            declared_type: "TEXT",
            not_null,
            primary_key: false,
        }
    }

    const fn integer(name: &'static str) -> Self {
        Self {
            name,
            declared_type: "INTEGER",
            not_null: true,
            primary_key: false,
        }
    }

    fn definition(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.declared_type);
        if self.primary_key {
            sql.push_str(" PRIMARY KEY AUTOINCREMENT");
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        sql
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
}

impl TableSpec {
    pub fn create_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(ColumnSpec::definition)
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({columns})", self.name)
    }

    pub async fn validate(&self, pool: &SqlitePool) -> Result<(), StoreError> {
        let rows = sqlx::query(&format!("PRAGMA table_info('{}')", self.name))
            .fetch_all(pool)
            .await?;

        if rows.is_empty() {
            return Err(self.mismatch("table is missing".to_string()));
        }
        if rows.len() != self.columns.len() {
            return Err(self.mismatch(format!(
                "expected {} columns, found {}",
                self.columns.len(),
                rows.len()
            )));
        }

        for (expected, row) in self.columns.iter().zip(&rows) {
            let name: String = row.try_get("name")?;
            let declared_type: String = row.try_get("type")?;
            let not_null: i64 = row.try_get("notnull")?;
            let primary_key: i64 = row.try_get("pk")?;

            if name != expected.name
                || !declared_type.eq_ignore_ascii_case(expected.declared_type)
                || (not_null != 0) != expected.not_null
                || (primary_key != 0) != expected.primary_key
            {
                return Err(self.mismatch(format!(
                    "column `{}` should be `{}`, found `{name} {declared_type}` (notnull={not_null}, pk={primary_key})",
                    expected.name,
                    expected.definition()
                )));
            }
        }
        Ok(())
    }

    fn mismatch(&self, detail: String) -> StoreError {
        StoreError::SchemaMismatch {
            table: self.name.to_string(),
            detail,
        }
    }
}

pub const CATALOG: TableSpec = TableSpec {
    name: "catalog",
    columns: &[
        ColumnSpec::key("id"),
        ColumnSpec::text("title", true),
        ColumnSpec::text("author", true),
        ColumnSpec::text("identifier_code", true),
        ColumnSpec::text("reference_uri", false),
        ColumnSpec::text("summary", true),
    ],
};

pub const REPLY_LEDGER: TableSpec = TableSpec {
    name: "reply_ledger",
    columns: &[
        ColumnSpec::key("id"),
        ColumnSpec::text("local_id", true),
        ColumnSpec::integer("succeeded"),
    ],
};

pub const OPTED_IN: TableSpec = TableSpec {
    name: "opted_in",
    columns: &[ColumnSpec::key("id"), ColumnSpec::text("identity", true)],
};

pub const TABLES: [TableSpec; 3] = [CATALOG, REPLY_LEDGER, OPTED_IN];

pub async fn create_all(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    for table in TABLES {
        sqlx::query(&table.create_sql()).execute(&mut *tx).await?;
    }
    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn validate_all(pool: &SqlitePool) -> Result<(), StoreError> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    // 0 means the file predates versioning; the column check below still applies.
    if version != 0 && version != SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch {
            table: "*".to_string(),
            detail: format!("store schema version {version}, expected {SCHEMA_VERSION}"),
        });
    }
    for table in TABLES {
        table.validate(pool).await?;
    }
    Ok(())
}

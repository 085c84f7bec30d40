//! SQLite-backed catalog, opt-in roster and reply ledger for RSARB.

pub mod schema;

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rsarb_core::CatalogEntry;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "rsarb-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {table} entry {key:?}")]
    DuplicateEntry { table: &'static str, key: String },
    #[error("catalog entry {0:?} not found")]
    NotFound(String),
    #[error("table {table} does not match the expected schema: {detail}")]
    SchemaMismatch { table: String, detail: String },
    #[error("{} is not a valid sqlite3 file", .0.display())]
    NotASupportedFile(PathBuf),
    #[error("store not found at {}; run with --initialize first", .0.display())]
    Missing(PathBuf),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    /// Duplicate ledger inserts mean an entity was processed twice.
    pub fn is_duplicate_reply(&self) -> bool {
        matches!(self, Self::DuplicateEntry { table, .. } if *table == schema::REPLY_LEDGER.name)
    }
}

/// Added and removed identities from a roster sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Handle over one SQLite connection. The bot is the only writer.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create the store at `path` when absent, otherwise check that the
    /// existing file is a SQLite database with the expected tables.
    pub async fn initialize_schema(path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if file_exists(path).await? {
            check_sqlite_header(path).await?;
            let pool = connect(file_options(path, false)).await?;
            let result = schema::validate_all(&pool).await;
            pool.close().await;
            result?;
            info!(path = %path.display(), "store already initialized; schema matches");
            return Ok(());
        }

        let pool = connect(file_options(path, true)).await?;
        let result = schema::create_all(&pool).await;
        pool.close().await;
        result?;
        info!(path = %path.display(), "created store");
        Ok(())
    }

    /// Open an existing store read/write and validate its schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !file_exists(path).await? {
            return Err(StoreError::Missing(path.to_path_buf()));
        }
        check_sqlite_header(path).await?;
        let pool = connect(file_options(path, false)).await?;
        schema::validate_all(&pool).await?;
        debug!(path = %path.display(), "opened store");
        Ok(Self { pool })
    }

    /// Fresh in-memory store with the schema applied.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = connect(SqliteConnectOptions::from_str("sqlite::memory:")?).await?;
        schema::create_all(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn list_catalog_titles(&self) -> Result<BTreeSet<String>, StoreError> {
        let titles: Vec<String> = sqlx::query_scalar("SELECT title FROM catalog")
            .fetch_all(&self.pool)
            .await?;
        Ok(titles.into_iter().map(|t| t.to_lowercase()).collect())
    }

    /// Case-insensitive lookup by title.
    pub async fn lookup_catalog_entry(&self, title: &str) -> Result<CatalogEntry, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT title, author, identifier_code, reference_uri, summary
              FROM catalog
             WHERE title = ? COLLATE NOCASE
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(title)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return catalog_entry(&row);
        }
        // NOCASE only folds ASCII; titles are lower-cased with full Unicode rules.
        if !title.is_ascii() {
            let wanted = title.to_lowercase();
            let rows = sqlx::query(
                "SELECT title, author, identifier_code, reference_uri, summary FROM catalog ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                if row.try_get::<String, _>("title")?.to_lowercase() == wanted {
                    return catalog_entry(&row);
                }
            }
        }
        Err(StoreError::NotFound(title.to_string()))
    }

    pub async fn add_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError> {
        if self.list_catalog_titles().await?.contains(&entry.title.to_lowercase()) {
            return Err(StoreError::DuplicateEntry {
                table: schema::CATALOG.name,
                key: entry.title.clone(),
            });
        }
        sqlx::query(
            r#"
            INSERT INTO catalog (title, author, identifier_code, reference_uri, summary)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.title)
        .bind(&entry.author)
        .bind(&entry.identifier_code)
        .bind(&entry.reference_uri)
        .bind(&entry.summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_opted_in(&self) -> Result<BTreeSet<String>, StoreError> {
        let users: Vec<String> = sqlx::query_scalar("SELECT identity FROM opted_in")
            .fetch_all(&self.pool)
            .await?;
        Ok(users.into_iter().map(|u| u.to_lowercase()).collect())
    }

    pub async fn add_opted_in(&self, identity: &str) -> Result<(), StoreError> {
        let identity = identity.to_lowercase();
        if self.list_opted_in().await?.contains(&identity) {
            return Err(StoreError::DuplicateEntry {
                table: schema::OPTED_IN.name,
                key: identity,
            });
        }
        sqlx::query("INSERT INTO opted_in (identity) VALUES (?)")
            .bind(&identity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns whether any row was removed.
    pub async fn remove_opted_in(&self, identity: &str) -> Result<bool, StoreError> {
        let wanted = identity.to_lowercase();
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT id, identity FROM opted_in")
            .fetch_all(&mut *tx)
            .await?;
        let mut removed = false;
        for row in rows {
            let stored: String = row.try_get("identity")?;
            if stored.to_lowercase() == wanted {
                let id: i64 = row.try_get("id")?;
                sqlx::query("DELETE FROM opted_in WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                removed = true;
            }
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Make the roster equal `identities` (case-insensitive): insert the
    /// missing ones, delete everything else.
    pub async fn sync_opted_in(&self, identities: &BTreeSet<String>) -> Result<RosterDiff, StoreError> {
        let wanted: BTreeSet<String> = identities.iter().map(|i| i.to_lowercase()).collect();
        let mut diff = RosterDiff::default();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("SELECT id, identity FROM opted_in ORDER BY id")
            .fetch_all(&mut *tx)
            .await?;
        let mut kept = BTreeSet::new();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let identity = row.try_get::<String, _>("identity")?.to_lowercase();
            if wanted.contains(&identity) && kept.insert(identity.clone()) {
                continue;
            }
            sqlx::query("DELETE FROM opted_in WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            diff.removed.push(identity);
        }

        for identity in wanted.difference(&kept) {
            sqlx::query("INSERT INTO opted_in (identity) VALUES (?)")
                .bind(identity)
                .execute(&mut *tx)
                .await?;
            diff.added.push(identity.clone());
        }

        tx.commit().await?;
        Ok(diff)
    }

    pub async fn list_replied(&self) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT local_id FROM reply_ledger")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Outcome recorded for `local_id`, if any.
    pub async fn reply_outcome(&self, local_id: &str) -> Result<Option<bool>, StoreError> {
        let succeeded: Option<i64> =
            sqlx::query_scalar("SELECT succeeded FROM reply_ledger WHERE local_id = ? LIMIT 1")
                .bind(local_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(succeeded.map(|v| v != 0))
    }

    /// Append a ledger entry. A second entry for the same local id is a
    /// double-processing bug and fails with `DuplicateEntry`.
    pub async fn record_reply(&self, local_id: &str, succeeded: bool) -> Result<(), StoreError> {
        if self.insert_reply(local_id, succeeded).await? {
            Ok(())
        } else {
            Err(StoreError::DuplicateEntry {
                table: schema::REPLY_LEDGER.name,
                key: local_id.to_string(),
            })
        }
    }

    /// Like `record_reply`, but an existing entry is left untouched.
    pub async fn record_reply_if_absent(&self, local_id: &str, succeeded: bool) -> Result<bool, StoreError> {
        self.insert_reply(local_id, succeeded).await
    }

    async fn insert_reply(&self, local_id: &str, succeeded: bool) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM reply_ledger WHERE local_id = ? LIMIT 1")
                .bind(local_id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Ok(false);
        }
        sqlx::query("INSERT INTO reply_ledger (local_id, succeeded) VALUES (?, ?)")
            .bind(local_id)
            .bind(i64::from(succeeded))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}

fn catalog_entry(row: &SqliteRow) -> Result<CatalogEntry, StoreError> {
    Ok(CatalogEntry {
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        identifier_code: row.try_get("identifier_code")?,
        reference_uri: row.try_get("reference_uri")?,
        summary: row.try_get("summary")?,
    })
}

fn file_options(path: &Path, create: bool) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
}

async fn connect(options: SqliteConnectOptions) -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn file_exists(path: &Path) -> Result<bool, StoreError> {
    fs::try_exists(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reject anything whose first 100 bytes are not a SQLite header.
pub async fn check_sqlite_header(path: &Path) -> Result<(), StoreError> {
    let mut file = fs::File::open(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut header = [0u8; schema::SQLITE_HEADER_LEN];
    match file.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(StoreError::NotASupportedFile(path.to_path_buf()));
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }
    if &header[..schema::SQLITE_MAGIC.len()] != schema::SQLITE_MAGIC {
        return Err(StoreError::NotASupportedFile(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn book(n: u32) -> CatalogEntry {
        CatalogEntry {
            title: format!("book{n}"),
            author: format!("author{n}"),
            identifier_code: format!("isbn{n}"),
            reference_uri: Some(format!("url{n}")),
            summary: format!("sum{n}"),
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn seeded() -> Store {
        let store = Store::in_memory().await.expect("in-memory store");
        for n in 1..=3 {
            store.add_catalog_entry(&book(n)).await.expect("add book");
        }
        store
    }

    #[tokio::test]
    async fn initialize_creates_then_validates() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bot.db");

        Store::initialize_schema(&path).await.expect("create");
        assert!(path.exists());
        Store::initialize_schema(&path).await.expect("second run is a no-op");

        let store = Store::open(&path).await.expect("open");
        assert!(store.list_catalog_titles().await.expect("titles").is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn initialize_rejects_non_sqlite_files() {
        let dir = tempdir().expect("tempdir");
        let short = dir.path().join("short.db");
        std::fs::write(&short, b"not a database").expect("write");
        assert!(matches!(
            Store::initialize_schema(&short).await,
            Err(StoreError::NotASupportedFile(_))
        ));

        let long = dir.path().join("long.db");
        std::fs::write(&long, vec![b'x'; 4096]).expect("write");
        assert!(matches!(
            Store::initialize_schema(&long).await,
            Err(StoreError::NotASupportedFile(_))
        ));
    }

    #[tokio::test]
    async fn initialize_rejects_schema_drift() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("drift.db");

        let pool = connect(file_options(&path, true)).await.expect("create file");
        sqlx::query(&schema::CATALOG.create_sql()).execute(&pool).await.expect("catalog");
        sqlx::query(&schema::OPTED_IN.create_sql()).execute(&pool).await.expect("opted_in");
        sqlx::query(
            "CREATE TABLE reply_ledger (id INTEGER PRIMARY KEY AUTOINCREMENT, local_id TEXT NOT NULL)",
        )
        .execute(&pool)
        .await
        .expect("old ledger");
        pool.close().await;

        match Store::initialize_schema(&path).await {
            Err(StoreError::SchemaMismatch { table, .. }) => assert_eq!(table, "reply_ledger"),
            other => panic!("expected schema mismatch, got {other:?}"),
        }
        assert!(matches!(
            Store::open(&path).await,
            Err(StoreError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn initialize_rejects_nullable_flag_drift() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nullable.db");

        let pool = connect(file_options(&path, true)).await.expect("create file");
        sqlx::query(
            "CREATE TABLE catalog (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL, \
             author TEXT NOT NULL, identifier_code TEXT NOT NULL, reference_uri TEXT NOT NULL, summary TEXT NOT NULL)",
        )
        .execute(&pool)
        .await
        .expect("catalog");
        sqlx::query(&schema::REPLY_LEDGER.create_sql()).execute(&pool).await.expect("ledger");
        sqlx::query(&schema::OPTED_IN.create_sql()).execute(&pool).await.expect("opted_in");
        pool.close().await;

        match Store::initialize_schema(&path).await {
            Err(StoreError::SchemaMismatch { table, detail }) => {
                assert_eq!(table, "catalog");
                assert!(detail.contains("reference_uri"), "{detail}");
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_requires_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing.db");
        assert!(matches!(Store::open(&path).await, Err(StoreError::Missing(_))));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn catalog_titles_are_lowercased_and_lookup_ignores_case() {
        let store = seeded().await;
        store
            .add_catalog_entry(&CatalogEntry {
                title: "The Way of Kings".into(),
                author: "Brandon Sanderson".into(),
                identifier_code: "9780765326355".into(),
                reference_uri: None,
                summary: "Roshar.".into(),
            })
            .await
            .expect("add");

        let titles = store.list_catalog_titles().await.expect("titles");
        assert_eq!(titles, set(&["book1", "book2", "book3", "the way of kings"]));

        let entry = store.lookup_catalog_entry("THE WAY OF KINGS").await.expect("lookup");
        assert_eq!(entry.author, "Brandon Sanderson");
        assert_eq!(entry.reference_uri, None);

        assert!(matches!(
            store.lookup_catalog_entry("book9").await,
            Err(StoreError::NotFound(title)) if title == "book9"
        ));
    }

    #[tokio::test]
    async fn lookup_folds_non_ascii_case() {
        let store = seeded().await;
        store
            .add_catalog_entry(&CatalogEntry {
                title: "Les Misérables".into(),
                author: "Victor Hugo".into(),
                identifier_code: "9780140444308".into(),
                reference_uri: None,
                summary: String::new(),
            })
            .await
            .expect("add");

        let title = store
            .list_catalog_titles()
            .await
            .expect("titles")
            .into_iter()
            .find(|t| t.starts_with("les"))
            .expect("lower-cased title");
        assert_eq!(title, "les misérables");
        let entry = store.lookup_catalog_entry(&title).await.expect("lookup");
        assert_eq!(entry.author, "Victor Hugo");
        assert_eq!(
            store.lookup_catalog_entry("LES MISÉRABLES").await.expect("upper").title,
            "Les Misérables"
        );
        assert!(matches!(
            store.lookup_catalog_entry("les misérables 2").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_catalog_titles_are_rejected() {
        let store = seeded().await;
        let mut dup = book(1);
        dup.title = "BOOK1".into();
        assert!(matches!(
            store.add_catalog_entry(&dup).await,
            Err(StoreError::DuplicateEntry { table: "catalog", .. })
        ));
    }

    #[tokio::test]
    async fn record_reply_rejects_duplicates() {
        let store = seeded().await;
        store.record_reply("abc", true).await.expect("first insert");

        let err = store.record_reply("abc", false).await.unwrap_err();
        assert!(err.is_duplicate_reply());
        assert_eq!(store.reply_outcome("abc").await.expect("outcome"), Some(true));
        assert_eq!(store.list_replied().await.expect("replied").len(), 1);
    }

    #[tokio::test]
    async fn record_reply_if_absent_keeps_first_outcome() {
        let store = seeded().await;
        assert!(store.record_reply_if_absent("abc", false).await.expect("insert"));
        assert!(!store.record_reply_if_absent("abc", true).await.expect("skip"));
        assert_eq!(store.reply_outcome("abc").await.expect("outcome"), Some(false));
        assert_eq!(store.reply_outcome("zzz").await.expect("outcome"), None);
    }

    #[tokio::test]
    async fn opted_in_duplicates_are_rejected_case_insensitively() {
        let store = seeded().await;
        store.add_opted_in("Alice").await.expect("add");
        assert!(matches!(
            store.add_opted_in("ALICE").await,
            Err(StoreError::DuplicateEntry { table: "opted_in", .. })
        ));
        assert_eq!(store.list_opted_in().await.expect("list"), set(&["alice"]));

        assert!(store.remove_opted_in("aLiCe").await.expect("remove"));
        assert!(!store.remove_opted_in("alice").await.expect("remove again"));
        assert!(store.list_opted_in().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn sync_opted_in_replaces_roster() {
        let store = seeded().await;
        store.add_opted_in("alice").await.expect("alice");
        store.add_opted_in("carol").await.expect("carol");

        let diff = store.sync_opted_in(&set(&["Alice", "bob"])).await.expect("sync");
        assert_eq!(diff.added, vec!["bob".to_string()]);
        assert_eq!(diff.removed, vec!["carol".to_string()]);
        assert_eq!(store.list_opted_in().await.expect("list"), set(&["alice", "bob"]));

        let diff = store.sync_opted_in(&set(&["alice", "bob"])).await.expect("resync");
        assert_eq!(diff, RosterDiff::default());

        store.sync_opted_in(&BTreeSet::new()).await.expect("clear");
        assert!(store.list_opted_in().await.expect("list").is_empty());
    }
}

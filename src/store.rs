//! Document store clients
//!
//! Event records are appended to a named collection of a named database.
//! Two backends exist: an HTTP document gateway for deployed courses and a
//! SQLite file for local contexts. Connections are opened per operation.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{TelemetryError, TelemetryResult};

/// Where and as whom to connect
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

/// Backend selected from an endpoint URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Http(url::Url),
    Sqlite(PathBuf),
}

impl StoreKind {
    /// `http(s)://` goes to the gateway, `sqlite://<path>` or a bare path to SQLite
    pub fn parse(url: &str) -> TelemetryResult<Self> {
        if let Some(path) = url.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(TelemetryError::invalid("sqlite URL has no path"));
            }
            return Ok(StoreKind::Sqlite(PathBuf::from(path)));
        }

        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(StoreKind::Http(parsed)),
            Ok(parsed) if parsed.scheme().len() > 1 => Err(TelemetryError::invalid(format!(
                "unsupported store scheme '{}'",
                parsed.scheme()
            ))),
            // No scheme, or a single-letter Windows drive
            _ if !url.is_empty() => Ok(StoreKind::Sqlite(PathBuf::from(url))),
            _ => Err(TelemetryError::invalid("store URL is empty")),
        }
    }
}

/// An open handle on a document database
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Cheap round trip confirming the store is reachable and credentials work
    async fn ping(&self) -> TelemetryResult<()>;

    /// Append documents to a collection in one call; all or nothing
    async fn insert_many(&self, collection: &str, documents: &[Value]) -> TelemetryResult<usize>;
}

/// Opens store handles
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> TelemetryResult<Box<dyn DocumentStore>>;
}

/// Connector dispatching on the endpoint URL scheme
#[derive(Clone, Default)]
pub struct DefaultConnector {
    http: reqwest::Client,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreConnector for DefaultConnector {
    async fn connect(&self, endpoint: &Endpoint) -> TelemetryResult<Box<dyn DocumentStore>> {
        match StoreKind::parse(&endpoint.url)? {
            StoreKind::Http(base) => Ok(Box::new(HttpStore::new(self.http.clone(), base, endpoint))),
            StoreKind::Sqlite(path) => Ok(Box::new(SqliteStore::open(&path, &endpoint.database).await?)),
        }
    }
}

/// JSON document gateway
///
/// `GET {url}/ping` checks reachability; `POST {url}/action/insertMany` with
/// `{database, collection, documents}` appends.
pub struct HttpStore {
    client: reqwest::Client,
    base: url::Url,
    user: Option<String>,
    password: Option<String>,
    database: String,
}

impl HttpStore {
    pub fn new(client: reqwest::Client, base: url::Url, endpoint: &Endpoint) -> Self {
        Self {
            client,
            base,
            user: endpoint.user.clone(),
            password: endpoint.password.clone(),
            database: endpoint.database.clone(),
        }
    }

    fn route(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.user {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn ping(&self) -> TelemetryResult<()> {
        self.authorize(self.client.get(self.route("ping")))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn insert_many(&self, collection: &str, documents: &[Value]) -> TelemetryResult<usize> {
        let body = json!({
            "database": self.database,
            "collection": collection,
            "documents": documents,
        });

        let response = self.authorize(self.client.post(self.route("action/insertMany")))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TelemetryError::transfer(format!("gateway returned {}: {}", status, text)));
        }

        debug!("Inserted {} documents into {}.{}", documents.len(), self.database, collection);
        Ok(documents.len())
    }
}

/// SQLite-backed document store; one table per `<database>_<collection>`
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    database: String,
}

impl SqliteStore {
    /// Open (creating if needed) the database file
    pub async fn open(path: &Path, database: &str) -> TelemetryResult<Self> {
        validate_identifier(database)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            database: database.to_string(),
        })
    }

    fn table(&self, collection: &str) -> TelemetryResult<String> {
        validate_identifier(collection)?;
        Ok(format!("{}_{}", self.database, collection))
    }

    /// Number of documents in a collection
    pub async fn count(&self, collection: &str) -> TelemetryResult<usize> {
        let table = self.table(collection)?;
        let conn = self.conn.lock().await;
        Self::ensure_table(&conn, &table)?;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// All documents of a collection in insertion order
    pub async fn documents(&self, collection: &str) -> TelemetryResult<Vec<Value>> {
        let table = self.table(collection)?;
        let conn = self.conn.lock().await;
        Self::ensure_table(&conn, &table)?;

        let mut stmt = conn.prepare(&format!("SELECT document FROM \"{}\" ORDER BY id", table))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(serde_json::from_str(&row?)?);
        }
        Ok(documents)
    }

    fn ensure_table(conn: &Connection, table: &str) -> TelemetryResult<()> {
        conn.execute_batch(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document TEXT NOT NULL,
                inserted_at TEXT NOT NULL
            );"#,
            table
        ))?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn ping(&self) -> TelemetryResult<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    async fn insert_many(&self, collection: &str, documents: &[Value]) -> TelemetryResult<usize> {
        let table = self.table(collection)?;
        let mut conn = self.conn.lock().await;
        Self::ensure_table(&conn, &table)?;

        let now = chrono::Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO \"{}\" (document, inserted_at) VALUES (?1, ?2)",
                table
            ))?;
            for document in documents {
                stmt.execute(params![serde_json::to_string(document)?, now])?;
            }
        }
        tx.commit()?;

        debug!("Inserted {} documents into {}", documents.len(), table);
        Ok(documents.len())
    }
}

fn validate_identifier(name: &str) -> TelemetryResult<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TelemetryError::invalid(format!("invalid database or collection name '{}'", name)))
    }
}

//! SurrealDB driver - connection and document operations
//!
//! Implements the `Driver` contract on top of `Surreal<Any>`:
//! - CRUD through `type::thing($tb, $id)` record addressing
//! - native queries compiled to SurrealQL `SELECT ... WHERE` with bound
//!   parameters
//! - changefeeds as `LIVE SELECT` streams, preceded by an initial snapshot
//!   and a `ready` marker
//!
//! Supports both local (in-memory) and remote (WebSocket) connections.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::{Action, Notification, Surreal};
use tracing::{debug, info, instrument, warn};

use crate::driver::*;
use crate::error::StorageError;
use crate::query::{
    apply_updates, document_id, id_to_string, Document, FieldUpdate, Predicate, Query,
    QueryOutput, Selector, Term, ID_FIELD,
};

const DEFAULT_NAMESPACE: &str = "graphfeed";
const DEFAULT_DATABASE: &str = "main";

/// Configuration for a SurrealDB connection
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// Endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud", "mem://")
    pub endpoint: String,
    /// Credentials; `None` skips sign-in
    pub credentials: Option<Credentials>,
    /// Namespace (default: "graphfeed")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
}

/// Sign-in credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl SurrealConfig {
    /// Create a configuration for an endpoint without credentials
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
        }
    }

    /// In-memory database
    pub fn memory() -> Self {
        Self::new("mem://")
    }

    /// Sign in as a database user
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            is_root: false,
        });
        self
    }

    /// Sign in as a root user
    pub fn with_root_user(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            is_root: true,
        });
        self
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (with SURREALDB_USERNAME / SURREALDB_PASSWORD)
    /// - SURREALDB_URL (no credentials), used when SURREALDB_ENDPOINT is unset
    /// - SURREALDB_NAMESPACE (optional, default: "graphfeed")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false") - set to "true" for root users
    ///
    /// Falls back to `mem://` when neither endpoint variable is set.
    pub fn from_env() -> std::result::Result<Self, String> {
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());

        let config = if let Ok(endpoint) = std::env::var("SURREALDB_ENDPOINT") {
            let username =
                std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
            let password =
                std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
            let is_root = std::env::var("SURREALDB_ROOT")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false);
            let config = SurrealConfig::new(endpoint);
            if is_root {
                config.with_root_user(username, password)
            } else {
                config.with_user(username, password)
            }
        } else if let Ok(url) = std::env::var("SURREALDB_URL") {
            SurrealConfig::new(url)
        } else {
            SurrealConfig::memory()
        };

        Ok(config.with_namespace(namespace).with_database(database))
    }
}

/// SurrealDB-backed implementation of [`Driver`].
#[derive(Clone)]
pub struct SurrealDriver {
    db: Surreal<Any>,
}

impl SurrealDriver {
    /// Connect, authenticate and select namespace/database.
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn connect(config: SurrealConfig) -> StorageResult<Self> {
        info!("Connecting to SurrealDB");

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        match &config.credentials {
            Some(creds) if creds.is_root => {
                db.signin(Root {
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StorageError::Connection(format!("Root authentication failed: {e}")))?;
            }
            Some(creds) => {
                db.signin(Database {
                    namespace: &config.namespace,
                    database: &config.database,
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| {
                    StorageError::Connection(format!("Database authentication failed: {e}"))
                })?;
            }
            None => {}
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to select namespace/database: {e}"))
            })?;

        info!("SurrealDB connected");
        Ok(Self { db })
    }

    /// Connect to an in-memory database.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect(SurrealConfig::memory()).await
    }

    /// Connect using [`SurrealConfig::from_env`].
    pub async fn from_env() -> StorageResult<Self> {
        let config = SurrealConfig::from_env().map_err(StorageError::Connection)?;
        Self::connect(config).await
    }

    /// Define schemaless tables. Safe to call multiple times.
    #[instrument(skip(self))]
    pub async fn define_tables(&self, tables: &[&str]) -> StorageResult<()> {
        let mut statements = String::new();
        for table in tables {
            statements.push_str(&format!(
                "DEFINE TABLE IF NOT EXISTS {} SCHEMALESS;\n",
                ident(table)?
            ));
        }
        self.db.query(statements).await?.check()?;
        debug!("Tables defined");
        Ok(())
    }

    async fn select(&self, query: &Query) -> StorageResult<Vec<Document>> {
        let mut builder = SqlBuilder::default();
        let sql = builder.select(query)?;
        debug!(%sql, "running select");

        let mut request = self.db.query(sql);
        for binding in builder.bindings {
            request = request.bind(binding);
        }
        let mut response = request.await?;
        let rows: Vec<Value> = response.take(0)?;
        rows.into_iter()
            .map(|row| normalize_document(row, query.table_name()))
            .collect()
    }

    async fn replace(&self, table: &str, id: &str, mut doc: Document) -> StorageResult<()> {
        doc.remove(ID_FIELD);
        self.db
            .query("UPDATE type::thing($tb, $id) CONTENT $doc")
            .bind(("tb", table.to_string()))
            .bind(("id", id.to_string()))
            .bind(("doc", Value::Object(doc)))
            .await?
            .check()?;
        Ok(())
    }
}

#[async_trait]
impl Driver for SurrealDriver {
    #[instrument(skip(self, doc))]
    async fn insert(&self, table: &str, mut doc: Document) -> StorageResult<()> {
        let id = document_id(&doc).ok_or_else(|| {
            StorageError::Query(format!("document inserted into `{table}` has no id"))
        })?;
        if self.get(table, &id).await?.is_some() {
            return Err(StorageError::Conflict {
                table: table.to_string(),
                id,
            });
        }

        doc.remove(ID_FIELD);
        self.db
            .query("CREATE type::thing($tb, $id) CONTENT $doc")
            .bind(("tb", table.to_string()))
            .bind(("id", id))
            .bind(("doc", Value::Object(doc)))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, table: &str, id: &str) -> StorageResult<Option<Document>> {
        Ok(self.select(&Query::get(table, id)).await?.into_iter().next())
    }

    #[instrument(skip(self, updates))]
    async fn update(
        &self,
        table: &str,
        selector: Selector,
        updates: Vec<FieldUpdate>,
    ) -> StorageResult<u64> {
        let query = match selector {
            Selector::Id(id) => Query::get(table, id),
            Selector::Ids(ids) => {
                let predicate = ids.into_iter().fold(Predicate::Const(false), |acc, id| {
                    acc.or(Predicate::Eq(
                        Term::Field(ID_FIELD.to_string()),
                        Term::Literal(Value::String(id)),
                    ))
                });
                Query::table(table).filter(predicate)
            }
            Selector::Where(predicate) => Query::table(table).filter(predicate),
        };

        let mut count = 0;
        for mut doc in self.select(&query).await? {
            let Some(id) = document_id(&doc) else {
                continue;
            };
            if apply_updates(&mut doc, &updates) {
                self.replace(table, &id, doc).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn delete(&self, table: &str, id: &str) -> StorageResult<()> {
        self.db
            .query("DELETE type::thing($tb, $id)")
            .bind(("tb", table.to_string()))
            .bind(("id", id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn run(&self, query: &Query) -> StorageResult<QueryOutput> {
        let docs = self.select(query).await?;
        if query.is_point_lookup() {
            Ok(QueryOutput::Single(docs.into_iter().next()))
        } else {
            Ok(QueryOutput::Many(docs))
        }
    }

    #[instrument(skip(self))]
    async fn changes(&self, query: &Query, options: ChangeOptions) -> StorageResult<ChangeCursor> {
        let table = query.table_name().to_string();

        // Register the live query before the snapshot so no change is missed.
        let sql = format!("LIVE SELECT *, meta::id(id) AS id FROM {}", ident(&table)?);
        let mut response = self.db.query(sql).await?;
        let live = response.stream::<Notification<Value>>(0)?;

        // Previous images of every document in the table, for `old_val`.
        let snapshot = self.select(&Query::table(table.clone())).await?;
        let mut head: Vec<StorageResult<Change>> = Vec::new();
        if options.include_states {
            head.push(Ok(Change::State(FeedState::Initializing)));
        }
        if options.include_initial {
            head.extend(
                snapshot
                    .iter()
                    .filter(|doc| query.matches(doc))
                    .cloned()
                    .map(|doc| Ok(Change::insert(doc))),
            );
        }
        if options.include_states {
            head.push(Ok(Change::State(FeedState::Ready)));
        }

        let images: HashMap<String, Document> = snapshot
            .into_iter()
            .filter_map(|doc| document_id(&doc).map(|id| (id, doc)))
            .collect();

        let query = query.clone();
        let tail = futures::stream::unfold(
            (live, images, query, table),
            |(mut live, mut images, query, table)| async move {
                loop {
                    let notification = match live.next().await? {
                        Ok(notification) => notification,
                        Err(e) => {
                            let err = StorageError::Changefeed(e.to_string());
                            return Some((Err(err), (live, images, query, table)));
                        }
                    };
                    let doc = match normalize_document(notification.data, &table) {
                        Ok(doc) => doc,
                        Err(e) => return Some((Err(e), (live, images, query, table))),
                    };
                    let Some(id) = document_id(&doc) else {
                        warn!(table = %table, "live notification without id");
                        continue;
                    };

                    let Some((old, new)) = track_image(&mut images, notification.action, id, doc)
                    else {
                        continue;
                    };

                    if let Some(change) = Change::project(&query, old.as_ref(), new.as_ref()) {
                        return Some((Ok(change), (live, images, query, table)));
                    }
                }
            },
        );

        Ok(futures::stream::iter(head).chain(tail).boxed())
    }

    async fn table_of(&self, query: &Query) -> StorageResult<String> {
        Ok(query.table_name().to_string())
    }

    async fn list_tables(&self) -> StorageResult<Vec<String>> {
        let mut response = self.db.query("INFO FOR DB").await?;
        let info: Option<Value> = response.take(0)?;
        let mut tables: Vec<String> = info
            .as_ref()
            .and_then(|info| info.get("tables"))
            .and_then(Value::as_object)
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default();
        tables.sort();
        Ok(tables)
    }
}

/// Fold a live notification into the per-feed image map and return the
/// `(old_val, new_val)` pair it stands for.
///
/// A create for a document the snapshot already holds unchanged was
/// registered between `LIVE SELECT` and the snapshot, and is dropped.
fn track_image(
    images: &mut HashMap<String, Document>,
    action: Action,
    id: String,
    doc: Document,
) -> Option<(Option<Document>, Option<Document>)> {
    match action {
        Action::Create => match images.insert(id, doc.clone()) {
            Some(seen) if seen == doc => None,
            seen => Some((seen, Some(doc))),
        },
        Action::Update => {
            let old = images.insert(id, doc.clone());
            Some((old, Some(doc)))
        }
        Action::Delete => Some((Some(images.remove(&id).unwrap_or(doc)), None)),
        other => {
            debug!(action = ?other, "ignoring live notification");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// SurrealQL compilation
// ---------------------------------------------------------------------------

/// Quote a table or field name, rejecting anything outside `[A-Za-z0-9_]`.
fn ident(name: &str) -> StorageResult<String> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StorageError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("`{name}`"))
}

#[derive(Default)]
struct SqlBuilder {
    bindings: Vec<(String, Value)>,
}

impl SqlBuilder {
    fn param(&mut self, value: Value) -> String {
        let name = format!("p{}", self.bindings.len());
        let placeholder = format!("${name}");
        self.bindings.push((name, value));
        placeholder
    }

    fn term(&mut self, term: &Term) -> StorageResult<String> {
        match term {
            Term::Field(field) if field == ID_FIELD => Ok("meta::id(id)".to_string()),
            Term::Field(field) => ident(field),
            Term::Literal(value) => Ok(self.param(value.clone())),
        }
    }

    fn predicate(&mut self, predicate: &Predicate) -> StorageResult<String> {
        Ok(match predicate {
            Predicate::Const(value) => value.to_string(),
            Predicate::Eq(a, b) => format!("{} = {}", self.term(a)?, self.term(b)?),
            Predicate::Contains { field, key } => {
                let key = self.param(Value::String(key.clone()));
                format!("object::keys({} ?? {{}}) CONTAINS {key}", ident(field)?)
            }
            Predicate::And(a, b) => format!("({} AND {})", self.predicate(a)?, self.predicate(b)?),
            Predicate::Or(a, b) => format!("({} OR {})", self.predicate(a)?, self.predicate(b)?),
        })
    }

    fn select(&mut self, query: &Query) -> StorageResult<String> {
        let mut predicates = Vec::new();
        let mut current = query;
        while let Query::Filter { source, predicate } = current {
            predicates.push(predicate);
            current = source;
        }

        let from = match current {
            Query::Table { table } => {
                let tb = self.param(Value::String(table.clone()));
                format!("type::table({tb})")
            }
            Query::Get { table, id } => {
                let tb = self.param(Value::String(table.clone()));
                let id = self.param(Value::String(id.clone()));
                format!("type::thing({tb}, {id})")
            }
            Query::Filter { .. } => unreachable!("filters are unwrapped above"),
        };

        let mut sql = format!("SELECT *, meta::id(id) AS id FROM {from}");
        if !predicates.is_empty() {
            let clauses = predicates
                .into_iter()
                .rev()
                .map(|p| self.predicate(p))
                .collect::<StorageResult<Vec<_>>>()?;
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        Ok(sql)
    }
}

/// Turn a SurrealDB row into a flat document with a plain string id.
///
/// Record ids may arrive as `table:id`, `table:⟨id⟩`, or a `{tb, id}` object
/// depending on whether the projection applied.
fn normalize_document(row: Value, table: &str) -> StorageResult<Document> {
    let Value::Object(mut doc) = row else {
        return Err(StorageError::Serialization(format!(
            "expected a document from `{table}`, got {row}"
        )));
    };
    if let Some(raw) = doc.remove(ID_FIELD) {
        if let Some(id) = record_key(&raw, table) {
            doc.insert(ID_FIELD.to_string(), Value::String(id));
        }
    }
    Ok(doc)
}

fn record_key(raw: &Value, table: &str) -> Option<String> {
    match raw {
        Value::String(s) => {
            let key = s
                .strip_prefix(table)
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(s);
            Some(
                key.trim_start_matches(['⟨', '`'])
                    .trim_end_matches(['⟩', '`'])
                    .to_string(),
            )
        }
        Value::Object(thing) => {
            let id = thing.get("id")?;
            match id {
                Value::Object(inner) => inner.values().next().and_then(id_to_string),
                other => id_to_string(other),
            }
        }
        other => id_to_string(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn compiles_filtered_select_with_bound_parameters() {
        let query = Query::table("messages").filter(Predicate::Eq(
            Term::Field("body".into()),
            Term::Literal(json!("hello")),
        ));
        let mut builder = SqlBuilder::default();
        let sql = builder.select(&query).unwrap();

        assert_eq!(
            sql,
            "SELECT *, meta::id(id) AS id FROM type::table($p0) WHERE `body` = $p1"
        );
        assert_eq!(builder.bindings[0].1, json!("messages"));
        assert_eq!(builder.bindings[1].1, json!("hello"));
    }

    #[test]
    fn compiles_membership_predicate() {
        let query = Query::table("chat_rooms").filter(Predicate::Contains {
            field: "messageIds".into(),
            key: "m1".into(),
        });
        let sql = SqlBuilder::default().select(&query).unwrap();
        assert!(sql.ends_with("WHERE object::keys(`messageIds` ?? {}) CONTAINS $p1"));
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(ident("chat_rooms").is_ok());
        assert!(matches!(
            ident("rooms; DELETE users"),
            Err(StorageError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn record_keys_are_unwrapped() {
        assert_eq!(record_key(&json!("messages:m1"), "messages").unwrap(), "m1");
        assert_eq!(record_key(&json!("messages:⟨a-b⟩"), "messages").unwrap(), "a-b");
        assert_eq!(record_key(&json!("m1"), "messages").unwrap(), "m1");
        assert_eq!(
            record_key(&json!({"tb": "messages", "id": {"String": "m1"}}), "messages").unwrap(),
            "m1"
        );
        assert_eq!(record_key(&json!(7), "messages").unwrap(), "7");
    }

    #[tokio::test]
    async fn test_in_memory_crud_round_trip() {
        let driver = SurrealDriver::in_memory().await.unwrap();
        let doc = json!({"id": "m1", "body": "hello"})
            .as_object()
            .cloned()
            .unwrap();

        driver.insert("messages", doc).await.unwrap();
        let loaded = driver.get("messages", "m1").await.unwrap().unwrap();
        assert_eq!(loaded["body"], json!("hello"));
        assert_eq!(loaded["id"], json!("m1"));

        driver.delete("messages", "m1").await.unwrap();
        assert!(driver.get("messages", "m1").await.unwrap().is_none());
    }

    #[test]
    fn create_already_in_snapshot_is_dropped() {
        let snapshot = doc(json!({"id": "m1", "body": "Hello"}));
        let mut images = HashMap::from([("m1".to_string(), snapshot.clone())]);

        assert!(track_image(&mut images, Action::Create, "m1".into(), snapshot).is_none());

        let (old, new) = track_image(
            &mut images,
            Action::Create,
            "m2".into(),
            doc(json!({"id": "m2", "body": "Hi"})),
        )
        .unwrap();
        assert!(old.is_none());
        assert_eq!(new.unwrap()["body"], json!("Hi"));
    }

    #[test]
    fn update_and_delete_carry_previous_image() {
        let mut images = HashMap::from([(
            "m1".to_string(),
            doc(json!({"id": "m1", "body": "Hello"})),
        )]);

        let (old, _) = track_image(
            &mut images,
            Action::Update,
            "m1".into(),
            doc(json!({"id": "m1", "body": "Goodbye"})),
        )
        .unwrap();
        assert_eq!(old.unwrap()["body"], json!("Hello"));

        let (old, new) =
            track_image(&mut images, Action::Delete, "m1".into(), doc(json!({"id": "m1"}))).unwrap();
        assert_eq!(old.unwrap()["body"], json!("Goodbye"));
        assert!(new.is_none());
        assert!(images.is_empty());
    }
}

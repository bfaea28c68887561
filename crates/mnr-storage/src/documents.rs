use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use crate::archive::write_atomic;

const CHANGE_FEED_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid document key {collection}/{id}")]
    InvalidKey { collection: String, id: String },
    #[error("document {collection}/{id} could not be decoded: {source}")]
    Decode {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding document: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("filesystem error: {0:#}")]
    Io(anyhow::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Before/after pair emitted whenever a document is written.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub collection: String,
    pub id: String,
    /// `None` when the write created the document.
    pub before: Option<JsonValue>,
    pub after: JsonValue,
}

impl DocumentChange {
    pub fn is_update(&self) -> bool {
        self.before.is_some()
    }
}

/// Broadcast fan-out of [`DocumentChange`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<DocumentChange>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { tx }
    }
}

impl ChangeFeed {
    pub fn publish(&self, change: DocumentChange) {
        // No subscribers is fine.
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.tx.subscribe()
    }
}

/// Key-value document store with whole-document writes and change subscription.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, StoreError>;

    /// Overwrite the whole document.
    async fn set(&self, collection: &str, id: &str, document: JsonValue) -> Result<(), StoreError>;

    fn changes(&self) -> broadcast::Receiver<DocumentChange>;
}

pub async fn load_document<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<Option<T>, StoreError> {
    store
        .get(collection, id)
        .await?
        .map(|value| {
            serde_json::from_value(value).map_err(|source| StoreError::Decode {
                collection: collection.to_string(),
                id: id.to_string(),
                source,
            })
        })
        .transpose()
}

pub async fn save_document<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    document: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(document).map_err(StoreError::Encode)?;
    store.set(collection, id, value).await
}

fn validate_key(collection: &str, id: &str) -> Result<(), StoreError> {
    let bad = |s: &str| {
        s.is_empty() || s == "." || s == ".." || s.contains(['/', '\\']) || s.starts_with('.')
    };
    if bad(collection) || bad(id) {
        return Err(StoreError::InvalidKey {
            collection: collection.to_string(),
            id: id.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<(String, String), JsonValue>>,
    feed: ChangeFeed,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(&(collection.to_string(), id.to_string()))
            .cloned())
    }

    async fn set(&self, collection: &str, id: &str, document: JsonValue) -> Result<(), StoreError> {
        validate_key(collection, id)?;
        let before = {
            let mut documents = self.documents.write().await;
            documents.insert((collection.to_string(), id.to_string()), document.clone())
        };
        self.feed.publish(DocumentChange {
            collection: collection.to_string(),
            id: id.to_string(),
            before,
            after: document,
        });
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<DocumentChange> {
        self.feed.subscribe()
    }
}

/// One pretty-printed JSON file per document at `<root>/<collection>/<id>.json`.
#[derive(Debug)]
pub struct FsDocumentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    feed: ChangeFeed,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
            feed: ChangeFeed::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.root.join(collection).join(format!("{id}.json"))
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, StoreError> {
        validate_key(collection, id)?;
        let path = self.document_path(collection, id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StoreError::Io(
                    anyhow::Error::new(err).context(format!("reading {}", path.display())),
                ))
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                collection: collection.to_string(),
                id: id.to_string(),
                source,
            })
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, StoreError> {
        self.read(collection, id).await
    }

    async fn set(&self, collection: &str, id: &str, document: JsonValue) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let before = self.read(collection, id).await?;
        let bytes = serde_json::to_vec_pretty(&document).map_err(StoreError::Encode)?;
        let path = self.document_path(collection, id);
        write_atomic(&path, &bytes).await.map_err(StoreError::Io)?;
        debug!(path = %path.display(), bytes = bytes.len(), "document written");
        self.feed.publish(DocumentChange {
            collection: collection.to_string(),
            id: id.to_string(),
            before,
            after: document,
        });
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<DocumentChange> {
        self.feed.subscribe()
    }
}

/// Documents in a single `documents` table. Change events are published to
/// subscribers inside this process only.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    feed: ChangeFeed,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            feed: ChangeFeed::default(),
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<JsonValue>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT body
              FROM documents
             WHERE collection = $1
               AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("body")).transpose()?)
    }

    async fn set(&self, collection: &str, id: &str, document: JsonValue) -> Result<(), StoreError> {
        validate_key(collection, id)?;
        let mut tx = self.pool.begin().await?;
        let before: Option<JsonValue> = sqlx::query(
            r#"
            SELECT body
              FROM documents
             WHERE collection = $1
               AND id = $2
               FOR UPDATE
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.try_get("body"))
        .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, body, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (collection, id)
            DO UPDATE SET body = EXCLUDED.body,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(&document)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.feed.publish(DocumentChange {
            collection: collection.to_string(),
            id: id.to_string(),
            before,
            after: document,
        });
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<DocumentChange> {
        self.feed.subscribe()
    }
}

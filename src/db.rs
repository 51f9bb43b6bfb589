//! Job record store
//!
//! A thin key-value layer over SurrealDB. Every job is kept as a single record in the
//! `job` table, keyed by the job id, holding the job's JSON as an opaque string payload.
//! Parsing the payload is the job model's business, so a corrupt payload is still
//! readable here and degrades to defaults upstream.

use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use surrealdb::{Surreal, engine::any::Any};

use crate::config::{DatabaseAuthMethod, DatabaseConfig};

const TABLE_NAME: &str = "job";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Missing credentials for root sign-in")]
    MissingCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    payload: String,
}

/// Handle to the job record store. Cheap to clone, every clone talks to the same database.
#[derive(Clone)]
pub struct JobStore {
    db: Surreal<Any>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore").finish_non_exhaustive()
    }
}

impl JobStore {
    #[tracing::instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let url = config.connection_url();
        tracing::info!("Connecting to database at {}", url);
        let db = surrealdb::engine::any::connect(url).await?;

        match config.db_auth_method {
            DatabaseAuthMethod::Root => {
                tracing::info!("Signing in as root user");
                let (Some(username), Some(password)) =
                    (config.root_username.as_deref(), config.root_password.as_deref())
                else {
                    return Err(StoreError::MissingCredentials);
                };
                db.signin(surrealdb::opt::auth::Root { username, password })
                    .await?;
            }
            DatabaseAuthMethod::None => {
                tracing::info!("No authentication configured");
            }
        }

        tracing::info!(
            "Using namespace '{}' and database '{}'",
            config.db_namespace,
            config.db_database
        );
        db.use_ns(&config.db_namespace)
            .use_db(&config.db_database)
            .await?;

        tracing::info!("Database initialization complete");
        Ok(Self { db })
    }

    /// Fresh, isolated in-memory store.
    #[cfg(test)]
    pub async fn memory() -> Self {
        let db = surrealdb::engine::any::connect("mem://")
            .await
            .expect("in-memory database");
        db.use_ns("test").use_db("test").await.expect("namespace");
        Self { db }
    }

    /// Write a record whose `payload` field holds any value, not just a string.
    #[cfg(test)]
    pub async fn put_raw(&self, key: &str, payload: serde_json::Value) -> Result<(), StoreError> {
        self.db
            .query("CREATE type::thing($table, $key) SET payload = $payload")
            .bind(("table", TABLE_NAME))
            .bind(("key", key.to_string()))
            .bind(("payload", payload))
            .await?
            .check()?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub async fn put(&self, key: &str, payload: String) -> Result<(), StoreError> {
        let _: Option<StoredRecord> = self
            .db
            .upsert((TABLE_NAME, key))
            .content(StoredRecord { payload })
            .await?;
        Ok(())
    }

    /// `Ok(None)` when no record exists under `key`. An empty payload is still `Some`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let record: Option<StoredRecord> = self.db.select((TABLE_NAME, key)).await?;
        Ok(record.map(|r| r.payload))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _: Option<StoredRecord> = self.db.delete((TABLE_NAME, key)).await?;
        Ok(())
    }

    /// Keys present in the store right now, in no particular order.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut response = self
            .db
            .query(format!("SELECT VALUE meta::id(id) FROM {TABLE_NAME}"))
            .await?;
        let keys: Vec<String> = response.take(0)?;
        Ok(keys)
    }

    /// One lazy pass over every record.
    ///
    /// Keys are snapshotted when the scan starts and each payload is fetched as the
    /// stream is polled. Records deleted in between are skipped; a failed read is
    /// yielded as an error item so the caller decides whether to keep going.
    pub async fn scan(
        &self,
    ) -> Result<impl Stream<Item = Result<String, StoreError>> + '_, StoreError> {
        let keys = self.keys().await?;
        tracing::trace!(count = keys.len(), "Scanning job records");

        Ok(stream::iter(keys).filter_map(move |key| async move {
            match self.get(&key).await {
                Ok(Some(payload)) => Some(Ok(payload)),
                Ok(None) => {
                    tracing::debug!(%key, "Record vanished during scan");
                    None
                }
                Err(e) => Some(Err(e)),
            }
        }))
    }
}

//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of
//! the `DocumentStore` and `AccountRepository` ports from the `core` crate. It
//! handles all interactions with the PostgreSQL database using `sqlx`.
//!
//! Documents live in a single JSONB table keyed by path. A trigger announces
//! every change on the `document_changes` channel with the collection path as
//! payload; live reads hold a `PgListener` and re-run their query when their
//! collection is named.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use verse_study_core::domain::{AccountCredentials, Identity};
use verse_study_core::ports::{
    AccountRepository, DocumentStore, PortError, PortResult, SnapshotStream,
};
use verse_study_core::store::{
    merge_into, resolve_server_timestamps, DocPath, Document, FilterOp, MonotonicClock, Query,
    WriteMode,
};

/// The NOTIFY channel the `documents` trigger publishes on.
pub const CHANGES_CHANNEL: &str = "document_changes";

const UNIQUE_VIOLATION: &str = "23505";

// A write first claims the row so that the lock below also covers documents
// that do not exist yet; concurrent first writers queue on the claim.
const CLAIM_ROW_SQL: &str = "INSERT INTO documents (path, parent, data) VALUES ($1, $2, '{}'::jsonb) \
     ON CONFLICT (path) DO NOTHING";
const LOCK_ROW_SQL: &str = "SELECT data FROM documents WHERE path = $1 FOR UPDATE";
const UPDATE_ROW_SQL: &str = "UPDATE documents SET data = $2, updated_at = now() WHERE path = $1";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DocumentStore` and `AccountRepository` ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
    clock: Arc<MonotonicClock>,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    async fn run_query(&self, query: &Query) -> PortResult<Vec<Document>> {
        let records = select_collection(query)
            .build_query_as::<DocumentRecord>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        let docs = records
            .into_iter()
            .map(DocumentRecord::to_domain)
            .collect::<PortResult<Vec<_>>>()?;
        // Ordering and range filters are evaluated the same way as in every
        // other store.
        Ok(query.apply(docs))
    }

    async fn fetch(&self, path: &DocPath) -> PortResult<Option<Document>> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            "SELECT path, data FROM documents WHERE path = $1",
        )
        .bind(path.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        record.map(DocumentRecord::to_domain).transpose()
    }

    async fn listener(&self) -> PortResult<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(db_error)?;
        listener.listen(CHANGES_CHANNEL).await.map_err(db_error)?;
        Ok(listener)
    }
}

/// `SELECT` over one collection, with equality filters pushed down as JSONB
/// containment.
fn select_collection(query: &Query) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("SELECT path, data FROM documents WHERE parent = ");
    builder.push_bind(query.collection.as_str().to_string());

    let equalities: Map<String, Value> = query
        .filters
        .iter()
        .filter(|f| f.op == FilterOp::Eq)
        .map(|f| (f.field.clone(), f.value.clone()))
        .collect();
    if !equalities.is_empty() {
        builder.push(" AND data @> ");
        builder.push_bind(Json(Value::Object(equalities)));
    }
    builder
}

fn db_error(e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound("Row not found".to_string()),
        other => PortError::Unexpected(other.to_string()),
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct DocumentRecord {
    path: String,
    data: Json<Value>,
}
impl DocumentRecord {
    fn to_domain(self) -> PortResult<Document> {
        Ok(Document {
            path: DocPath::parse(&self.path)?,
            data: self.data.0,
        })
    }
}

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    email: String,
    display_name: Option<String>,
}
impl UserRecord {
    fn to_domain(self) -> Identity {
        Identity {
            uid: self.user_id,
            email: Some(self.email),
            display_name: self.display_name,
        }
    }
}

#[derive(FromRow)]
struct CredentialsRecord {
    user_id: Uuid,
    email: String,
    display_name: Option<String>,
    password_hash: String,
}
impl CredentialsRecord {
    fn to_domain(self) -> AccountCredentials {
        AccountCredentials {
            identity: Identity {
                uid: self.user_id,
                email: Some(self.email),
                display_name: self.display_name,
            },
            hashed_password: self.password_hash,
        }
    }
}

//=========================================================================================
// `DocumentStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl DocumentStore for DbAdapter {
    async fn get(&self, path: &DocPath) -> PortResult<Option<Document>> {
        self.fetch(path).await
    }

    async fn query(&self, query: &Query) -> PortResult<Vec<Document>> {
        self.run_query(query).await
    }

    async fn set(&self, path: &DocPath, mut data: Value, mode: WriteMode) -> PortResult<()> {
        if !data.is_object() {
            return Err(PortError::InvalidInput(format!(
                "Document body for {} must be an object",
                path
            )));
        }

        let key = path.to_string();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        sqlx::query(CLAIM_ROW_SQL)
            .bind(&key)
            .bind(path.collection().as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        let existing = sqlx::query_scalar::<_, Json<Value>>(LOCK_ROW_SQL)
            .bind(&key)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;

        resolve_server_timestamps(&mut data, self.clock.now());
        let merged = merge_into(Some(existing.0), data, mode);

        sqlx::query(UPDATE_ROW_SQL)
            .bind(&key)
            .bind(Json(merged))
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        debug!(%path, ?mode, "Document written.");
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> PortResult<()> {
        sqlx::query("DELETE FROM documents WHERE path = $1")
            .bind(path.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn listen_query(&self, query: &Query) -> PortResult<SnapshotStream<Vec<Document>>> {
        let mut listener = self.listener().await?;
        let initial = self.run_query(query).await?;
        let store = self.clone();
        let query = query.clone();

        Ok(Box::pin(async_stream::stream! {
            let mut last = initial.clone();
            yield Ok(initial);
            loop {
                match listener.recv().await {
                    Ok(notification) if notification.payload() != query.collection.as_str() => continue,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(collection = %query.collection, error = %e, "Change listener failed.");
                        yield Err(db_error(e));
                        break;
                    }
                }
                match store.run_query(&query).await {
                    Ok(next) if next != last => {
                        last = next.clone();
                        yield Ok(next);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }

    async fn listen_doc(&self, path: &DocPath) -> PortResult<SnapshotStream<Option<Document>>> {
        let mut listener = self.listener().await?;
        let initial = self.fetch(path).await?;
        let store = self.clone();
        let path = path.clone();

        Ok(Box::pin(async_stream::stream! {
            let mut last = initial.clone();
            yield Ok(initial);
            loop {
                match listener.recv().await {
                    Ok(notification) if notification.payload() != path.collection().as_str() => continue,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%path, error = %e, "Change listener failed.");
                        yield Err(db_error(e));
                        break;
                    }
                }
                match store.fetch(&path).await {
                    Ok(next) if next != last => {
                        last = next.clone();
                        yield Ok(next);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }
}

//=========================================================================================
// `AccountRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl AccountRepository for DbAdapter {
    async fn create_user_with_email(
        &self,
        email: &str,
        display_name: Option<&str>,
        hashed_password: &str,
    ) -> PortResult<Identity> {
        let record = sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (user_id, email, display_name, password_hash) VALUES ($1, $2, $3, $4) \
             RETURNING user_id, email, display_name",
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(display_name)
        .bind(hashed_password)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                PortError::InvalidInput(format!("An account already exists for {}", email))
            }
            other => db_error(other),
        })?;
        Ok(record.to_domain())
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<AccountCredentials> {
        let record = sqlx::query_as::<_, CredentialsRecord>(
            "SELECT user_id, email, display_name, password_hash FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("User {} not found", email)),
            other => db_error(other),
        })?;
        Ok(record.to_domain())
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Identity> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT u.user_id, u.email, u.display_name FROM auth_sessions s \
             JOIN users u ON u.user_id = s.user_id \
             WHERE s.id = $1 AND s.expires_at > now()",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        record
            .map(UserRecord::to_domain)
            .ok_or(PortError::Unauthorized)
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

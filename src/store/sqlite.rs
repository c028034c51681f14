//! SQLite-backed vector store.
//!
//! Records live in two tables: `memory_documents` for the structured fields
//! and `memory_vectors` for the out-of-band embedding, joined by id. Cosine
//! distance is computed inside SQLite via the `sqlite-vec` extension, which
//! is registered process-wide on first use.
//!
//! Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`), so several
//! processes can open the same database file concurrently.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use tokio_rusqlite::{Connection, OptionalExtension, ffi};
use uuid::Uuid;

use crate::error::MemoryError;

use super::{
    DocumentFilter, DocumentType, Page, PageRequest, ScoredDocument, StoredDocument,
    UpsertOutcome, UpsertProgress, UpsertReport, UpsertStatus, VectorStore, check_dimensions,
    l2_normalise, paginate, rank_results,
};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS memory_documents (
    id            TEXT PRIMARY KEY,
    content       TEXT NOT NULL,
    document_type TEXT NOT NULL,
    original_id   TEXT,
    chunk_number  INTEGER,
    content_hash  TEXT NOT NULL,
    tags          TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    timestamp     TEXT
);
CREATE INDEX IF NOT EXISTS idx_memory_documents_original
    ON memory_documents(original_id);
CREATE TABLE IF NOT EXISTS memory_vectors (
    id     TEXT PRIMARY KEY,
    vector TEXT NOT NULL
);
";

const DOCUMENT_COLUMNS: &str = "d.id, d.content, d.document_type, d.original_id, d.chunk_number, \
     d.content_hash, d.tags, d.metadata, d.timestamp, v.vector";

/// Persistent [`VectorStore`] implementation over SQLite + `sqlite-vec`.
pub struct SqliteVectorStore {
    conn: Connection,
    dimension: usize,
    batch_max: usize,
}

impl SqliteVectorStore {
    /// Opens (or creates) a store at the given path.
    pub async fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, MemoryError> {
        Self::register_sqlite_vec()?;
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path).await.map_err(MemoryError::storage)?;
        Self::from_connection(conn, dimension).await
    }

    /// Opens a transient in-memory database. Useful for tests.
    pub async fn open_in_memory(dimension: usize) -> Result<Self, MemoryError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open_in_memory()
            .await
            .map_err(MemoryError::storage)?;
        Self::from_connection(conn, dimension).await
    }

    async fn from_connection(conn: Connection, dimension: usize) -> Result<Self, MemoryError> {
        // Fail fast if the extension did not register.
        conn.call(|conn| {
            conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
                
        })
        .await
        .map_err(MemoryError::storage)?;

        let store = Self {
            conn,
            dimension,
            batch_max: 100,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Overrides the internal flush batch size (default 100).
    #[must_use]
    pub fn with_upsert_batch_max(mut self, batch_max: usize) -> Self {
        self.batch_max = batch_max.max(1);
        self
    }

    fn register_sqlite_vec() -> Result<(), MemoryError> {
        use std::sync::Mutex;

        static INIT: Once = Once::new();
        static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

        INIT.call_once(|| {
            let result = unsafe {
                type SqliteExtensionInit = unsafe extern "C" fn(
                    *mut ffi::sqlite3,
                    *mut *mut c_char,
                    *const ffi::sqlite3_api_routines,
                ) -> i32;

                let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
                let init_fn: SqliteExtensionInit =
                    transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
                let rc = ffi::sqlite3_auto_extension(Some(init_fn));
                if rc != 0 {
                    Err(format!("failed to register sqlite-vec extension (code {rc})"))
                } else {
                    Ok(())
                }
            };
            *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
        });

        INIT_RESULT
            .lock()
            .expect("init result mutex poisoned")
            .clone()
            .expect("init was called but result not set")
            .map_err(MemoryError::storage)
    }

    /// Loads every record (with its vector). Tag/metadata conditions are
    /// evaluated in-process against the reference filter semantics, so this
    /// backend fetches rows and filters in Rust.
    async fn load_all(&self) -> Result<Vec<StoredDocument>, MemoryError> {
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM memory_documents d \
                     JOIN memory_vectors v ON d.id = v.id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(StoredDocument {
                            id: row.get(0)?,
                            content: row.get(1)?,
                            document_type: DocumentType::decode(&row.get::<_, String>(2)?),
                            original_id: row.get(3)?,
                            chunk_number: row.get::<_, Option<i64>>(4)?.map(|n| n as u32),
                            content_hash: row.get(5)?,
                            tags: serde_json::from_str(&row.get::<_, String>(6)?)
                                .unwrap_or_default(),
                            metadata: serde_json::from_str(&row.get::<_, String>(7)?)
                                .unwrap_or_default(),
                            timestamp: row
                                .get::<_, Option<String>>(8)?
                                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                                .map(|t| t.with_timezone(&chrono::Utc)),
                            vector: serde_json::from_str(&row.get::<_, String>(9)?)
                                .unwrap_or_default(),
                        })
                    })
                    ?;

                let mut documents = Vec::new();
                for row in rows {
                    documents.push(row?);
                }
                Ok::<_, tokio_rusqlite::rusqlite::Error>(documents)
            })
            .await
            .map_err(MemoryError::storage)
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn ensure_schema(&self) -> Result<(), MemoryError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA_SQL)
                    
            })
            .await
            .map_err(MemoryError::storage)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(
        &self,
        documents: Vec<StoredDocument>,
        progress: Option<flume::Sender<UpsertProgress>>,
    ) -> Result<UpsertReport, MemoryError> {
        let total = documents.len();
        let mut report = UpsertReport::default();
        let mut processed = 0usize;

        for batch in documents.chunks(self.batch_max) {
            check_dimensions(batch, self.dimension)?;

            let mut prepared = Vec::with_capacity(batch.len());
            for doc in batch {
                let mut doc = doc.clone();
                if doc.id.is_empty() {
                    doc.id = Uuid::new_v4().to_string();
                }
                l2_normalise(&mut doc.vector);
                prepared.push(doc);
            }

            let statuses = self
                .conn
                .call(move |conn| {
                    let mut statuses = Vec::with_capacity(prepared.len());
                    for doc in prepared {
                        let id = doc.id.clone();
                        let outcome = (|| -> Result<(), tokio_rusqlite::Error> {
                            let sp = conn
                                .savepoint()
                                ?;
                            let tags_json = serde_json::to_string(&doc.tags)
                                .unwrap_or_else(|_| "[]".to_string());
                            let metadata_json = serde_json::to_string(&doc.metadata)
                                .unwrap_or_else(|_| "{}".to_string());
                            let vector_json = serde_json::to_string(&doc.vector)
                                .unwrap_or_else(|_| "[]".to_string());
                            sp.execute(
                                "INSERT INTO memory_documents \
                                 (id, content, document_type, original_id, chunk_number, \
                                  content_hash, tags, metadata, timestamp) \
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                                 ON CONFLICT(id) DO UPDATE SET \
                                   content = excluded.content, \
                                   document_type = excluded.document_type, \
                                   original_id = excluded.original_id, \
                                   chunk_number = excluded.chunk_number, \
                                   content_hash = excluded.content_hash, \
                                   tags = excluded.tags, \
                                   metadata = excluded.metadata, \
                                   timestamp = excluded.timestamp",
                                (
                                    &doc.id,
                                    &doc.content,
                                    doc.document_type.as_str(),
                                    &doc.original_id,
                                    doc.chunk_number.map(i64::from),
                                    &doc.content_hash,
                                    &tags_json,
                                    &metadata_json,
                                    doc.timestamp.map(|t| t.to_rfc3339()),
                                ),
                            )
                            ?;
                            sp.execute(
                                "INSERT INTO memory_vectors (id, vector) VALUES (?1, ?2) \
                                 ON CONFLICT(id) DO UPDATE SET vector = excluded.vector",
                                (&doc.id, &vector_json),
                            )
                            ?;
                            sp.commit()?;
                            Ok(())
                        })();

                        statuses.push(UpsertStatus {
                            id,
                            outcome: match outcome {
                                Ok(()) => UpsertOutcome::Stored,
                                Err(err) => UpsertOutcome::Failed(err.to_string()),
                            },
                        });
                    }
                    Ok::<_, tokio_rusqlite::rusqlite::Error>(statuses)
                })
                .await
                .map_err(MemoryError::storage)?;

            for status in statuses {
                processed += 1;
                if let Some(sender) = &progress {
                    let _ = sender.try_send(UpsertProgress {
                        id: status.id.clone(),
                        processed,
                        total,
                    });
                }
                report.statuses.push(status);
            }
        }

        Ok(report)
    }

    async fn query_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&DocumentFilter>,
    ) -> Result<Vec<ScoredDocument>, MemoryError> {
        if vector.len() != self.dimension {
            return Err(MemoryError::InvalidVector {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let mut query = vector.to_vec();
        l2_normalise(&mut query);
        let query_json = serde_json::to_string(&query).map_err(MemoryError::storage)?;

        let scored = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {DOCUMENT_COLUMNS}, \
                     vec_distance_cosine(vec_f32(v.vector), vec_f32(?1)) AS distance \
                     FROM memory_documents d \
                     JOIN memory_vectors v ON d.id = v.id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([&query_json], |row| {
                        let document = StoredDocument {
                            id: row.get(0)?,
                            content: row.get(1)?,
                            document_type: DocumentType::decode(&row.get::<_, String>(2)?),
                            original_id: row.get(3)?,
                            chunk_number: row.get::<_, Option<i64>>(4)?.map(|n| n as u32),
                            content_hash: row.get(5)?,
                            tags: serde_json::from_str(&row.get::<_, String>(6)?)
                                .unwrap_or_default(),
                            metadata: serde_json::from_str(&row.get::<_, String>(7)?)
                                .unwrap_or_default(),
                            timestamp: row
                                .get::<_, Option<String>>(8)?
                                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                                .map(|t| t.with_timezone(&chrono::Utc)),
                            vector: serde_json::from_str(&row.get::<_, String>(9)?)
                                .unwrap_or_default(),
                        };
                        let distance: f32 = row.get(10)?;
                        Ok(ScoredDocument {
                            document,
                            similarity: 1.0 - distance,
                        })
                    })
                    ?;

                let mut results = Vec::new();
                for row in rows {
                    results.push(row?);
                }
                Ok::<_, tokio_rusqlite::rusqlite::Error>(results)
            })
            .await
            .map_err(MemoryError::storage)?;

        let mut results: Vec<ScoredDocument> = scored
            .into_iter()
            .filter(|r| filter.is_none_or(|f| f.matches(&r.document)))
            .collect();
        rank_results(&mut results);
        results.truncate(k);
        Ok(results)
    }

    async fn get(&self, id: &str) -> Result<StoredDocument, MemoryError> {
        let wanted = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM memory_documents d \
                     JOIN memory_vectors v ON d.id = v.id WHERE d.id = ?1"
                );
                conn.query_row(&sql, [&wanted], |row| {
                    Ok(StoredDocument {
                        id: row.get(0)?,
                        content: row.get(1)?,
                        document_type: DocumentType::decode(&row.get::<_, String>(2)?),
                        original_id: row.get(3)?,
                        chunk_number: row.get::<_, Option<i64>>(4)?.map(|n| n as u32),
                        content_hash: row.get(5)?,
                        tags: serde_json::from_str(&row.get::<_, String>(6)?)
                            .unwrap_or_default(),
                        metadata: serde_json::from_str(&row.get::<_, String>(7)?)
                            .unwrap_or_default(),
                        timestamp: row
                            .get::<_, Option<String>>(8)?
                            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                            .map(|t| t.with_timezone(&chrono::Utc)),
                        vector: serde_json::from_str(&row.get::<_, String>(9)?)
                            .unwrap_or_default(),
                    })
                })
                .optional()
                
            })
            .await
            .map_err(MemoryError::storage)?;

        found.ok_or_else(|| MemoryError::NotFound { id: id.to_string() })
    }

    async fn update(
        &self,
        id: &str,
        content: String,
        vector: Vec<f32>,
        metadata: Option<std::collections::BTreeMap<String, String>>,
    ) -> Result<(), MemoryError> {
        if vector.len() != self.dimension {
            return Err(MemoryError::InvalidVector {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let mut vector = vector;
        l2_normalise(&mut vector);
        let content_hash = crate::chunking::content_hash(&[&content]);
        let wanted = id.to_string();

        let found = self
            .conn
            .call(move |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT metadata FROM memory_documents WHERE id = ?1",
                        [&wanted],
                        |row| row.get(0),
                    )
                    .optional()
                    ?;
                let Some(existing) = existing else {
                    return Ok::<_, tokio_rusqlite::rusqlite::Error>(false);
                };

                let mut merged: std::collections::BTreeMap<String, String> =
                    serde_json::from_str(&existing).unwrap_or_default();
                if let Some(patch) = metadata {
                    merged.extend(patch);
                }
                let metadata_json =
                    serde_json::to_string(&merged).unwrap_or_else(|_| "{}".to_string());
                let vector_json =
                    serde_json::to_string(&vector).unwrap_or_else(|_| "[]".to_string());

                let tx = conn
                    .transaction()
                    ?;
                tx.execute(
                    "UPDATE memory_documents \
                     SET content = ?2, content_hash = ?3, metadata = ?4 WHERE id = ?1",
                    (&wanted, &content, &content_hash, &metadata_json),
                )
                ?;
                tx.execute(
                    "UPDATE memory_vectors SET vector = ?2 WHERE id = ?1",
                    (&wanted, &vector_json),
                )
                ?;
                tx.commit()?;
                Ok(true)
            })
            .await
            .map_err(MemoryError::storage)?;

        if found {
            Ok(())
        } else {
            Err(MemoryError::NotFound { id: id.to_string() })
        }
    }

    async fn delete(&self, id: &str) -> Result<(), MemoryError> {
        let wanted = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    ?;
                // Vectors first, while the chunk rows still exist to resolve
                // the cascade.
                tx.execute(
                    "DELETE FROM memory_vectors WHERE id = ?1 OR id IN \
                     (SELECT id FROM memory_documents WHERE original_id = ?1)",
                    [&wanted],
                )
                ?;
                tx.execute(
                    "DELETE FROM memory_documents WHERE id = ?1 OR original_id = ?1",
                    [&wanted],
                )
                ?;
                tx.commit()?;
                Ok::<_, tokio_rusqlite::rusqlite::Error>(())
            })
            .await
            .map_err(MemoryError::storage)
    }

    async fn query_documents(
        &self,
        filter: &DocumentFilter,
        page: PageRequest,
    ) -> Result<Page, MemoryError> {
        let documents = self.load_all().await?;
        let matched: Vec<StoredDocument> = documents
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .collect();
        Ok(paginate(matched, page))
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM memory_documents", [], |row| {
                        row.get(0)
                    })
                    ?;
                Ok::<_, tokio_rusqlite::rusqlite::Error>(count as usize)
            })
            .await
            .map_err(MemoryError::storage)
    }

    async fn delete_all(&self) -> Result<(), MemoryError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "DELETE FROM memory_vectors; DELETE FROM memory_documents;",
                )
                
            })
            .await
            .map_err(MemoryError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteVectorStore {
        SqliteVectorStore::open_in_memory(3).await.unwrap()
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let store = store().await;
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_get_round_trip() {
        let store = store().await;
        let doc = StoredDocument::original("primaryUser lives in Berlin", vec![0.0, 3.0, 4.0])
            .with_metadata("subject", "primaryUser");
        let report = store.upsert(vec![doc], None).await.unwrap();
        assert_eq!(report.succeeded(), 1);

        let id = &report.statuses[0].id;
        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.content, "primaryUser lives in Berlin");
        assert_eq!(fetched.metadata.get("subject").unwrap(), "primaryUser");
        // Vector comes back L2-normalised.
        assert!((fetched.vector[1] - 0.6).abs() < 1e-6);
        assert!((fetched.vector[2] - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn knn_orders_by_cosine_similarity() {
        let store = store().await;
        store
            .upsert(
                vec![
                    StoredDocument::original("a", vec![1.0, 0.0, 0.0]).with_id("a"),
                    StoredDocument::original("b", vec![0.9, 0.1, 0.0]).with_id("b"),
                    StoredDocument::original("c", vec![0.0, 1.0, 0.0]).with_id("c"),
                ],
                None,
            )
            .await
            .unwrap();

        let results = store
            .query_by_vector(&[1.0, 0.0, 0.0], 2, None)
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.document.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks() {
        let store = store().await;
        store
            .upsert(
                vec![
                    StoredDocument::original("parent", vec![1.0, 0.0, 0.0]).with_id("p"),
                    StoredDocument::chunk("p", 0, "part", vec![1.0, 0.0, 0.0]).with_id("p:0"),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        store.delete("p").await.unwrap();
        store.delete("p").await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = store().await;
        let result = store
            .update("ghost", "x".into(), vec![1.0, 0.0, 0.0], None)
            .await;
        assert!(matches!(result, Err(MemoryError::NotFound { .. })));
    }
}

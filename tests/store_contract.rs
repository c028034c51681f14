//! Contract tests run against both vector store backends.
//!
//! The in-memory backend is the reference implementation; the SQLite backend
//! must expose identical semantics. Each test body is written once against
//! `dyn VectorStore` and executed per backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use memloom::error::MemoryError;
use memloom::store::memory::MemoryVectorStore;
use memloom::store::sqlite::SqliteVectorStore;
use memloom::store::{
    DocumentFilter, DocumentType, PageRequest, StoredDocument, VectorStore, l2_normalise,
};
use proptest::prelude::*;

const DIM: usize = 4;

async fn backends() -> Vec<(&'static str, Arc<dyn VectorStore>)> {
    vec![
        ("memory", Arc::new(MemoryVectorStore::new(DIM))),
        (
            "sqlite",
            Arc::new(SqliteVectorStore::open_in_memory(DIM).await.unwrap()),
        ),
    ]
}

fn doc(id: &str, content: &str, vector: [f32; DIM]) -> StoredDocument {
    StoredDocument::original(content, vector.to_vec()).with_id(id)
}

#[tokio::test]
async fn upsert_get_round_trip_within_tolerance() {
    for (name, store) in backends().await {
        let mut metadata = BTreeMap::new();
        metadata.insert("subject".to_string(), "primaryUser".to_string());
        metadata.insert("category".to_string(), "habit".to_string());

        let mut written = doc("f1", "primaryUser drinks coffee at 7am", [0.2, 0.4, 0.1, 0.8]);
        written.metadata = metadata.clone();
        written.tags.insert("habits".to_string());
        written.timestamp = Some(Utc.with_ymd_and_hms(2025, 5, 4, 8, 30, 0).unwrap());

        store.upsert(vec![written.clone()], None).await.unwrap();
        let fetched = store.get("f1").await.unwrap();

        assert_eq!(fetched.content, written.content, "{name}");
        assert_eq!(fetched.metadata, metadata, "{name}");
        assert_eq!(fetched.tags, written.tags, "{name}");
        assert_eq!(fetched.timestamp, written.timestamp, "{name}");
        assert_eq!(fetched.content_hash, written.content_hash, "{name}");

        let mut expected = written.vector.clone();
        l2_normalise(&mut expected);
        assert_eq!(fetched.vector.len(), DIM, "{name}");
        for (got, want) in fetched.vector.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "{name}: vector drift");
        }
    }
}

#[tokio::test]
async fn delete_is_idempotent() {
    for (name, store) in backends().await {
        store
            .upsert(vec![doc("victim", "to be removed", [1.0, 0.0, 0.0, 0.0])], None)
            .await
            .unwrap();

        store.delete("victim").await.unwrap();
        store.delete("victim").await.unwrap();
        assert!(
            matches!(store.get("victim").await, Err(MemoryError::NotFound { .. })),
            "{name}: record must be gone"
        );
        // Deleting an id that never existed is also a success.
        store.delete("never-there").await.unwrap();
    }
}

#[tokio::test]
async fn chunk_cascade_removes_children() {
    for (name, store) in backends().await {
        store
            .upsert(
                vec![
                    doc("orig", "the original", [1.0, 0.0, 0.0, 0.0]),
                    StoredDocument::chunk("orig", 0, "slice one", [1.0, 0.0, 0.0, 0.0].to_vec())
                        .with_id("orig:0"),
                    StoredDocument::chunk("orig", 1, "slice two", [0.0, 1.0, 0.0, 0.0].to_vec())
                        .with_id("orig:1"),
                    doc("bystander", "unrelated", [0.0, 0.0, 1.0, 0.0]),
                ],
                None,
            )
            .await
            .unwrap();

        store.delete("orig").await.unwrap();

        let chunks = store
            .query_documents(
                &DocumentFilter::new()
                    .with_document_type(DocumentType::Chunk)
                    .with_original_id("orig"),
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(chunks.total, 0, "{name}: cascade must remove all chunks");
        assert_eq!(store.count().await.unwrap(), 1, "{name}: bystander survives");
    }
}

// Scenario: with seeded vectors a=[1,0,..], b=[0.9,0.1,..], c=[0,1,..] and
// query [1,0,..], the top-2 results are [a, b] in that order.
#[tokio::test]
async fn query_determinism_with_seeded_vectors() {
    for (name, store) in backends().await {
        store
            .upsert(
                vec![
                    doc("a", "vector a", [1.0, 0.0, 0.0, 0.0]),
                    doc("b", "vector b", [0.9, 0.1, 0.0, 0.0]),
                    doc("c", "vector c", [0.0, 1.0, 0.0, 0.0]),
                ],
                None,
            )
            .await
            .unwrap();

        let results = store
            .query_by_vector(&[1.0, 0.0, 0.0, 0.0], 2, None)
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.document.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"], "{name}");
        assert!(
            results[0].similarity >= results[1].similarity,
            "{name}: similarity must not increase down the ranking"
        );
    }
}

#[tokio::test]
async fn query_ties_break_by_timestamp_then_id() {
    for (name, store) in backends().await {
        let older = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        // Identical vectors: similarity ties across all three.
        let vector = [0.5, 0.5, 0.0, 0.0];
        store
            .upsert(
                vec![
                    doc("z-old", "old", vector).with_timestamp(older),
                    doc("m-new", "new", vector).with_timestamp(newer),
                    doc("a-new", "new too", vector).with_timestamp(newer),
                ],
                None,
            )
            .await
            .unwrap();

        let results = store
            .query_by_vector(&vector, 3, None)
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.document.id.as_str()).collect();
        assert_eq!(ids, vec!["a-new", "m-new", "z-old"], "{name}");
    }
}

#[tokio::test]
async fn filters_compose_as_conjunction() {
    for (name, store) in backends().await {
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
        let mut gmail = doc("g1", "an email", [1.0, 0.0, 0.0, 0.0]);
        gmail.metadata.insert("source".into(), "gmail".into());
        gmail.tags.insert("inbox".into());
        gmail.timestamp = Some(at);

        let mut chat = doc("c1", "a chat line", [1.0, 0.0, 0.0, 0.0]);
        chat.metadata.insert("source".into(), "chatgpt".into());

        store.upsert(vec![gmail, chat], None).await.unwrap();

        let filter = DocumentFilter::new()
            .with_source("gmail")
            .with_tag("inbox")
            .with_timestamp_from(at)
            .with_timestamp_to(at);
        let page = store
            .query_documents(&filter, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1, "{name}");
        assert_eq!(page.items[0].id, "g1", "{name}");

        let results = store
            .query_by_vector(&[1.0, 0.0, 0.0, 0.0], 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 1, "{name}");
        assert_eq!(results[0].document.id, "g1", "{name}");
    }
}

#[tokio::test]
async fn pagination_is_stable_and_complete() {
    for (name, store) in backends().await {
        let docs: Vec<StoredDocument> = (0..10)
            .map(|i| doc(&format!("id-{i:02}"), "paged", [1.0, 0.0, 0.0, 0.0]))
            .collect();
        store.upsert(docs, None).await.unwrap();

        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let page = store
                .query_documents(&DocumentFilter::new(), PageRequest::new(3, offset))
                .await
                .unwrap();
            assert_eq!(page.total, 10, "{name}");
            seen.extend(page.items.iter().map(|d| d.id.clone()));
            offset += page.items.len();
            if !page.has_more {
                break;
            }
        }
        assert_eq!(seen.len(), 10, "{name}: pages must cover every record");
        let mut deduped = seen.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), 10, "{name}: pages must not overlap");
    }
}

#[tokio::test]
async fn update_survives_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memloom.db");

    {
        let store = SqliteVectorStore::open(&path, DIM).await.unwrap();
        store
            .upsert(vec![doc("persisted", "before", [1.0, 0.0, 0.0, 0.0])], None)
            .await
            .unwrap();
        store
            .update(
                "persisted",
                "after".to_string(),
                vec![0.0, 1.0, 0.0, 0.0],
                None,
            )
            .await
            .unwrap();
    }

    // Reopen: schema creation is idempotent and the data is still there.
    let store = SqliteVectorStore::open(&path, DIM).await.unwrap();
    let fetched = store.get("persisted").await.unwrap();
    assert_eq!(fetched.content, "after");
    assert!((fetched.vector[1] - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn delete_all_empties_the_store() {
    for (name, store) in backends().await {
        store
            .upsert(
                vec![
                    doc("x", "one", [1.0, 0.0, 0.0, 0.0]),
                    doc("y", "two", [0.0, 1.0, 0.0, 0.0]),
                ],
                None,
            )
            .await
            .unwrap();
        store.delete_all().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0, "{name}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // Ranking invariant: results are sorted strictly by descending
    // similarity, with the documented tie-breaks, for arbitrary stores.
    #[test]
    fn ranking_invariant_holds_for_arbitrary_vectors(
        vectors in proptest::collection::vec(
            proptest::array::uniform4(-1.0f32..1.0),
            1..24,
        ),
        query in proptest::array::uniform4(-1.0f32..1.0),
    ) {
        prop_assume!(query.iter().any(|v| v.abs() > 1e-3));
        prop_assume!(vectors.iter().all(|v| v.iter().any(|x| x.abs() > 1e-3)));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let store = MemoryVectorStore::new(DIM);
            let docs: Vec<StoredDocument> = vectors
                .iter()
                .enumerate()
                .map(|(i, v)| doc(&format!("v{i:03}"), "probe", *v))
                .collect();
            store.upsert(docs, None).await.unwrap();

            let results = store.query_by_vector(&query, vectors.len(), None).await.unwrap();
            for pair in results.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.similarity >= b.similarity);
                if a.similarity.total_cmp(&b.similarity).is_eq() {
                    prop_assert!(a.document.id <= b.document.id);
                }
            }
            Ok(())
        })?;
    }
}

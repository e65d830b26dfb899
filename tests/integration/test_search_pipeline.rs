//! End-to-end search over a store configured from `Settings`.

use crate::common::{TestStore, basis, tagged};
use plotarmor::{
    EmbeddingGenerator, MetadataFilter, SearchError, TermFrequencyEmbedder, Vector, Vocabulary,
};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_padded_search_matches_worked_example() {
    let test = TestStore::new(16);
    let store = test.open();
    store
        .store_batch(vec![
            Vector::new("A", vec![1.0, 0.0, 0.0, 0.0]),
            Vector::new("B", vec![0.0, 1.0, 0.0, 0.0]),
            Vector::new("C", vec![0.9, 0.1, 0.0, 0.0]),
        ])
        .unwrap();

    let engine = test.engine(&store);
    let results = engine.search(&[1.0, 0.0, 0.0, 0.0], 2, None).unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec!["A", "C"]);
    assert!((results[0].similarity - 1.0).abs() < 1e-6);
    assert!((results[1].similarity - 0.994).abs() < 1e-3);
    assert!(results.iter().all(|r| r.vector.values.len() == 16));
}

#[test]
fn test_filtered_search_and_cache_invalidation() {
    let test = TestStore::new(4);
    let store = test.open();
    store
        .store_batch(vec![
            tagged("x-near", vec![1.0, 0.1], "x"),
            tagged("y-near", vec![1.0, 0.0], "y"),
            tagged("x-far", vec![0.0, 1.0], "x"),
            Vector::new("untagged", vec![1.0, 0.0]),
        ])
        .unwrap();
    let engine = test.engine(&store);
    let filter = MetadataFilter::new().with("category", "x");

    let first = engine.search(&[1.0, 0.0], 5, Some(&filter)).unwrap();
    assert_eq!(
        first.iter().map(|r| r.id()).collect::<Vec<_>>(),
        vec!["x-near", "x-far"]
    );
    let again = engine.search(&[1.0, 0.0], 5, Some(&filter)).unwrap();
    assert_eq!(first, again);
    assert_eq!(engine.cache_metrics().hits, 1);

    store.delete("x-near").unwrap();
    let after_delete = engine.search(&[1.0, 0.0], 5, Some(&filter)).unwrap();
    assert_eq!(
        after_delete.iter().map(|r| r.id()).collect::<Vec<_>>(),
        vec!["x-far"]
    );
}

#[test]
fn test_text_ingestion_and_search_share_vocabulary() {
    let test = TestStore::new(32);
    let vocabulary = Arc::new(Vocabulary::new(32));
    let embedder = Arc::new(TermFrequencyEmbedder::with_vocabulary(Arc::clone(&vocabulary)).unwrap());
    let store = test.open();

    for (id, text) in [
        ("storage", "write ahead log and snapshot compaction"),
        ("search", "parallel cosine similarity search"),
        ("cache", "cache eviction and ttl expiry"),
    ] {
        store
            .store(Vector::new(id, embedder.generate_embedding(text).unwrap()))
            .unwrap();
    }
    vocabulary.save(&test.settings.vocabulary_path()).unwrap();

    // A fresh embedder over the persisted vocabulary maps terms identically.
    let reloaded = Arc::new(Vocabulary::load(&test.settings.vocabulary_path()).unwrap());
    let embedder = Arc::new(TermFrequencyEmbedder::with_vocabulary(reloaded).unwrap());
    let engine = test.engine(&store).with_embedder(embedder);

    let results = engine.search_by_text("cosine search", 1, None).unwrap();
    assert_eq!(results[0].id(), "search");
    let results = engine.search_by_text("snapshot compaction", 1, None).unwrap();
    assert_eq!(results[0].id(), "storage");
}

#[test]
fn test_concurrent_searches_during_writes() {
    let test = TestStore::new(8);
    let store = test.open();
    store
        .store_batch((0..200).map(|i| Vector::new(format!("base{i:03}"), basis(8, i % 8))).collect())
        .unwrap();
    let engine = Arc::new(test.engine(&store));

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..100 {
                store
                    .store(Vector::new(format!("new{i:03}"), basis(8, i % 8)))
                    .unwrap();
            }
        })
    };
    let searchers: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let results = engine.search(&basis(8, t), 10, None).unwrap();
                    assert_eq!(results.len(), 10);
                    assert!(results.iter().all(|r| (r.similarity - 1.0).abs() < 1e-6));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for searcher in searchers {
        searcher.join().unwrap();
    }
    assert_eq!(store.len(), 300);
}

#[test]
fn test_engine_close_clears_cache_and_refuses_work() {
    let test = TestStore::new(4);
    let store = test.open();
    store.store(Vector::new("a", basis(4, 0))).unwrap();
    let engine = test.engine(&store);

    engine.search(&basis(4, 0), 1, None).unwrap();
    assert_eq!(engine.cache_metrics().size, 1);

    assert!(engine.close(Duration::from_secs(1)));
    assert_eq!(engine.cache_metrics().size, 0);
    assert!(matches!(
        engine.search(&basis(4, 0), 1, None),
        Err(SearchError::ShuttingDown)
    ));
    // The store is independent of the engine.
    assert_eq!(store.len(), 1);
}

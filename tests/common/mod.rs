#![allow(dead_code)]

use plotarmor::{Durability, SearchEngine, Settings, Vector, VectorDimension, VectorStore};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Settings rooted in an isolated temporary directory.
pub fn test_settings(dir: &Path, dimension: usize) -> Settings {
    let mut settings = Settings::default();
    settings.data_path = dir.join("data");
    settings.dimension = VectorDimension::new(dimension).expect("non-zero dimension");
    settings.storage.durability = Durability::Buffered;
    settings.search.worker_threads = 4;
    settings
}

pub struct TestStore {
    pub dir: TempDir,
    pub settings: Settings,
}

impl TestStore {
    pub fn new(dimension: usize) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings = test_settings(dir.path(), dimension);
        Self { dir, settings }
    }

    pub fn open(&self) -> Arc<VectorStore> {
        Arc::new(
            VectorStore::open(self.settings.store_path(), self.settings.storage_options())
                .expect("Failed to open store"),
        )
    }

    pub fn engine(&self, store: &Arc<VectorStore>) -> SearchEngine {
        SearchEngine::new(Arc::clone(store), self.settings.search_options())
            .expect("Failed to start engine")
    }
}

/// Unit basis vector `e_index` of the given width.
pub fn basis(dimension: usize, index: usize) -> Vec<f32> {
    let mut values = vec![0.0; dimension];
    values[index] = 1.0;
    values
}

pub fn tagged(id: &str, values: Vec<f32>, category: &str) -> Vector {
    Vector::new(id, values).with_metadata("category", category)
}

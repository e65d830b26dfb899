//! Text embedding generation for text queries and text ingestion.
//!
//! The search engine only needs fixed-length, order-stable float vectors, so
//! the producer sits behind the [`EmbeddingGenerator`] trait. The bundled
//! [`TermFrequencyEmbedder`] maps each term to a vocabulary slot and weights it
//! by its frequency in the text.
//!
//! # Vocabulary invariants
//! - A term's index is assigned once and never changes or gets reused.
//! - Indices are handed out in increasing order, starting from zero.
//! - Once the vocabulary reaches capacity, unseen terms are ignored.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::EmbeddingError;
use crate::vector::{VectorDimension, normalize_in_place};

/// Trait for generating embeddings from text.
///
/// Implementations of this trait should be thread-safe; the search engine
/// shares one generator across all callers.
pub trait EmbeddingGenerator: Send + Sync {
    /// Generate an embedding for a single text.
    fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Generate embeddings for multiple texts, one per input.
    fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.generate_embedding(t)).collect()
    }

    /// Get the dimension of embeddings produced by this generator.
    #[must_use]
    fn dimension(&self) -> VectorDimension;
}

/// Persisted form of a vocabulary: terms in index order.
#[derive(Debug, Serialize, Deserialize)]
struct VocabularyFile {
    capacity: usize,
    terms: Vec<String>,
}

/// Append-only term-to-index table shared by embedders.
#[derive(Debug)]
pub struct Vocabulary {
    index: RwLock<VocabularyState>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct VocabularyState {
    by_term: HashMap<String, u32>,
    terms: Vec<String>,
}

impl Vocabulary {
    /// Creates an empty vocabulary holding at most `capacity` terms.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            index: RwLock::new(VocabularyState::default()),
            capacity,
        }
    }

    /// Returns the index for `term`, assigning the next free one if the term
    /// is new. Returns `None` once the vocabulary is full.
    pub fn get_or_assign(&self, term: &str) -> Option<u32> {
        if let Some(&index) = self.index.read().by_term.get(term) {
            return Some(index);
        }

        let mut state = self.index.write();
        // Another thread may have assigned it between the two locks.
        if let Some(&index) = state.by_term.get(term) {
            return Some(index);
        }
        if state.terms.len() >= self.capacity {
            return None;
        }
        let index = state.terms.len() as u32;
        state.by_term.insert(term.to_string(), index);
        state.terms.push(term.to_string());
        Some(index)
    }

    /// Looks up an already assigned index without assigning.
    #[must_use]
    pub fn get(&self, term: &str) -> Option<u32> {
        self.index.read().by_term.get(term).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().terms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the known terms in index order.
    #[must_use]
    pub fn terms(&self) -> Vec<String> {
        self.index.read().terms.clone()
    }

    /// Forgets every term. Intended for tests and explicit re-initialization.
    pub fn reset(&self) {
        let mut state = self.index.write();
        state.by_term.clear();
        state.terms.clear();
    }

    /// Writes the vocabulary as JSON so indices survive restarts.
    pub fn save(&self, path: &Path) -> Result<(), EmbeddingError> {
        let file = VocabularyFile {
            capacity: self.capacity,
            terms: self.terms(),
        };
        let save_err = |reason: String| EmbeddingError::VocabularySave {
            path: path.to_path_buf(),
            reason,
        };
        let json = serde_json::to_vec(&file).map_err(|e| save_err(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| save_err(e.to_string()))?;
        }
        std::fs::write(path, json).map_err(|e| save_err(e.to_string()))
    }

    /// Loads a vocabulary written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, EmbeddingError> {
        let load_err = |reason: String| EmbeddingError::VocabularyLoad {
            path: path.to_path_buf(),
            reason,
        };
        let bytes = std::fs::read(path).map_err(|e| load_err(e.to_string()))?;
        let file: VocabularyFile =
            serde_json::from_slice(&bytes).map_err(|e| load_err(e.to_string()))?;
        if file.terms.len() > file.capacity {
            return Err(load_err(format!(
                "{} terms exceed capacity {}",
                file.terms.len(),
                file.capacity
            )));
        }

        let mut state = VocabularyState::default();
        for term in file.terms {
            if state.by_term.contains_key(&term) {
                return Err(load_err(format!("duplicate term '{term}'")));
            }
            state.by_term.insert(term.clone(), state.terms.len() as u32);
            state.terms.push(term);
        }

        Ok(Self {
            index: RwLock::new(state),
            capacity: file.capacity,
        })
    }

    /// Loads the vocabulary at `path` if it exists, otherwise starts empty.
    pub fn load_or_new(path: &Path, capacity: usize) -> Result<Self, EmbeddingError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new(capacity))
        }
    }
}

/// Term-frequency embedder backed by a shared [`Vocabulary`].
///
/// Produces vectors of `vocabulary.capacity()` components, L2-normalized.
#[derive(Debug, Clone)]
pub struct TermFrequencyEmbedder {
    vocabulary: Arc<Vocabulary>,
    dimension: VectorDimension,
}

impl TermFrequencyEmbedder {
    /// Creates an embedder with a fresh vocabulary of `vocabulary_size` terms.
    pub fn new(vocabulary_size: usize) -> Result<Self, EmbeddingError> {
        Self::with_vocabulary(Arc::new(Vocabulary::new(vocabulary_size)))
    }

    /// Creates an embedder over an existing, possibly shared, vocabulary.
    pub fn with_vocabulary(vocabulary: Arc<Vocabulary>) -> Result<Self, EmbeddingError> {
        let dimension = VectorDimension::new(vocabulary.capacity())
            .map_err(|e| EmbeddingError::Generation(e.to_string()))?;
        Ok(Self {
            vocabulary,
            dimension,
        })
    }

    #[must_use]
    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }
}

/// Lowercases, drops every character that is not ASCII alphanumeric or
/// whitespace, and splits on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().map(str::to_string).collect()
}

impl EmbeddingGenerator for TermFrequencyEmbedder {
    fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let tokens = tokenize(text);
        let mut embedding = vec![0.0f32; self.dimension.get()];
        if tokens.is_empty() {
            return Ok(embedding);
        }

        let mut frequencies: HashMap<&str, u32> = HashMap::new();
        for token in &tokens {
            *frequencies.entry(token.as_str()).or_default() += 1;
        }

        let total = tokens.len() as f32;
        for (term, count) in frequencies {
            if let Some(index) = self.vocabulary.get_or_assign(term) {
                embedding[index as usize] = count as f32 / total;
            }
        }

        normalize_in_place(&mut embedding);
        Ok(embedding)
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::l2_norm;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn test_tokenize_strips_punctuation() {
        assert_eq!(
            tokenize("Hello, World!  hello-again"),
            vec!["hello", "world", "helloagain"]
        );
        assert!(tokenize("  ?! ").is_empty());
    }

    #[test]
    fn test_vocabulary_assigns_monotonic_indices() {
        let vocab = Vocabulary::new(10);
        assert_eq!(vocab.get_or_assign("alpha"), Some(0));
        assert_eq!(vocab.get_or_assign("beta"), Some(1));
        assert_eq!(vocab.get_or_assign("alpha"), Some(0));
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.terms(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_vocabulary_is_bounded() {
        let vocab = Vocabulary::new(2);
        vocab.get_or_assign("a");
        vocab.get_or_assign("b");
        assert_eq!(vocab.get_or_assign("c"), None);
        assert_eq!(vocab.get("c"), None);
        assert_eq!(vocab.len(), 2);
    }

    #[test]
    fn test_concurrent_assignment_has_no_duplicates() {
        let vocab = Arc::new(Vocabulary::new(1_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let vocab = Arc::clone(&vocab);
                std::thread::spawn(move || {
                    (0..200)
                        .map(|i| vocab.get_or_assign(&format!("term{}", (i + t * 7) % 300)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let terms = vocab.terms();
        let unique: HashSet<_> = terms.iter().collect();
        assert_eq!(unique.len(), terms.len());
        for (expected, term) in terms.iter().enumerate() {
            assert_eq!(vocab.get(term), Some(expected as u32));
        }
    }

    #[test]
    fn test_reset_clears_vocabulary() {
        let vocab = Vocabulary::new(4);
        vocab.get_or_assign("x");
        vocab.reset();
        assert!(vocab.is_empty());
        assert_eq!(vocab.get_or_assign("y"), Some(0));
    }

    #[test]
    fn test_embedding_is_normalized_term_frequency() {
        let embedder = TermFrequencyEmbedder::new(16).unwrap();
        let embedding = embedder.generate_embedding("cat cat dog").unwrap();

        assert_eq!(embedding.len(), 16);
        let cat = embedder.vocabulary().get("cat").unwrap() as usize;
        let dog = embedder.vocabulary().get("dog").unwrap() as usize;
        // Weights 2/3 and 1/3 normalize to 2/sqrt(5) and 1/sqrt(5).
        assert!((embedding[cat] - 2.0 / 5f32.sqrt()).abs() < 1e-6);
        assert!((embedding[dog] - 1.0 / 5f32.sqrt()).abs() < 1e-6);
        assert!((l2_norm(&embedding) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_text_yields_zero_vector() {
        let embedder = TermFrequencyEmbedder::new(8).unwrap();
        let embedding = embedder.generate_embedding("!!!").unwrap();
        assert!(embedding.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_same_text_embeds_identically() {
        let embedder = TermFrequencyEmbedder::new(32).unwrap();
        let first = embedder.generate_embedding("rust vector search").unwrap();
        embedder.generate_embedding("unrelated words here").unwrap();
        let second = embedder.generate_embedding("search vector rust").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_vocabulary_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vocab").join("vocabulary.json");

        let vocab = Vocabulary::new(8);
        vocab.get_or_assign("one");
        vocab.get_or_assign("two");
        vocab.save(&path).unwrap();

        let loaded = Vocabulary::load(&path).unwrap();
        assert_eq!(loaded.capacity(), 8);
        assert_eq!(loaded.get("two"), Some(1));
        assert_eq!(loaded.get_or_assign("three"), Some(2));

        let fresh = Vocabulary::load_or_new(&temp_dir.path().join("missing.json"), 4).unwrap();
        assert!(fresh.is_empty());
    }
}

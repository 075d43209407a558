//! Text embeddings for goal-alignment scoring.
//!
//! The [`Embedder`] seam keeps the validator independent of where vectors
//! come from. The default [`KeywordEmbedder`] is a deterministic, offline
//! scorer: it buckets text into a handful of life-area features plus a
//! length feature and normalizes. Good enough for nearest-goal retrieval;
//! a hosted embedding API can replace it behind the same trait.

use async_trait::async_trait;

/// Life-area keyword buckets. One embedding dimension per bucket.
const BUCKETS: &[(&str, &[&str])] = &[
    (
        "work",
        &[
            "work", "meeting", "project", "code", "tech", "architecture", "design", "review",
            "sprint", "deadline", "client",
        ],
    ),
    (
        "creative",
        &[
            "album", "recording", "mixing", "studio", "song", "music", "vocals", "perform",
            "show", "gig", "write", "draft",
        ],
    ),
    (
        "health",
        &[
            "health", "workout", "cardio", "strength", "sleep", "food", "meal", "nutrition",
            "run", "gym", "doctor", "dentist",
        ],
    ),
    (
        "home",
        &[
            "home", "house", "renovation", "contractor", "hosting", "party", "dinner", "travel",
            "finance", "clean", "grocer",
        ],
    ),
];

/// Embedding width: one dimension per bucket plus a length feature.
pub const EMBEDDING_DIM: usize = BUCKETS.len() + 1;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Deterministic keyword-bucket embedder. No network, no state.
pub struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(keyword_embedding(text))
    }
}

fn keyword_embedding(text: &str) -> Vec<f32> {
    let normalized = text.to_lowercase();
    let mut embedding = vec![0.0f32; EMBEDDING_DIM];

    for (i, (_, words)) in BUCKETS.iter().enumerate() {
        embedding[i] = words.iter().filter(|w| normalized.contains(**w)).count() as f32;
    }
    embedding[BUCKETS.len()] = text.len() as f32 / 100.0;

    let magnitude = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in &mut embedding {
            *value /= magnitude;
        }
    }
    embedding
}

/// Cosine similarity in [-1, 1]. Returns 0.0 for mismatched lengths or a
/// zero vector rather than propagating a NaN into score arithmetic.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_are_unit_length() {
        let e = keyword_embedding("finish mixing the album in the studio");
        let magnitude: f32 = e.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_texts_score_higher_than_unrelated() {
        let workout = keyword_embedding("morning cardio workout at the gym");
        let meal = keyword_embedding("plan the week's meal nutrition");
        let sprint_review = keyword_embedding("prep the sprint review for the client meeting");

        assert!(
            cosine_similarity(&workout, &meal) > cosine_similarity(&workout, &sprint_review)
        );
    }

    #[test]
    fn zero_vector_yields_zero_not_nan() {
        let zero = vec![0.0f32; EMBEDDING_DIM];
        let some = keyword_embedding("workout");
        assert_eq!(cosine_similarity(&zero, &some), 0.0);
    }

    #[test]
    fn mismatched_lengths_yield_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }

    proptest::proptest! {
        #[test]
        fn similarity_is_bounded_and_symmetric(
            a in proptest::collection::vec(-10.0f32..10.0, EMBEDDING_DIM),
            b in proptest::collection::vec(-10.0f32..10.0, EMBEDDING_DIM),
        ) {
            let s = cosine_similarity(&a, &b);
            proptest::prop_assert!((-1.0001..=1.0001).contains(&s));
            let reversed = cosine_similarity(&b, &a);
            proptest::prop_assert!((s - reversed).abs() < 1e-9);
        }

        #[test]
        fn embeddings_never_contain_nan(text in ".{0,200}") {
            let e = keyword_embedding(&text);
            proptest::prop_assert!(e.iter().all(|v| v.is_finite()));
        }
    }
}

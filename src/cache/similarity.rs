//! Prompt normalization, hashing, and similarity scoring.
//!
//! Two prompts match exactly when their normalized forms hash to the same
//! key under the same model. Fuzzy matching scores normalized text with a
//! bigram Dice coefficient, or optionally with a holographic trigram
//! encoding that folds configured semantic seed terms into the vector.

use std::collections::HashMap;

/// Normalize a prompt for keying and similarity: lowercase, strip
/// non-word/non-space characters, collapse whitespace, trim.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn djb2(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Cache key: djb2 over `normalized|model`. Including the model id keeps
/// responses from one model out of another model's hits.
pub fn hash_key(normalized: &str, model: &str) -> String {
    let mut input = Vec::with_capacity(normalized.len() + model.len() + 1);
    input.extend_from_slice(normalized.as_bytes());
    input.push(b'|');
    input.extend_from_slice(model.as_bytes());
    format!("{:08x}", djb2(&input))
}

fn bigram_counts(text: &str) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = text.chars().collect();
    let mut counts = HashMap::new();
    for pair in chars.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    counts
}

/// Bigram Dice coefficient over two normalized texts, in `[0.0, 1.0]`.
pub fn dice_coefficient(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }

    let counts_a = bigram_counts(a);
    let counts_b = bigram_counts(b);
    let total_a: usize = counts_a.values().sum();
    let total_b: usize = counts_b.values().sum();
    if total_a == 0 || total_b == 0 {
        return 0.0;
    }

    let overlap: usize = counts_a
        .iter()
        .map(|(bigram, &count)| count.min(*counts_b.get(bigram).unwrap_or(&0)))
        .sum();

    (2.0 * overlap as f64) / (total_a + total_b) as f64
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Number of dimensions in a holographic vector.
const HOLOGRAPHIC_DIMS: usize = 256;
/// Components contributed by each semantic seed term.
const SEED_COMPONENTS: usize = 8;
/// Weight of a seed component relative to a trigram component.
const SEED_WEIGHT: f32 = 2.0;

/// Higher-recall similarity backend: character trigrams scattered into a
/// fixed-width signed vector, with configured seed terms contributing
/// deterministic weighted patterns so domain vocabulary pulls related
/// prompts together.
#[derive(Debug, Clone)]
pub struct HolographicEncoder {
    seeds: HashMap<String, u64>,
}

impl HolographicEncoder {
    /// Create an encoder. Seed terms are matched against normalized text.
    pub fn new(seeds: Option<HashMap<String, u64>>) -> Self {
        let seeds = seeds
            .unwrap_or_default()
            .into_iter()
            .map(|(term, seed)| (normalize(&term), seed))
            .collect();
        Self { seeds }
    }

    /// Encode normalized text into a unit-length vector.
    pub fn encode(&self, normalized: &str) -> Vec<f32> {
        let mut vector = vec![0f32; HOLOGRAPHIC_DIMS];
        let chars: Vec<char> = normalized.chars().collect();

        if chars.len() < 3 {
            let hash = djb2(normalized.as_bytes());
            vector[hash as usize % HOLOGRAPHIC_DIMS] += 1.0;
        } else {
            for window in chars.windows(3) {
                let trigram: String = window.iter().collect();
                let hash = djb2(trigram.as_bytes());
                let sign = if (hash >> 16) & 1 == 0 { 1.0 } else { -1.0 };
                vector[hash as usize % HOLOGRAPHIC_DIMS] += sign;
            }
        }

        for (term, seed) in &self.seeds {
            if !term.is_empty() && normalized.contains(term.as_str()) {
                let mut state = *seed;
                for _ in 0..SEED_COMPONENTS {
                    let r = splitmix64(&mut state);
                    let sign = if r & 1 == 0 { 1.0 } else { -1.0 };
                    vector[(r >> 1) as usize % HOLOGRAPHIC_DIMS] += SEED_WEIGHT * sign;
                }
            }
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }

    /// Cosine similarity between two encoded vectors, in `[-1.0, 1.0]`.
    pub fn similarity(a: &[f32], b: &[f32]) -> f64 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        (dot / (norm_a * norm_b)) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize("  How do I  configure my DB?! "),
            "how do i configure my db"
        );
        assert_eq!(normalize("a_b-c"), "a_b c");
        assert_eq!(normalize("!!!"), "");
    }

    #[test]
    fn test_hash_key_is_model_scoped() {
        let n = normalize("What is TypeScript?");
        let k1 = hash_key(&n, "gpt-4o");
        let k2 = hash_key(&n, "gpt-4o");
        let k3 = hash_key(&n, "gpt-4o-mini");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_dice_identical_and_disjoint() {
        assert_eq!(dice_coefficient("night", "night"), 1.0);
        assert_eq!(dice_coefficient("abc", "xyz"), 0.0);
        assert_eq!(dice_coefficient("", "abc"), 0.0);
    }

    #[test]
    fn test_dice_near_match() {
        let a = normalize("How do I configure my database connection?");
        let b = normalize("How do I configure my database connection");
        assert!(dice_coefficient(&a, &b) >= 0.85);

        let c = normalize("What is the weather today?");
        assert!(dice_coefficient(&a, &c) < 0.5);
    }

    #[test]
    fn test_holographic_self_similarity() {
        let encoder = HolographicEncoder::new(None);
        let v = encoder.encode("how do i configure my database connection");
        assert!((HolographicEncoder::similarity(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_holographic_near_match_beats_unrelated() {
        let encoder = HolographicEncoder::new(None);
        let a = encoder.encode("how do i configure my database connection");
        let b = encoder.encode("how do i configure my database connections");
        let c = encoder.encode("tell me a joke about cats");

        let near = HolographicEncoder::similarity(&a, &b);
        let far = HolographicEncoder::similarity(&a, &c);
        assert!(near > 0.85);
        assert!(near > far);
    }

    #[test]
    fn test_semantic_seeds_pull_terms_together() {
        let seeds = HashMap::from([
            ("database".to_string(), 11u64),
            ("db".to_string(), 11u64),
        ]);
        let seeded = HolographicEncoder::new(Some(seeds));
        let plain = HolographicEncoder::new(None);

        let with_seed = HolographicEncoder::similarity(
            &seeded.encode("configure the database"),
            &seeded.encode("configure the db"),
        );
        let without_seed = HolographicEncoder::similarity(
            &plain.encode("configure the database"),
            &plain.encode("configure the db"),
        );
        // A shared seed pattern raises the score of the seeded pair.
        assert!(with_seed > without_seed);
    }

    proptest! {
        #[test]
        fn prop_hash_is_deterministic(text in ".{0,120}", model in "[a-z0-9.-]{1,24}") {
            let n = normalize(&text);
            prop_assert_eq!(hash_key(&n, &model), hash_key(&n, &model));
        }

        #[test]
        fn prop_dice_is_symmetric_and_bounded(a in ".{0,60}", b in ".{0,60}") {
            let na = normalize(&a);
            let nb = normalize(&b);
            let ab = dice_coefficient(&na, &nb);
            let ba = dice_coefficient(&nb, &na);
            prop_assert!((ab - ba).abs() < 1e-12);
            prop_assert!((0.0..=1.0).contains(&ab));
        }

        #[test]
        fn prop_normalize_is_idempotent(text in ".{0,120}") {
            let once = normalize(&text);
            prop_assert_eq!(normalize(&once), once);
        }
    }
}

//! Property-based tests for the scoring and selection math.
//!
//! - Cosine similarity is bounded, reflexive on non-zero vectors and zero
//!   against the zero vector
//! - Duplicate classification is monotonic in similarity
//! - Recency decays monotonically and halves per half-life
//! - Importance and composite scores stay in range
//! - Budget trimming keeps a prefix that fits

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    use crate::budget::{apply_context_budget, estimate_tokens, get_context_budget, TokenCost};
    use crate::chunker::{chunk_response, SPLIT_THRESHOLD_WORDS};
    use crate::dedup::{check_duplicate, classify, MatchType};
    use crate::embedding::{cosine_similarity, normalize};
    use crate::memory::MemoryId;
    use crate::scoring::{
        compute_composite_score, compute_importance_score, compute_recency_score_at,
        RankingStrategy,
    };

    // Non-degenerate vectors in a small space
    fn vector() -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-10.0f32..10.0f32, 8)
            .prop_filter("non-zero", |v| v.iter().any(|x| x.abs() > 1e-3))
    }

    fn signal() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("user_correction".to_string()),
            Just("decision".to_string()),
            Just("technical_detail".to_string()),
            Just("general".to_string()),
            "[a-z_]{1,12}",
        ]
    }

    fn strategy() -> impl Strategy<Value = RankingStrategy> {
        prop_oneof![
            Just(RankingStrategy::Balanced),
            Just(RankingStrategy::Recency),
            Just(RankingStrategy::Importance),
        ]
    }

    // =========================================================================
    // Similarity
    // =========================================================================

    proptest! {
        #[test]
        fn similarity_is_reflexive(mut v in vector()) {
            normalize(&mut v);
            let sim = cosine_similarity(&v, &v);
            prop_assert!((sim - 1.0).abs() < 1e-4, "sim(v, v) = {}", sim);
        }

        #[test]
        fn similarity_against_zero_is_zero(v in vector()) {
            let zero = vec![0.0; v.len()];
            prop_assert_eq!(cosine_similarity(&v, &zero), 0.0);
            prop_assert_eq!(cosine_similarity(&zero, &v), 0.0);
        }

        #[test]
        fn similarity_is_bounded_and_symmetric(a in vector(), b in vector()) {
            let ab = cosine_similarity(&a, &b);
            let ba = cosine_similarity(&b, &a);
            prop_assert!((-1.0001..=1.0001).contains(&ab), "sim = {}", ab);
            prop_assert!((ab - ba).abs() < 1e-6);
        }
    }

    // =========================================================================
    // Deduplication
    // =========================================================================

    proptest! {
        /// Raising a similarity never lowers the match class.
        #[test]
        fn classification_is_monotonic(low in -1.0f32..1.0, delta in 0.0f32..1.0) {
            let rank = |m: MatchType| match m {
                MatchType::Novel => 0,
                MatchType::Related => 1,
                MatchType::ExactDup => 2,
            };
            let high = (low + delta).min(1.0);
            prop_assert!(rank(classify(high)) >= rank(classify(low)));
        }

        #[test]
        fn dedup_is_deterministic(query in vector(), pool in prop::collection::vec(vector(), 0..8)) {
            let existing: Vec<(MemoryId, Vec<f32>)> = pool
                .into_iter()
                .enumerate()
                .map(|(i, v)| (MemoryId::from(format!("mem_{i}")), v))
                .collect();
            prop_assert_eq!(check_duplicate(&query, &existing), check_duplicate(&query, &existing));
        }

        /// Adding an identical vector to any pool yields an exact duplicate.
        #[test]
        fn identical_candidate_is_exact(query in vector(), pool in prop::collection::vec(vector(), 0..8)) {
            let mut existing: Vec<(MemoryId, Vec<f32>)> = pool
                .into_iter()
                .enumerate()
                .map(|(i, v)| (MemoryId::from(format!("mem_{i}")), v))
                .collect();
            existing.push((MemoryId::from("mem_same"), query.clone()));
            let result = check_duplicate(&query, &existing);
            prop_assert_eq!(result.match_type, MatchType::ExactDup);
        }
    }

    // =========================================================================
    // Scoring
    // =========================================================================

    proptest! {
        #[test]
        fn recency_decays_monotonically(
            younger in 0i64..10_000,
            extra in 0i64..10_000,
            half_life in 0.5f64..60.0
        ) {
            let now = Utc::now();
            let a = compute_recency_score_at(now - Duration::minutes(younger), now, half_life);
            let b = compute_recency_score_at(now - Duration::minutes(younger + extra), now, half_life);
            prop_assert!(a >= b);
            prop_assert!((0.0..=1.0).contains(&a));
        }

        #[test]
        fn recency_halves_per_half_life(half_life in 1i64..60) {
            let now = Utc::now();
            let score = compute_recency_score_at(now - Duration::days(half_life), now, half_life as f64);
            prop_assert!((score - 0.5).abs() < 1e-9);
        }

        #[test]
        fn future_timestamps_are_fresh(ahead in 1i64..10_000) {
            let now = Utc::now();
            prop_assert_eq!(compute_recency_score_at(now + Duration::minutes(ahead), now, 7.0), 1.0);
        }

        #[test]
        fn importance_is_max_weight_in_range(signals in prop::collection::vec(signal(), 0..6)) {
            let score = compute_importance_score(&signals);
            prop_assert!((0.0..=1.0).contains(&score));
            if signals.iter().any(|s| s == "user_correction") {
                prop_assert_eq!(score, 0.9);
            }
        }

        #[test]
        fn composite_is_bounded(
            sim in 0.0f64..=1.0,
            rec in 0.0f64..=1.0,
            imp in 0.0f64..=1.0,
            strategy in strategy()
        ) {
            let score = compute_composite_score(sim, rec, imp, strategy);
            prop_assert!((0.0..=1.0 + 1e-12).contains(&score));
        }
    }

    // =========================================================================
    // Budget and chunking
    // =========================================================================

    proptest! {
        #[test]
        fn budget_never_exceeds_cap(total in 0usize..2_000_000, used in 0usize..2_000_000) {
            let budget = get_context_budget(total, used);
            prop_assert!(budget as f64 <= total as f64 * 0.15);
        }

        /// The kept items are a prefix of the input and fit the budget.
        #[test]
        fn trimming_keeps_fitting_prefix(
            sizes in prop::collection::vec(0usize..200, 0..12),
            budget in 0usize..1_000
        ) {
            let items: Vec<String> = sizes.iter().map(|n| vec!["w"; *n].join(" ")).collect();
            let kept = apply_context_budget(items.clone(), budget);

            prop_assert_eq!(&items[..kept.len()], &kept[..]);
            let used: usize = kept.iter().map(TokenCost::estimated_tokens).sum();
            prop_assert!(used <= budget);
            if kept.len() < items.len() {
                prop_assert!(used + estimate_tokens(&items[kept.len()]) > budget);
            }
        }

        /// Splitting never loses words.
        #[test]
        fn chunking_preserves_words(paragraphs in prop::collection::vec(1usize..120, 1..8)) {
            let text = paragraphs
                .iter()
                .enumerate()
                .map(|(p, n)| (0..*n).map(|i| format!("p{p}w{i}")).collect::<Vec<_>>().join(" "))
                .collect::<Vec<_>>()
                .join("\n\n");
            let chunks = chunk_response(&text, SPLIT_THRESHOLD_WORDS);
            prop_assert!(!chunks.is_empty());

            let original: Vec<&str> = text.split_whitespace().collect();
            let rebuilt: Vec<&str> = chunks.iter().flat_map(|c| c.split_whitespace()).collect();
            prop_assert_eq!(original, rebuilt);
        }
    }
}

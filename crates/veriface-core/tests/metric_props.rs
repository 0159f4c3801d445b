use proptest::prelude::*;

use veriface_core::{Embedding, EuclideanMatcher, Matcher, RegisteredIdentity, EMBEDDING_DIM};

fn embedding() -> impl Strategy<Value = Embedding> {
    prop::collection::vec(-1.0f32..1.0, EMBEDDING_DIM)
        .prop_map(|values| Embedding::new(values).unwrap())
}

fn population(embeddings: &[Embedding]) -> Vec<RegisteredIdentity> {
    embeddings
        .iter()
        .enumerate()
        .map(|(i, e)| RegisteredIdentity {
            identity_id: format!("id-{i}"),
            embedding: e.clone(),
            registered_at: None,
        })
        .collect()
}

proptest! {
    /// distance(a, b) == distance(b, a), bit for bit.
    #[test]
    fn distance_is_symmetric(a in embedding(), b in embedding()) {
        prop_assert_eq!(a.distance(&b).unwrap(), b.distance(&a).unwrap());
    }

    /// distance(a, a) == 0.
    #[test]
    fn self_distance_is_zero(a in embedding()) {
        prop_assert_eq!(a.distance(&a).unwrap(), 0.0);
    }

    /// Probing with a registered embedding always matches it, at any threshold >= 0.
    #[test]
    fn registered_embedding_matches_itself(
        embeddings in prop::collection::vec(embedding(), 1..16),
        pick in any::<prop::sample::Index>(),
        threshold in 0.0f32..2.0,
    ) {
        let identities = population(&embeddings);
        let probe = &identities[pick.index(identities.len())];

        let result = EuclideanMatcher.best_match(&probe.embedding, &identities, threshold).unwrap();
        prop_assert!(result.matched);
        prop_assert_eq!(result.distance, 0.0);
        prop_assert_eq!(result.similarity, 1.0);
        let matched = identities
            .iter()
            .find(|i| Some(&i.identity_id) == result.identity_id.as_ref())
            .unwrap();
        prop_assert_eq!(&matched.embedding, &probe.embedding);
    }

    /// An empty population never matches and never errors.
    #[test]
    fn empty_population_never_matches(probe in embedding(), threshold in 0.0f32..100.0) {
        let result = EuclideanMatcher.best_match(&probe, &[], threshold).unwrap();
        prop_assert!(!result.matched);
        prop_assert_eq!(result.identity_id, None);
    }

    /// Reported similarity always lies in [0, 1].
    #[test]
    fn similarity_is_bounded(a in embedding(), b in embedding(), threshold in 0.0f32..4.0) {
        let result = EuclideanMatcher.best_match(&a, &population(&[b]), threshold).unwrap();
        prop_assert!((0.0..=1.0).contains(&result.similarity));
        prop_assert_eq!(result.matched, result.distance < threshold || result.distance == 0.0);
    }
}

use proptest::prelude::*;
use sdk::errors::{EngineError, SortieErrorExt};
use sdk::parser::ParserConfig;
use sdk::types::{Fact, OriginType, Relationship};

// Every error carries a non-empty hint that never echoes the raw detail
proptest! {
    #[test]
    fn test_error_user_hint_completeness(detail in "[a-zA-Z0-9_./-]{8,32}") {
        let errs = vec![
            EngineError::Config(detail.clone()),
            EngineError::UnknownShell(detail.clone()),
            EngineError::PlannerNotFound(detail.clone()),
            EngineError::ObjectiveNotFound(detail.clone()),
            EngineError::ParserNotFound(detail.clone()),
            EngineError::UnknownBucket { planner: detail.clone(), bucket: detail.clone() },
            EngineError::Profile(detail.clone()),
            EngineError::AbilityNotFound(detail.clone()),
            EngineError::LinkNotFound(detail.clone()),
            EngineError::OperationClosed(detail.clone()),
            EngineError::OperationTimedOut(detail.clone()),
            EngineError::Parser(detail.clone()),
            EngineError::Database(detail.clone()),
            EngineError::Serialization(detail.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            prop_assert!(!hint.contains(&detail));
            prop_assert!(err.to_string().contains(&detail));
        }
    }
}

// Facts survive JSON with their key, score, and origin intact
proptest! {
    #[test]
    fn test_fact_json_round_trip(
        trait_name in "[a-z]{1,8}(\\.[a-z]{1,8}){0,3}",
        value in "\\PC{0,24}",
        score in -10..10i64,
        origin in prop_oneof![
            Just(OriginType::Seeded),
            Just(OriginType::Learned),
            Just(OriginType::Imported),
            Just(OriginType::User),
        ],
        source in proptest::option::of("[a-z0-9-]{4,12}"),
    ) {
        let mut fact = Fact::new(&trait_name, &value)
            .with_score(score)
            .with_origin(origin);
        if let Some(source) = &source {
            fact = fact.with_source(source);
        }

        let json = serde_json::to_string(&fact).unwrap();
        prop_assert!(json.contains("\"trait\""));
        let parsed: Fact = serde_json::from_str(&json).unwrap();

        prop_assert_eq!(&parsed, &fact);
        prop_assert_eq!(parsed.score, score);
        prop_assert_eq!(parsed.origin_type, origin);
        prop_assert_eq!(parsed.is_active(), score > 0);
        prop_assert_eq!(parsed.unique(), format!("{}{}", trait_name, value));
    }
}

// Absorbing provenance is idempotent and keeps first-seen order
proptest! {
    #[test]
    fn test_absorb_idempotent(
        mine in prop::collection::vec("[a-z0-9]{6}", 0..4),
        theirs in prop::collection::vec("[a-z0-9]{6}", 0..4),
    ) {
        let mut a = Fact::new("t", "v");
        for paw in &mine {
            if !a.collected_by.contains(paw) {
                a.collected_by.push(paw.clone());
            }
        }
        let mut b = Fact::new("t", "v");
        b.collected_by = theirs.clone();

        a.absorb(&b);
        let once = a.collected_by.clone();
        a.absorb(&b);
        prop_assert_eq!(&a.collected_by, &once);

        for paw in mine.iter().chain(theirs.iter()) {
            prop_assert_eq!(a.collected_by.iter().filter(|p| *p == paw).count(), 1);
        }
    }
}

// Relationship equality ignores score and origin
proptest! {
    #[test]
    fn test_relationship_equality(
        edge in proptest::option::of("[a-z_]{1,10}"),
        score in -5..5i64,
        origin in proptest::option::of("[a-z0-9-]{8}"),
    ) {
        let build = |score: i64, origin: Option<String>| {
            let mut r = Relationship::new(Fact::new("a.b", "x"));
            if let Some(edge) = &edge {
                r = r.with_target(Some(edge.clone()), Fact::new("c.d", "y"));
            }
            r.score = score;
            r.origin = origin;
            r
        };

        let left = build(score, origin.clone());
        let right = build(1, None);
        prop_assert_eq!(&left, &right);
        prop_assert_eq!(left.facts().count(), if edge.is_some() { 2 } else { 1 });
    }
}

// Parser configs keep optional fields optional on the wire
proptest! {
    #[test]
    fn test_parser_config_round_trip(
        source in "[a-z]{1,8}\\.[a-z]{1,8}",
        edge in proptest::option::of("[a-z_]{1,10}"),
        target in proptest::option::of("[a-z]{1,8}\\.[a-z]{1,8}"),
    ) {
        let mut config = ParserConfig::source(&source);
        config.edge = edge.clone();
        config.target = target.clone();

        let json = serde_json::to_string(&config).unwrap();
        prop_assert_eq!(json.contains("\"edge\""), edge.is_some());
        prop_assert_eq!(json.contains("\"target\""), target.is_some());
        prop_assert!(!json.contains("custom_parser_vals"));

        let parsed: ParserConfig = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(parsed, config);
    }
}

use chrono::Utc;
use proptest::prelude::*;
use sdk::types::Fact;
use sortie_engine::ability::{Ability, AbilityExecutor};
use sortie_engine::agent::Privilege;
use sortie_engine::config::OperationConfig;
use sortie_engine::knowledge::{FactCriteria, KnowledgeStore};
use sortie_engine::link::{Link, LinkResult, LinkStatus};
use sortie_engine::objective::{Goal, Objective};
use std::sync::Arc;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(future)
}

// Operation settings survive a TOML round trip and stay valid
proptest! {
    #[test]
    fn test_operation_config_round_trip(
        apply in 1..=600u64,
        link in 1..=600u64,
        finish in 1..=600u64,
        base in 1..=86_400u64,
        learning in any::<bool>(),
        auto_close in any::<bool>(),
        planner in "atomic|batch|buckets|privileged_persistence",
    ) {
        let config = OperationConfig {
            apply_poll_secs: apply,
            link_poll_secs: link,
            finish_poll_secs: finish,
            base_timeout_secs: base,
            use_learning_parsers: learning,
            auto_close,
            default_planner: planner,
            ..OperationConfig::default()
        };

        let serialized = toml::to_string(&config).unwrap();
        let parsed: OperationConfig = toml::from_str(&serialized).unwrap();

        prop_assert!(parsed.validate().is_ok());
        prop_assert_eq!(parsed.apply_poll_secs, apply);
        prop_assert_eq!(parsed.link_poll_secs, link);
        prop_assert_eq!(parsed.finish_poll_secs, finish);
        prop_assert_eq!(parsed.base_timeout_secs, base);
        prop_assert_eq!(parsed.use_learning_parsers, learning);
        prop_assert_eq!(parsed.auto_close, auto_close);
        prop_assert_eq!(parsed.default_planner, config.default_planner);
    }
}

// Privilege names parse in any letter case and order User below Elevated
proptest! {
    #[test]
    fn test_privilege_parse_any_case(name in "[uU][sS][eE][rR]|[eE][lL][eE][vV][aA][tT][eE][dD]") {
        let privilege: Privilege = name.parse().unwrap();
        let expected = if name.eq_ignore_ascii_case("user") {
            Privilege::User
        } else {
            Privilege::Elevated
        };
        prop_assert_eq!(privilege, expected);
        prop_assert!(Privilege::User < Privilege::Elevated);
        prop_assert_eq!(privilege.to_string().parse::<Privilege>().unwrap(), privilege);
    }
}

// The first result recorded on a link wins
proptest! {
    #[test]
    fn test_link_finalize_is_set_once(first in -1000..1000i32, second in -1000..1000i32) {
        let ability = Arc::new(Ability::new("a", "discovery", AbilityExecutor::new("sh", "linux", "id")));
        let executor = ability.executors[0].clone();
        let mut link = Link::new(ability, executor, "paw", "id", LinkStatus::EXECUTE);
        let result = |exit_code| LinkResult {
            link_id: link.id.clone(),
            stdout: "out".to_string(),
            stderr: String::new(),
            exit_code,
            pid: None,
            agent_reported_time: Utc::now(),
        };
        let first_result = result(first);
        let second_result = result(second);

        prop_assert!(link.finalize(&first_result));
        let finished_at = link.finish;
        prop_assert!(!link.finalize(&second_result));
        prop_assert_eq!(link.status, LinkStatus(first));
        prop_assert_eq!(link.finish, finished_at);
        prop_assert!(link.is_finished());
    }
}

// Adding the same observation repeatedly keeps one copy with merged provenance
proptest! {
    #[test]
    fn test_knowledge_add_fact_deduplicates(
        trait_name in "[a-z]{1,8}\\.[a-z]{1,8}",
        value in "[a-zA-Z0-9]{1,16}",
        paws in prop::collection::vec("[a-z0-9]{6}", 1..5),
    ) {
        let store = KnowledgeStore::new();
        let added: Vec<bool> = block_on(async {
            let mut added = Vec::new();
            for paw in &paws {
                let mut fact = Fact::new(&trait_name, &value).with_source("op");
                fact.collected_by.push(paw.clone());
                added.push(store.add_fact(fact).await);
            }
            added
        });

        prop_assert!(added[0]);
        prop_assert!(added[1..].iter().all(|a| !a));

        let stored = block_on(store.get_facts(&FactCriteria::new().trait_name(&trait_name)));
        prop_assert_eq!(stored.len(), 1);
        for paw in &paws {
            prop_assert!(stored[0].collected_by.contains(paw));
        }
    }
}

// Objective progress agrees with completion
proptest! {
    #[test]
    fn test_objective_percentage_matches_completion(
        targets in prop::collection::vec(0..5u32, 1..6),
        present in prop::collection::vec(0..5u32, 0..6),
    ) {
        let objective = Objective {
            id: "obj".to_string(),
            name: "obj".to_string(),
            description: String::new(),
            goals: targets
                .iter()
                .map(|t| Goal::new(format!("goal.{}", t), "yes"))
                .collect(),
        };
        let facts: Vec<Fact> = present
            .iter()
            .map(|p| Fact::new(format!("goal.{}", p), "yes"))
            .collect();

        let percentage = objective.percentage(&facts);
        prop_assert!((0.0..=100.0).contains(&percentage));
        prop_assert_eq!(objective.completed(&facts), percentage >= 100.0);
        prop_assert_eq!(
            objective.completed(&facts),
            targets.iter().all(|t| present.contains(t))
        );
    }
}

//! Property tests for the pipeline's universal invariants.

use proptest::prelude::*;

use remedy::artifact::Redactor;
use remedy::pipeline::compute_backoff_seconds;
use remedy::safety::{
    PolicyEngine, PolicySeverity, SafetyPolicy, parse_unified_diff,
};
use remedy::store::RunStatus;

fn path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,8}", 1..4).prop_map(|segments| {
        let mut path = segments.join("/");
        path.push_str(".py");
        path
    })
}

fn diff_strategy() -> impl Strategy<Value = (String, Vec<(String, usize, usize)>)> {
    prop::collection::btree_map(path_strategy(), (0usize..20, 0usize..20), 1..6).prop_map(
        |files| {
            let mut diff = String::new();
            let mut expected = Vec::new();
            for (path, (adds, removes)) in files {
                diff.push_str(&format!("diff --git a/{0} b/{0}\n", path));
                diff.push_str(&format!("--- a/{}\n", path));
                diff.push_str(&format!("+++ b/{}\n", path));
                diff.push_str("@@ -1 +1 @@\n");
                for i in 0..removes {
                    diff.push_str(&format!("-removed line {}\n", i));
                }
                for i in 0..adds {
                    diff.push_str(&format!("+added line {}\n", i));
                }
                expected.push((path, adds, removes));
            }
            (diff, expected)
        },
    )
}

proptest! {
    #[test]
    fn diff_parser_counts_match_construction((diff, expected) in diff_strategy()) {
        let parsed = parse_unified_diff(&diff);
        prop_assert_eq!(parsed.total_files, expected.len());
        prop_assert_eq!(parsed.files.len(), parsed.total_files);

        let total_adds: usize = expected.iter().map(|(_, a, _)| *a).sum();
        let total_removes: usize = expected.iter().map(|(_, _, r)| *r).sum();
        prop_assert_eq!(parsed.total_lines_added, total_adds);
        prop_assert_eq!(parsed.total_lines_removed, total_removes);

        for (path, adds, removes) in &expected {
            let file = parsed.files.iter().find(|f| &f.path == path).unwrap();
            prop_assert_eq!(file.lines_added, *adds);
            prop_assert_eq!(file.lines_removed, *removes);
        }
    }

    #[test]
    fn policy_allowed_iff_no_block_violation((diff, _) in diff_strategy()) {
        let engine = PolicyEngine::new(SafetyPolicy::default());
        let (decision, _) = engine.evaluate_patch(&diff);
        let has_block = decision
            .violations
            .iter()
            .any(|v| v.severity == PolicySeverity::Block);
        prop_assert_eq!(decision.allowed, !has_block);
        prop_assert!(decision.danger_score <= 100);
    }

    #[test]
    fn redactor_is_idempotent_and_secret_free(text in ".{0,200}") {
        let redactor = Redactor::from_policy(&SafetyPolicy::default());
        let once = redactor.redact_text(&text);
        let twice = redactor.redact_text(&once);
        prop_assert_eq!(&once, &twice);
    }

    #[test]
    fn redactor_removes_injected_secrets(prefix in "[a-z ]{0,20}", secret in "[A-Za-z0-9]{36}") {
        let redactor = Redactor::from_policy(&SafetyPolicy::default());
        let text = format!("{}ghp_{}", prefix, secret);
        let out = redactor.redact_text(&text);
        prop_assert!(!out.contains(&format!("ghp_{}", secret)));
    }

    #[test]
    fn backoff_is_monotonic_and_bounded(
        base in 1u64..120,
        max in 120u64..4000,
        attempt in 1u32..40,
    ) {
        let current = compute_backoff_seconds(attempt, base, max);
        let next = compute_backoff_seconds(attempt + 1, base, max);
        prop_assert!(current <= next);
        prop_assert!(current <= max);
        prop_assert!(current >= base.min(max));
    }

    #[test]
    fn status_ranks_are_total_and_terminal_states_sink(
        a in 0usize..18,
        b in 0usize..18,
    ) {
        let all = [
            RunStatus::Created,
            RunStatus::ContextBuilt,
            RunStatus::RcaReady,
            RunStatus::PlanBlocked,
            RunStatus::PlanReady,
            RunStatus::CriticReady,
            RunStatus::ConsensusReady,
            RunStatus::PatchBlocked,
            RunStatus::PatchReady,
            RunStatus::ValidationFailed,
            RunStatus::ValidationPassed,
            RunStatus::PrFailed,
            RunStatus::PrCreated,
            RunStatus::AwaitingApproval,
            RunStatus::Monitoring,
            RunStatus::Merged,
            RunStatus::Escalated,
            RunStatus::Blocked,
        ];
        let (sa, sb) = (all[a], all[b]);
        // Rank order is antisymmetric over distinct ranks.
        if sa.rank() < sb.rank() {
            prop_assert!(sb.rank() > sa.rank());
        }
        // Every terminal state ranks at least as high as `created`.
        if sa.is_terminal() {
            prop_assert!(sa.rank() > RunStatus::Created.rank());
        }
    }
}

#[test]
fn attempt_counter_is_monotone_under_increments() {
    use remedy::store::{AutomationMode, Store};
    use remedy::events::{CiProvider, FailureType, NormalizedPipelineEvent};

    let store = Store::new_in_memory().unwrap();
    let event = NormalizedPipelineEvent {
        idempotency_key: "k".to_string(),
        ci_provider: CiProvider::Jenkins,
        pipeline_id: "1".to_string(),
        repo: "org/app".to_string(),
        commit_sha: "c".repeat(40),
        branch: "main".to_string(),
        stage: "build".to_string(),
        failure_type: FailureType::Build,
        error_message: None,
        event_timestamp: chrono::Utc::now(),
        raw_payload: serde_json::json!({}),
        correlation_id: None,
    };
    let (event_id, _) = store.insert_event(&event).unwrap();
    let run = store
        .create_run(&event_id, None, AutomationMode::AutoPr, 5)
        .unwrap();

    let mut last = 0;
    for _ in 0..10 {
        let next = store.increment_attempt(&run.id).unwrap();
        assert!(next > last);
        last = next;
    }
}

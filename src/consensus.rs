//! Issue graph construction and the consensus decision.
//!
//! The issue graph is derived deterministically from structured context
//! and RCA output: every parsed error, build error, test failure, stack
//! trace, and RCA-affected file becomes a node, chained with
//! `correlates_with` links in source order. Consensus then merges the
//! plan, critic, and policy signals into a single accept/reject decision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::FailureContextBundle;
use crate::intel::schemas::{CriticDecision, FixPlan, RcaResult};
use crate::safety::{PolicyDecision, normalize_path};

// ── Issue graph ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueNode {
    pub issue_id: String,
    pub message: String,
    pub severity: String,
    #[serde(default)]
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueDependencyLink {
    pub source: String,
    pub target: String,
    pub relation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueGraph {
    pub issues: Vec<IssueNode>,
    pub affected_files: Vec<String>,
    pub severity_levels: BTreeMap<String, u32>,
    pub dependency_links: Vec<IssueDependencyLink>,
}

fn severity_key(value: &str) -> &'static str {
    match value {
        "warning" => "warning",
        "info" => "info",
        _ => "error",
    }
}

fn file_from_location(location: Option<&str>) -> Option<String> {
    let raw = location?.split(':').next()?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(normalize_path(raw))
}

/// Build the deterministic issue graph from context + RCA.
pub fn build_issue_graph(context: &FailureContextBundle, rca: &RcaResult) -> IssueGraph {
    let mut issues: Vec<IssueNode> = Vec::new();
    let mut severity_levels: BTreeMap<String, u32> = BTreeMap::new();
    let mut affected_files: Vec<String> = Vec::new();
    let mut seen_files = std::collections::HashSet::new();

    let mut track_files = |paths: &[String],
                           affected: &mut Vec<String>,
                           seen: &mut std::collections::HashSet<String>| {
        for path in paths {
            let normalized = normalize_path(path);
            if normalized.is_empty() || !seen.insert(normalized.clone()) {
                continue;
            }
            affected.push(normalized);
        }
    };

    let mut push = |issues: &mut Vec<IssueNode>,
                    levels: &mut BTreeMap<String, u32>,
                    issue_id: String,
                    message: &str,
                    severity: &str,
                    file_paths: Vec<String>,
                    evidence_refs: Vec<String>| {
        let severity = severity_key(severity);
        let message = message.trim();
        issues.push(IssueNode {
            issue_id,
            message: if message.is_empty() {
                "unknown_issue".to_string()
            } else {
                message.to_string()
            },
            severity: severity.to_string(),
            file_paths: file_paths.iter().map(|p| normalize_path(p)).collect(),
            evidence_refs,
        });
        *levels.entry(severity.to_string()).or_insert(0) += 1;
    };

    for (idx, err) in context.errors.iter().enumerate() {
        let files: Vec<String> = file_from_location(err.location.as_deref())
            .into_iter()
            .collect();
        let evidence = if err.context_lines.is_empty() {
            vec![err.message.clone()]
        } else {
            err.context_lines.iter().take(3).cloned().collect()
        };
        push(
            &mut issues,
            &mut severity_levels,
            format!("error_{}", idx),
            &err.message,
            err.severity.as_str(),
            files.clone(),
            evidence,
        );
        track_files(&files, &mut affected_files, &mut seen_files);
    }

    for (idx, be) in context.build_errors.iter().enumerate() {
        push(
            &mut issues,
            &mut severity_levels,
            format!("build_{}", idx),
            &be.message,
            be.severity.as_str(),
            vec![be.file.clone()],
            vec![format!(
                "{}:{}:{}",
                be.file,
                be.line.unwrap_or(0),
                be.column.unwrap_or(0)
            )],
        );
        track_files(
            &[be.file.clone()],
            &mut affected_files,
            &mut seen_files,
        );
    }

    for (idx, tf) in context.test_failures.iter().enumerate() {
        let files: Vec<String> = tf.test_file.iter().cloned().collect();
        push(
            &mut issues,
            &mut severity_levels,
            format!("test_{}", idx),
            &tf.error_message,
            "error",
            files.clone(),
            vec![tf.test_name.clone()],
        );
        track_files(&files, &mut affected_files, &mut seen_files);
    }

    for (idx, trace) in context.stack_traces.iter().enumerate() {
        let files: Vec<String> = trace
            .frames
            .iter()
            .map(|f| f.file.clone())
            .filter(|f| !f.is_empty())
            .take(2)
            .collect();
        push(
            &mut issues,
            &mut severity_levels,
            format!("stack_{}", idx),
            &trace.message,
            "error",
            files.clone(),
            vec![trace.exception_type.clone()],
        );
        track_files(&files, &mut affected_files, &mut seen_files);
    }

    for (idx, af) in rca.affected_files.iter().enumerate() {
        track_files(
            &[af.filename.clone()],
            &mut affected_files,
            &mut seen_files,
        );
        push(
            &mut issues,
            &mut severity_levels,
            format!("rca_{}", idx),
            &af.reason,
            "info",
            vec![af.filename.clone()],
            vec![
                af.suggested_action
                    .clone()
                    .unwrap_or_else(|| "rca_affected_file".to_string()),
            ],
        );
    }

    if issues.is_empty() {
        let message = if !context.log_summary.is_empty() {
            context.log_summary.clone()
        } else {
            rca.primary_hypothesis.description.clone()
        };
        let files: Vec<String> = rca
            .affected_files
            .iter()
            .take(3)
            .map(|af| af.filename.clone())
            .collect();
        push(
            &mut issues,
            &mut severity_levels,
            "fallback_0".to_string(),
            &message,
            "error",
            files.clone(),
            vec![context.event_id.clone()],
        );
        track_files(&files, &mut affected_files, &mut seen_files);
    }

    let mut dependency_links = Vec::new();
    for idx in 1..issues.len() {
        dependency_links.push(IssueDependencyLink {
            source: issues[idx - 1].issue_id.clone(),
            target: issues[idx].issue_id.clone(),
            relation: "correlates_with".to_string(),
        });
    }

    affected_files.sort();

    IssueGraph {
        issues,
        affected_files,
        severity_levels,
        dependency_links,
    }
}

// ── Consensus ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusState {
    Accepted,
    RejectedLowAgreement,
    RejectedSafetyVeto,
    RejectedInvalidCandidates,
}

impl ConsensusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::RejectedLowAgreement => "rejected_low_agreement",
            Self::RejectedSafetyVeto => "rejected_safety_veto",
            Self::RejectedInvalidCandidates => "rejected_invalid_candidates",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRejection {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningEdge {
    pub source: String,
    pub target: String,
    pub relation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    #[serde(rename = "type")]
    pub action_type: String,
    pub file: String,
    pub rationale: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// One candidate the coordinator decided over. The single built-in
/// candidate today is the planner's plan; the shape leaves room for
/// additional agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_name: String,
    pub version: String,
    pub confidence_score: f64,
    #[serde(default)]
    pub reasoning_graph: Vec<ReasoningEdge>,
    #[serde(default)]
    pub proposed_actions: Vec<ProposedAction>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub state: ConsensusState,
    pub agreement_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_plan: Option<FixPlan>,
    pub candidates: Vec<AgentOutput>,
    pub rejections: Vec<ConsensusRejection>,
    pub metadata: Value,
}

fn planner_candidate(plan: &FixPlan) -> AgentOutput {
    AgentOutput {
        agent_name: "planner".to_string(),
        version: "1".to_string(),
        confidence_score: plan.confidence,
        reasoning_graph: Vec::new(),
        proposed_actions: plan
            .operations
            .iter()
            .map(|op| ProposedAction {
                action_type: op.op_type.as_str().to_string(),
                file: op.file.clone(),
                rationale: op.rationale.clone(),
                evidence: op.evidence.clone(),
            })
            .collect(),
        metadata: serde_json::json!({"category": plan.category}),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsensusThresholds {
    pub min_agreement: f64,
    pub min_confidence: f64,
    pub danger_veto: u32,
}

/// Merge plan, critic, and policy signals into one decision.
///
/// A policy block or a danger score past the veto threshold rejects
/// outright. Otherwise four signals vote: plan confidence, critic
/// allowed, critic reasoning consistency, policy allowed. A critic that
/// failed schema validation (or never produced output) counts as a
/// disagreement on both of its signals; only a missing plan leaves the
/// coordinator with no candidates at all.
pub fn decide(
    _graph: &IssueGraph,
    plan: Option<&FixPlan>,
    critic: Option<&CriticDecision>,
    policy: &PolicyDecision,
    thresholds: ConsensusThresholds,
) -> ConsensusDecision {
    let mut rejections = Vec::new();
    let candidates: Vec<AgentOutput> = plan.map(planner_candidate).into_iter().collect();

    if !policy.allowed || policy.danger_score > thresholds.danger_veto {
        rejections.push(ConsensusRejection {
            reason: "safety_veto".to_string(),
            agent_name: Some("policy".to_string()),
            details: Some(format!(
                "allowed={} danger_score={}",
                policy.allowed, policy.danger_score
            )),
        });
        return ConsensusDecision {
            state: ConsensusState::RejectedSafetyVeto,
            agreement_rate: 0.0,
            selected_agent: None,
            selected_plan: None,
            candidates,
            rejections,
            metadata: serde_json::json!({"danger_score": policy.danger_score}),
        };
    }

    let Some(plan) = plan else {
        rejections.push(ConsensusRejection {
            reason: "invalid_candidates".to_string(),
            agent_name: None,
            details: Some("plan output missing".to_string()),
        });
        return ConsensusDecision {
            state: ConsensusState::RejectedInvalidCandidates,
            agreement_rate: 0.0,
            selected_agent: None,
            selected_plan: None,
            candidates,
            rejections,
            metadata: Value::Null,
        };
    };

    let signals = [
        plan.confidence >= thresholds.min_confidence,
        critic.map(|c| c.allowed).unwrap_or(false),
        critic
            .map(|c| c.reasoning_consistency >= thresholds.min_confidence)
            .unwrap_or(false),
        policy.allowed,
    ];
    let agreeing = signals.iter().filter(|s| **s).count();
    let agreement_rate = agreeing as f64 / signals.len() as f64;

    if !signals[0] {
        rejections.push(ConsensusRejection {
            reason: "low_plan_confidence".to_string(),
            agent_name: Some("planner".to_string()),
            details: Some(format!("confidence={}", plan.confidence)),
        });
    }
    match critic {
        Some(critic) => {
            if !signals[1] {
                rejections.push(ConsensusRejection {
                    reason: "critic_disallowed".to_string(),
                    agent_name: Some("critic".to_string()),
                    details: None,
                });
            }
            if !signals[2] {
                rejections.push(ConsensusRejection {
                    reason: "low_reasoning_consistency".to_string(),
                    agent_name: Some("critic".to_string()),
                    details: Some(format!(
                        "reasoning_consistency={}",
                        critic.reasoning_consistency
                    )),
                });
            }
        }
        None => {
            rejections.push(ConsensusRejection {
                reason: "critic_unavailable".to_string(),
                agent_name: Some("critic".to_string()),
                details: Some("critic output missing or failed schema validation".to_string()),
            });
        }
    }

    let metadata = serde_json::json!({
        "signals": agreeing,
        "signals_total": signals.len(),
        "danger_score": policy.danger_score,
    });

    if agreement_rate >= thresholds.min_agreement {
        ConsensusDecision {
            state: ConsensusState::Accepted,
            agreement_rate,
            selected_agent: Some("planner".to_string()),
            selected_plan: Some(plan.clone()),
            candidates,
            rejections,
            metadata,
        }
    } else {
        ConsensusDecision {
            state: ConsensusState::RejectedLowAgreement,
            agreement_rate,
            selected_agent: None,
            selected_plan: None,
            candidates,
            rejections,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{
        BuildError, ContextError, IssueSeverity, StackFrame, StackTrace, TestFailure,
    };
    use crate::intel::schemas::{Classification, FailureCategory, RcaHypothesis};
    use crate::safety::{PlanIntent, PolicyEngine, SafetyPolicy};

    fn sample_rca() -> RcaResult {
        RcaResult {
            classification: Classification {
                category: FailureCategory::Dependency,
                confidence: 0.9,
                reasoning: "r".to_string(),
                indicators: vec![],
                secondary_category: None,
            },
            primary_hypothesis: RcaHypothesis {
                description: "missing module".to_string(),
                confidence: 0.9,
                evidence: vec![],
                suggested_fix: None,
            },
            alternative_hypotheses: vec![],
            affected_files: vec![],
            similar_incidents: vec![],
        }
    }

    fn sample_context() -> FailureContextBundle {
        FailureContextBundle {
            event_id: "evt-1".to_string(),
            repo: "org/app".to_string(),
            commit_sha: "deadbeef".to_string(),
            branch: "main".to_string(),
            pipeline_id: "42".to_string(),
            job_name: "test".to_string(),
            errors: vec![ContextError {
                message: "Error: kaboom".to_string(),
                severity: IssueSeverity::Error,
                location: Some("src/app.py:3".to_string()),
                context_lines: vec![],
            }],
            build_errors: vec![BuildError {
                file: "src/lib.c".to_string(),
                line: Some(1),
                column: Some(2),
                message: "bad type".to_string(),
                severity: IssueSeverity::Error,
            }],
            test_failures: vec![TestFailure {
                test_name: "test_x".to_string(),
                test_file: Some("tests/test_x.py".to_string()),
                error_message: "assert failed".to_string(),
            }],
            stack_traces: vec![StackTrace {
                exception_type: "ModuleNotFoundError".to_string(),
                message: "No module named 'requests'".to_string(),
                frames: vec![StackFrame {
                    file: "src/app/main.py".to_string(),
                    line: Some(3),
                    function: None,
                }],
            }],
            log_summary: "summary".to_string(),
        }
    }

    fn sample_plan(confidence: f64) -> FixPlan {
        FixPlan {
            root_cause: "rc".to_string(),
            category: "python_missing_dependency".to_string(),
            confidence,
            files: vec!["pyproject.toml".to_string()],
            operations: vec![],
        }
    }

    fn sample_critic(allowed: bool, consistency: f64) -> CriticDecision {
        CriticDecision {
            allowed,
            hallucination_risk: 0.1,
            reasoning_consistency: consistency,
            issues: vec![],
            requires_manual_review: false,
            recommended_label: "safe".to_string(),
        }
    }

    fn allowed_policy() -> PolicyDecision {
        PolicyEngine::new(SafetyPolicy::default()).evaluate_plan(&PlanIntent {
            target_files: vec!["pyproject.toml".to_string()],
            category: None,
            operation_types: vec!["add_dependency".to_string()],
        })
    }

    fn thresholds() -> ConsensusThresholds {
        ConsensusThresholds {
            min_agreement: 0.75,
            min_confidence: 0.6,
            danger_veto: 70,
        }
    }

    #[test]
    fn graph_node_ids_follow_source_order() {
        let graph = build_issue_graph(&sample_context(), &sample_rca());
        let ids: Vec<&str> = graph.issues.iter().map(|i| i.issue_id.as_str()).collect();
        assert_eq!(ids, vec!["error_0", "build_0", "test_0", "stack_0"]);
        assert_eq!(graph.dependency_links.len(), 3);
        assert_eq!(graph.dependency_links[0].relation, "correlates_with");
        assert_eq!(graph.dependency_links[0].source, "error_0");
        assert_eq!(graph.dependency_links[0].target, "build_0");
    }

    #[test]
    fn graph_counts_severities_and_sorts_files() {
        let graph = build_issue_graph(&sample_context(), &sample_rca());
        assert_eq!(graph.severity_levels.get("error"), Some(&4));
        let mut sorted = graph.affected_files.clone();
        sorted.sort();
        assert_eq!(graph.affected_files, sorted);
        assert!(graph.affected_files.contains(&"src/lib.c".to_string()));
    }

    #[test]
    fn empty_context_yields_fallback_node() {
        let context = FailureContextBundle {
            errors: vec![],
            build_errors: vec![],
            test_failures: vec![],
            stack_traces: vec![],
            ..sample_context()
        };
        let graph = build_issue_graph(&context, &sample_rca());
        assert_eq!(graph.issues.len(), 1);
        assert_eq!(graph.issues[0].issue_id, "fallback_0");
        assert_eq!(graph.issues[0].severity, "error");
    }

    #[test]
    fn accepted_when_all_signals_agree() {
        let graph = build_issue_graph(&sample_context(), &sample_rca());
        let plan = sample_plan(0.9);
        let critic = sample_critic(true, 0.9);
        let decision = decide(&graph, Some(&plan), Some(&critic), &allowed_policy(), thresholds());
        assert_eq!(decision.state, ConsensusState::Accepted);
        assert!((decision.agreement_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(decision.selected_agent.as_deref(), Some("planner"));
        assert!(decision.selected_plan.is_some());

        // The candidate set the decision was made over is recorded.
        assert_eq!(decision.candidates.len(), 1);
        assert_eq!(decision.candidates[0].agent_name, "planner");
        assert!((decision.candidates[0].confidence_score - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn candidate_carries_plan_operations() {
        use crate::intel::schemas::{FixOperation, FixOperationType};
        let graph = build_issue_graph(&sample_context(), &sample_rca());
        let mut plan = sample_plan(0.9);
        plan.operations = vec![FixOperation {
            op_type: FixOperationType::AddDependency,
            file: "pyproject.toml".to_string(),
            details: serde_json::json!({"package": "requests"}),
            rationale: "missing module".to_string(),
            evidence: vec!["No module named 'requests'".to_string()],
        }];
        let critic = sample_critic(true, 0.9);
        let decision = decide(&graph, Some(&plan), Some(&critic), &allowed_policy(), thresholds());
        let actions = &decision.candidates[0].proposed_actions;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, "add_dependency");
        assert_eq!(actions[0].file, "pyproject.toml");
    }

    #[test]
    fn low_confidence_and_critic_veto_reject() {
        let graph = build_issue_graph(&sample_context(), &sample_rca());
        let plan = sample_plan(0.4);
        let critic = sample_critic(false, 0.9);
        let decision = decide(&graph, Some(&plan), Some(&critic), &allowed_policy(), thresholds());
        assert_eq!(decision.state, ConsensusState::RejectedLowAgreement);
        assert!((decision.agreement_rate - 0.5).abs() < f64::EPSILON);
        assert!(
            decision
                .rejections
                .iter()
                .any(|r| r.reason == "low_plan_confidence")
        );
        assert!(
            decision
                .rejections
                .iter()
                .any(|r| r.reason == "critic_disallowed")
        );
    }

    #[test]
    fn policy_block_is_a_safety_veto() {
        let graph = build_issue_graph(&sample_context(), &sample_rca());
        let engine = PolicyEngine::new(SafetyPolicy::default());
        let policy = engine.evaluate_plan(&PlanIntent {
            target_files: vec![".github/workflows/ci.yml".to_string()],
            category: None,
            operation_types: vec![],
        });
        let plan = sample_plan(0.9);
        let critic = sample_critic(true, 0.9);
        let decision = decide(&graph, Some(&plan), Some(&critic), &policy, thresholds());
        assert_eq!(decision.state, ConsensusState::RejectedSafetyVeto);
    }

    #[test]
    fn missing_plan_is_invalid_candidates() {
        let graph = build_issue_graph(&sample_context(), &sample_rca());
        let critic = sample_critic(true, 0.9);
        let decision = decide(&graph, None, Some(&critic), &allowed_policy(), thresholds());
        assert_eq!(decision.state, ConsensusState::RejectedInvalidCandidates);
        assert!(decision.candidates.is_empty());
    }

    #[test]
    fn missing_critic_counts_as_disagreement() {
        // A parse-failed critic contributes two failed signals; the
        // decision still flows through the agreement rate.
        let graph = build_issue_graph(&sample_context(), &sample_rca());
        let plan = sample_plan(0.9);
        let decision = decide(&graph, Some(&plan), None, &allowed_policy(), thresholds());
        assert_eq!(decision.state, ConsensusState::RejectedLowAgreement);
        assert!((decision.agreement_rate - 0.5).abs() < f64::EPSILON);
        assert!(
            decision
                .rejections
                .iter()
                .any(|r| r.reason == "critic_unavailable")
        );
        // The planner candidate is still recorded.
        assert_eq!(decision.candidates.len(), 1);
    }
}

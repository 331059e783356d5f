//! Plan critic: hallucination-risk and reasoning-consistency review.

use crate::context::FailureContextBundle;
use crate::errors::StageError;

use super::schemas::{CriticDecision, FixPlan, RcaResult};
use super::{LlmProvider, generate_validated};

pub struct PlanCritic<'a> {
    provider: &'a dyn LlmProvider,
    max_tokens: u32,
    max_retries: u32,
}

impl<'a> PlanCritic<'a> {
    pub fn new(provider: &'a dyn LlmProvider, max_tokens: u32, max_retries: u32) -> Self {
        Self {
            provider,
            max_tokens,
            max_retries,
        }
    }

    pub async fn review(
        &self,
        rca: &RcaResult,
        context: &FailureContextBundle,
        plan: &FixPlan,
    ) -> Result<CriticDecision, StageError> {
        let plan_json = serde_json::to_string_pretty(plan)
            .map_err(|e| StageError::failed(format!("plan serialization: {}", e)))?;
        let prompt = build_critic_prompt(rca, context, &plan_json);
        let decision: CriticDecision =
            generate_validated(
                self.provider,
                &prompt,
                self.max_tokens,
                self.max_retries,
                |d: &mut CriticDecision| d.validate(),
            )
            .await?;
        tracing::info!(
            allowed = decision.allowed,
            requires_manual_review = decision.requires_manual_review,
            hallucination_risk = decision.hallucination_risk,
            issues = decision.issues.len(),
            "Critic decision"
        );
        Ok(decision)
    }
}

fn build_critic_prompt(rca: &RcaResult, context: &FailureContextBundle, plan_json: &str) -> String {
    format!(
        "You are a skeptical reviewer of automated CI fix plans. Check the plan against \
         the evidence: does every operation follow from the failure? Is any file or \
         package invented? Return a JSON object with fields: allowed, \
         hallucination_risk, reasoning_consistency, issues (code, severity, message, \
         evidence_refs), requires_manual_review, recommended_label. Return JSON only.\n\n\
         Failure summary:\n{}\n\nRCA hypothesis:\n{}\n\nProposed plan:\n{}\n",
        context.log_summary, rca.primary_hypothesis.description, plan_json
    )
}

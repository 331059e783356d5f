//! Fix plan generation from RCA output.

use crate::context::FailureContextBundle;
use crate::errors::StageError;

use super::schemas::{FixPlan, RcaResult};
use super::{LlmProvider, generate_validated};

pub struct PlanGenerator<'a> {
    provider: &'a dyn LlmProvider,
    max_tokens: u32,
    max_retries: u32,
}

impl<'a> PlanGenerator<'a> {
    pub fn new(provider: &'a dyn LlmProvider, max_tokens: u32, max_retries: u32) -> Self {
        Self {
            provider,
            max_tokens,
            max_retries,
        }
    }

    /// Generate a normalized, deterministically ordered fix plan.
    pub async fn generate(
        &self,
        rca: &RcaResult,
        context: &FailureContextBundle,
    ) -> Result<FixPlan, StageError> {
        let prompt = build_plan_prompt(rca, context);
        let plan: FixPlan =
            generate_validated(
                self.provider,
                &prompt,
                self.max_tokens,
                self.max_retries,
                |p: &mut FixPlan| p.normalize_and_validate(),
            )
            .await?;
        tracing::info!(
            category = %plan.category,
            confidence = plan.confidence,
            files = plan.files.len(),
            operations = plan.operations.len(),
            model = self.provider.model_name(),
            "Generated fix plan"
        );
        Ok(plan)
    }
}

fn build_plan_prompt(rca: &RcaResult, context: &FailureContextBundle) -> String {
    let mut prompt = String::from(
        "You are a CI remediation planner. Produce a minimal fix plan as a JSON object \
         with fields: root_cause, category, confidence, files, operations. Each operation \
         has: type (add_dependency | pin_dependency | update_config | modify_code | \
         remove_unused), file, details, rationale, evidence. Every operation file must \
         appear in files. At most 10 operations. Return JSON only.\n\n",
    );
    prompt.push_str(&format!(
        "Repository: {}\nRoot cause hypothesis: {}\nCategory: {}\n",
        context.repo,
        rca.primary_hypothesis.description,
        rca.classification.category.as_str()
    ));
    if let Some(fix) = &rca.primary_hypothesis.suggested_fix {
        prompt.push_str(&format!("Suggested fix: {}\n", fix));
    }
    if !rca.affected_files.is_empty() {
        prompt.push_str("Affected files:\n");
        for f in &rca.affected_files {
            prompt.push_str(&format!("- {} ({})\n", f.filename, f.reason));
        }
    }
    prompt.push_str(&format!("\nLog summary:\n{}\n", context.log_summary));
    prompt
}

//! Root-cause analysis over the failure context.

use async_trait::async_trait;

use crate::context::FailureContextBundle;
use crate::errors::StageError;

use super::schemas::{RcaResult, SimilarIncident};
use super::{LlmProvider, generate_validated};

/// Similar-incident search, abstracted away from the embedding store.
#[async_trait]
pub trait IncidentIndex: Send + Sync {
    async fn search(&self, text: &str, k: usize) -> Vec<SimilarIncident>;
}

/// Index that never finds anything; used when no store is configured.
pub struct NoIncidentIndex;

#[async_trait]
impl IncidentIndex for NoIncidentIndex {
    async fn search(&self, _text: &str, _k: usize) -> Vec<SimilarIncident> {
        Vec::new()
    }
}

pub struct RcaEngine<'a> {
    provider: &'a dyn LlmProvider,
    index: &'a dyn IncidentIndex,
    max_tokens: u32,
    max_retries: u32,
}

impl<'a> RcaEngine<'a> {
    pub fn new(
        provider: &'a dyn LlmProvider,
        index: &'a dyn IncidentIndex,
        max_tokens: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            provider,
            index,
            max_tokens,
            max_retries,
        }
    }

    pub async fn analyze(&self, context: &FailureContextBundle) -> Result<RcaResult, StageError> {
        let incidents = self.index.search(&context.log_summary, 5).await;
        let prompt = build_rca_prompt(context, &incidents);

        let mut rca: RcaResult =
            generate_validated(
                self.provider,
                &prompt,
                self.max_tokens,
                self.max_retries,
                |r: &mut RcaResult| r.validate(),
            )
            .await?;

        // Retrieved incidents are authoritative over whatever the model
        // echoed back.
        if !incidents.is_empty() {
            rca.similar_incidents = incidents;
        }
        tracing::info!(
            category = rca.classification.category.as_str(),
            confidence = rca.classification.confidence,
            affected_files = rca.affected_files.len(),
            "RCA completed"
        );
        Ok(rca)
    }
}

fn build_rca_prompt(context: &FailureContextBundle, incidents: &[SimilarIncident]) -> String {
    let mut prompt = String::from(
        "You are a CI failure analyst. Analyze the failure context and return a JSON \
         object with fields: classification {category, confidence, reasoning, indicators, \
         secondary_category?}, primary_hypothesis {description, confidence, evidence, \
         suggested_fix?}, alternative_hypotheses, affected_files, similar_incidents.\n\
         category is one of: infrastructure, dependency, code, configuration, test, \
         flaky, security, unknown. Return JSON only.\n\n",
    );
    prompt.push_str(&format!(
        "Repository: {}\nBranch: {}\nJob: {}\n\nLog summary:\n{}\n",
        context.repo, context.branch, context.job_name, context.log_summary
    ));
    if !context.stack_traces.is_empty() {
        prompt.push_str("\nStack traces:\n");
        for trace in &context.stack_traces {
            prompt.push_str(&format!("- {}: {}\n", trace.exception_type, trace.message));
        }
    }
    if !context.test_failures.is_empty() {
        prompt.push_str("\nTest failures:\n");
        for tf in &context.test_failures {
            prompt.push_str(&format!("- {}: {}\n", tf.test_name, tf.error_message));
        }
    }
    if !context.build_errors.is_empty() {
        prompt.push_str("\nBuild errors:\n");
        for be in &context.build_errors {
            prompt.push_str(&format!("- {}: {}\n", be.file, be.message));
        }
    }
    if !incidents.is_empty() {
        prompt.push_str("\nSimilar past incidents:\n");
        for incident in incidents {
            prompt.push_str(&format!(
                "- [{}] {} (similarity {:.2})\n",
                incident.incident_id, incident.summary, incident.similarity_score
            ));
        }
    }
    prompt
}

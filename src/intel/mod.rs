//! Intelligence stages: RCA, plan generation, plan critique.
//!
//! Every stage wraps the `LlmProvider` in the same parse-validate-retry
//! loop: generate at temperature 0, extract the first JSON object from
//! the raw output, validate against a strict schema, and on failure ask
//! the model to repair its own output a bounded number of times.

pub mod critic;
pub mod plan;
pub mod rca;
pub mod schemas;

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::errors::StageError;

pub use critic::PlanCritic;
pub use plan::PlanGenerator;
pub use rca::{IncidentIndex, NoIncidentIndex, RcaEngine};

/// Seam to the LLM backend. Implementations must be safe to call
/// concurrently; the pipeline holds one provider per process.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<String, StageError>;
}

/// HTTP provider for an Ollama-compatible endpoint.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<String, StageError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {"temperature": temperature, "num_predict": max_tokens},
        });
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| StageError::transient(format!("LLM request failed: {}", e)))?;
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("LLM response unreadable: {}", e)))?;
        payload["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StageError::failed("LLM response missing 'response' field"))
    }
}

/// Scripted provider for tests and the `mock` config value: returns
/// queued responses in order, repeating the last one when drained.
pub struct MockLlm {
    responses: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
}

impl MockLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f64,
    ) -> Result<String, StageError> {
        let mut queue = self
            .responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(next) = queue.pop_front() {
            *self
                .last
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(next.clone());
            return Ok(next);
        }
        let last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        last.clone()
            .ok_or_else(|| StageError::failed("mock provider has no responses"))
    }
}

/// Extract the first JSON object from raw model output: strip code
/// fences, then take the span from the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> String {
    let mut raw = text.trim();
    if raw.starts_with("```") {
        raw = raw.trim_matches('`').trim();
        raw = raw.strip_prefix("json").map(str::trim).unwrap_or(raw);
    }
    let start = raw.find('{');
    let end = raw.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e > s => raw[s..=e].to_string(),
        _ => raw.to_string(),
    }
}

fn repair_prompt(error: &str, bad_output: &str) -> String {
    format!(
        "Return JSON ONLY. Do not include markdown. Do not include commentary.\n\n\
         The previous output was invalid.\n\n\
         Error:\n{}\n\n\
         Previous output:\n{}\n\n\
         Return a single corrected JSON object that matches the required schema.",
        error, bad_output
    )
}

/// Shared parse-validate-retry loop for LLM-backed stages.
///
/// `validate` runs after deserialization and may normalize the value in
/// place; its error message feeds the repair prompt.
pub async fn generate_validated<T, F>(
    provider: &dyn LlmProvider,
    initial_prompt: &str,
    max_tokens: u32,
    max_retries: u32,
    mut validate: F,
) -> Result<T, StageError>
where
    T: DeserializeOwned,
    F: FnMut(&mut T) -> Result<(), String>,
{
    let mut last_error: Option<String> = None;
    let mut last_raw: Option<String> = None;

    for attempt in 0..=max_retries {
        let prompt = if attempt == 0 {
            initial_prompt.to_string()
        } else {
            repair_prompt(
                last_error.as_deref().unwrap_or("unknown"),
                last_raw.as_deref().unwrap_or(""),
            )
        };
        let raw = provider.generate(&prompt, max_tokens, 0.0).await?;
        last_raw = Some(raw.clone());
        let json_text = extract_json_object(&raw);

        let mut value: T = match serde_json::from_str(&json_text) {
            Ok(v) => v,
            Err(e) => {
                last_error = Some(format!("JSON parse error: {}", e));
                continue;
            }
        };
        match validate(&mut value) {
            Ok(()) => {
                tracing::debug!(attempt, model = provider.model_name(), "LLM output validated");
                return Ok(value);
            }
            Err(e) => {
                last_error = Some(format!("Schema validation error: {}", e));
                continue;
            }
        }
    }

    Err(StageError::Parse {
        message: last_error.unwrap_or_else(|| "no valid output produced".to_string()),
        raw_output: last_raw.unwrap_or_default(),
    })
}

//! Environment-driven runtime configuration.
//!
//! Every tunable has a canonical environment key. `Settings::from_env`
//! reads them once at startup; components receive the values they need at
//! construction rather than reading the environment themselves.

use std::path::PathBuf;

use crate::errors::FatalConfigError;

/// Deployment environment. Production tightens the startup checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }
}

/// Runtime settings for the service.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,

    // API
    pub api_host: String,
    pub api_port: u16,

    // Persistence / coordination
    pub database_url: String,
    pub redis_url: String,

    // Webhooks + VCS
    pub github_webhook_secret: String,
    pub github_token: String,
    pub github_api_base_url: String,
    pub log_max_size_mb: u64,

    // LLM
    pub llm_provider: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub llm_max_retries: u32,

    // Sandbox
    pub sandbox_image: String,
    pub sandbox_timeout_seconds: u64,
    pub sandbox_memory_limit: String,
    pub sandbox_cpu_limit: f64,
    pub sandbox_network_enabled: bool,
    pub fail_on_vuln_severity: String,

    // Safety + artifacts
    pub safety_policy_path: PathBuf,
    pub artifacts_dir: PathBuf,

    // Orchestrator
    pub max_pipeline_attempts: u32,
    pub repo_pipeline_concurrency_limit: u32,
    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub cooldown_seconds: u64,
    pub post_merge_monitor_ttl_seconds: u64,

    // Consensus thresholds
    pub consensus_min_agreement: f64,
    pub consensus_min_confidence: f64,
    pub consensus_danger_veto: u32,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::Dev,
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            database_url: "remedy.db".to_string(),
            redis_url: "redis://localhost:6379/0".to_string(),
            github_webhook_secret: String::new(),
            github_token: String::new(),
            github_api_base_url: "https://api.github.com".to_string(),
            log_max_size_mb: 10,
            llm_provider: "mock".to_string(),
            llm_base_url: "http://localhost:11434".to_string(),
            llm_model: "deepseek-coder:6.7b".to_string(),
            llm_max_tokens: 2000,
            llm_max_retries: 2,
            sandbox_image: "python:3.11-slim".to_string(),
            sandbox_timeout_seconds: 300,
            sandbox_memory_limit: "512m".to_string(),
            sandbox_cpu_limit: 1.0,
            sandbox_network_enabled: false,
            fail_on_vuln_severity: "HIGH".to_string(),
            safety_policy_path: PathBuf::from("safety-policy.yaml"),
            artifacts_dir: PathBuf::from("artifacts"),
            max_pipeline_attempts: 3,
            repo_pipeline_concurrency_limit: 2,
            base_backoff_seconds: 30,
            max_backoff_seconds: 900,
            cooldown_seconds: 3600,
            post_merge_monitor_ttl_seconds: 7200,
            consensus_min_agreement: 0.75,
            consensus_min_confidence: 0.6,
            consensus_danger_veto: 70,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    /// Call `dotenvy::dotenv()` beforehand to pick up a local `.env`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            environment: Environment::parse(&env_or("ENVIRONMENT", "dev")),
            api_host: env_or("API_HOST", &defaults.api_host),
            api_port: env_parse("API_PORT", defaults.api_port),
            database_url: env_or("DATABASE_URL", &defaults.database_url),
            redis_url: env_or("REDIS_URL", &defaults.redis_url),
            github_webhook_secret: env_or("GITHUB_WEBHOOK_SECRET", ""),
            github_token: env_or("GITHUB_TOKEN", ""),
            github_api_base_url: env_or("GITHUB_API_BASE_URL", &defaults.github_api_base_url),
            log_max_size_mb: env_parse("LOG_MAX_SIZE_MB", defaults.log_max_size_mb),
            llm_provider: env_or("LLM_PROVIDER", &defaults.llm_provider),
            llm_base_url: env_or("LLM_BASE_URL", &defaults.llm_base_url),
            llm_model: env_or("LLM_MODEL", &defaults.llm_model),
            llm_max_tokens: env_parse("LLM_MAX_TOKENS", defaults.llm_max_tokens),
            llm_max_retries: env_parse("LLM_MAX_RETRIES", defaults.llm_max_retries),
            sandbox_image: env_or("SANDBOX_IMAGE", &defaults.sandbox_image),
            sandbox_timeout_seconds: env_parse(
                "SANDBOX_TIMEOUT_SECONDS",
                defaults.sandbox_timeout_seconds,
            ),
            sandbox_memory_limit: env_or("SANDBOX_MEMORY_LIMIT", &defaults.sandbox_memory_limit),
            sandbox_cpu_limit: env_parse("SANDBOX_CPU_LIMIT", defaults.sandbox_cpu_limit),
            sandbox_network_enabled: env_parse(
                "SANDBOX_NETWORK_ENABLED",
                defaults.sandbox_network_enabled,
            ),
            fail_on_vuln_severity: env_or("FAIL_ON_VULN_SEVERITY", &defaults.fail_on_vuln_severity),
            safety_policy_path: PathBuf::from(env_or("SAFETY_POLICY_PATH", "safety-policy.yaml")),
            artifacts_dir: PathBuf::from(env_or("ARTIFACTS_DIR", "artifacts")),
            max_pipeline_attempts: env_parse(
                "MAX_PIPELINE_ATTEMPTS",
                defaults.max_pipeline_attempts,
            ),
            repo_pipeline_concurrency_limit: env_parse(
                "REPO_PIPELINE_CONCURRENCY_LIMIT",
                defaults.repo_pipeline_concurrency_limit,
            ),
            base_backoff_seconds: env_parse("BASE_BACKOFF_SECONDS", defaults.base_backoff_seconds),
            max_backoff_seconds: env_parse("MAX_BACKOFF_SECONDS", defaults.max_backoff_seconds),
            cooldown_seconds: env_parse("COOLDOWN_SECONDS", defaults.cooldown_seconds),
            post_merge_monitor_ttl_seconds: env_parse(
                "POST_MERGE_MONITOR_TTL_SECONDS",
                defaults.post_merge_monitor_ttl_seconds,
            ),
            consensus_min_agreement: env_parse(
                "CONSENSUS_MIN_AGREEMENT",
                defaults.consensus_min_agreement,
            ),
            consensus_min_confidence: env_parse(
                "CONSENSUS_MIN_CONFIDENCE",
                defaults.consensus_min_confidence,
            ),
            consensus_danger_veto: env_parse(
                "CONSENSUS_DANGER_VETO",
                defaults.consensus_danger_veto,
            ),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Prod
    }

    /// Startup validation. Fails the process on misconfiguration that
    /// would otherwise surface as silent insecurity at runtime.
    pub fn validate(&self) -> Result<(), FatalConfigError> {
        if self.is_production() && self.github_webhook_secret.is_empty() {
            return Err(FatalConfigError::MissingWebhookSecret);
        }
        if self.is_production() && !self.safety_policy_path.exists() {
            return Err(FatalConfigError::MissingSafetyPolicy(
                self.safety_policy_path.display().to_string(),
            ));
        }
        if self.max_pipeline_attempts == 0 {
            return Err(FatalConfigError::Invalid {
                key: "MAX_PIPELINE_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.repo_pipeline_concurrency_limit == 0 {
            return Err(FatalConfigError::Invalid {
                key: "REPO_PIPELINE_CONCURRENCY_LIMIT".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_dev_safe() {
        let settings = Settings::default();
        assert!(!settings.is_production());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn production_requires_webhook_secret() {
        let settings = Settings {
            environment: Environment::Prod,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(FatalConfigError::MissingWebhookSecret)
        ));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let settings = Settings {
            max_pipeline_attempts: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn environment_parse_accepts_aliases() {
        assert_eq!(Environment::parse("production"), Environment::Prod);
        assert_eq!(Environment::parse("PROD"), Environment::Prod);
        assert_eq!(Environment::parse("staging"), Environment::Staging);
        assert_eq!(Environment::parse("anything-else"), Environment::Dev);
    }
}

//! Pipeline configuration
//!
//! Everything the configuration collaborator supplies: provider endpoints
//! and credentials, per-provider budget windows, retry/backoff parameters,
//! batch timeout and the in-flight concurrency bound. `from_env()` loads a
//! `.env` file first so local runs work without exported variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which wire shape a provider speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI chat completions
    OpenAi,
    /// xAI (Grok) chat completions
    Xai,
}

/// Fixed-window budget for one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetConfig {
    /// Units available per window
    pub limit_units: u64,
    /// Window length; consumption resets at each boundary
    pub window: Duration,
    /// How long a reservation may wait before `RateLimitTimeout`
    pub max_wait: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit_units: 60,
            window: Duration::from_secs(60),
            max_wait: Duration::from_secs(30),
        }
    }
}

/// One external AI provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Stable identifier used for budgets, events and logs
    pub id: String,
    pub kind: ProviderKind,
    /// Missing key means the provider is configured but unusable (degraded)
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Bound on a single HTTP call
    pub request_timeout: Duration,
    pub budget: BudgetConfig,
}

impl ProviderConfig {
    pub fn openai(api_key: Option<String>) -> Self {
        Self {
            id: "openai".to_string(),
            kind: ProviderKind::OpenAi,
            api_key,
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-5-nano-2025-08-07".to_string(),
            request_timeout: Duration::from_secs(90),
            budget: BudgetConfig::default(),
        }
    }

    pub fn xai(api_key: Option<String>) -> Self {
        Self {
            id: "xai".to_string(),
            kind: ProviderKind::Xai,
            api_key,
            base_url: "https://api.x.ai".to_string(),
            model: "grok-4-1-fast".to_string(),
            request_timeout: Duration::from_secs(120),
            budget: BudgetConfig::default(),
        }
    }

    /// Whether this provider can actually be called
    pub fn has_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// Retry policy for transient provider failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per provider, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration for one pipeline instance
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ordered provider list; the first usable entry is the primary,
    /// the next usable one is the single fallback
    pub providers: Vec<ProviderConfig>,
    pub retry: RetryConfig,
    /// Overall deadline for one batch
    pub batch_timeout: Duration,
    /// Maximum tasks dispatched concurrently
    pub max_in_flight: usize,
    /// Classifier rejects files above this size
    pub max_file_size: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            providers: vec![ProviderConfig::openai(None), ProviderConfig::xai(None)],
            retry: RetryConfig::default(),
            batch_timeout: Duration::from_secs(300),
            max_in_flight: num_cpus::get().clamp(2, 8),
            max_file_size: 50 * 1024 * 1024, // 50 MB
        }
    }
}

impl PipelineConfig {
    /// Build a configuration from the environment.
    ///
    /// Loads `.env` if present, then reads provider keys from the usual
    /// variables (`OPENAI_API_KEY`, `XAI_API_KEY` / `GROK_API_KEY`).
    /// Providers without keys stay in the list so the degraded state is
    /// visible rather than silently narrowed.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let openai_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .or_else(|| std::env::var("VITE_OPENAI_API_KEY").ok());
        let xai_key = std::env::var("XAI_API_KEY")
            .ok()
            .or_else(|| std::env::var("GROK_API_KEY").ok());

        Self {
            providers: vec![
                ProviderConfig::openai(openai_key),
                ProviderConfig::xai(xai_key),
            ],
            ..Self::default()
        }
    }
}

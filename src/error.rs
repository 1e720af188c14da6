//! Error taxonomy for the analysis pipeline
//!
//! Every error that can reach a report is typed and serializable. Per-task
//! and per-provider failures are data, carried inside `AnalysisResult`;
//! nothing in the pipeline panics on bad input.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Why a file was rejected before dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ValidationError {
    /// Zero-byte input
    #[error("file is empty")]
    EmptyFile,

    /// Input larger than the configured maximum
    #[error("file is {size} bytes, limit is {limit}")]
    SizeExceeded { size: u64, limit: u64 },

    /// Content signature contradicts the declared extension
    #[error("content signature {detected} does not match extension .{extension}")]
    SignatureMismatch { extension: String, detected: String },

    /// No category claims the extension
    #[error("no category claims extension .{extension}")]
    UnknownExtension { extension: String },
}

/// Outcome of a single provider call attempt, before retry policy is applied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The request did not complete within the bounded timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// 5xx from the provider
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Provider-reported throttling (429)
    #[error("provider throttled the request")]
    Throttled,

    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Credentials rejected (401/403)
    #[error("authentication rejected")]
    Auth,

    /// The provider rejected the request itself (other 4xx)
    #[error("request rejected ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    /// Response arrived but could not be parsed
    #[error("unparseable response payload: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Transient failures are retried with backoff; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Server { .. } | Self::Throttled | Self::Network(_)
        )
    }
}

/// Budget could not be reserved within the configured max wait
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no budget for provider {provider} within {waited:?}")]
pub struct RateLimitTimeout {
    pub provider: String,
    pub waited: Duration,
}

/// What callers of the LLM service see after retries and fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum LlmError {
    /// No provider with usable credentials is configured
    #[error("no usable provider configured")]
    Unavailable,

    /// Retries and fallback exhausted without a success
    #[error("all providers exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The final attempt timed out
    #[error("provider call timed out")]
    Timeout,

    /// Credentials rejected; the key value is never included
    #[error("authentication failed for provider {provider}")]
    Auth { provider: String },

    /// The final attempt returned an unparseable payload
    #[error("provider returned an unparseable payload")]
    InvalidResponse,

    /// Provider budget was unavailable within the max wait
    #[error("rate limit budget for {provider} unavailable after {waited_ms}ms")]
    RateLimited { provider: String, waited_ms: u64 },
}

impl From<RateLimitTimeout> for LlmError {
    fn from(t: RateLimitTimeout) -> Self {
        Self::RateLimited {
            provider: t.provider,
            waited_ms: t.waited.as_millis() as u64,
        }
    }
}

/// Per-task failure recorded in the merged report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum AnalysisError {
    /// The file never made it past classification
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The agent's provider calls failed
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The task was still running when the batch deadline passed
    #[error("task exceeded the batch deadline")]
    Timeout,

    /// The agent panicked or was torn down mid-flight
    #[error("agent failed: {message}")]
    AgentFailure { message: String },
}

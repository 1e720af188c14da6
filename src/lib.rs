//! planroom — document-analysis orchestration for construction projects
//!
//! A batch of uploaded files goes in; a [`report::MergedReport`] comes out.
//! In between: content-validated classification, category-based agent
//! resolution, bounded concurrent dispatch, and multi-provider LLM calls
//! with per-provider rate limits, retries and fallback.

pub mod agents;
pub mod classify;
pub mod config;
pub mod error;
pub mod limiter;
pub mod llm;
pub mod orchestrator;
pub mod registry;
pub mod report;

pub use classify::{Classification, Classifier, Confidence, FileCategory};
pub use config::{PipelineConfig, ProviderConfig, ProviderKind};
pub use error::{AnalysisError, LlmError, ProviderError, RateLimitTimeout, ValidationError};
pub use limiter::{BudgetLease, RateLimiter};
pub use llm::{
    AttemptObserver, AttemptOutcome, CallAttempt, ChatTransport, HttpTransport, LlmRequest,
    LlmResponse, LlmService,
};
pub use orchestrator::{scan_dir, FileTask, IncomingFile, Orchestrator};
pub use registry::{AgentDescriptor, AgentRegistry, AnalysisAgent};
pub use report::{aggregate, AnalysisResult, BatchStatus, MergedReport, ReportSummary};

use tracing_subscriber::EnvFilter;

/// Initialize tracing with RUST_LOG env filter.
///
/// Default: warn for most crates, info for this one (batch summaries and
/// call attempts visible). Use RUST_LOG=debug for per-task logs.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,planroom=info")),
        )
        .init();
}

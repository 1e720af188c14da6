//! Orchestrator
//!
//! Turns a batch of uploaded files into a [`MergedReport`]: classify each
//! file, resolve candidate agents, dispatch concurrently under an in-flight
//! bound, collect under the batch deadline, aggregate. One bad file, one
//! slow provider or one panicking agent never takes the batch down.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError};
use uuid::Uuid;

use crate::agents::{default_agents, GenericAgent};
use crate::classify::{Classifier, Confidence, FileCategory};
use crate::config::PipelineConfig;
use crate::error::{AnalysisError, LlmError};
use crate::limiter::RateLimiter;
use crate::llm::LlmService;
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::report::{aggregate, AnalysisResult, MergedReport};

/// One uploaded file as handed over by the upload collaborator.
/// Nothing about it is trusted; the classifier re-validates everything.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub filename: String,
    pub content: Vec<u8>,
}

/// A file inside one batch, alive until the batch completes
#[derive(Debug, Clone)]
pub struct FileTask {
    pub id: Uuid,
    pub filename: String,
    pub content: Vec<u8>,
    pub category: Option<FileCategory>,
    pub confidence: Option<Confidence>,
}

/// Read every regular file under `dir` into a batch.
///
/// Convenience intake for callers that hold documents on disk rather than
/// in memory.
pub fn scan_dir(dir: &Path) -> std::io::Result<Vec<IncomingFile>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        let content = std::fs::read(entry.path())?;
        files.push(IncomingFile { filename, content });
    }
    Ok(files)
}

struct PendingTask {
    task_id: Uuid,
    filename: String,
    category: Option<FileCategory>,
    abort: AbortHandle,
}

/// Top-level coordinator for one pipeline instance
pub struct Orchestrator {
    classifier: Classifier,
    registry: Arc<AgentRegistry>,
    llm: Arc<LlmService>,
    fallback: AgentDescriptor,
    max_in_flight: usize,
    batch_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &PipelineConfig,
        registry: Arc<AgentRegistry>,
        llm: Arc<LlmService>,
    ) -> Self {
        Self {
            classifier: Classifier::new(config.max_file_size),
            registry,
            llm,
            fallback: AgentDescriptor {
                name: "generalist".to_string(),
                categories: Vec::new(),
                priority: 0,
                handler: Arc::new(GenericAgent),
            },
            max_in_flight: config.max_in_flight.max(1),
            batch_timeout: config.batch_timeout,
        }
    }

    /// Production wiring: one rate limiter, one LLM service, the default
    /// agent registration list. Fails only when zero providers are
    /// configured.
    pub fn from_config(config: PipelineConfig) -> Result<Self, LlmError> {
        let limiter = Arc::new(RateLimiter::new());
        let llm = Arc::new(LlmService::new(&config, Arc::clone(&limiter))?);
        let registry = Arc::new(AgentRegistry::discover(default_agents()));
        Ok(Self::new(&config, registry, llm))
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Process one batch. Always returns a report; data-level problems are
    /// per-task entries, never errors out of this function.
    pub async fn run_batch(&self, files: Vec<IncomingFile>) -> MergedReport {
        let batch_id = Uuid::new_v4();
        let total = files.len();
        tracing::info!(batch = %batch_id, files = total, "batch started");

        if files.is_empty() {
            return aggregate(batch_id, Vec::new(), self.llm.degraded(), Utc::now());
        }

        let mut slots: Vec<Option<AnalysisResult>> = (0..total).map(|_| None).collect();
        let mut dispatchable: Vec<(usize, FileTask, Vec<AgentDescriptor>)> = Vec::new();

        // Phase 1: classify and resolve. Validation failures are recorded
        // and the rest of the batch keeps going.
        for (idx, file) in files.into_iter().enumerate() {
            match self.classifier.classify(&file.filename, &file.content) {
                Ok(c) => {
                    let mut candidates = self.registry.resolve(c.category);
                    if candidates.is_empty() {
                        tracing::warn!(
                            filename = %file.filename,
                            category = c.category.as_str(),
                            "no agent resolved, assigning fallback"
                        );
                        candidates.push(self.fallback.clone());
                    }
                    dispatchable.push((
                        idx,
                        FileTask {
                            id: Uuid::new_v4(),
                            filename: file.filename,
                            content: file.content,
                            category: Some(c.category),
                            confidence: Some(c.confidence),
                        },
                        candidates,
                    ));
                }
                Err(err) => {
                    tracing::warn!(filename = %file.filename, error = %err, "file failed validation");
                    slots[idx] = Some(AnalysisResult::failure(
                        Uuid::new_v4(),
                        "classifier",
                        &file.filename,
                        None,
                        AnalysisError::Validation(err),
                    ));
                }
            }
        }

        // Phase 2: dispatch concurrently, bounded by the in-flight cap.
        // Each task runs in its own spawn so a panic stays contained there.
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut pending: HashMap<usize, PendingTask> = HashMap::new();
        let mut running = FuturesUnordered::new();

        for (idx, task, candidates) in dispatchable {
            let semaphore = Arc::clone(&semaphore);
            let llm = Arc::clone(&self.llm);
            let task_id = task.id;
            let filename = task.filename.clone();
            let category = task.category;

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                run_task(task, candidates, llm).await
            });
            pending.insert(
                idx,
                PendingTask {
                    task_id,
                    filename,
                    category,
                    abort: handle.abort_handle(),
                },
            );
            running.push(async move { (idx, handle.await) });
        }

        // Phase 3: collect as results complete, up to the batch deadline.
        let deadline = tokio::time::Instant::now() + self.batch_timeout;
        while !pending.is_empty() {
            tokio::select! {
                Some((idx, joined)) = running.next() => {
                    let info = pending.remove(&idx).expect("completed task was pending");
                    slots[idx] = Some(finish_task(info, joined));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        batch = %batch_id,
                        still_running = pending.len(),
                        "batch deadline reached"
                    );
                    // Cancel whatever is left and record it; leases held by
                    // cancelled calls release on drop.
                    for (idx, info) in pending.drain() {
                        info.abort.abort();
                        slots[idx] = Some(AnalysisResult::failure(
                            info.task_id,
                            "orchestrator",
                            &info.filename,
                            info.category,
                            AnalysisError::Timeout,
                        ));
                    }
                    break;
                }
            }
        }

        let results: Vec<AnalysisResult> = slots
            .into_iter()
            .map(|s| s.expect("every slot filled by completion or deadline"))
            .collect();

        let report = aggregate(batch_id, results, self.llm.degraded(), Utc::now());
        tracing::info!(
            batch = %batch_id,
            status = ?report.batch_status,
            successful = report.summary.successful,
            failed = report.summary.failed,
            "batch finished"
        );
        report
    }
}

/// Run one task against its candidate agents.
///
/// The primary candidate gets the task; on failure a low-confidence
/// classification earns the secondary candidate one sequential try. Retries
/// of one task are never concurrent.
async fn run_task(
    task: FileTask,
    candidates: Vec<AgentDescriptor>,
    llm: Arc<LlmService>,
) -> AnalysisResult {
    let primary = &candidates[0];
    tracing::debug!(task = %task.id, agent = %primary.name, "dispatching");

    match primary.handler.analyze(&task, &llm).await {
        Ok(payload) => {
            AnalysisResult::success(task.id, &primary.name, &task.filename, task.category, payload)
        }
        Err(primary_err) => {
            if task.confidence == Some(Confidence::Low) {
                if let Some(secondary) = candidates.get(1) {
                    tracing::debug!(
                        task = %task.id,
                        agent = %secondary.name,
                        "low confidence, consulting secondary agent"
                    );
                    if let Ok(payload) = secondary.handler.analyze(&task, &llm).await {
                        return AnalysisResult::success(
                            task.id,
                            &secondary.name,
                            &task.filename,
                            task.category,
                            payload,
                        );
                    }
                }
            }
            AnalysisResult::failure(
                task.id,
                &primary.name,
                &task.filename,
                task.category,
                AnalysisError::Llm(primary_err),
            )
        }
    }
}

/// Convert a join outcome into the task's result, containing panics
fn finish_task(info: PendingTask, joined: Result<AnalysisResult, JoinError>) -> AnalysisResult {
    match joined {
        Ok(result) => result,
        Err(e) => {
            let message = if e.is_panic() {
                let payload = e.into_panic();
                payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "agent panicked".to_string())
            } else {
                "task cancelled".to_string()
            };
            tracing::error!(task = %info.task_id, message = %message, "agent failed at dispatch boundary");
            AnalysisResult::failure(
                info.task_id,
                "orchestrator",
                &info.filename,
                info.category,
                AnalysisError::AgentFailure { message },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, ProviderConfig, ProviderKind, RetryConfig};
    use crate::error::{ProviderError, ValidationError};
    use crate::llm::{ChatTransport, LlmRequest, LlmResponse};
    use crate::registry::AnalysisAgent;
    use crate::report::BatchStatus;
    use async_trait::async_trait;

    /// Transport that always answers with a fixed JSON payload
    struct StaticTransport;

    #[async_trait]
    impl ChatTransport for StaticTransport {
        async fn send(
            &self,
            provider: &ProviderConfig,
            _request: &LlmRequest,
        ) -> Result<LlmResponse, ProviderError> {
            Ok(LlmResponse {
                provider: provider.id.clone(),
                content: r#"{"summary": "a concrete spec", "confidence": 0.9}"#.to_string(),
                total_tokens: 20,
            })
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            providers: vec![ProviderConfig {
                id: "openai".to_string(),
                kind: ProviderKind::OpenAi,
                api_key: Some("sk-test".to_string()),
                base_url: "http://localhost".to_string(),
                model: "test-model".to_string(),
                request_timeout: Duration::from_secs(5),
                budget: BudgetConfig {
                    limit_units: 1000,
                    window: Duration::from_secs(60),
                    max_wait: Duration::from_secs(1),
                },
            }],
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(10),
            },
            batch_timeout: Duration::from_secs(60),
            max_in_flight: 4,
            max_file_size: 1024 * 1024,
        }
    }

    fn orchestrator_with(
        config: &PipelineConfig,
        agents: Vec<Arc<dyn AnalysisAgent>>,
        transport: Arc<dyn ChatTransport>,
    ) -> Orchestrator {
        let limiter = Arc::new(RateLimiter::new());
        let llm =
            Arc::new(LlmService::with_transport(config, Arc::clone(&limiter), transport).unwrap());
        let registry = Arc::new(AgentRegistry::discover(agents));
        Orchestrator::new(config, registry, llm)
    }

    fn pdf(name: &str) -> IncomingFile {
        IncomingFile {
            filename: name.to_string(),
            content: b"%PDF-1.7 structural steel spec, Division 05".to_vec(),
        }
    }

    fn xlsx(name: &str) -> IncomingFile {
        IncomingFile {
            filename: name.to_string(),
            content: vec![0x50, 0x4B, 0x03, 0x04, 0x14, 0x00, 0x06, 0x00],
        }
    }

    fn renamed_executable(name: &str) -> IncomingFile {
        IncomingFile {
            filename: name.to_string(),
            content: b"MZ\x90\x00\x03 not actually a document".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_mixed_batch_is_partial_with_signature_error() {
        let config = test_config();
        let orchestrator =
            orchestrator_with(&config, default_agents(), Arc::new(StaticTransport));

        let report = orchestrator
            .run_batch(vec![
                pdf("spec-05-steel.pdf"),
                renamed_executable("malware.pdf"),
                xlsx("takeoff.xlsx"),
            ])
            .await;

        assert_eq!(report.batch_status, BatchStatus::Partial);
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.successful, 2);
        assert_eq!(report.summary.failed, 1);

        let failed = &report.results[1];
        assert_eq!(failed.filename, "malware.pdf");
        assert_eq!(
            failed.error,
            Some(AnalysisError::Validation(
                ValidationError::SignatureMismatch {
                    extension: "pdf".into(),
                    detected: "executable".into()
                }
            ))
        );
    }

    #[tokio::test]
    async fn test_empty_batch_reports_no_input() {
        let config = test_config();
        let orchestrator =
            orchestrator_with(&config, default_agents(), Arc::new(StaticTransport));

        let report = orchestrator.run_batch(vec![]).await;
        assert_eq!(report.batch_status, BatchStatus::NoInput);
        assert_eq!(report.summary.total, 0);
    }

    #[tokio::test]
    async fn test_unclaimed_category_falls_back_to_generalist() {
        let config = test_config();
        // Registry knows nothing; every classified file needs the fallback
        let orchestrator = orchestrator_with(&config, vec![], Arc::new(StaticTransport));

        let report = orchestrator.run_batch(vec![xlsx("quantities.xlsx")]).await;

        assert_eq!(report.batch_status, BatchStatus::Success);
        assert_eq!(report.results[0].agent_id, "generalist");
    }

    struct PanickingAgent;

    #[async_trait]
    impl AnalysisAgent for PanickingAgent {
        fn name(&self) -> &str {
            "unstable"
        }
        fn categories(&self) -> &[FileCategory] {
            &[FileCategory::Spreadsheet]
        }
        async fn analyze(
            &self,
            _task: &FileTask,
            _llm: &LlmService,
        ) -> Result<serde_json::Value, LlmError> {
            panic!("cell overflow");
        }
    }

    #[tokio::test]
    async fn test_agent_panic_is_contained() {
        let config = test_config();
        let orchestrator = orchestrator_with(
            &config,
            vec![Arc::new(PanickingAgent)],
            Arc::new(StaticTransport),
        );

        let report = orchestrator
            .run_batch(vec![xlsx("takeoff.xlsx"), pdf("spec.pdf")])
            .await;

        // The panicking agent only claims spreadsheets; the PDF still runs
        assert_eq!(report.batch_status, BatchStatus::Partial);
        let failed = &report.results[0];
        assert_eq!(
            failed.error,
            Some(AnalysisError::AgentFailure {
                message: "cell overflow".into()
            })
        );
    }

    struct StalledAgent;

    #[async_trait]
    impl AnalysisAgent for StalledAgent {
        fn name(&self) -> &str {
            "stalled"
        }
        fn categories(&self) -> &[FileCategory] {
            &[FileCategory::Spreadsheet]
        }
        async fn analyze(
            &self,
            _task: &FileTask,
            _llm: &LlmService,
        ) -> Result<serde_json::Value, LlmError> {
            tokio::time::sleep(Duration::from_secs(10_000)).await;
            Ok(serde_json::json!({}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_marks_stragglers_as_timeout() {
        let mut config = test_config();
        config.batch_timeout = Duration::from_secs(5);
        let orchestrator = orchestrator_with(
            &config,
            vec![Arc::new(StalledAgent)],
            Arc::new(StaticTransport),
        );

        let report = orchestrator.run_batch(vec![xlsx("takeoff.xlsx")]).await;

        assert_eq!(report.batch_status, BatchStatus::Error);
        assert_eq!(report.summary.total, 1, "stragglers are reported, not dropped");
        assert_eq!(report.results[0].error, Some(AnalysisError::Timeout));
    }

    #[tokio::test]
    async fn test_low_confidence_consults_secondary_agent() {
        struct RefusingAgent;

        #[async_trait]
        impl AnalysisAgent for RefusingAgent {
            fn name(&self) -> &str {
                "refuser"
            }
            fn categories(&self) -> &[FileCategory] {
                &[FileCategory::Specification]
            }
            fn priority(&self) -> u8 {
                90
            }
            async fn analyze(
                &self,
                _task: &FileTask,
                _llm: &LlmService,
            ) -> Result<serde_json::Value, LlmError> {
                Err(LlmError::InvalidResponse)
            }
        }

        struct AcceptingAgent;

        #[async_trait]
        impl AnalysisAgent for AcceptingAgent {
            fn name(&self) -> &str {
                "acceptor"
            }
            fn categories(&self) -> &[FileCategory] {
                &[FileCategory::Specification]
            }
            fn priority(&self) -> u8 {
                10
            }
            async fn analyze(
                &self,
                _task: &FileTask,
                _llm: &LlmService,
            ) -> Result<serde_json::Value, LlmError> {
                Ok(serde_json::json!({"summary": "recovered"}))
            }
        }

        let config = test_config();
        let orchestrator = orchestrator_with(
            &config,
            vec![Arc::new(RefusingAgent), Arc::new(AcceptingAgent)],
            Arc::new(StaticTransport),
        );

        // Bare PDFs classify with low confidence, unlocking the secondary
        let report = orchestrator.run_batch(vec![pdf("ambiguous.pdf")]).await;

        assert_eq!(report.batch_status, BatchStatus::Success);
        assert_eq!(report.results[0].agent_id, "acceptor");
    }

    #[tokio::test]
    async fn test_scan_dir_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("spec.pdf"), b"%PDF-1.7 body").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"poured footing F3").unwrap();

        let mut files = scan_dir(dir.path()).unwrap();
        files.sort_by(|a, b| a.filename.cmp(&b.filename));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].filename, "notes.txt");
        assert!(files[0].content.starts_with(b"poured"));
        assert_eq!(files[1].filename, "spec.pdf");
    }
}

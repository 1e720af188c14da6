//! LLM Service Abstraction
//!
//! One call contract over every configured AI provider. The service hides
//! per-provider request/response shapes behind [`ChatTransport`], reserves
//! rate-limit budget before each attempt, bounds every call with a timeout,
//! retries transient failures with exponential backoff, and switches once to
//! a fallback provider when the primary is exhausted.
//!
//! Providers are an ordered list iterated generically; adding one means
//! adding a config entry, not a new branch.

mod providers;

pub use providers::HttpTransport;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{PipelineConfig, ProviderConfig, RetryConfig};
use crate::error::{LlmError, ProviderError, RateLimitTimeout};
use crate::limiter::RateLimiter;

/// A single prompt for a provider
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Budget units this call is expected to consume
    pub estimated_units: u64,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: 1000,
            temperature: 0.1,
            estimated_units: 1,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Successful provider reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmResponse {
    /// Provider that actually answered (may be the fallback)
    pub provider: String,
    pub content: String,
    pub total_tokens: u32,
}

/// Outcome class of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    FatalFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientFailure => "transient_failure",
            Self::FatalFailure => "fatal_failure",
        }
    }
}

/// One provider invocation attempt, emitted per attempt for observability
#[derive(Debug, Clone)]
pub struct CallAttempt {
    pub provider: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub duration: Duration,
}

/// Callback invoked with every [`CallAttempt`]
pub type AttemptObserver = Arc<dyn Fn(&CallAttempt) + Send + Sync>;

/// Wire-level provider access, swapped out for a scripted one in tests
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(
        &self,
        provider: &ProviderConfig,
        request: &LlmRequest,
    ) -> Result<LlmResponse, ProviderError>;
}

enum LastFailure {
    Provider(ProviderError),
    RateLimited(RateLimitTimeout),
}

/// Multi-provider LLM call service with rate limiting and resilience
pub struct LlmService {
    providers: Vec<ProviderConfig>,
    retry: RetryConfig,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn ChatTransport>,
    degraded: bool,
    observer: Option<AttemptObserver>,
}

impl LlmService {
    /// Wire the service against real HTTP providers.
    ///
    /// An empty provider list is the one fatal misconfiguration; providers
    /// that are configured but keyless put the service in degraded mode
    /// instead, surfaced via [`LlmService::degraded`] and the report flag.
    pub fn new(config: &PipelineConfig, limiter: Arc<RateLimiter>) -> Result<Self, LlmError> {
        Self::with_transport(config, limiter, Arc::new(HttpTransport::new()))
    }

    /// Same wiring with an injected transport (tests, replay)
    pub fn with_transport(
        config: &PipelineConfig,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn ChatTransport>,
    ) -> Result<Self, LlmError> {
        if config.providers.is_empty() {
            return Err(LlmError::Unavailable);
        }

        for provider in &config.providers {
            limiter.register(&provider.id, &provider.budget);
        }

        let usable = config.providers.iter().filter(|p| p.has_key()).count();
        let degraded = usable < config.providers.len();
        if degraded {
            tracing::warn!(
                configured = config.providers.len(),
                usable,
                "running degraded: some providers have no credentials"
            );
        }

        Ok(Self {
            providers: config.providers.clone(),
            retry: config.retry.clone(),
            limiter,
            transport,
            degraded,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// True when at least one configured provider has no credentials
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    /// Call the provider chain: primary with retries, then a single switch
    /// to the fallback. Budget is reserved before each attempt and the
    /// lease always releases, success or not.
    pub async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let usable: Vec<&ProviderConfig> =
            self.providers.iter().filter(|p| p.has_key()).collect();
        if usable.is_empty() {
            return Err(LlmError::Unavailable);
        }

        // Primary plus at most one fallback switch
        let chain = &usable[..usable.len().min(2)];
        let mut attempts_total = 0u32;
        let mut last_failure: Option<LastFailure> = None;

        for provider in chain {
            let mut backoff = self.retry.initial_backoff;

            'attempts: for attempt in 1..=self.retry.max_attempts {
                let lease = match self
                    .limiter
                    .reserve(&provider.id, request.estimated_units)
                    .await
                {
                    Ok(lease) => lease,
                    Err(timeout) => {
                        tracing::warn!(
                            provider = %provider.id,
                            "budget unavailable, switching provider"
                        );
                        last_failure = Some(LastFailure::RateLimited(timeout));
                        break 'attempts;
                    }
                };

                let started = Instant::now();
                let result = match tokio::time::timeout(
                    provider.request_timeout,
                    self.transport.send(provider, request),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(provider.request_timeout)),
                };
                let duration = started.elapsed();
                attempts_total += 1;

                match result {
                    Ok(response) => {
                        self.record(provider, attempt, AttemptOutcome::Success, duration);
                        lease.release(request.estimated_units).await;
                        return Ok(response);
                    }
                    Err(err) => {
                        let outcome = if err.is_transient() {
                            AttemptOutcome::TransientFailure
                        } else {
                            AttemptOutcome::FatalFailure
                        };
                        self.record(provider, attempt, outcome, duration);
                        lease.release(request.estimated_units).await;

                        if matches!(err, ProviderError::Auth) {
                            // The key value never reaches the log
                            tracing::error!(
                                provider = %provider.id,
                                key = %mask_key(provider.api_key.as_deref().unwrap_or_default()),
                                "authentication rejected"
                            );
                            return Err(LlmError::Auth {
                                provider: provider.id.clone(),
                            });
                        }

                        let transient = err.is_transient();
                        last_failure = Some(LastFailure::Provider(err));

                        if !transient {
                            // Deterministic failure on this provider; try
                            // the fallback instead of repeating it
                            break 'attempts;
                        }
                        if attempt < self.retry.max_attempts {
                            tracing::warn!(
                                provider = %provider.id,
                                attempt,
                                backoff_ms = backoff.as_millis() as u64,
                                "transient failure, backing off"
                            );
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(self.retry.max_backoff);
                        }
                    }
                }
            }
        }

        // The final failure's kind decides what the caller sees
        Err(match last_failure {
            Some(LastFailure::Provider(ProviderError::Timeout(_))) => LlmError::Timeout,
            Some(LastFailure::Provider(ProviderError::InvalidResponse(_))) => {
                LlmError::InvalidResponse
            }
            Some(LastFailure::RateLimited(timeout)) => timeout.into(),
            _ => LlmError::Exhausted {
                attempts: attempts_total,
            },
        })
    }

    fn record(
        &self,
        provider: &ProviderConfig,
        attempt: u32,
        outcome: AttemptOutcome,
        duration: Duration,
    ) {
        let event = CallAttempt {
            provider: provider.id.clone(),
            attempt,
            outcome,
            duration,
        };
        tracing::info!(
            provider = %event.provider,
            attempt = event.attempt,
            outcome = event.outcome.as_str(),
            duration_ms = event.duration.as_millis() as u64,
            "provider call attempt"
        );
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }
}

/// Show just enough of a credential to correlate, never the value
fn mask_key(key: &str) -> String {
    if key.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", key.chars().take(4).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, ProviderKind};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport that replays a fixed script of outcomes
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<LlmResponse, ProviderError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<LlmResponse, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send(
            &self,
            provider: &ProviderConfig,
            _request: &LlmRequest,
        ) -> Result<LlmResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(reply(&provider.id)))
        }
    }

    fn reply(provider: &str) -> LlmResponse {
        LlmResponse {
            provider: provider.to_string(),
            content: r#"{"summary": "ok"}"#.to_string(),
            total_tokens: 42,
        }
    }

    fn provider(id: &str, key: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            kind: ProviderKind::OpenAi,
            api_key: key.map(String::from),
            base_url: "http://localhost".to_string(),
            model: "test-model".to_string(),
            request_timeout: Duration::from_secs(5),
            budget: BudgetConfig {
                limit_units: 1000,
                window: Duration::from_secs(60),
                max_wait: Duration::from_secs(1),
            },
        }
    }

    fn config(providers: Vec<ProviderConfig>) -> PipelineConfig {
        PipelineConfig {
            providers,
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
            },
            ..PipelineConfig::default()
        }
    }

    fn service(
        providers: Vec<ProviderConfig>,
        transport: Arc<ScriptedTransport>,
    ) -> LlmService {
        LlmService::with_transport(
            &config(providers),
            Arc::new(RateLimiter::new()),
            transport,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_zero_configured_providers_is_fatal() {
        let err = LlmService::with_transport(
            &config(vec![]),
            Arc::new(RateLimiter::new()),
            ScriptedTransport::new(vec![]),
        )
        .err()
        .unwrap();
        assert_eq!(err, LlmError::Unavailable);
    }

    #[tokio::test]
    async fn test_keyless_providers_mean_degraded_not_fatal() {
        let svc = service(vec![provider("openai", None)], ScriptedTransport::new(vec![]));
        assert!(svc.degraded());
        let err = svc.call(&LlmRequest::new("hi")).await.unwrap_err();
        assert_eq!(err, LlmError::Unavailable);
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let transport = ScriptedTransport::new(vec![Ok(reply("openai"))]);
        let svc = service(vec![provider("openai", Some("sk-a"))], Arc::clone(&transport));
        let response = svc.call(&LlmRequest::new("hi")).await.unwrap();
        assert_eq!(response.provider, "openai");
        assert_eq!(transport.calls(), 1);
        assert!(!svc.degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_to_cap_then_fall_back() {
        let transport = ScriptedTransport::new(vec![
            Err(ProviderError::Throttled),
            Err(ProviderError::Server {
                status: 503,
                message: "overloaded".into(),
            }),
            Err(ProviderError::Throttled),
            // Fallback provider answers
            Ok(reply("xai")),
        ]);
        let svc = service(
            vec![provider("openai", Some("sk-a")), provider("xai", Some("sk-b"))],
            Arc::clone(&transport),
        );

        let response = svc.call(&LlmRequest::new("hi")).await.unwrap();
        assert_eq!(response.provider, "xai");
        assert_eq!(transport.calls(), 4, "3 primary attempts, 1 fallback");
    }

    #[tokio::test(start_paused = true)]
    async fn test_everything_failing_returns_exhausted() {
        let transport = ScriptedTransport::new(vec![
            Err(ProviderError::Throttled),
            Err(ProviderError::Throttled),
            Err(ProviderError::Throttled),
            Err(ProviderError::Throttled),
            Err(ProviderError::Throttled),
            Err(ProviderError::Throttled),
        ]);
        let svc = service(
            vec![provider("openai", Some("sk-a")), provider("xai", Some("sk-b"))],
            Arc::clone(&transport),
        );

        let err = svc.call(&LlmRequest::new("hi")).await.unwrap_err();
        assert_eq!(err, LlmError::Exhausted { attempts: 6 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_timeout_surfaces_as_timeout() {
        let transport = ScriptedTransport::new(vec![
            Err(ProviderError::Throttled),
            Err(ProviderError::Timeout(Duration::from_secs(5))),
            Err(ProviderError::Timeout(Duration::from_secs(5))),
        ]);
        let svc = service(vec![provider("openai", Some("sk-a"))], Arc::clone(&transport));

        let err = svc.call(&LlmRequest::new("hi")).await.unwrap_err();
        assert_eq!(err, LlmError::Timeout);
    }

    #[tokio::test]
    async fn test_fatal_auth_error_stops_after_one_attempt() {
        let transport = ScriptedTransport::new(vec![Err(ProviderError::Auth)]);
        let svc = service(
            vec![provider("openai", Some("sk-a")), provider("xai", Some("sk-b"))],
            Arc::clone(&transport),
        );

        let err = svc.call(&LlmRequest::new("hi")).await.unwrap_err();
        assert_eq!(
            err,
            LlmError::Auth {
                provider: "openai".into()
            }
        );
        assert_eq!(transport.calls(), 1, "auth failures are never retried");
    }

    #[tokio::test]
    async fn test_invalid_request_switches_provider_without_retry() {
        let transport = ScriptedTransport::new(vec![
            Err(ProviderError::InvalidRequest {
                status: 422,
                message: "bad schema".into(),
            }),
            Ok(reply("xai")),
        ]);
        let svc = service(
            vec![provider("openai", Some("sk-a")), provider("xai", Some("sk-b"))],
            Arc::clone(&transport),
        );

        let response = svc.call(&LlmRequest::new("hi")).await.unwrap();
        assert_eq!(response.provider, "xai");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_third_provider_is_never_consulted() {
        // Single fallback switch: the chain is capped at two providers
        let transport = ScriptedTransport::new(vec![
            Err(ProviderError::InvalidRequest {
                status: 400,
                message: "no".into(),
            }),
            Err(ProviderError::InvalidRequest {
                status: 400,
                message: "no".into(),
            }),
            Ok(reply("third")),
        ]);
        let svc = service(
            vec![
                provider("openai", Some("sk-a")),
                provider("xai", Some("sk-b")),
                provider("third", Some("sk-c")),
            ],
            Arc::clone(&transport),
        );

        let err = svc.call(&LlmRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, LlmError::Exhausted { .. }));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_attempt_events_are_emitted() {
        let transport = ScriptedTransport::new(vec![
            Err(ProviderError::Throttled),
            Ok(reply("openai")),
        ]);
        let svc = service(vec![provider("openai", Some("sk-a"))], transport);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let svc = svc.with_observer(Arc::new(move |attempt: &CallAttempt| {
            sink.lock().unwrap().push((attempt.attempt, attempt.outcome));
        }));

        svc.call(&LlmRequest::new("hi")).await.unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                (1, AttemptOutcome::TransientFailure),
                (2, AttemptOutcome::Success)
            ]
        );
    }

    #[tokio::test]
    async fn test_skips_keyless_primary_for_keyed_fallback() {
        let transport = ScriptedTransport::new(vec![Ok(reply("xai"))]);
        let svc = service(
            vec![provider("openai", None), provider("xai", Some("sk-b"))],
            Arc::clone(&transport),
        );
        assert!(svc.degraded());

        let response = svc.call(&LlmRequest::new("hi")).await.unwrap();
        assert_eq!(response.provider, "xai");
    }

    #[test]
    fn test_mask_key_hides_value() {
        assert_eq!(mask_key("sk-supersecretvalue"), "sk-s****");
        assert_eq!(mask_key("abc"), "****");
        assert_eq!(mask_key(""), "****");
    }
}

//! Fixed-shape generation operations over the orchestrator.
//!
//! The facade owns prompt assembly for the two call shapes every stage uses:
//! one structured JSON document, or a batch of exactly N items. It injects
//! the repair hint into the prompt when the retry context asks for it, and
//! turns unparseable output into a typed parse failure so the retry loop can
//! drive repair mode.

use std::sync::Arc;
use std::time::Duration;

use genrelay_config::ConfigError;
use genrelay_core::{ErrorCategory, GenError, ProviderModel};
use genrelay_retry::RetryContext;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::{CallParams, ProviderRegistry, ProviderRequest, ProviderResponse};
use crate::{CallOptions, CallOutcome, Orchestrator};

/// Options for one facade generation call.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub stage: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub params: CallParams,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl GenerateOptions {
    pub fn new(
        stage: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            params: CallParams::default(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_params(mut self, params: CallParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

struct Parsed<T> {
    value: T,
    prompt_tokens: u64,
    completion_tokens: u64,
}

pub struct OrchestratorFacade {
    orchestrator: Arc<Orchestrator>,
    registry: ProviderRegistry,
}

impl OrchestratorFacade {
    pub fn new(orchestrator: Arc<Orchestrator>, registry: ProviderRegistry) -> Self {
        Self {
            orchestrator,
            registry,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Generate one structured JSON document and deserialize it into `T`.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        opts: GenerateOptions,
    ) -> Result<CallOutcome<T>, ConfigError> {
        self.generate_with(opts, |target, text| {
            let json = extract_json(text);
            serde_json::from_str::<T>(json).map_err(|error| {
                parse_failure(target, format!("structured output invalid: {error}"))
            })
        })
        .await
    }

    /// Generate a JSON array of exactly `expected_count` items.
    ///
    /// A syntactically valid array of the wrong length is still a parse
    /// failure: the stage asked for N artifacts and can use nothing else.
    pub async fn generate_batch<T: DeserializeOwned>(
        &self,
        opts: GenerateOptions,
        expected_count: usize,
    ) -> Result<CallOutcome<Vec<T>>, ConfigError> {
        self.generate_with(opts, move |target, text| {
            let json = extract_json(text);
            let items: Vec<T> = serde_json::from_str(json).map_err(|error| {
                parse_failure(target, format!("batch output invalid: {error}"))
            })?;
            if items.len() != expected_count {
                return Err(parse_failure(
                    target,
                    format!(
                        "batch output malformed: expected {expected_count} items, got {}",
                        items.len()
                    ),
                ));
            }
            Ok(items)
        })
        .await
    }

    async fn generate_with<T, P>(
        &self,
        opts: GenerateOptions,
        parse: P,
    ) -> Result<CallOutcome<T>, ConfigError>
    where
        P: Fn(&ProviderModel, &str) -> Result<T, GenError>,
    {
        let call_opts = CallOptions {
            stage: opts.stage.clone(),
            timeout: opts.timeout,
            cancel: opts.cancel.clone(),
        };
        let registry = &self.registry;
        let parse = &parse;
        let opts_ref = &opts;

        let outcome = self
            .orchestrator
            .call(call_opts, |target, context, token| {
                let request = build_request(opts_ref, &target, &context);
                async move {
                    let provider = registry.get(&target.provider).ok_or_else(|| {
                        anyhow::Error::new(GenError::new(
                            ErrorCategory::NonRetryable,
                            target.clone(),
                            format!("provider '{}' not registered", target.provider),
                        ))
                    })?;
                    let response: ProviderResponse =
                        provider.perform_call(&request, &token).await?;
                    let value = parse(&target, &response.text)
                        .map_err(anyhow::Error::new)?;
                    Ok(Parsed {
                        value,
                        prompt_tokens: response.prompt_tokens,
                        completion_tokens: response.completion_tokens,
                    })
                }
            })
            .await?;

        let CallOutcome {
            result,
            mut telemetry,
        } = outcome;
        let result = result.map(|parsed| {
            telemetry.prompt_tokens = parsed.prompt_tokens;
            telemetry.completion_tokens = parsed.completion_tokens;
            parsed.value
        });
        Ok(CallOutcome { result, telemetry })
    }
}

fn build_request(
    opts: &GenerateOptions,
    target: &ProviderModel,
    context: &RetryContext,
) -> ProviderRequest {
    let user_prompt = match (&context.repair_hint, context.repair_mode) {
        (Some(hint), true) => {
            debug!(stage = %opts.stage, attempt = context.attempt, "injecting repair hint");
            format!("{}\n\n{hint}", opts.user_prompt)
        }
        _ => opts.user_prompt.clone(),
    };
    ProviderRequest {
        target: target.clone(),
        system_prompt: opts.system_prompt.clone(),
        user_prompt,
        params: opts.params.clone(),
    }
}

fn parse_failure(target: &ProviderModel, message: String) -> GenError {
    GenError::new(ErrorCategory::RetryableParse, target.clone(), message)
}

/// Strip a markdown code fence if the model wrapped its JSON in one.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use genrelay_config::RelayConfig;
    use genrelay_core::AttemptOutcome;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::provider::Provider;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Pool {
        name: String,
    }

    struct ScriptedProvider {
        responses: Mutex<VecDeque<anyhow::Result<ProviderResponse>>>,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<anyhow::Result<ProviderResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn ok(text: &str) -> anyhow::Result<ProviderResponse> {
            Ok(ProviderResponse {
                text: text.to_string(),
                prompt_tokens: 100,
                completion_tokens: 20,
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn perform_call(
            &self,
            request: &ProviderRequest,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<ProviderResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| anyhow::bail!("script exhausted"))
        }
    }

    fn facade(provider: Arc<ScriptedProvider>) -> OrchestratorFacade {
        let mut config = RelayConfig::default();
        config.default_route = vec!["mock/model-x".into()];
        config.retry.base_delay_ms = 1;
        config.retry.jitter_factor = 0.0;
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(config)));
        let mut registry = ProviderRegistry::new();
        registry.register("mock", provider as Arc<dyn Provider>);
        OrchestratorFacade::new(orchestrator, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_output_parsed_and_tokens_recorded() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::ok(
            "```json\n{\"name\": \"forest\"}\n```",
        )]);
        let f = facade(Arc::clone(&provider));

        let outcome = f
            .generate_structured::<Pool>(GenerateOptions::new("pools", "sys", "make a pool"))
            .await
            .unwrap();

        assert_eq!(outcome.result.unwrap(), Pool { name: "forest".into() });
        assert_eq!(outcome.telemetry.prompt_tokens, 100);
        assert_eq!(outcome.telemetry.completion_tokens, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_hint_injected_on_third_attempt() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::ok("not json at all {"),
            ScriptedProvider::ok("still not json {"),
            ScriptedProvider::ok("{\"name\": \"cave\"}"),
        ]);
        let f = facade(Arc::clone(&provider));

        let outcome = f
            .generate_structured::<Pool>(GenerateOptions::new("pools", "sys", "make a pool"))
            .await
            .unwrap();
        assert_eq!(outcome.result.unwrap(), Pool { name: "cave".into() });

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].user_prompt, "make a pool");
        assert_eq!(requests[1].user_prompt, "make a pool");
        // Repair mode kicks in after the second parse failure.
        assert!(requests[2].user_prompt.starts_with("make a pool\n\n"));
        assert!(requests[2].user_prompt.len() > "make a pool".len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_wrong_count_is_a_parse_failure() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::ok("[{\"name\": \"a\"}, {\"name\": \"b\"}]"),
            ScriptedProvider::ok("[{\"name\": \"a\"}, {\"name\": \"b\"}, {\"name\": \"c\"}]"),
        ]);
        let f = facade(Arc::clone(&provider));

        let outcome = f
            .generate_batch::<Pool>(GenerateOptions::new("pools", "sys", "make 3 pools"), 3)
            .await
            .unwrap();

        let items = outcome.result.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(outcome.telemetry.total_attempts, 2);
        assert!(matches!(
            outcome.telemetry.attempts[0].outcome,
            AttemptOutcome::Error {
                category: ErrorCategory::RetryableParse
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_provider_fails_without_retry() {
        let mut config = RelayConfig::default();
        config.default_route = vec!["nobody/model".into()];
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(config)));
        let f = OrchestratorFacade::new(orchestrator, ProviderRegistry::new());

        let outcome = f
            .generate_structured::<Pool>(GenerateOptions::new("pools", "sys", "u"))
            .await
            .unwrap();

        let error = outcome.result.unwrap_err();
        assert_eq!(error.category, ErrorCategory::NonRetryable);
        assert_eq!(outcome.telemetry.total_attempts, 1);
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```\n[1,2]\n```"), "[1,2]");
        assert_eq!(extract_json("  {\"a\":1}  "), "{\"a\":1}");
    }
}

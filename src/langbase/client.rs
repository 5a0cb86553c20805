use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{CreatePipeRequest, CreatePipeResponse, Message, PipeRequest, PipeResponse};
use crate::config::{LangbaseConfig, RequestConfig};
use crate::error::{LangbaseError, LangbaseResult};

const RUN_PATH: &str = "/v1/pipes/run";
const PIPES_PATH: &str = "/v1/pipes";

/// Model every research pipe is provisioned with.
const PIPE_MODEL: &str = "openai:gpt-4o-mini";

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Client for the Langbase Pipes API.
///
/// Every agent and pipe-backed backend in the research engine goes through
/// one shared instance; it is cheap to clone.
#[derive(Clone)]
pub struct LangbaseClient {
    client: Client,
    base_url: String,
    api_key: String,
    request_config: RequestConfig,
}

impl LangbaseClient {
    /// Create a new Langbase client
    pub fn new(config: &LangbaseConfig, request_config: RequestConfig) -> LangbaseResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LangbaseError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_config,
        })
    }

    /// Run a pipe, retrying transient failures.
    ///
    /// Timeouts, transport errors, 429 and 5xx are retried up to
    /// `max_retries` times with exponential backoff; once exhausted the last
    /// error is reported as [`LangbaseError::Unavailable`]. Other API errors
    /// and undecodable bodies are returned as they are.
    pub async fn call_pipe(&self, request: PipeRequest) -> LangbaseResult<PipeResponse> {
        let mut attempts = 0u32;

        loop {
            if attempts > 0 {
                let delay = self.backoff(attempts);
                warn!(
                    pipe = %request.name,
                    retry = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying pipe run"
                );
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let result = self.post::<_, PipeResponse>(RUN_PATH, &request).await;
            attempts += 1;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    debug!(
                        pipe = %request.name,
                        latency_ms,
                        attempts,
                        completion_len = response.completion.len(),
                        "Pipe run succeeded"
                    );
                    return Ok(response);
                }
                Err(e) if is_transient(&e) => {
                    warn!(pipe = %request.name, error = %e, latency_ms, "Pipe run failed");
                    if attempts > self.request_config.max_retries {
                        return Err(LangbaseError::Unavailable {
                            message: e.to_string(),
                            retries: attempts,
                        });
                    }
                }
                Err(e) => {
                    warn!(pipe = %request.name, error = %e, latency_ms, "Pipe run rejected");
                    return Err(e);
                }
            }
        }
    }

    /// Create (or, with `upsert`, update) a pipe.
    pub async fn create_pipe(
        &self,
        request: CreatePipeRequest,
    ) -> LangbaseResult<CreatePipeResponse> {
        debug!(pipe = %request.name, upsert = ?request.upsert, "Creating pipe");
        let created: CreatePipeResponse = self.post(PIPES_PATH, &request).await?;
        info!(pipe = %created.name, url = %created.url, "Pipe created");
        Ok(created)
    }

    /// Upsert a JSON-output pipe with the given system prompt.
    ///
    /// A 409 from the API means the pipe already exists and is accepted.
    pub async fn ensure_pipe(
        &self,
        pipe_name: &str,
        description: &str,
        system_prompt: &str,
    ) -> LangbaseResult<()> {
        let request = CreatePipeRequest::new(pipe_name)
            .with_description(description)
            .with_model(PIPE_MODEL)
            .with_upsert(true)
            .with_json_output(true)
            .with_temperature(0.4)
            .with_max_tokens(4000)
            .with_messages(vec![Message::system(system_prompt)]);

        match self.create_pipe(request).await {
            Ok(_) => Ok(()),
            Err(LangbaseError::Api { status: 409, .. }) => {
                debug!(pipe = %pipe_name, "Pipe already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> LangbaseResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        decode(response).await
    }

    fn transport_error(&self, e: reqwest::Error) -> LangbaseError {
        if e.is_timeout() {
            LangbaseError::Timeout {
                timeout_ms: self.request_config.timeout_ms,
            }
        } else {
            LangbaseError::Http(e)
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.request_config
                .retry_delay_ms
                .saturating_mul(factor)
                .min(MAX_BACKOFF_MS),
        )
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> LangbaseResult<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(LangbaseError::Api {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }

    response
        .json()
        .await
        .map_err(|e| LangbaseError::InvalidResponse {
            message: e.to_string(),
        })
}

/// Whether another attempt could succeed.
fn is_transient(error: &LangbaseError) -> bool {
    match error {
        LangbaseError::Timeout { .. } | LangbaseError::Http(_) => true,
        LangbaseError::Api { status, .. } => *status == 429 || *status >= 500,
        LangbaseError::InvalidResponse { .. } | LangbaseError::Unavailable { .. } => false,
    }
}

//! External completion capability.
//!
//! Every stage talks to the model through the `Completion` trait. Calls are
//! blocking and run on pool worker threads; each worker builds its own client
//! from a shared `CompletionFactory`.

use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use thiserror::Error;

use crate::error::PipelineError;
use crate::types::{CompletionConfig, CompletionProvider};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const GEMINI_KEY_HEADER: &str = "x-goog-api-key";

/// Failures of a single completion call.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion timed out after {0} seconds")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Completion endpoint returned no text")]
    EmptyResponse,

    #[error("Rate limited by completion endpoint")]
    RateLimited,

    #[error("Completion endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unexpected response envelope: {0}")]
    InvalidResponse(String),

    #[error("API key not set (expected in ${0})")]
    MissingApiKey(String),

    #[error("Failed to build completion client: {0}")]
    Client(String),
}

impl CompletionError {
    /// Returns true if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Timeout(_)
            | CompletionError::Network(_)
            | CompletionError::EmptyResponse
            | CompletionError::RateLimited
            | CompletionError::InvalidResponse(_) => true,
            CompletionError::Http { status, .. } => *status >= 500,
            CompletionError::MissingApiKey(_) | CompletionError::Client(_) => false,
        }
    }
}

/// Sampling knobs for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub top_p: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_output_tokens: 4096,
            top_p: 0.95,
        }
    }
}

impl GenerationOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }
}

/// A text-in, text-out completion endpoint.
pub trait Completion: Send {
    fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String, CompletionError>;
}

/// Builds one completion client per worker.
pub trait CompletionFactory: Sync {
    fn client(&self) -> Result<Box<dyn Completion>, CompletionError>;
}

/// Call `completion` with up to `retries` extra attempts on transient failure.
///
/// `build_prompt` receives the attempt number (0-based) so callers can shrink
/// the context on each retry.
pub fn generate_with_retry(
    completion: &dyn Completion,
    retries: u32,
    options: &GenerationOptions,
    mut build_prompt: impl FnMut(u32) -> String,
) -> Result<String, PipelineError> {
    let mut last_error = String::new();
    for attempt in 0..=retries {
        let prompt = build_prompt(attempt);
        match completion.generate(&prompt, options) {
            Ok(text) => return Ok(text),
            Err(e) if e.is_retryable() => {
                log::warn!(
                    "Completion: attempt {}/{} failed: {}",
                    attempt + 1,
                    retries + 1,
                    e
                );
                last_error = e.to_string();
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(PipelineError::TransientCallFailure {
        attempts: retries + 1,
        detail: last_error,
    })
}

// =============================================================================
// HTTP client
// =============================================================================

/// Gemini or OpenAI-compatible endpoint over blocking reqwest.
pub struct HttpCompletion {
    client: Client,
    provider: CompletionProvider,
    model: String,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
}

impl HttpCompletion {
    pub fn new(config: &CompletionConfig, api_key: String) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CompletionError::Client(e.to_string()))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| match config.provider {
                CompletionProvider::Gemini => GEMINI_BASE_URL.to_string(),
                CompletionProvider::OpenaiCompatible => OPENAI_BASE_URL.to_string(),
            });
        Ok(Self {
            client,
            provider: config.provider,
            model: config.model.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout_secs: config.timeout_secs,
        })
    }

    /// Error text never carries the request URL.
    fn map_send_error(&self, err: reqwest::Error) -> CompletionError {
        if err.is_timeout() {
            CompletionError::Timeout(self.timeout_secs)
        } else {
            CompletionError::Network(err.without_url().to_string())
        }
    }

    fn post(&self, url: &str, payload: &Value) -> Result<Value, CompletionError> {
        let request = self.client.post(url).json(payload);
        let request = match self.provider {
            CompletionProvider::Gemini => request.header(GEMINI_KEY_HEADER, &self.api_key),
            CompletionProvider::OpenaiCompatible => request.bearer_auth(&self.api_key),
        };
        let response = request.send().map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(CompletionError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CompletionError::Http {
                status: status.as_u16(),
                body: crate::util::safe_truncate(&body, 300).to_string(),
            });
        }
        response
            .json()
            .map_err(|e| CompletionError::InvalidResponse(e.without_url().to_string()))
    }
}

impl Completion for HttpCompletion {
    fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String, CompletionError> {
        let text = match self.provider {
            CompletionProvider::Gemini => {
                let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
                let payload = serde_json::json!({
                    "contents": [{"parts": [{"text": prompt}]}],
                    "generationConfig": {
                        "temperature": options.temperature,
                        "maxOutputTokens": options.max_output_tokens,
                        "topP": options.top_p,
                    }
                });
                let json = self.post(&url, &payload)?;
                gemini_text(&json)
            }
            CompletionProvider::OpenaiCompatible => {
                let url = format!("{}/v1/chat/completions", self.base_url);
                let payload = serde_json::json!({
                    "model": self.model,
                    "messages": [{"role": "user", "content": prompt}],
                    "temperature": options.temperature,
                    "max_tokens": options.max_output_tokens,
                    "top_p": options.top_p,
                });
                let json = self.post(&url, &payload)?;
                openai_text(&json)
            }
        };
        match text {
            Some(t) if !t.trim().is_empty() => Ok(t),
            _ => Err(CompletionError::EmptyResponse),
        }
    }
}

/// Concatenate the text parts of the first Gemini candidate.
fn gemini_text(json: &Value) -> Option<String> {
    let parts = json
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    Some(text)
}

fn openai_text(json: &Value) -> Option<String> {
    json.get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

/// Builds `HttpCompletion` clients from config, reading the key from the environment.
pub struct HttpCompletionFactory {
    config: CompletionConfig,
}

impl HttpCompletionFactory {
    pub fn new(config: CompletionConfig) -> Self {
        Self { config }
    }

    fn api_key(&self) -> Result<String, CompletionError> {
        std::env::var(&self.config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| CompletionError::MissingApiKey(self.config.api_key_env.clone()))
    }
}

impl CompletionFactory for HttpCompletionFactory {
    fn client(&self) -> Result<Box<dyn Completion>, CompletionError> {
        let key = self.api_key()?;
        Ok(Box::new(HttpCompletion::new(&self.config, key)?))
    }
}

// =============================================================================
// Scripted completions for tests
// =============================================================================


#[cfg(test)]
mod tests {
    use super::test_utils::ScriptedCompletion;
    use super::*;
    use crate::prompts::{build_batch_grouping_prompt, RecordLine, HEADER_GROUP_BATCH};

    #[test]
    fn test_retryable_split() {
        assert!(CompletionError::Timeout(5).is_retryable());
        assert!(CompletionError::RateLimited.is_retryable());
        assert!(CompletionError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(!CompletionError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!CompletionError::MissingApiKey("K".into()).is_retryable());
    }

    #[test]
    fn test_gemini_envelope() {
        let json = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "{\"a\":"}, {"text": "1}"}]}}]
        });
        assert_eq!(gemini_text(&json).as_deref(), Some("{\"a\":1}"));
        assert_eq!(gemini_text(&serde_json::json!({"candidates": []})), None);
    }

    #[test]
    fn test_openai_envelope() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(openai_text(&json).as_deref(), Some("hello"));
    }

    #[test]
    fn test_retry_shrinks_prompt_and_gives_up() {
        let fake = ScriptedCompletion::new();
        fake.on("## Task: probe", |_| Err(CompletionError::Timeout(1)));
        let client = fake.clone();

        let result = generate_with_retry(&client, 2, &GenerationOptions::default(), |attempt| {
            format!("## Task: probe\ncontext={}", 100 >> attempt)
        });
        match result {
            Err(PipelineError::TransientCallFailure { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected transient failure, got {:?}", other),
        }
        let prompts = fake.prompts("## Task: probe");
        assert_eq!(prompts.len(), 3);
        assert!(prompts[2].ends_with("context=25"));

        let records = vec![RecordLine {
            id: 1,
            title: "Acme agrees to buy Beta in all-stock deal ".repeat(10),
        }];
        fake.on(HEADER_GROUP_BATCH, |_| Err(CompletionError::RateLimited));
        let result = generate_with_retry(&client, 2, &GenerationOptions::default(), |attempt| {
            build_batch_grouping_prompt(&records, attempt)
        });
        assert!(matches!(result, Err(PipelineError::TransientCallFailure { attempts: 3, .. })));
        let sizes: Vec<usize> = fake.prompts(HEADER_GROUP_BATCH).iter().map(String::len).collect();
        assert_eq!(sizes.len(), 3);
        assert!(sizes[0] > sizes[1] && sizes[1] > sizes[2]);
    }

    #[test]
    fn test_retry_recovers_and_stops_on_fatal() {
        let fake = ScriptedCompletion::new();
        fake.queue("## Task: probe", Err(CompletionError::EmptyResponse));
        fake.queue("## Task: probe", Ok("done".into()));
        let client = fake.clone();
        let text = generate_with_retry(&client, 2, &GenerationOptions::default(), |_| {
            "## Task: probe".to_string()
        })
        .unwrap();
        assert_eq!(text, "done");

        fake.queue("## Task: probe", Err(CompletionError::MissingApiKey("K".into())));
        let err = generate_with_retry(&client, 2, &GenerationOptions::default(), |_| {
            "## Task: probe".to_string()
        })
        .unwrap_err();
        assert_eq!(err.kind(), "config");
        assert_eq!(fake.call_count("## Task: probe"), 3);
    }

    #[test]
    fn test_failed_request_error_omits_api_key() {
        let config = CompletionConfig {
            provider: CompletionProvider::Gemini,
            base_url: Some("http://127.0.0.1:1".into()),
            timeout_secs: 5,
            ..Default::default()
        };
        let client = HttpCompletion::new(&config, "SUPERSECRETKEY".into()).unwrap();
        let err = client
            .generate("## Task: probe", &GenerationOptions::default())
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.to_string().contains("SUPERSECRETKEY"));
        assert!(!format!("{:?}", err).contains("SUPERSECRETKEY"));
    }

    #[test]
    fn test_factory_requires_key() {
        let config = CompletionConfig {
            api_key_env: "EVENTDESK_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..Default::default()
        };
        let factory = HttpCompletionFactory::new(config);
        assert!(matches!(
            factory.client().err(),
            Some(CompletionError::MissingApiKey(_))
        ));
    }
}

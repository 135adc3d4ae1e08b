//! Direct HTTP backend for OpenAI-compatible chat completion APIs.

use std::time::Duration;

use async_trait::async_trait;
use review_coordination::error::exit_code;
use review_coordination::redaction::Redactor;
use review_coordination::{Backend, BackendOutput, Capability, InvocationRequest};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::auth::{credential_from_env, OPENAI_KEY_VARS};

pub const NAME: &str = "curl";

const MAX_ERROR_BODY_CHARS: usize = 500;

pub struct CurlBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    redactor: Redactor,
}

impl CurlBackend {
    /// Key taken from the environment.
    pub fn new(base_url: &str) -> Self {
        Self::with_key(base_url, credential_from_env(OPENAI_KEY_VARS))
    }

    pub fn with_key(base_url: &str, api_key: Option<String>) -> Self {
        let mut redactor = Redactor::from_env();
        if let Some(key) = &api_key {
            redactor = redactor.with_literal(key.clone());
        }
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            redactor,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    pub fn request_body(request: &InvocationRequest) -> Value {
        json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_content },
            ],
            "response_format": { "type": "json_object" },
        })
    }
}

/// `choices[0].message.content`, if present and a string.
pub fn extract_content(resp: &Value) -> Option<&str> {
    resp["choices"][0]["message"]["content"].as_str()
}

#[async_trait]
impl Backend for CurlBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn invoke(&self, request: &InvocationRequest) -> BackendOutput {
        let Some(key) = &self.api_key else {
            warn!(backend = NAME, "OPENAI_API_KEY not set");
            return BackendOutput::failure(exit_code::MISSING_AUTH, "OPENAI_API_KEY not set");
        };

        let url = self.endpoint();
        debug!(backend = NAME, %url, model = %request.model, "Posting chat completion");
        let resp = match self
            .client
            .post(&url)
            .bearer_auth(key)
            .timeout(Duration::from_secs(request.timeout_seconds.max(1)))
            .json(&Self::request_body(request))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let msg = self.redactor.redact_text(&e.to_string());
                warn!(backend = NAME, error = %msg, "Request failed");
                return BackendOutput::failure(exit_code::BACKEND_FAILURE, msg);
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            let msg = self.redactor.redact_text(&format!("HTTP {status}: {body}"));
            warn!(backend = NAME, status = status.as_u16(), "API returned error");
            return BackendOutput::failure(exit_code::BACKEND_FAILURE, msg);
        }

        let resp_json: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                return BackendOutput::failure(exit_code::UNPARSEABLE_OUTPUT, format!("response is not JSON: {e}"));
            }
        };
        match extract_content(&resp_json) {
            Some(content) => BackendOutput::success(content),
            None => BackendOutput::failure(
                exit_code::UNPARSEABLE_OUTPUT,
                "response has no choices[0].message.content",
            ),
        }
    }

    /// Plain HTTP: no sandbox, workspace or CLI flags to speak of.
    fn has_capability(&self, capability: Capability) -> bool {
        capability == Capability::MultiPass
    }
}

//! HTTP analysis client for managed and external request modes.
//!
//! Both modes speak the OpenAI-compatible chat completions shape; managed
//! mode uses a fixed endpoint and a server-supplied credential, external
//! mode uses whatever endpoint/key/model the user configured. The PDF is
//! attached as a base64 data URI file part.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::normalize::{parse_comparison, parse_summary};
use crate::{
    AnalysisBackend, AnalysisError, AnalysisSettings, AnalysisSummary, ComparisonResult,
    PaperContent,
};

const SUMMARY_PROMPT: &str = "Read the attached research paper and answer with a single JSON \
object containing these fields: title, authors, publication, problem, method, contributions, \
results, limitations, keywords. Answer with JSON only, no surrounding prose.";

const COMPARISON_PROMPT: &str = "Compare the following paper summaries. Answer with a single \
JSON object: {\"summary\": <prose comparison>, \"papers\": [{\"title\", \"strengths\", \
\"weaknesses\"} for each paper, in input order]}. JSON only.";

/// Default upper bound for managed-mode calls. The managed provider has
/// its own server-side limits; this caps how long a stuck call can hold
/// an analysis slot.
pub const DEFAULT_MANAGED_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for managed mode: the first-party endpoint and the
/// server-supplied credential.
#[derive(Debug, Clone)]
pub struct ManagedConfig {
    pub endpoint: String,
    pub model: String,
    /// Credential handed out by the backend. `None` fails analysis fast
    /// with [`AnalysisError::CredentialMissing`], before any network call.
    pub credential: Option<String>,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            credential: None,
            temperature: 0.2,
            timeout: DEFAULT_MANAGED_TIMEOUT,
        }
    }
}

/// Analysis client holding one shared reqwest client for the session.
pub struct LlmClient {
    client: reqwest::Client,
    managed: ManagedConfig,
    /// Base URL prepended to server-relative content references before
    /// fetching (e.g. `http://localhost:4577/`).
    file_base: Option<String>,
}

impl LlmClient {
    pub fn new(client: reqwest::Client, managed: ManagedConfig, file_base: Option<String>) -> Self {
        Self {
            client,
            managed,
            file_base,
        }
    }

    /// Resolve the request target, bearer credential, model, temperature
    /// and timeout for the selected mode.
    fn request_params<'a>(
        &'a self,
        settings: &'a AnalysisSettings,
    ) -> Result<(&'a str, &'a str, &'a str, f32, Duration), AnalysisError> {
        match settings {
            AnalysisSettings::Managed => {
                let credential = self
                    .managed
                    .credential
                    .as_deref()
                    .ok_or(AnalysisError::CredentialMissing)?;
                Ok((
                    self.managed.endpoint.as_str(),
                    credential,
                    self.managed.model.as_str(),
                    self.managed.temperature,
                    self.managed.timeout,
                ))
            }
            AnalysisSettings::External(ext) => {
                if ext.api_key.trim().is_empty() {
                    return Err(AnalysisError::CredentialMissing);
                }
                Ok((
                    ext.endpoint.as_str(),
                    ext.api_key.as_str(),
                    ext.model.as_str(),
                    ext.temperature,
                    ext.timeout,
                ))
            }
        }
    }

    /// Fetch the bytes behind a server-relative or absolute reference.
    async fn fetch_reference(&self, reference: &str) -> Result<Vec<u8>, AnalysisError> {
        let url = if reference.starts_with("http://") || reference.starts_with("https://") {
            reference.to_string()
        } else {
            let base = self
                .file_base
                .as_deref()
                .ok_or_else(|| AnalysisError::FetchFailed("no file base configured".into()))?;
            format!("{}/{}", base.trim_end_matches('/'), reference.trim_start_matches('/'))
        };

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AnalysisError::FetchFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AnalysisError::FetchFailed(format!("HTTP {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AnalysisError::FetchFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// POST a chat completion and return the assistant message text.
    async fn send_chat(
        &self,
        endpoint: &str,
        credential: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<String, AnalysisError> {
        let request = self
            .client
            .post(endpoint)
            .bearer_auth(credential)
            .json(&body)
            .send();

        // Cooperative cancellation: dropping the future aborts the call.
        let resp = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| AnalysisError::Timeout)?
            .map_err(classify_transport_error)?;

        let status = resp.status();
        let text = tokio::time::timeout(timeout, resp.text())
            .await
            .map_err(|_| AnalysisError::Timeout)?
            .map_err(classify_transport_error)?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }

        extract_message_text(&text)
    }
}

/// Map a failed HTTP status to the analysis error taxonomy.
pub fn classify_status(status: u16, body: &str) -> AnalysisError {
    match status {
        401 | 403 => AnalysisError::CredentialMissing,
        429 => AnalysisError::RateLimited,
        500..=599 => AnalysisError::UpstreamUnavailable(status),
        _ => {
            let lowered = body.to_lowercase();
            if lowered.contains("content_filter")
                || lowered.contains("content policy")
                || lowered.contains("safety")
            {
                AnalysisError::ContentRejected
            } else {
                AnalysisError::Unclassified(format!("HTTP {status}"))
            }
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> AnalysisError {
    if err.is_timeout() {
        AnalysisError::Timeout
    } else {
        AnalysisError::NetworkUnreachable(err.to_string())
    }
}

/// Pull the assistant message out of a chat completion response body.
fn extract_message_text(body: &str) -> Result<String, AnalysisError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AnalysisError::MalformedResponse(format!("invalid response body: {e}")))?;

    let choice = &value["choices"][0];
    if choice["finish_reason"].as_str() == Some("content_filter") {
        return Err(AnalysisError::ContentRejected);
    }

    choice["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AnalysisError::MalformedResponse("response has no message content".into()))
}

#[async_trait::async_trait]
impl AnalysisBackend for LlmClient {
    async fn analyze(
        &self,
        content: &PaperContent,
        settings: &AnalysisSettings,
    ) -> Result<AnalysisSummary, AnalysisError> {
        let (endpoint, credential, model, temperature, timeout) = self.request_params(settings)?;

        let bytes = match content {
            PaperContent::Bytes(b) => b.clone(),
            PaperContent::Reference(r) => self.fetch_reference(r).await?,
        };
        let encoded = BASE64.encode(&bytes);

        let body = json!({
            "model": model,
            "temperature": temperature,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": SUMMARY_PROMPT },
                    {
                        "type": "file",
                        "file": {
                            "filename": "paper.pdf",
                            "file_data": format!("data:application/pdf;base64,{encoded}"),
                        }
                    }
                ]
            }]
        });

        tracing::debug!(endpoint, model, size = bytes.len(), "sending analysis request");
        let text = self.send_chat(endpoint, credential, body, timeout).await?;
        parse_summary(&text)
    }

    async fn compare(
        &self,
        summaries: &[AnalysisSummary],
        settings: &AnalysisSettings,
    ) -> Result<ComparisonResult, AnalysisError> {
        let (endpoint, credential, model, temperature, timeout) = self.request_params(settings)?;

        let payload = serde_json::to_string(summaries)
            .map_err(|e| AnalysisError::Unclassified(e.to_string()))?;
        let body = json!({
            "model": model,
            "temperature": temperature,
            "messages": [{
                "role": "user",
                "content": format!("{COMPARISON_PROMPT}\n\n{payload}"),
            }]
        });

        tracing::debug!(endpoint, model, papers = summaries.len(), "sending comparison request");
        let text = self.send_chat(endpoint, credential, body, timeout).await?;
        parse_comparison(&text, summaries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── classify_status ────────────────────────────────────────────────

    #[test]
    fn auth_statuses_are_credential_missing() {
        assert_eq!(classify_status(401, ""), AnalysisError::CredentialMissing);
        assert_eq!(classify_status(403, ""), AnalysisError::CredentialMissing);
    }

    #[test]
    fn status_429_is_rate_limited() {
        assert_eq!(classify_status(429, ""), AnalysisError::RateLimited);
    }

    #[test]
    fn server_errors_are_upstream_unavailable() {
        assert_eq!(classify_status(500, ""), AnalysisError::UpstreamUnavailable(500));
        assert_eq!(classify_status(503, ""), AnalysisError::UpstreamUnavailable(503));
    }

    #[test]
    fn content_filter_body_is_rejected() {
        let err = classify_status(400, r#"{"error": {"code": "content_filter"}}"#);
        assert_eq!(err, AnalysisError::ContentRejected);
    }

    #[test]
    fn other_client_errors_unclassified() {
        assert!(matches!(classify_status(418, "teapot"), AnalysisError::Unclassified(_)));
    }

    // ── extract_message_text ───────────────────────────────────────────

    #[test]
    fn extracts_assistant_message() {
        let body = r#"{"choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}]}"#;
        assert_eq!(extract_message_text(body).unwrap(), "hello");
    }

    #[test]
    fn content_filter_finish_is_rejected() {
        let body = r#"{"choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]}"#;
        assert_eq!(extract_message_text(body).unwrap_err(), AnalysisError::ContentRejected);
    }

    #[test]
    fn missing_content_is_malformed() {
        let body = r#"{"choices": []}"#;
        assert!(matches!(
            extract_message_text(body).unwrap_err(),
            AnalysisError::MalformedResponse(_)
        ));
    }

    // ── request_params ─────────────────────────────────────────────────

    #[test]
    fn managed_without_credential_fails_fast() {
        let client = LlmClient::new(
            reqwest::Client::new(),
            ManagedConfig::default(),
            None,
        );
        let err = client.request_params(&AnalysisSettings::Managed).unwrap_err();
        assert_eq!(err, AnalysisError::CredentialMissing);
    }

    #[test]
    fn external_with_blank_key_fails_fast() {
        let client = LlmClient::new(reqwest::Client::new(), ManagedConfig::default(), None);
        let settings = AnalysisSettings::External(crate::ExternalSettings {
            endpoint: "http://localhost:1234/v1/chat/completions".into(),
            api_key: "  ".into(),
            model: "local".into(),
            temperature: 0.5,
            timeout: Duration::from_secs(30),
        });
        assert_eq!(
            client.request_params(&settings).unwrap_err(),
            AnalysisError::CredentialMissing
        );
    }

    #[test]
    fn external_settings_are_used_verbatim() {
        let client = LlmClient::new(reqwest::Client::new(), ManagedConfig::default(), None);
        let settings = AnalysisSettings::External(crate::ExternalSettings {
            endpoint: "http://localhost:1234/v1/chat/completions".into(),
            api_key: "sk-test".into(),
            model: "local-model".into(),
            temperature: 0.7,
            timeout: Duration::from_secs(45),
        });
        let (endpoint, credential, model, temperature, timeout) =
            client.request_params(&settings).unwrap();
        assert_eq!(endpoint, "http://localhost:1234/v1/chat/completions");
        assert_eq!(credential, "sk-test");
        assert_eq!(model, "local-model");
        assert_eq!(temperature, 0.7);
        assert_eq!(timeout, Duration::from_secs(45));
    }
}

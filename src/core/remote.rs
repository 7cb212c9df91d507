//! Reference engine backed by an OpenAI-compatible `/chat/completions` API.
//!
//! It streams the assistant reply as text fragments and keeps the
//! conversation history. It never edits files and never reflects; referenced
//! files are read through the capture shim and sent as context.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};

use crate::config::RetryPolicy;
use crate::core::capture::CaptureIo;
use crate::core::engine::{
    ChatMessage, EditFormat, Engine, EngineError, EngineFactory, EngineSpec, Fragment,
    FragmentStream,
};
use crate::core::events::UsageReport;
use crate::logging;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ChatCompletionsFactory {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl ChatCompletionsFactory {
    pub fn new(retry: RetryPolicy) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { http, retry })
    }
}

impl EngineFactory for ChatCompletionsFactory {
    fn create(&self, spec: EngineSpec, io: Arc<CaptureIo>) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(ChatCompletionsEngine {
            spec,
            io,
            http: self.http.clone(),
            retry: self.retry.clone(),
            history: Vec::new(),
            usage: None,
            reflected: None,
        }))
    }
}

pub struct ChatCompletionsEngine {
    spec: EngineSpec,
    io: Arc<CaptureIo>,
    http: reqwest::Client,
    retry: RetryPolicy,
    history: Vec<ChatMessage>,
    usage: Option<UsageReport>,
    reflected: Option<String>,
}

impl ChatCompletionsEngine {
    fn endpoint(&self) -> Result<(String, String), EngineError> {
        let provider = self.spec.credentials.provider().ok_or_else(|| {
            EngineError::runtime("No provider configured; POST /api/chat/setting first")
        })?;
        let base_url = self.spec.credentials.base_url().ok_or_else(|| {
            EngineError::runtime(format!("Provider '{}' has no base URL", provider.name))
        })?;
        let url = format!("{}{}", base_url.trim_end_matches('/'), provider.chat_path);
        let model = provider.api_model_name(&self.spec.model).to_string();
        Ok((url, model))
    }

    fn system_prompt(&self) -> Result<String, EngineError> {
        let mut prompt = match self.spec.edit_format {
            EditFormat::Ask => "Answer questions about the code below. Do not propose edits.".to_string(),
            other => format!(
                "You are a code editing assistant. Describe changes using {} blocks.",
                other.as_str()
            ),
        };
        let files = self
            .spec
            .writable_files
            .iter()
            .map(|path| (path, false))
            .chain(self.spec.read_only_files.iter().map(|path| (path, true)));
        for (path, readonly) in files {
            let content = self.io.read_text(path)?;
            let label = if readonly { " (read-only)" } else { "" };
            prompt.push_str(&format!("\n\n{}{label}\n```\n{content}\n```", path.display()));
        }
        Ok(prompt)
    }

    fn request_body(&self, model: &str, message: &str) -> Result<Value, EngineError> {
        let mut messages = vec![json!({ "role": "system", "content": self.system_prompt()? })];
        messages.extend(
            self.history
                .iter()
                .map(|m| json!({ "role": m.role, "content": m.content })),
        );
        messages.push(json!({ "role": "user", "content": message }));
        Ok(json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        }))
    }
}

impl Engine for ChatCompletionsEngine {
    fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn run_stream<'a>(&'a mut self, message: &'a str) -> FragmentStream<'a> {
        let this = self;
        Box::pin(async_stream::try_stream! {
            this.usage = None;
            let (url, model) = this.endpoint()?;
            let body = this.request_body(&model, message)?;
            let api_key = this.spec.credentials.api_key();

            let response = send_with_retry(&this.retry, || {
                let request = this.http.post(&url).json(&body);
                match api_key.as_deref() {
                    Some(key) => request.bearer_auth(key),
                    None => request,
                }
            })
            .await
            .map_err(|err| EngineError::runtime(format!("Request to {url} failed: {err}")))?;
            let response = ensure_success(response).await?;

            let mut byte_stream = std::pin::pin!(response.bytes_stream());
            let mut decoder = SseDataDecoder::default();
            let mut reply = String::new();
            let mut finished = false;

            while !finished {
                let payloads = match byte_stream.next().await {
                    Some(chunk) => {
                        let chunk = chunk
                            .map_err(|err| EngineError::runtime(format!("Stream read error: {err}")))?;
                        decoder.push(&chunk)
                    }
                    None => {
                        finished = true;
                        decoder.finish()
                    }
                };

                for data in payloads {
                    let Ok(parsed) = serde_json::from_str::<Value>(&data) else {
                        this.io.tool_warning(&format!("Skipping malformed stream chunk: {data}"));
                        continue;
                    };
                    if let Some(usage) = parse_usage(&parsed) {
                        this.usage = Some(usage);
                    }
                    if let Some(text) = delta_text(&parsed) {
                        reply.push_str(&text);
                        yield Fragment::text(text);
                    }
                }
            }

            this.history.push(ChatMessage::new("user", message));
            this.history.push(ChatMessage::new("assistant", reply));
        })
    }

    fn usage_report(&self) -> Option<UsageReport> {
        self.usage.clone()
    }

    fn reflected_message(&self) -> Option<&str> {
        self.reflected.as_deref()
    }

    fn clear_reflected_message(&mut self) {
        self.reflected = None;
    }

    fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    fn replace_history(&mut self, history: Vec<ChatMessage>) {
        self.history = history;
    }

    fn rebuild(&self, spec: EngineSpec) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(ChatCompletionsEngine {
            spec,
            io: Arc::clone(&self.io),
            http: self.http.clone(),
            retry: self.retry.clone(),
            history: self.history.clone(),
            usage: None,
            reflected: None,
        }))
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response.text().await.unwrap_or_default();
    Err(EngineError::runtime(format!(
        "Model request failed: HTTP {status}: {error_text}"
    )))
}

/// Splits an SSE byte stream into `data:` payloads.
#[derive(Debug, Default)]
struct SseDataDecoder {
    bytes: Vec<u8>,
    data: String,
}

impl SseDataDecoder {
    /// Payloads completed by `chunk`.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(newline) = self.bytes.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=newline).collect();
            self.line(&String::from_utf8_lossy(&line), &mut payloads);
        }
        payloads
    }

    /// Flush a trailing line or event the upstream never terminated.
    fn finish(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        let rest = std::mem::take(&mut self.bytes);
        if !rest.is_empty() {
            self.line(&String::from_utf8_lossy(&rest), &mut payloads);
        }
        self.line("", &mut payloads);
        payloads
    }

    fn line(&mut self, line: &str, payloads: &mut Vec<String>) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            let data = std::mem::take(&mut self.data);
            if !data.is_empty() && data.trim() != "[DONE]" {
                payloads.push(data);
            }
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data.push_str(data.trim_start());
        }
    }
}

fn delta_text(chunk: &Value) -> Option<String> {
    let text = chunk
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()?;
    (!text.is_empty()).then(|| text.to_string())
}

fn parse_usage(chunk: &Value) -> Option<UsageReport> {
    let usage = chunk.get("usage").filter(|u| u.is_object())?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let mut report = UsageReport::new(prompt, completion);
    if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
        report.total_tokens = total;
    }
    Some(report)
}

// === Retry Helpers ===

async fn send_with_retry<F>(policy: &RetryPolicy, mut build: F) -> reqwest::Result<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;

    loop {
        match build().send().await {
            Ok(response) => {
                let status = response.status();
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if status.is_success()
                    || !retryable
                    || !policy.enabled
                    || attempt >= policy.max_retries
                {
                    return Ok(response);
                }
                logging::warn(format!(
                    "Retryable HTTP {} (attempt {} of {})",
                    status.as_u16(),
                    attempt + 1,
                    policy.max_retries + 1
                ));
            }
            Err(err) => {
                if !policy.enabled || attempt >= policy.max_retries {
                    return Err(err);
                }
                logging::warn(format!(
                    "Request error: {} (attempt {} of {})",
                    err,
                    attempt + 1,
                    policy.max_retries + 1
                ));
            }
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        logging::info(format!("Retrying after {:.2}s", delay.as_secs_f64()));
        tokio::time::sleep(delay).await;
    }
}

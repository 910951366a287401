//! External HTTP API calls
//!
//! Transport failures and throttling/server statuses map to `Retry`;
//! other client errors are terminal. The response lands in the context
//! under `"{task_id}_response"`.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value};

use civiflow_core::operator::{Operator, TaskContext, TaskResult};

/// Calls an external HTTP API
pub struct HttpOperator {
    task_id: String,
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Value>,
    body_context_key: Option<String>,
    max_attempts: u32,
    client: Client,
}

impl HttpOperator {
    /// Create an HTTP operator
    pub fn new(task_id: impl Into<String>, method: Method, url: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            method,
            url: url.into(),
            headers: vec![],
            body: None,
            body_context_key: None,
            max_attempts: 3,
            client: Client::new(),
        }
    }

    /// GET shorthand
    pub fn get(task_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(task_id, Method::GET, url)
    }

    /// POST shorthand
    pub fn post(task_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(task_id, Method::POST, url)
    }

    /// Add a request header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Static JSON request body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Take the request body from a context dot-path instead (overrides
    /// the static body when the key is present)
    pub fn body_from_context(mut self, key: impl Into<String>) -> Self {
        self.body_context_key = Some(key.into());
        self
    }

    /// Set the retry attempt cap
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Bound each request's duration (connect + response)
    pub fn with_request_timeout(mut self, timeout: std::time::Duration) -> Self {
        if let Ok(client) = Client::builder().timeout(timeout).build() {
            self.client = client;
        }
        self
    }

    /// Whether a response status is worth retrying
    fn is_transient(status: StatusCode) -> bool {
        status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
    }
}

#[async_trait]
impl Operator for HttpOperator {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn operator_type(&self) -> &'static str {
        "http"
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskResult {
        let body = self
            .body_context_key
            .as_ref()
            .and_then(|key| ctx.get_path(key).cloned())
            .or_else(|| self.body.clone());

        let mut request = self.client.request(self.method.clone(), &self.url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                ctx.log_warning("http request failed", None);
                return TaskResult::retry(format!("http request failed: {error}"));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(error) => {
                return TaskResult::retry(format!("failed to read response body: {error}"));
            }
        };

        if status.is_success() {
            let value: Value =
                serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text));
            let mut data = Map::new();
            data.insert(format!("{}_response", self.task_id), value);
            data.insert(
                format!("{}_status", self.task_id),
                Value::Number(status.as_u16().into()),
            );
            return TaskResult::done(data);
        }

        if Self::is_transient(status) {
            TaskResult::retry(format!("HTTP {status}"))
        } else {
            TaskResult::failed(format!("HTTP {status}: {}", truncate(&text, 500)))
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

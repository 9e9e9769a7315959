//! HTTP transport -- executes a resolved request with pre/after script hooks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::HeaderEntry;
use crate::sandbox::{Sandbox, ScriptContext};

/// Transport failure. Carries whatever response fragments the failure
/// surfaced, so the execution record can still show them.
#[derive(Debug, Default, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub header: Option<HashMap<String, String>>,
    pub body: Option<Value>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            header: None,
            body: None,
        }
    }
}

/// A fully resolved request, ready to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOptions {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<HeaderEntry>,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default)]
    pub body: Value,
}

/// The request as actually sent.
#[derive(Debug, Clone, Default)]
pub struct RealizedRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// The response as received.
#[derive(Debug, Clone)]
pub struct RealizedResponse {
    pub status: u16,
    pub status_text: String,
    pub header: HashMap<String, String>,
    pub body: Value,
}

/// One completed request/response pair.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub req: RealizedRequest,
    pub res: RealizedResponse,
}

/// Identifies the run and case a request belongs to; used for correlation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub uid: i64,
    pub case_id: i64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute the request, running `pre_script` before the call and
    /// `after_script` on the response. Empty scripts are skipped.
    async fn execute(
        &self,
        options: RequestOptions,
        pre_script: &str,
        after_script: &str,
        ctx: &ExecutionContext,
    ) -> Result<Exchange, TransportError>;
}

/// Production transport backed by a shared reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
    sandbox: Sandbox,
}

impl HttpTransport {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .redirect(reqwest::redirect::Policy::limited(10))
                .build()
                .expect("failed to build HTTP client"),
            sandbox,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        mut options: RequestOptions,
        pre_script: &str,
        after_script: &str,
        ctx: &ExecutionContext,
    ) -> Result<Exchange, TransportError> {
        // A pre-script may rewrite the options (headers, query, body, url)
        // before the call goes out.
        if !pre_script.is_empty() {
            let script_ctx = ScriptContext {
                options: Some(
                    serde_json::to_value(&options)
                        .map_err(|e| TransportError::new(format!("pre script error: {}", e)))?,
                ),
                ..Default::default()
            };
            let outcome = self
                .sandbox
                .run(pre_script, script_ctx)
                .await
                .map_err(|e| TransportError::new(format!("pre script error: {}", e)))?;
            if let Some(updated) = outcome.options {
                match serde_json::from_value::<RequestOptions>(updated) {
                    Ok(parsed) => options = parsed,
                    Err(e) => {
                        warn!(case = ctx.case_id, error = %e, "pre script produced unusable options, keeping originals")
                    }
                }
            }
        }

        let method = Method::from_bytes(options.method.as_bytes()).map_err(|e| {
            TransportError::new(format!("invalid HTTP method '{}': {}", options.method, e))
        })?;

        debug!(
            run = %ctx.run_id,
            case = ctx.case_id,
            uid = ctx.uid,
            method = %method,
            url = %options.url,
            "executing request"
        );

        let mut request = self
            .client
            .request(method.clone(), &options.url)
            .headers(build_header_map(&options.headers));
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }

        let mut sent_body = Value::Null;
        if !matches!(method, Method::GET | Method::HEAD) && !options.body.is_null() {
            match &options.body {
                Value::String(raw) => request = request.body(raw.clone()),
                other => request = request.json(other),
            }
            sent_body = options.body.clone();
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::new(e.to_string()))?;

        let status = response.status();
        let url = response.url().to_string();
        let mut header = HashMap::new();
        for (name, value) in response.headers() {
            header.insert(
                name.to_string(),
                value.to_str().unwrap_or_default().to_string(),
            );
        }

        let text = response.text().await.map_err(|e| TransportError {
            message: e.to_string(),
            header: Some(header.clone()),
            body: None,
        })?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        let res = RealizedResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            header,
            body,
        };

        if !after_script.is_empty() {
            let script_ctx = ScriptContext {
                response: Some(json!({
                    "status": res.status,
                    "statusText": res.status_text,
                    "header": res.header,
                    "body": res.body,
                })),
                ..Default::default()
            };
            self.sandbox
                .run(after_script, script_ctx)
                .await
                .map_err(|e| TransportError {
                    message: format!("after script error: {}", e),
                    header: Some(res.header.clone()),
                    body: Some(res.body.clone()),
                })?;
        }

        let req = RealizedRequest {
            url,
            method: method.to_string(),
            headers: realized_headers(&options.headers),
            body: sent_body,
        };

        Ok(Exchange { req, res })
    }
}

fn build_header_map(entries: &[HeaderEntry]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for entry in entries {
        if !entry.abled || entry.name.is_empty() {
            continue;
        }
        match (
            HeaderName::from_bytes(entry.name.as_bytes()),
            HeaderValue::from_str(&entry.value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %entry.name, "skipping invalid header"),
        }
    }
    headers
}

/// Enabled headers as a plain map for the execution record.
pub fn realized_headers(entries: &[HeaderEntry]) -> HashMap<String, String> {
    entries
        .iter()
        .filter(|h| h.abled && !h.name.is_empty())
        .map(|h| (h.name.clone(), h.value.clone()))
        .collect()
}

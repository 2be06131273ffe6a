//! I/O-backed step executors.
//!
//! The pure executors (`data_transform`, `data_validate`, log-sink
//! `notification`) live in `tradeflow-core`. This module adds the ones that
//! talk to the outside world and assembles the registry the CLI runs with:
//!
//! - `http` -- `api_call` and `data_fetch` over reqwest
//! - `ai` -- `ai_process` against an OpenAI-compatible endpoint
//! - `sql` -- read-only `database_query` on the SQLite pool
//! - `webhook` -- signed `notification` delivery

pub mod ai;
pub mod http;
pub mod sql;
pub mod webhook;

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tradeflow_core::workflow::executor::{ExecutorRegistry, StepError};
use tradeflow_types::config::EngineConfig;
use tradeflow_types::workflow::StepKind;

use crate::sqlite::pool::DatabasePool;

/// Environment variable holding the bearer token for `ai_process` requests.
pub const AI_API_KEY_ENV: &str = "TRADEFLOW_AI_API_KEY";

/// Build the registry used by the CLI: core built-ins plus every I/O
/// executor the configuration allows.
///
/// - `notification` is replaced by the webhook sender when
///   `notification_webhook_url` is set.
/// - `database_query` is only registered when a pool is supplied.
pub fn default_registry(
    config: &EngineConfig,
    pool: Option<&DatabasePool>,
) -> Result<ExecutorRegistry, reqwest::Error> {
    let mut registry = ExecutorRegistry::with_builtins()
        .allow_unregistered_custom(config.allow_unregistered_custom_steps);

    let client = http_client(Duration::from_secs(config.http_timeout_secs))?;

    registry.register(StepKind::ApiCall, http::ApiCallExecutor::new(client.clone()));
    registry.register(StepKind::DataFetch, http::DataFetchExecutor::new(client.clone()));
    registry.register(
        StepKind::AiProcess,
        ai::AiProcessExecutor::new(
            client.clone(),
            config.ai_endpoint.clone(),
            config.ai_model.clone(),
            std::env::var(AI_API_KEY_ENV).ok(),
        ),
    );

    if let Some(url) = &config.notification_webhook_url {
        registry.register(
            StepKind::Notification,
            webhook::WebhookNotificationExecutor::new(
                client,
                url.clone(),
                config.notification_signing_secret.clone(),
            ),
        );
    }

    if let Some(pool) = pool {
        registry.register(
            StepKind::DatabaseQuery,
            sql::DatabaseQueryExecutor::new(pool.reader.clone()),
        );
    }

    tracing::debug!(kinds = ?registry.kinds(), "executor registry ready");
    Ok(registry)
}

/// Shared HTTP client with a per-request timeout.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("tradeflow/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Race `fut` against the step's cancellation token.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, StepError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StepError::Cancelled),
        result = fut => result,
    }
}

pub(crate) fn request_failed(err: reqwest::Error) -> StepError {
    if err.is_timeout() {
        StepError::ExecutionFailed(format!("request timed out: {err}"))
    } else {
        StepError::ExecutionFailed(format!("HTTP request failed: {err}"))
    }
}

/// Read a response body as JSON, falling back to a plain string.
pub(crate) async fn read_body(response: reqwest::Response) -> Result<Value, StepError> {
    let text = response.text().await.map_err(request_failed)?;
    Ok(serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)))
}

/// Render a JSON value into a header or query string value.
pub(crate) fn value_to_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Minimal one-shot HTTP server and request builders for executor tests.

    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tradeflow_core::workflow::context::ExecutionContext;
    use tradeflow_core::workflow::executor::StepRequest;
    use tradeflow_types::workflow::{StepKind, WorkflowStep};
    use uuid::Uuid;

    /// What the server saw.
    #[derive(Debug)]
    pub struct Captured {
        pub request_line: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl Captured {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k == &name.to_ascii_lowercase())
                .map(|(_, v)| v.as_str())
        }

        pub fn json(&self) -> Value {
            serde_json::from_slice(&self.body).unwrap()
        }
    }

    /// Accept one connection, capture the request, answer with `body`.
    pub async fn serve_once(status: u16, body: &str) -> (String, JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reason = if status < 400 { "OK" } else { "Error" };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_end = loop {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let mut lines = head.split("\r\n");
            let request_line = lines.next().unwrap_or_default().to_string();
            let headers: Vec<(String, String)> = lines
                .filter_map(|l| l.split_once(':'))
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
                .collect();
            let len = headers
                .iter()
                .find(|(k, _)| k == "content-length")
                .and_then(|(_, v)| v.parse::<usize>().ok())
                .unwrap_or(0);

            while buf.len() < header_end + len {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;

            Captured {
                request_line,
                headers,
                body: buf[header_end..].to_vec(),
            }
        });

        (format!("http://{addr}"), handle)
    }

    pub fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    /// A request whose execution context has `input` as `input_data`.
    pub fn request(kind: StepKind, params: Value, input: Value) -> StepRequest {
        let workflow_id = Uuid::now_v7();
        let execution_id = Uuid::now_v7();
        let mut step = WorkflowStep::new(workflow_id, "step", kind, 1);
        step.config.params = params.as_object().cloned().unwrap_or_default();
        StepRequest {
            execution_id,
            step,
            input: input.clone(),
            context: ExecutionContext::new(workflow_id, execution_id, input),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }
}

//! `api_call` and `data_fetch` executors.
//!
//! Both render `{{ path }}` placeholders in their URL, headers, query and
//! body against the execution context before sending.

use std::time::Instant;

use reqwest::Method;
use serde_json::{Value, json};
use tradeflow_core::workflow::context::lookup_path;
use tradeflow_core::workflow::executor::{StepError, StepExecutor, StepOutcome, StepRequest};

use super::{cancellable, read_body, request_failed, value_to_text};

fn parse_method(method: &str) -> Result<Method, StepError> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "HEAD" => Ok(Method::HEAD),
        other => Err(StepError::InvalidInput(format!("unsupported HTTP method: {other}"))),
    }
}

fn required_url(request: &StepRequest) -> Result<String, StepError> {
    let template = request.step.config.param_str("url").ok_or_else(|| {
        StepError::InvalidInput(format!("{} step requires a 'url' parameter", request.step.step_type))
    })?;
    Ok(request.context.render(template))
}

/// Apply the rendered `headers` and `query` parameters to `builder`.
fn apply_headers_and_query(
    mut builder: reqwest::RequestBuilder,
    request: &StepRequest,
) -> reqwest::RequestBuilder {
    let config = &request.step.config;
    if let Some(Value::Object(headers)) = config.param("headers") {
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value_to_text(request.context.render_value(value)));
        }
    }
    if let Some(Value::Object(query)) = config.param("query") {
        let pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.clone(), value_to_text(request.context.render_value(v))))
            .collect();
        builder = builder.query(&pairs);
    }
    builder
}

fn has_payload(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// api_call
// ---------------------------------------------------------------------------

/// Generic HTTP request.
///
/// Config parameters:
/// - `url` (required), `method` (default `GET`)
/// - `headers`, `query`: objects of templated values
/// - `body`: templated JSON body; without it, non-GET requests send the
///   step input when it is non-empty
/// - `allow_error_status`: return 4xx/5xx responses instead of failing
/// - `context_key`: also export the response body under this context key
pub struct ApiCallExecutor {
    client: reqwest::Client,
}

impl ApiCallExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl StepExecutor for ApiCallExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
        let config = &request.step.config;
        let url = required_url(request)?;
        let method = parse_method(config.param_str("method").unwrap_or("GET"))?;

        let mut builder = apply_headers_and_query(self.client.request(method.clone(), &url), request);
        let body = match config.param("body") {
            Some(body) => Some(request.context.render_value(body)),
            None if method != Method::GET && method != Method::HEAD && has_payload(&request.input) => {
                Some(request.input.clone())
            }
            None => None,
        };
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        tracing::debug!(step = %request.step.name, %method, %url, "sending API call");
        let started = Instant::now();
        let response = cancellable(&request.cancel, async {
            builder.send().await.map_err(request_failed)
        })
        .await?;
        let status = response.status();
        let response_body = cancellable(&request.cancel, read_body(response)).await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        if !status.is_success() && !config.param_bool("allow_error_status").unwrap_or(false) {
            return Err(StepError::ExecutionFailed(format!(
                "{method} {url} returned HTTP {}",
                status.as_u16()
            )));
        }

        tracing::info!(step = %request.step.name, %method, %url, status = status.as_u16(), "API call completed");

        let mut outcome = StepOutcome::new(json!({
            "status": status.as_u16(),
            "success": status.is_success(),
            "body": response_body.clone(),
        }))
        .with_metric("http_status", f64::from(status.as_u16()))
        .with_metric("elapsed_ms", elapsed_ms);
        if let Some(key) = config.param_str("context_key") {
            outcome = outcome.with_update(key, response_body);
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// data_fetch
// ---------------------------------------------------------------------------

/// Fetch a JSON document with GET.
///
/// Config parameters:
/// - `url` (required), `headers`, `query` as for `api_call`
/// - `data_path`: dot-path into the response selecting the records
/// - `context_key`: also export the records under this context key
///
/// Output is `{ "data": ..., "record_count": n }`; a non-JSON response or a
/// missing `data_path` fails the step.
pub struct DataFetchExecutor {
    client: reqwest::Client,
}

impl DataFetchExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl StepExecutor for DataFetchExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
        let config = &request.step.config;
        let url = required_url(request)?;
        let builder = apply_headers_and_query(self.client.get(&url), request);

        let started = Instant::now();
        let response = cancellable(&request.cancel, async {
            builder.send().await.map_err(request_failed)
        })
        .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StepError::ExecutionFailed(format!(
                "GET {url} returned HTTP {}",
                status.as_u16()
            )));
        }
        let document: Value = cancellable(&request.cancel, async {
            response
                .json()
                .await
                .map_err(|e| StepError::ExecutionFailed(format!("response from {url} is not JSON: {e}")))
        })
        .await?;

        let data = match config.param_str("data_path") {
            Some(path) => lookup_path(&document, path).cloned().ok_or_else(|| {
                StepError::ExecutionFailed(format!("response has no value at '{path}'"))
            })?,
            None => document,
        };
        let record_count = match &data {
            Value::Array(items) => items.len(),
            Value::Null => 0,
            _ => 1,
        };

        tracing::info!(step = %request.step.name, %url, record_count, "data fetched");

        let mut outcome = StepOutcome::new(json!({
            "data": data.clone(),
            "record_count": record_count,
        }))
        .with_metric("records_fetched", record_count as f64)
        .with_metric("elapsed_ms", started.elapsed().as_secs_f64() * 1000.0);
        if let Some(key) = config.param_str("context_key") {
            outcome = outcome.with_update(key, data);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{client, request, serve_once};
    use super::*;
    use tradeflow_types::workflow::StepKind;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("post").unwrap(), Method::POST);
        assert!(matches!(parse_method("TRACE"), Err(StepError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn api_call_renders_templates_and_posts_body() {
        let (base, server) = serve_once(201, r#"{"id": "ord-7"}"#).await;
        let req = request(
            StepKind::ApiCall,
            json!({
                "method": "POST",
                "url": format!("{base}/orders/{{{{ input_data.order_id }}}}"),
                "headers": {"X-Shop": "{{ input_data.shop }}"},
                "body": {"qty": "{{ input_data.qty }}", "note": "rush"},
                "context_key": "created_order",
            }),
            json!({"order_id": "A-1", "shop": "acme", "qty": 3}),
        );

        let outcome = ApiCallExecutor::new(client()).execute(&req).await.unwrap();
        assert_eq!(outcome.output["status"], json!(201));
        assert_eq!(outcome.output["body"]["id"], json!("ord-7"));
        assert_eq!(outcome.metrics["http_status"], 201.0);
        assert_eq!(outcome.context_updates["created_order"], json!({"id": "ord-7"}));

        let seen = server.await.unwrap();
        assert!(seen.request_line.starts_with("POST /orders/A-1 "), "{}", seen.request_line);
        assert_eq!(seen.header("x-shop"), Some("acme"));
        assert_eq!(seen.json(), json!({"qty": 3, "note": "rush"}));
    }

    #[tokio::test]
    async fn api_call_sends_input_when_no_body_configured() {
        let (base, server) = serve_once(200, "ok").await;
        let req = request(
            StepKind::ApiCall,
            json!({"method": "PUT", "url": format!("{base}/stock")}),
            json!({"sku": "X1", "level": 4}),
        );

        let outcome = ApiCallExecutor::new(client()).execute(&req).await.unwrap();
        assert_eq!(outcome.output["body"], json!("ok"));
        assert_eq!(server.await.unwrap().json(), json!({"sku": "X1", "level": 4}));
    }

    #[tokio::test]
    async fn api_call_fails_on_error_status() {
        let (base, _server) = serve_once(503, r#"{"error": "down"}"#).await;
        let req = request(StepKind::ApiCall, json!({"url": base}), json!({}));

        let err = ApiCallExecutor::new(client()).execute(&req).await.unwrap_err();
        match err {
            StepError::ExecutionFailed(msg) => assert!(msg.contains("503"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_call_can_accept_error_status() {
        let (base, _server) = serve_once(404, r#"{"error": "missing"}"#).await;
        let req = request(
            StepKind::ApiCall,
            json!({"url": base, "allow_error_status": true}),
            json!({}),
        );

        let outcome = ApiCallExecutor::new(client()).execute(&req).await.unwrap();
        assert_eq!(outcome.output["success"], json!(false));
        assert_eq!(outcome.output["body"]["error"], json!("missing"));
    }

    #[tokio::test]
    async fn api_call_requires_url() {
        let req = request(StepKind::ApiCall, json!({}), json!({}));
        let err = ApiCallExecutor::new(client()).execute(&req).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn api_call_honours_cancellation() {
        let req = request(
            StepKind::ApiCall,
            json!({"url": "http://127.0.0.1:9/never"}),
            json!({}),
        );
        req.cancel.cancel();
        let err = ApiCallExecutor::new(client()).execute(&req).await.unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
    }

    #[tokio::test]
    async fn data_fetch_selects_records_and_counts() {
        let (base, server) = serve_once(
            200,
            r#"{"page": 1, "result": {"items": [{"sku": "A"}, {"sku": "B"}]}}"#,
        )
        .await;
        let req = request(
            StepKind::DataFetch,
            json!({
                "url": format!("{base}/products"),
                "query": {"since": "{{ input_data.since }}"},
                "data_path": "result.items",
                "context_key": "products",
            }),
            json!({"since": "2026-01-01"}),
        );

        let outcome = DataFetchExecutor::new(client()).execute(&req).await.unwrap();
        assert_eq!(outcome.output["record_count"], json!(2));
        assert_eq!(outcome.output["data"][1]["sku"], json!("B"));
        assert_eq!(outcome.metrics["records_fetched"], 2.0);
        assert!(outcome.context_updates.contains_key("products"));

        let seen = server.await.unwrap();
        assert!(
            seen.request_line.starts_with("GET /products?since=2026-01-01 "),
            "{}",
            seen.request_line
        );
    }

    #[tokio::test]
    async fn data_fetch_rejects_non_json() {
        let (base, _server) = serve_once(200, "<html>nope</html>").await;
        let req = request(StepKind::DataFetch, json!({"url": base}), json!({}));

        let err = DataFetchExecutor::new(client()).execute(&req).await.unwrap_err();
        assert!(matches!(err, StepError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn data_fetch_missing_data_path_fails() {
        let (base, _server) = serve_once(200, r#"{"items": []}"#).await;
        let req = request(
            StepKind::DataFetch,
            json!({"url": base, "data_path": "result.items"}),
            json!({}),
        );

        let err = DataFetchExecutor::new(client()).execute(&req).await.unwrap_err();
        match err {
            StepError::ExecutionFailed(msg) => assert!(msg.contains("result.items")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

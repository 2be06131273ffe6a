//! `ai_process` executor for OpenAI-compatible chat completion endpoints.

use serde_json::{Value, json};
use tradeflow_core::workflow::executor::{StepError, StepExecutor, StepOutcome, StepRequest};

use super::{cancellable, request_failed};

/// Send a prompt to a chat completions endpoint and return the reply.
///
/// Config parameters:
/// - `prompt`: templated user message; defaults to the step input as JSON
/// - `system`: optional system message
/// - `model`, `temperature`, `max_tokens`: request overrides
/// - `parse_json`: decode the reply as JSON (fails the step if it is not)
/// - `context_key`: also export the reply under this context key
pub struct AiProcessExecutor {
    client: reqwest::Client,
    endpoint: Option<String>,
    model: String,
    api_key: Option<String>,
}

impl AiProcessExecutor {
    pub fn new(
        client: reqwest::Client,
        endpoint: Option<String>,
        model: String,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            model,
            api_key,
        }
    }

    fn build_body(&self, request: &StepRequest) -> Value {
        let config = &request.step.config;
        let prompt = match config.param_str("prompt") {
            Some(template) => request.context.render(template),
            None => request.input.to_string(),
        };

        let mut messages = Vec::new();
        if let Some(system) = config.param_str("system") {
            messages.push(json!({"role": "system", "content": request.context.render(system)}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let mut body = json!({
            "model": config.param_str("model").unwrap_or(&self.model),
            "messages": messages,
        });
        for key in ["temperature", "max_tokens"] {
            if let Some(value) = config.param(key) {
                body[key] = value.clone();
            }
        }
        body
    }
}

impl StepExecutor for AiProcessExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            StepError::ExecutionFailed("ai_process requires 'ai_endpoint' in config.toml".to_string())
        })?;
        let body = self.build_body(request);

        let mut builder = self.client.post(endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        tracing::debug!(step = %request.step.name, model = %body["model"], "sending AI request");
        let response = cancellable(&request.cancel, async {
            builder.send().await.map_err(request_failed)
        })
        .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(StepError::ExecutionFailed(format!(
                "AI endpoint returned HTTP {}: {}",
                status.as_u16(),
                detail.chars().take(200).collect::<String>()
            )));
        }
        let reply: Value = cancellable(&request.cancel, async {
            response
                .json()
                .await
                .map_err(|e| StepError::ExecutionFailed(format!("invalid AI response: {e}")))
        })
        .await?;

        let content = reply
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::ExecutionFailed("AI response has no message content".to_string()))?;

        let config = &request.step.config;
        let result = if config.param_bool("parse_json").unwrap_or(false) {
            serde_json::from_str::<Value>(content.trim()).map_err(|e| {
                StepError::ExecutionFailed(format!("AI reply is not valid JSON: {e}"))
            })?
        } else {
            Value::String(content.to_string())
        };

        let mut outcome = StepOutcome::new(json!({
            "result": result.clone(),
            "model": reply.get("model").cloned().unwrap_or_else(|| body["model"].clone()),
        }));
        if let Some(usage) = reply.get("usage") {
            for (field, metric) in [("prompt_tokens", "prompt_tokens"), ("completion_tokens", "completion_tokens")] {
                if let Some(n) = usage.get(field).and_then(Value::as_f64) {
                    outcome = outcome.with_metric(metric, n);
                }
            }
        }
        if let Some(key) = config.param_str("context_key") {
            outcome = outcome.with_update(key, result);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{client, request, serve_once};
    use super::*;
    use tradeflow_types::workflow::StepKind;

    fn executor(endpoint: Option<String>) -> AiProcessExecutor {
        AiProcessExecutor::new(client(), endpoint, "gpt-4o-mini".to_string(), Some("sk-test".to_string()))
    }

    #[tokio::test]
    async fn ai_process_sends_prompt_and_parses_json_reply() {
        let (base, server) = serve_once(
            200,
            r#"{"model": "gpt-4o-mini", "choices": [{"message": {"role": "assistant", "content": "{\"category\": \"shoes\"}"}}], "usage": {"prompt_tokens": 12, "completion_tokens": 5}}"#,
        )
        .await;
        let req = request(
            StepKind::AiProcess,
            json!({
                "prompt": "Categorise: {{ input_data.title }}",
                "system": "Answer in JSON",
                "parse_json": true,
                "temperature": 0,
            }),
            json!({"title": "Trail runner"}),
        );

        let outcome = executor(Some(format!("{base}/v1/chat/completions")))
            .execute(&req)
            .await
            .unwrap();
        assert_eq!(outcome.output["result"], json!({"category": "shoes"}));
        assert_eq!(outcome.metrics["prompt_tokens"], 12.0);

        let seen = server.await.unwrap();
        assert_eq!(seen.header("authorization"), Some("Bearer sk-test"));
        let sent = seen.json();
        assert_eq!(sent["model"], json!("gpt-4o-mini"));
        assert_eq!(sent["temperature"], json!(0));
        assert_eq!(sent["messages"][0]["role"], json!("system"));
        assert_eq!(sent["messages"][1]["content"], json!("Categorise: Trail runner"));
    }

    #[tokio::test]
    async fn ai_process_without_endpoint_fails() {
        let req = request(StepKind::AiProcess, json!({}), json!({"title": "x"}));
        let err = executor(None).execute(&req).await.unwrap_err();
        assert!(matches!(err, StepError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn ai_process_rejects_reply_without_content() {
        let (base, _server) = serve_once(200, r#"{"choices": []}"#).await;
        let req = request(StepKind::AiProcess, json!({}), json!({"title": "x"}));
        let err = executor(Some(base)).execute(&req).await.unwrap_err();
        match err {
            StepError::ExecutionFailed(msg) => assert!(msg.contains("no message content")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

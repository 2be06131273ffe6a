//! Webhook `notification` executor with HMAC-SHA256 payload signing.
//!
//! Receivers verify `X-Tradeflow-Signature: sha256=<hex>` by computing
//! HMAC-SHA256 over the raw request body with the shared secret.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tradeflow_core::workflow::executor::{StepError, StepExecutor, StepOutcome, StepRequest};

use super::{cancellable, request_failed};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Tradeflow-Signature";

/// Compute the `sha256=<hex>` signature of `body` under `secret`.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> Result<String, StepError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| StepError::InvalidInput(format!("invalid signing key: {e}")))?;
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("sha256={hex}"))
}

/// POST notifications to a webhook.
///
/// Config parameters:
/// - `message`: templated text (defaults to a generic line naming the step)
/// - `level`: `info` (default), `warn` or `error`
/// - `data`: templated JSON attached to the payload; defaults to the step input
/// - `webhook_url`: per-step override of the configured URL
pub struct WebhookNotificationExecutor {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotificationExecutor {
    pub fn new(client: reqwest::Client, url: String, secret: Option<String>) -> Self {
        Self { client, url, secret }
    }
}

impl StepExecutor for WebhookNotificationExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
        let config = &request.step.config;
        let template = config
            .param_str("message")
            .map(str::to_string)
            .unwrap_or_else(|| format!("workflow step '{}' reached", request.step.name));
        let message = request.context.render(&template);
        let url = config
            .param_str("webhook_url")
            .map(|u| request.context.render(u))
            .unwrap_or_else(|| self.url.clone());
        let data = match config.param("data") {
            Some(data) => request.context.render_value(data),
            None => request.input.clone(),
        };

        let payload = json!({
            "execution_id": request.execution_id,
            "workflow_id": request.step.workflow_id,
            "step": request.step.name,
            "level": config.param_str("level").unwrap_or("info"),
            "message": message,
            "data": data,
            "sent_at": Utc::now().to_rfc3339(),
        });
        let body = serde_json::to_vec(&payload)
            .map_err(|e| StepError::ExecutionFailed(format!("cannot encode payload: {e}")))?;

        let mut builder = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            builder = builder.header(SIGNATURE_HEADER, sign_payload(secret.as_bytes(), &body)?);
        }

        let response = cancellable(&request.cancel, async {
            builder.body(body).send().await.map_err(request_failed)
        })
        .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StepError::ExecutionFailed(format!(
                "webhook {url} returned HTTP {}",
                status.as_u16()
            )));
        }

        tracing::info!(
            execution_id = %request.execution_id,
            step = %request.step.name,
            %url,
            status = status.as_u16(),
            "notification delivered"
        );

        Ok(StepOutcome::new(json!({
            "delivered": true,
            "channel": "webhook",
            "status": status.as_u16(),
            "message": message,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{client, request, serve_once};
    use super::*;
    use tradeflow_types::workflow::StepKind;

    #[test]
    fn test_sign_payload_known_vector() {
        // RFC 4231 test case 2.
        let sig = sign_payload(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[tokio::test]
    async fn webhook_posts_signed_payload() {
        let (base, server) = serve_once(200, "{}").await;
        let req = request(
            StepKind::Notification,
            json!({"message": "order {{ input_data.order_id }} shipped", "level": "warn"}),
            json!({"order_id": "A-9"}),
        );

        let executor = WebhookNotificationExecutor::new(
            client(),
            format!("{base}/hooks"),
            Some("s3cret".to_string()),
        );
        let outcome = executor.execute(&req).await.unwrap();
        assert_eq!(outcome.output["channel"], json!("webhook"));
        assert_eq!(outcome.output["message"], json!("order A-9 shipped"));

        let seen = server.await.unwrap();
        assert!(seen.request_line.starts_with("POST /hooks "));
        let expected = sign_payload(b"s3cret", &seen.body).unwrap();
        assert_eq!(seen.header(SIGNATURE_HEADER), Some(expected.as_str()));

        let payload = seen.json();
        assert_eq!(payload["level"], json!("warn"));
        assert_eq!(payload["data"], json!({"order_id": "A-9"}));
        assert_eq!(payload["step"], json!("step"));
    }

    #[tokio::test]
    async fn webhook_without_secret_is_unsigned() {
        let (base, server) = serve_once(200, "").await;
        let req = request(StepKind::Notification, json!({}), json!({}));

        WebhookNotificationExecutor::new(client(), base, None)
            .execute(&req)
            .await
            .unwrap();
        assert!(server.await.unwrap().header(SIGNATURE_HEADER).is_none());
    }

    #[tokio::test]
    async fn webhook_error_status_fails_step() {
        let (base, _server) = serve_once(500, "{}").await;
        let req = request(StepKind::Notification, json!({}), json!({}));

        let err = WebhookNotificationExecutor::new(client(), base, None)
            .execute(&req)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::ExecutionFailed(_)));
    }
}

//! Completion webhooks.

use std::sync::OnceLock;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha512;
use shard_protocol::{CostsInfo, EnhancedErrorInfo, WebhookOption};
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::{Error, Result};

pub const SIGNATURE_HEADER: &str = "X-Rendershard-Signature";
pub const NO_SECRET_PROVIDED: &str = "NO_SECRET_PROVIDED";

type HmacSha512 = Hmac<Sha512>;

pub(crate) fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Signature header value for `body`.
pub fn sign_payload(secret: Option<&str>, body: &[u8]) -> String {
    let Some(secret) = secret else {
        return NO_SECRET_PROVIDED.to_string();
    };
    match HmacSha512::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            format!("sha512={}", hex::encode(mac.finalize().into_bytes()))
        }
        Err(_) => NO_SECRET_PROVIDED.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookError {
    pub message: String,
    pub name: String,
    pub stack: String,
}

impl From<&EnhancedErrorInfo> for WebhookError {
    fn from(e: &EnhancedErrorInfo) -> Self {
        Self {
            message: e.message.clone(),
            name: e.name.clone(),
            stack: e.stack.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub kind: WebhookKind,
    pub render_id: String,
    pub expected_bucket_owner: Option<String>,
    pub bucket_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_finish: Option<i64>,
    pub errors: Vec<WebhookError>,
    pub custom_data: Option<Value>,
    pub costs: CostsInfo,
}

/// Delivers webhook payloads. Failures are logged and returned, never retried
/// beyond the configured budget.
pub struct WebhookClient {
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> Self {
        install_rustls_provider();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    async fn post(&self, url: &str, headers: HeaderMap, body: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Other(format!("Webhook request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!("Webhook failed: {status} - {body}")));
        }
        Ok(())
    }

    pub async fn send(&self, webhook: &WebhookOption, payload: &WebhookPayload) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let signature = sign_payload(webhook.secret.as_deref(), &body);
        if let Ok(value) = HeaderValue::from_str(&signature) {
            headers.insert(SIGNATURE_HEADER, value);
        }

        let mut attempt = 0;
        loop {
            match self.post(&webhook.url, headers.clone(), body.clone()).await {
                Ok(()) => {
                    info!(render_id = %payload.render_id, kind = ?payload.kind, "Webhook delivered");
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        render_id = %payload.render_id,
                        attempt,
                        max = self.max_retries,
                        error = %e,
                        "Retrying webhook delivery"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    warn!(render_id = %payload.render_id, error = %e, "Webhook delivery failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::cost::zero_costs;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_signature() {
        assert_eq!(
            sign_payload(Some("secret"), br#"{"type":"success"}"#),
            "sha512=a09ef39ed5cd8b6d33909120321443d0694a10620a95a9bfdf8cb34af73559aa348b47e2935194ac0e2d2c70051ace46b8f330e680e2c156ce17bf4f807180ae"
        );
        assert_eq!(sign_payload(None, b"{}"), NO_SECRET_PROVIDED);
    }

    fn payload() -> WebhookPayload {
        WebhookPayload {
            kind: WebhookKind::Success,
            render_id: "abc".to_string(),
            expected_bucket_owner: None,
            bucket_name: "bucket".to_string(),
            output_url: Some("memory://bucket/out.mp4".to_string()),
            time_to_finish: Some(1_000),
            errors: Vec::new(),
            custom_data: Some(serde_json::json!({"project": "intro"})),
            costs: zero_costs(),
        }
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let length = text[..header_end]
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Answers the first `failures` requests with 500 and the rest with 200.
    async fn serve(failures: u32) -> (String, Arc<AtomicU32>, tokio::sync::mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let status = if n < failures { "500 Internal Server Error" } else { "200 OK" };
                let response = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
                let _ = tx.send(request).await;
            }
        });
        (url, hits, rx)
    }

    fn client() -> WebhookClient {
        WebhookClient::new(&WebhookConfig {
            timeout_secs: 5,
            max_retries: 2,
            retry_delay_ms: 1,
        })
    }

    #[tokio::test]
    async fn test_delivers_signed_payload() {
        let (url, hits, mut requests) = serve(0).await;
        let webhook = WebhookOption {
            url,
            secret: Some("secret".to_string()),
            custom_data: None,
        };

        client().send(&webhook, &payload()).await.unwrap();

        let request = requests.recv().await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(lower.starts_with("post /hook"));
        assert!(lower.contains("x-rendershard-signature: sha512="));
        assert!(request.contains(r#""renderId":"abc""#));
        assert!(request.contains(r#""type":"success""#));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_gives_up() {
        let (url, hits, _requests) = serve(u32::MAX).await;
        let webhook = WebhookOption {
            url,
            secret: None,
            custom_data: None,
        };
        assert!(client().send(&webhook, &payload()).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_failure() {
        let (url, hits, _requests) = serve(1).await;
        let webhook = WebhookOption {
            url,
            secret: None,
            custom_data: None,
        };
        client().send(&webhook, &payload()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

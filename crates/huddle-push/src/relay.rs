//! Push relay client.
//!
//! [`RelayClient`] is the seam between the sender and the network; the
//! production implementation is [`HttpRelayClient`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::errors::RelayError;
use crate::wire::{API_URL_SUFFIX_V1, PushAck, PushMessage, PushResponse};

/// Transport to the external push relay.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// POST one device payload and return the relay verdict.
    async fn send_push(&self, msg: &PushMessage) -> Result<PushResponse, RelayError>;

    /// POST a delivery acknowledgement.
    async fn ack(&self, ack: &PushAck) -> Result<(), RelayError>;
}

/// JSON-over-HTTP relay client.
pub struct HttpRelayClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRelayClient {
    /// Client for the relay at `server_url` with a per-request `timeout`.
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: format!("{}{API_URL_SUFFIX_V1}", server_url.trim_end_matches('/')),
        })
    }

    /// `<server>/api/v1`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, RelayError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn send_push(&self, msg: &PushMessage) -> Result<PushResponse, RelayError> {
        let response = self.post("/send_push", msg).await?;
        let text = response.text().await?;
        let parsed: PushResponse =
            serde_json::from_str(&text).map_err(|e| RelayError::Decode(e.to_string()))?;
        debug!(notification_id = %msg.id, ack_id = %msg.ack_id, status = %parsed.status, "relay replied");
        Ok(parsed)
    }

    async fn ack(&self, ack: &PushAck) -> Result<(), RelayError> {
        let _ = self.post("/ack", ack).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::wire::RelayStatus;

    fn message() -> PushMessage {
        PushMessage {
            id: "n1".into(),
            ack_id: "a1".into(),
            platform: "apple".into(),
            device_id: "tok".into(),
            push_type: "message".into(),
            badge: 2,
            ..PushMessage::default()
        }
    }

    fn client(server: &MockServer) -> HttpRelayClient {
        HttpRelayClient::new(&format!("{}/", server.uri()), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let c = HttpRelayClient::new("http://relay.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(c.base_url(), "http://relay.local/api/v1");
    }

    #[tokio::test]
    async fn send_push_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/send_push"))
            .and(body_partial_json(serde_json::json!({
                "id": "n1", "ack_id": "a1", "device_id": "tok", "badge": 2
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "OK"})))
            .expect(1)
            .mount(&server)
            .await;

        let resp = client(&server).send_push(&message()).await.unwrap();
        assert_eq!(resp.classify(), RelayStatus::Ok);
    }

    #[tokio::test]
    async fn remove_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/send_push"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "REMOVE"})),
            )
            .mount(&server)
            .await;

        let resp = client(&server).send_push(&message()).await.unwrap();
        assert_eq!(resp.classify(), RelayStatus::Remove);
    }

    #[tokio::test]
    async fn http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/send_push"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = client(&server).send_push(&message()).await.unwrap_err();
        assert_matches!(err, RelayError::Status { status: 502, .. });
    }

    #[tokio::test]
    async fn garbage_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/send_push"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client(&server).send_push(&message()).await.unwrap_err();
        assert_matches!(err, RelayError::Decode(_));
    }

    #[tokio::test]
    async fn ack_posts_to_ack_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/ack"))
            .and(body_partial_json(serde_json::json!({"id": "a1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let ack = PushAck {
            id: "a1".into(),
            ..PushAck::default()
        };
        client(&server).ack(&ack).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_relay_is_request_error() {
        let c = HttpRelayClient::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        let err = c.send_push(&message()).await.unwrap_err();
        assert_matches!(err, RelayError::Request(_));
    }
}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use domain::{ClientNonce, ConversationId, GeoPoint, Message, NearbySitter};

use crate::error::SessionError;
use crate::transport::ChatApi;

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// 基于 reqwest 的 REST 客户端
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// 401 视为令牌失效，429 / 408 稍后重试，5xx 视为连接问题，其余非 2xx 只影响当前请求
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SessionError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|err| SessionError::Protocol(err.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(SessionError::AuthExpired);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SessionError::Throttled {
                retry_after: retry_after(&response),
            });
        }
        if status == StatusCode::REQUEST_TIMEOUT {
            return Err(SessionError::Timeout);
        }
        if status.is_server_error() {
            return Err(SessionError::TransportLost(format!("server responded {status}")));
        }
        let payload: ErrorPayload = response.json().await.unwrap_or_default();
        Err(SessionError::Api {
            status: status.as_u16(),
            code: payload.code,
            message: payload.message,
        })
    }
}

/// 只支持秒数形式的 `Retry-After`
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn get_messages(
        &self,
        token: &str,
        conversation_id: ConversationId,
        since_seq: u64,
    ) -> Result<Vec<Message>, SessionError> {
        let url = self.url(&format!(
            "/conversations/{conversation_id}/messages?since={since_seq}"
        ));
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(SessionError::transport)?;
        Self::decode(response).await
    }

    async fn send_message(
        &self,
        token: &str,
        conversation_id: ConversationId,
        body: &str,
        nonce: &ClientNonce,
    ) -> Result<Message, SessionError> {
        let url = self.url(&format!("/conversations/{conversation_id}/messages"));
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&json!({ "body": body, "client_nonce": nonce.as_str() }))
            .send()
            .await
            .map_err(SessionError::transport)?;
        Self::decode(response).await
    }

    async fn query_nearby(
        &self,
        token: &str,
        center: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<NearbySitter>, SessionError> {
        let url = self.url(&format!(
            "/sitters/nearby?lat={}&lon={}&radius={}",
            center.latitude, center.longitude, radius_meters
        ));
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(SessionError::transport)?;
        Self::decode(response).await
    }
}

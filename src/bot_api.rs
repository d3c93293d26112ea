// src/bot_api.rs

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::label::ChunkLabel;
use crate::models::{CredentialId, DestinationId};
use crate::transport::{RemoteMessage, Transport, TransportError};

pub const DEFAULT_BASE_URL: &str = "https://api.telegram.org";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
    document: Option<SentDocument>,
}

#[derive(Debug, Deserialize)]
struct SentDocument {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

/// Bot-API style HTTP transport. Each credential maps to one bot token.
#[derive(Debug, Clone)]
pub struct BotApiTransport {
    client: Client,
    base_url: String,
    tokens: HashMap<CredentialId, String>,
    timeout: Duration,
}

impl BotApiTransport {
    pub fn new(tokens: HashMap<CredentialId, String>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, tokens)
    }

    pub fn with_base_url(base_url: impl Into<String>, tokens: HashMap<CredentialId, String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn credentials(&self) -> impl Iterator<Item = &CredentialId> {
        self.tokens.keys()
    }

    fn token(&self, credential: &CredentialId) -> Result<&str, TransportError> {
        self.tokens
            .get(credential)
            .map(String::as_str)
            .ok_or_else(|| TransportError::Client {
                status: 401,
                message: format!("no token configured for credential {credential}"),
            })
    }

    fn method_url(&self, credential: &CredentialId, method: &str) -> Result<String, TransportError> {
        Ok(format!("{}/bot{}/{}", self.base_url, self.token(credential)?, method))
    }

    /// Sends a method call and returns the HTTP status with the raw body.
    async fn send_raw(&self, request: reqwest::RequestBuilder) -> Result<(u16, String), TransportError> {
        let response = request.timeout(self.timeout).send().await.map_err(network_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(network_error)?;
        Ok((status, body))
    }

    async fn call<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, TransportError> {
        let (status, body) = self.send_raw(request).await?;
        parse_response(status, &body)
    }
}

fn network_error(e: reqwest::Error) -> TransportError {
    match e.status() {
        Some(status) => TransportError::from_status(status.as_u16(), e.to_string(), None),
        None => TransportError::Network(e.to_string()),
    }
}

/// Decodes an API reply, classifying failures by status code and the
/// server's `retry_after` hint.
fn parse_response<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, TransportError> {
    let reply: ApiResponse<T> = match serde_json::from_str(body) {
        Ok(reply) => reply,
        Err(e) if (200..300).contains(&status) => {
            return Err(TransportError::Server {
                status,
                message: format!("malformed response: {e}"),
            })
        }
        Err(_) => return Err(TransportError::from_status(status, body.trim(), None)),
    };

    if reply.ok {
        if let Some(result) = reply.result {
            return Ok(result);
        }
    }

    let code = reply
        .error_code
        .unwrap_or(if (200..300).contains(&status) { 500 } else { status });
    let retry_after = reply
        .parameters
        .and_then(|p| p.retry_after)
        .map(Duration::from_secs);
    let message = reply.description.unwrap_or_else(|| "request failed".to_string());
    Err(TransportError::from_status(code, message, retry_after))
}

/// Description the API returns from `deleteMessage` when the message no longer exists.
const MESSAGE_GONE_PREFIX: &str = "Bad Request: message to delete not found";

/// Like [`parse_response`], but a message that is already gone is `Ok(false)`.
fn parse_delete_response(status: u16, body: &str) -> Result<bool, TransportError> {
    if let Ok(reply) = serde_json::from_str::<ApiResponse<bool>>(body) {
        let gone = !reply.ok
            && reply.error_code == Some(400)
            && reply
                .description
                .as_deref()
                .is_some_and(|d| d.starts_with(MESSAGE_GONE_PREFIX));
        if gone {
            return Ok(false);
        }
    }
    parse_response(status, body)
}

#[async_trait]
impl Transport for BotApiTransport {
    async fn send_chunk(
        &self,
        credential: &CredentialId,
        destination: &DestinationId,
        bytes: Bytes,
        label: &ChunkLabel,
    ) -> Result<RemoteMessage, TransportError> {
        let url = self.method_url(credential, "sendDocument")?;
        let file_name = format!("{}.part{}", label.name, label.index);
        let length = bytes.len() as u64;
        let form = Form::new()
            .text("chat_id", destination.0.clone())
            .text("caption", label.to_string())
            .part("document", Part::stream_with_length(bytes, length).file_name(file_name));

        let sent: SentMessage = self.call(self.client.post(url).multipart(form)).await?;
        let remote_ref = sent.document.map(|d| d.file_id).ok_or_else(|| TransportError::Server {
            status: 500,
            message: "sent message carries no document".into(),
        })?;
        tracing::debug!(credential = %credential, index = label.index, message_id = sent.message_id, "chunk sent");
        Ok(RemoteMessage {
            id: sent.message_id,
            remote_ref,
        })
    }

    async fn resolve_download_location(
        &self,
        credential: &CredentialId,
        remote_ref: &str,
    ) -> Result<String, TransportError> {
        let url = self.method_url(credential, "getFile")?;
        let file: FileInfo = self
            .call(self.client.get(url).query(&[("file_id", remote_ref)]))
            .await?;
        let path = file.file_path.ok_or_else(|| TransportError::Client {
            status: 400,
            message: "file has no download path".into(),
        })?;
        Ok(format!("{}/file/bot{}/{}", self.base_url, self.token(credential)?, path))
    }

    async fn fetch_bytes(&self, _credential: &CredentialId, location: &str) -> Result<Bytes, TransportError> {
        let response = self
            .client
            .get(location)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), body.trim(), None));
        }

        let mut buf = BytesMut::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.map_err(network_error)?);
        }
        Ok(buf.freeze())
    }

    async fn delete_remote_message(
        &self,
        credential: &CredentialId,
        destination: &DestinationId,
        message_id: i64,
    ) -> Result<bool, TransportError> {
        let url = self.method_url(credential, "deleteMessage")?;
        let params = [
            ("chat_id", destination.0.clone()),
            ("message_id", message_id.to_string()),
        ];
        let (status, body) = self.send_raw(self.client.post(url).form(&params)).await?;
        parse_delete_response(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_reply_yields_result() {
        let body = r#"{"ok":true,"result":{"message_id":42,"document":{"file_id":"BQAC"}}}"#;
        let sent: SentMessage = parse_response(200, body).unwrap();
        assert_eq!(sent.message_id, 42);
        assert_eq!(sent.document.unwrap().file_id, "BQAC");
    }

    #[test]
    fn flood_wait_carries_retry_after() {
        let body = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 17","parameters":{"retry_after":17}}"#;
        let err = parse_response::<bool>(429, body).unwrap_err();
        assert_eq!(
            err,
            TransportError::Throttled {
                retry_after: Some(Duration::from_secs(17))
            }
        );
    }

    #[test]
    fn bad_request_is_permanent() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: wrong file_id"}"#;
        let err = parse_response::<FileInfo>(400, body).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn gateway_error_page_is_transient() {
        let err = parse_response::<bool>(502, "<html>Bad Gateway</html>").unwrap_err();
        assert!(matches!(err, TransportError::Server { status: 502, .. }));
    }

    #[test]
    fn ok_without_result_is_server_error() {
        let err = parse_response::<bool>(200, r#"{"ok":true}"#).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn deleting_a_vanished_message_is_not_an_error() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: message to delete not found"}"#;
        assert_eq!(parse_delete_response(400, body), Ok(false));
        assert_eq!(parse_delete_response(200, r#"{"ok":true,"result":true}"#), Ok(true));

        // Other bad requests that merely mention "not found" still fail.
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
        let err = parse_delete_response(400, body).unwrap_err();
        assert!(matches!(err, TransportError::Client { status: 400, .. }));

        let body = r#"{"ok":false,"error_code":403,"description":"Forbidden: message to delete not found"}"#;
        assert!(parse_delete_response(403, body).is_err());
    }

    #[test]
    fn unknown_credential_is_rejected() {
        let transport = BotApiTransport::new(HashMap::from([("bot-a".into(), "123:abc".to_string())]));
        assert_eq!(
            transport.method_url(&"bot-a".into(), "getMe").unwrap(),
            "https://api.telegram.org/bot123:abc/getMe"
        );
        assert!(transport.method_url(&"bot-b".into(), "getMe").is_err());
    }
}

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::logging::{LogLevel, SharedJournal, Stage};
use crate::translate::anthropic_types::{MessagesRequest, MessagesResponse};
use crate::translate::openai_types::{ChatCompletionRequest, ChatCompletionResponse};
use crate::translate::request::openai_to_anthropic;
use crate::translate::response::anthropic_to_openai;
use crate::translate::streaming::StreamTranscoder;

use axum::http::HeaderMap;
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;

/// Outcome of proxying a non-streaming request
pub enum ProxyResult {
    Success(ChatCompletionResponse),
    /// Upstream answered with a non-2xx status; forwarded untouched
    Upstream { status: u16, body: Bytes },
}

/// Outcome of proxying a streaming request
pub enum StreamResult {
    Stream(BodyStream),
    Upstream { status: u16, body: Bytes },
}

/// Client-facing SSE bytes, ready to be used as a response body.
pub type BodyStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

/// Credential and protocol version forwarded to Anthropic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAuth {
    pub api_key: String,
    pub version: String,
}

impl UpstreamAuth {
    /// Pull the credential out of `Authorization` (or `x-api-key`) and the
    /// `anthropic-version` header, filling gaps from config.
    pub fn from_headers(headers: &HeaderMap, config: &BridgeConfig) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let api_key = header("authorization")
            .map(normalize_credential)
            .or_else(|| header("x-api-key").map(str::to_string))
            .or_else(|| config.fallback_api_key())
            .unwrap_or_default();

        let version = header("anthropic-version")
            .map(str::to_string)
            .unwrap_or_else(|| config.upstream.anthropic_version.clone());

        Self { api_key, version }
    }
}

/// `Bearer sk-ant-...` -> `sk-ant-...`
pub fn normalize_credential(raw: &str) -> String {
    raw.strip_prefix("Bearer ").unwrap_or(raw).trim().to_string()
}

/// Forward a non-streaming chat completion through Anthropic.
pub async fn proxy_non_streaming(
    req: &ChatCompletionRequest,
    auth: &UpstreamAuth,
    config: &BridgeConfig,
    client: &reqwest::Client,
    journal: &SharedJournal,
) -> Result<ProxyResult> {
    let anthropic_req = translate_request(req, journal)?;
    let response = send_messages(&anthropic_req, auth, config, client, journal).await?;

    let status = response.status().as_u16();
    let body = response.bytes().await?;

    journal.debug(
        Stage::Upstream,
        format!("Response status={} body_len={}", status, body.len()),
    );

    if !(200..300).contains(&status) {
        journal.warn(
            Stage::Upstream,
            format!("Upstream returned status {}: {}", status, truncate(&body, 300)),
        );
        return Ok(ProxyResult::Upstream { status, body });
    }

    let anthropic_resp: MessagesResponse = serde_json::from_slice(&body).map_err(|e| {
        BridgeError::translation(format!(
            "Failed to parse upstream response: {}. Body: {}",
            e,
            truncate(&body, 300)
        ))
    })?;

    let openai_resp = anthropic_to_openai(&anthropic_resp);

    journal.info(
        Stage::Translate,
        format!(
            "Completed: in={} out={} tokens",
            openai_resp.usage.prompt_tokens, openai_resp.usage.completion_tokens
        ),
    );

    Ok(ProxyResult::Success(openai_resp))
}

/// Forward a streaming chat completion, returning the re-framed client stream.
pub async fn proxy_streaming(
    req: &ChatCompletionRequest,
    auth: &UpstreamAuth,
    config: &BridgeConfig,
    client: &reqwest::Client,
    journal: &SharedJournal,
) -> Result<StreamResult> {
    let anthropic_req = translate_request(req, journal)?;
    let response = send_messages(&anthropic_req, auth, config, client, journal).await?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = response.bytes().await.unwrap_or_default();
        journal.warn(
            Stage::Upstream,
            format!("Streaming error status={}: {}", status, truncate(&body, 300)),
        );
        return Ok(StreamResult::Upstream { status, body });
    }

    let transcoder = StreamTranscoder::new(&req.model);
    journal.debug(Stage::Stream, format!("Streaming as {}", transcoder.id()));

    let stream = transcode_stream(response.bytes_stream(), transcoder, journal.clone());
    Ok(StreamResult::Stream(Box::pin(stream)))
}

/// Run an upstream byte stream through a [`StreamTranscoder`].
///
/// Upstream is only polled when the returned stream is, and dropping the
/// returned stream drops `upstream` with it, closing the connection.
pub fn transcode_stream<S, E>(
    upstream: S,
    mut transcoder: StreamTranscoder,
    journal: SharedJournal,
) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut frames = 0usize;

        tokio::pin!(upstream);

        while let Some(chunk_result) = upstream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    let message = format!("Upstream byte stream error: {}", e);
                    journal.error(Stage::Stream, message.clone());
                    yield Err(std::io::Error::other(message));
                    break;
                }
            };

            for frame in transcoder.feed(&chunk) {
                frames += 1;
                yield Ok(Bytes::from(frame));
            }
        }

        let dropped = transcoder.finish();
        journal.info(
            Stage::Stream,
            format!("Stream completed: frames={} dropped_bytes={}", frames, dropped),
        );
    }
}

fn translate_request(
    req: &ChatCompletionRequest,
    journal: &SharedJournal,
) -> Result<MessagesRequest> {
    openai_to_anthropic(req).map_err(|feature| {
        journal.record_with_context(
            LogLevel::Warn,
            Stage::Translate,
            format!("Rejected request: {}", feature),
            serde_json::json!({ "model": req.model, "param": feature.param() }),
        );
        BridgeError::from(feature)
    })
}

async fn send_messages(
    req: &MessagesRequest,
    auth: &UpstreamAuth,
    config: &BridgeConfig,
    client: &reqwest::Client,
    journal: &SharedJournal,
) -> Result<reqwest::Response> {
    let url = config.messages_url();

    journal.info(
        Stage::Upstream,
        format!(
            "POST {} model={}{}",
            url,
            req.model,
            if req.stream == Some(true) { " (streaming)" } else { "" }
        ),
    );

    let response = client
        .post(&url)
        .header("x-api-key", &auth.api_key)
        .header("anthropic-version", &auth.version)
        .header("content-type", "application/json")
        .json(req)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, url = %url, "upstream request failed");
            e
        })?;

    Ok(response)
}

fn truncate(body: &[u8], max: usize) -> String {
    String::from_utf8_lossy(&body[..body.len().min(max)]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_bearer_prefix_is_stripped() {
        assert_eq!(normalize_credential("Bearer sk-ant-123"), "sk-ant-123");
        assert_eq!(normalize_credential("sk-ant-123"), "sk-ant-123");
    }

    #[test]
    fn test_auth_from_authorization_header() {
        let config = BridgeConfig::default();
        let auth = UpstreamAuth::from_headers(&headers(&[("authorization", "Bearer key-1")]), &config);
        assert_eq!(auth.api_key, "key-1");
        assert_eq!(auth.version, "2023-06-01");
    }

    #[test]
    fn test_auth_prefers_client_version() {
        let config = BridgeConfig::default();
        let auth = UpstreamAuth::from_headers(
            &headers(&[("x-api-key", "key-2"), ("anthropic-version", "2024-10-22")]),
            &config,
        );
        assert_eq!(auth.api_key, "key-2");
        assert_eq!(auth.version, "2024-10-22");
    }

    #[test]
    fn test_auth_without_credential() {
        let auth = UpstreamAuth::from_headers(&HeaderMap::new(), &BridgeConfig::default());
        assert_eq!(auth.api_key, "");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_http_error() {
        let dir = tempfile::tempdir().unwrap();
        let journal = SharedJournal::open(dir.path().join("journal.jsonl")).unwrap();

        let dead = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let mut config = BridgeConfig::default();
        config.upstream.base_url = format!("http://{dead}");

        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "claude-3-haiku-20240307",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 10
        }))
        .unwrap();
        let auth = UpstreamAuth::from_headers(&HeaderMap::new(), &config);

        let result =
            proxy_non_streaming(&req, &auth, &config, &reqwest::Client::new(), &journal).await;
        assert!(matches!(result, Err(BridgeError::Http(_))));
    }

    #[test]
    fn test_truncate_is_lossy_safe() {
        assert_eq!(truncate("héllo".as_bytes(), 2), "h\u{fffd}");
        assert_eq!(truncate(b"ok", 300), "ok");
    }
}

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use oai2ant::logging::SharedJournal;
use oai2ant::proxy::transcode_stream;
use oai2ant::translate::anthropic_types::*;
use oai2ant::translate::openai_types::{ChatCompletionRequest, FinishReason};
use oai2ant::translate::request::openai_to_anthropic;
use oai2ant::translate::response::anthropic_to_openai;
use oai2ant::translate::streaming::{StreamTranscoder, DONE_FRAME, ERROR_FRAME};
use oai2ant::{build_router, AppState, BridgeConfig, UnsupportedFeature};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn upstream_sse() -> String {
    let events = [
        json!({"type": "message_start", "message": {
            "id": "msg_01", "type": "message", "role": "assistant", "content": [],
            "model": "claude-3-haiku-20240307", "stop_reason": null, "stop_sequence": null,
            "usage": {"input_tokens": 12, "output_tokens": 1}
        }}),
        json!({"type": "content_block_start", "index": 0,
               "content_block": {"type": "text", "text": ""}}),
        json!({"type": "ping"}),
        json!({"type": "content_block_delta", "index": 0,
               "delta": {"type": "text_delta", "text": "Hello"}}),
        json!({"type": "content_block_delta", "index": 0,
               "delta": {"type": "text_delta", "text": " world"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null},
               "usage": {"output_tokens": 2}}),
        json!({"type": "message_stop"}),
    ];

    events
        .iter()
        .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
        .collect()
}

fn canned_response() -> Value {
    json!({
        "id": "msg_canned",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": "pong"}],
        "model": "claude-3-haiku-20240307",
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": 9, "output_tokens": 1}
    })
}

fn sse_payloads(body: &str) -> Vec<&str> {
    body.split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| f.strip_prefix("data: ").expect("data frame"))
        .collect()
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_bridge(upstream: SocketAddr, dir: &TempDir) -> SocketAddr {
    let mut config = BridgeConfig::default();
    config.upstream.base_url = format!("http://{upstream}");

    let state = Arc::new(AppState {
        config,
        client: reqwest::Client::new(),
        journal: SharedJournal::open(dir.path().join("journal.jsonl")).unwrap(),
    });
    spawn(build_router(state)).await
}

/// Fake Anthropic endpoint that records what it was sent.
#[derive(Clone, Default)]
struct Recorder {
    hits: Arc<AtomicUsize>,
    last_headers: Arc<Mutex<Option<HeaderMap>>>,
    last_body: Arc<Mutex<Option<MessagesRequest>>>,
}

impl Recorder {
    fn router(&self, respond: fn(&MessagesRequest) -> Response) -> Router {
        let rec = self.clone();
        Router::new().route(
            "/v1/messages",
            post(move |headers: HeaderMap, Json(body): Json<MessagesRequest>| async move {
                rec.hits.fetch_add(1, Ordering::SeqCst);
                let response = respond(&body);
                *rec.last_headers.lock().unwrap() = Some(headers);
                *rec.last_body.lock().unwrap() = Some(body);
                response
            }),
        )
    }
}

fn respond_json(_: &MessagesRequest) -> Response {
    Json(canned_response()).into_response()
}

fn respond_sse(_: &MessagesRequest) -> Response {
    // Deliberately awkward chunking: frames split mid-line and mid-delimiter
    let chunks: Vec<Result<Bytes, std::io::Error>> = upstream_sse()
        .into_bytes()
        .chunks(7)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap()
}

fn respond_rate_limited(_: &MessagesRequest) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"type": "error", "error": {"type": "rate_limit_error", "message": "slow down"}})),
    )
        .into_response()
}

// ────────────────────────────────────────────────────────────────
// Translation
// ────────────────────────────────────────────────────────────────

#[test]
fn test_request_end_to_end_example() {
    let req: ChatCompletionRequest = serde_json::from_value(json!({
        "model": "gpt-3.5-turbo",
        "messages": [
            {"role": "system", "content": "You are a helpful assistant."},
            {"role": "user", "content": "Hello, how are you?"}
        ],
        "temperature": 0.7,
        "max_tokens": 150
    }))
    .unwrap();

    let result = openai_to_anthropic(&req).unwrap();

    assert_eq!(result.model, "gpt-3.5-turbo");
    assert_eq!(result.system.as_deref(), Some("You are a helpful assistant."));
    assert_eq!(
        result.messages,
        vec![Message {
            role: Role::User,
            content: MessageContent::Text("Hello, how are you?".to_string()),
        }]
    );
    assert_eq!(result.max_tokens, 150);
    assert_eq!(result.temperature, Some(0.7));
    assert!(result.stop_sequences.is_empty());
    assert_eq!(result.top_k, Some(40u64.into()));
    assert_eq!(result.top_p, None);
    assert_eq!(result.stream, None);
}

#[test]
fn test_response_end_to_end_example() {
    let resp: MessagesResponse = serde_json::from_value(json!({
        "id": "msg_456",
        "type": "message",
        "role": "assistant",
        "content": [
            {"type": "text", "text": "Here's a summary:"},
            {"type": "tool_use", "name": "summarize", "input": {"text": "Long text..."}},
            {"type": "text", "text": "That's the summary."}
        ],
        "model": "claude-2",
        "stop_reason": "max_tokens",
        "stop_sequence": null,
        "usage": {"input_tokens": 50, "output_tokens": 100}
    }))
    .unwrap();

    let result = anthropic_to_openai(&resp);

    assert_eq!(result.choices[0].finish_reason, Some(FinishReason::Length));
    assert_eq!(
        result.choices[0].message.content,
        "Here's a summary:Tool used: summarize\nInput: {\"text\":\"Long text...\"}\nThat's the summary."
    );
    assert_eq!(result.usage.total_tokens, 150);
}

#[test]
fn test_each_rejection_is_distinct() {
    let cases = [
        (json!({"function_call": "auto"}), UnsupportedFeature::FunctionCalling),
        (json!({"tools": []}), UnsupportedFeature::FunctionCalling),
        (json!({"frequency_penalty": 0.7}), UnsupportedFeature::FrequencyPenalty),
        (json!({"logit_bias": {"50256": -100}}), UnsupportedFeature::LogitBias),
    ];

    for (extra, expected) in cases {
        let mut body = json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 100
        });
        for (k, v) in extra.as_object().unwrap() {
            body[k] = v.clone();
        }
        let req: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(openai_to_anthropic(&req).unwrap_err(), expected);
    }
}

// ────────────────────────────────────────────────────────────────
// Streaming adapter
// ────────────────────────────────────────────────────────────────

#[test]
fn test_stream_adapter_is_chunking_independent() {
    let dir = tempfile::tempdir().unwrap();
    let journal = SharedJournal::open(dir.path().join("journal.jsonl")).unwrap();
    let sse = upstream_sse().into_bytes();

    let run = |chunk_size: usize| -> Vec<Bytes> {
        let chunks: Vec<Result<Bytes, &'static str>> = sse
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let transcoder = StreamTranscoder::with_identity("chatcmpl-x", "claude-3-haiku-20240307", 1);
        let stream = transcode_stream(tokio_stream::iter(chunks), transcoder, journal.clone());
        tokio_test::block_on(stream.collect::<Vec<_>>())
            .into_iter()
            .map(Result::unwrap)
            .collect()
    };

    let whole = run(sse.len());
    assert_eq!(whole, run(1));
    assert_eq!(whole, run(5));
    assert_eq!(whole.last().map(|b| b.as_ref()), Some(DONE_FRAME.as_bytes()));
}

#[test]
fn test_stream_adapter_surfaces_transport_errors() {
    let dir = tempfile::tempdir().unwrap();
    let journal = SharedJournal::open(dir.path().join("journal.jsonl")).unwrap();

    let chunks: Vec<Result<Bytes, &'static str>> = vec![
        Ok(Bytes::from_static(b"event: bogus\n\n")),
        Err("connection reset"),
        Ok(Bytes::from_static(b"event: never\ndata: {}\n\n")),
    ];
    let stream = transcode_stream(
        tokio_stream::iter(chunks),
        StreamTranscoder::new("m"),
        journal.clone(),
    );
    let items = tokio_test::block_on(stream.collect::<Vec<_>>());

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap().as_ref(), ERROR_FRAME.as_bytes());
    assert!(items[1].is_err());
    assert!(journal
        .recent(5)
        .iter()
        .any(|e| e.message.contains("connection reset")));
}

/// Flags when the upstream body it is attached to gets dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_client_disconnect_releases_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let journal = SharedJournal::open(dir.path().join("journal.jsonl")).unwrap();

    let dropped = Arc::new(AtomicBool::new(false));
    let flag = DropFlag(dropped.clone());
    let stop = Bytes::from_static(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");

    // Never ends on its own
    let upstream = futures::stream::repeat(stop).map(move |chunk| {
        let _held = &flag;
        Ok::<_, &'static str>(chunk)
    });

    let mut client_stream = Box::pin(transcode_stream(
        upstream,
        StreamTranscoder::new("claude-3-haiku-20240307"),
        journal,
    ));

    let first = client_stream.next().await.unwrap().unwrap();
    assert_eq!(first.as_ref(), DONE_FRAME.as_bytes());
    assert!(!dropped.load(Ordering::SeqCst));

    drop(client_stream);
    assert!(dropped.load(Ordering::SeqCst));
}

// ────────────────────────────────────────────────────────────────
// Full server round trips against a fake upstream
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_non_streaming_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let upstream = spawn(recorder.router(respond_json)).await;
    let bridge = spawn_bridge(upstream, &dir).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{bridge}/v1/chat/completions"))
        .header("Authorization", "Bearer sk-ant-test")
        .json(&json!({
            "model": "claude-3-haiku-20240307",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "ping"}
            ],
            "max_tokens": 10,
            "stop": "###",
            "user": "u-1"
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "msg_canned");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "claude-3-haiku-20240307");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 10);

    let headers = recorder.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers["x-api-key"], "sk-ant-test");
    assert_eq!(headers["anthropic-version"], "2023-06-01");

    let sent = recorder.last_body.lock().unwrap().clone().unwrap();
    assert_eq!(sent.system.as_deref(), Some("Be terse."));
    assert_eq!(sent.messages.len(), 1);
    assert_eq!(sent.stop_sequences, vec!["###"]);
    assert_eq!(sent.metadata.and_then(|m| m.user_id).as_deref(), Some("u-1"));
}

#[tokio::test]
async fn test_streaming_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let upstream = spawn(recorder.router(respond_sse)).await;
    let bridge = spawn_bridge(upstream, &dir).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{bridge}/v1/chat/completions"))
        .header("Authorization", "sk-ant-raw")
        .header("anthropic-version", "2024-01-01")
        .json(&json!({
            "model": "claude-3-haiku-20240307",
            "messages": [{"role": "user", "content": "Say hello world"}],
            "max_tokens": 20,
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");

    let text = resp.text().await.unwrap();
    let payloads = sse_payloads(&text);
    assert_eq!(payloads.last(), Some(&"[DONE]"));

    let chunks: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();

    let content: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "Hello world");

    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
    assert!(chunks.iter().all(|c| c["id"] == chunks[0]["id"]));
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");

    let headers = recorder.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers["x-api-key"], "sk-ant-raw");
    assert_eq!(headers["anthropic-version"], "2024-01-01");
    assert_eq!(
        recorder.last_body.lock().unwrap().as_ref().unwrap().stream,
        Some(true)
    );
}

#[tokio::test]
async fn test_unsupported_feature_never_reaches_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let upstream = spawn(recorder.router(respond_json)).await;
    let bridge = spawn_bridge(upstream, &dir).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{bridge}/v1/chat/completions"))
        .json(&json!({
            "model": "claude-3-haiku-20240307",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 10,
            "logit_bias": {"50256": -100}
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Logit bias is not supported");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["param"], "logit_bias");
    assert_eq!(recorder.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_upstream_errors_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let upstream = spawn(recorder.router(respond_rate_limited)).await;
    let bridge = spawn_bridge(upstream, &dir).await;

    for stream in [false, true] {
        let resp = reqwest::Client::new()
            .post(format!("http://{bridge}/chat/completions"))
            .json(&json!({
                "model": "claude-3-haiku-20240307",
                "messages": [{"role": "user", "content": "Hi"}],
                "max_tokens": 10,
                "stream": stream
            }))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 429);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }
    assert_eq!(recorder.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dispatcher_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let upstream = spawn(recorder.router(respond_json)).await;
    let bridge = spawn_bridge(upstream, &dir).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{bridge}/v1/chat/completions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    let resp = client
        .post(format!("http://{bridge}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    assert_eq!(recorder.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let dir = tempfile::tempdir().unwrap();
    // Bind then drop to get a port with nothing listening
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let bridge = spawn_bridge(dead, &dir).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{bridge}/v1/chat/completions"))
        .json(&json!({
            "model": "claude-3-haiku-20240307",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 10
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "api_error");
}

#[tokio::test]
async fn test_health_and_journal() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let upstream = spawn(recorder.router(respond_json)).await;
    let bridge = spawn_bridge(upstream, &dir).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("http://{bridge}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    client
        .post(format!("http://{bridge}/v1/chat/completions"))
        .json(&json!({
            "model": "claude-3-haiku-20240307",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 10
        }))
        .send()
        .await
        .unwrap();

    let journal: Value = client
        .get(format!("http://{bridge}/journal?limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = journal["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e["timestamp"].is_string()));
}

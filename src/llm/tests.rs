use super::*;
use crate::config::VertexSettings;
use crate::llm::auth::{AccessToken, AuthorizedUserTokenSource, StaticTokenSource, TokenSource};
use crate::llm::credentials::AdcCredentials;
use crate::llm::recording::PlaybackState;
use anyhow::Result;
use async_trait::async_trait;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::{response::IntoResponse, routing::post, Router};
use bytes::Bytes;
use futures::stream;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::net::TcpListener;

const HAIKU: &str = "vertex-4.5-haiku";

// What the mock server answers, in order; the last reply repeats
#[derive(Clone)]
enum MockReply {
    Json {
        status: u16,
        body: Value,
        headers: Vec<(&'static str, &'static str)>,
    },
    Sse(Vec<String>),
    /// Streams the chunks, then drops the connection mid-body
    BrokenSse(Vec<String>),
}

impl MockReply {
    fn ok(body: Value) -> Self {
        MockReply::Json {
            status: 200,
            body,
            headers: vec![],
        }
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    path: String,
    authorization: Option<String>,
    beta: Option<String>,
    body: Value,
}

type Captured = Arc<Mutex<Vec<CapturedRequest>>>;

async fn serve(app: Router) -> String {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = TcpListener::bind(addr).await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", server_addr)
}

// Helper to create a scripted mock of the Vertex raw predict endpoints
async fn create_mock_server(replies: Vec<MockReply>) -> (String, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let requests = captured.clone();

    let app = Router::new().route(
        "/*path",
        post(
            move |Path(path): Path<String>,
                  headers: HeaderMap,
                  axum::extract::Json(body): axum::extract::Json<Value>| {
                let replies = replies.clone();
                let requests = requests.clone();
                async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    let index = {
                        let mut requests = requests.lock().unwrap();
                        requests.push(CapturedRequest {
                            path,
                            authorization: header("authorization"),
                            beta: header("anthropic-beta"),
                            body,
                        });
                        requests.len() - 1
                    };

                    match replies[index.min(replies.len() - 1)].clone() {
                        MockReply::Sse(chunks) => {
                            let stream = stream::iter(
                                chunks
                                    .into_iter()
                                    .map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk))),
                            );
                            axum::response::Response::builder()
                                .status(axum::http::StatusCode::OK)
                                .header("content-type", "text/event-stream")
                                .body(axum::body::Body::from_stream(stream))
                                .unwrap()
                        }
                        MockReply::BrokenSse(chunks) => {
                            let stream = stream::iter(
                                chunks
                                    .into_iter()
                                    .map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk)))
                                    .chain(std::iter::once(Err(std::io::Error::new(
                                        std::io::ErrorKind::ConnectionReset,
                                        "connection dropped",
                                    )))),
                            );
                            axum::response::Response::builder()
                                .status(axum::http::StatusCode::OK)
                                .header("content-type", "text/event-stream")
                                .body(axum::body::Body::from_stream(stream))
                                .unwrap()
                        }
                        MockReply::Json {
                            status,
                            body,
                            headers,
                        } => {
                            let mut response = axum::response::Response::builder()
                                .status(status)
                                .header("content-type", "application/json");
                            for (key, value) in headers {
                                response = response.header(key, value);
                            }
                            response
                                .body(axum::body::Body::from(body.to_string()))
                                .unwrap()
                                .into_response()
                        }
                    }
                }
            },
        ),
    );

    (serve(app).await, captured)
}

fn settings(base_url: &str) -> VertexSettings {
    VertexSettings {
        project_id: "test-project".to_string(),
        region: "us-east5".to_string(),
        base_url: Some(base_url.to_string()),
        access_token: None,
        max_retries: 3,
    }
}

fn test_client(base_url: &str, model: &str) -> VertexClaude {
    VertexClaude::new(
        find_model(model).unwrap(),
        settings(base_url),
        Arc::new(TokenManager::new(Box::new(StaticTokenSource::new(
            "test-token",
        )))),
    )
}

fn message_body(content: Value, stop_reason: &str) -> Value {
    json!({
        "id": "msg_vrtx_01",
        "type": "message",
        "role": "assistant",
        "model": "claude-haiku-4-5-20251001",
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {"input_tokens": 17, "output_tokens": 20}
    })
}

fn sse(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|event| format!("event: {}\ndata: {}\n\n", event["type"].as_str().unwrap(), event))
        .collect()
}

fn text_stream(parts: &[&str]) -> Vec<String> {
    let mut events = vec![
        json!({"type": "message_start", "message": {
            "id": "msg_vrtx_02", "type": "message", "role": "assistant",
            "model": "claude-haiku-4-5-20251001", "content": [],
            "stop_reason": null, "stop_sequence": null,
            "usage": {"input_tokens": 17, "output_tokens": 1}
        }}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "ping"}),
    ];
    for part in parts {
        events.push(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": part}}));
    }
    events.push(json!({"type": "content_block_stop", "index": 0}));
    events.push(json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null}, "usage": {"output_tokens": 15}}));
    events.push(json!({"type": "message_stop"}));
    sse(&events)
}

// Chunk collector for streaming tests
#[derive(Clone)]
struct ChunkCollector {
    chunks: Arc<Mutex<Vec<String>>>,
    tool_chunks: Arc<Mutex<Vec<String>>>,
}

impl ChunkCollector {
    fn new() -> Self {
        Self {
            chunks: Arc::new(Mutex::new(Vec::new())),
            tool_chunks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn callback(&self) -> StreamingCallback {
        let chunks = self.chunks.clone();
        let tool_chunks = self.tool_chunks.clone();

        Box::new(move |chunk: &StreamingChunk| {
            match chunk {
                StreamingChunk::Text(text) => chunks.lock().unwrap().push(text.clone()),
                StreamingChunk::Thinking(text) => chunks
                    .lock()
                    .unwrap()
                    .push(format!("<thinking>{}</thinking>", text)),
                StreamingChunk::InputJson { content, .. } => {
                    tool_chunks.lock().unwrap().push(content.clone())
                }
                StreamingChunk::RateLimit { .. } => {}
            };
            Ok(())
        })
    }

    fn get_chunks(&self) -> Vec<String> {
        self.chunks.lock().unwrap().clone()
    }

    fn get_tool_chunks(&self) -> Vec<String> {
        self.tool_chunks.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_non_streaming_prompt() -> Result<()> {
    let (base_url, captured) = create_mock_server(vec![MockReply::ok(message_body(
        json!([{"type": "text", "text": "1. **Petro**\n2. **Captain Beak**"}]),
        "end_turn",
    ))])
    .await;
    let client = test_client(&base_url, HAIKU);

    let response = client
        .prompt(
            Prompt::new("Two names for a pet pelican, be brief"),
            None,
            None,
        )
        .await?;

    assert_eq!(response.text(), "1. **Petro**\n2. **Captain Beak**");
    assert_eq!(response.input_tokens(), 17);
    assert_eq!(response.output_tokens(), 20);
    assert_eq!(response.usage.token_details, None);
    let mut response_json = response.response_json.clone();
    response_json.as_object_mut().unwrap().remove("id");
    assert_eq!(
        response_json,
        json!({
            "content": [{"citations": null, "text": "1. **Petro**\n2. **Captain Beak**", "type": "text"}],
            "model": "claude-haiku-4-5-20251001",
            "role": "assistant",
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "type": "message",
        })
    );

    let requests = captured.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].path,
        "v1/projects/test-project/locations/us-east5/publishers/anthropic/models/claude-haiku-4-5@20251001:rawPredict"
    );
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer test-token"));
    assert_eq!(requests[0].body["anthropic_version"], "vertex-2023-10-16");
    assert_eq!(requests[0].body["stream"], false);
    assert!(requests[0].body.get("model").is_none());
    assert_eq!(requests[0].beta, None);
    Ok(())
}

#[tokio::test]
async fn test_streaming_prompt_with_visible_prefill() -> Result<()> {
    let (base_url, captured) =
        create_mock_server(vec![MockReply::Sse(text_stream(&["\ndef pelican():", "\n    pass\n"]))])
            .await;
    let client = test_client(&base_url, HAIKU);
    let collector = ChunkCollector::new();
    let callback = collector.callback();

    let options = ClaudeOptions::from_pairs(&[("prefill", "```python\n"), ("stop_sequences", "```")])?;
    let response = client
        .prompt(
            Prompt::new("Very short function describing a pelican").with_options(options),
            None,
            Some(&callback),
        )
        .await?;

    assert_eq!(
        collector.get_chunks(),
        vec!["```python", "\ndef pelican():", "\n    pass\n"]
    );
    assert_eq!(response.text(), "```python\ndef pelican():\n    pass\n");
    assert_eq!(response.output_tokens(), 15);
    assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));

    let requests = captured.lock().unwrap().clone();
    assert!(requests[0].path.ends_with(":streamRawPredict"));
    assert_eq!(requests[0].body["stream"], true);
    assert_eq!(
        requests[0].body["messages"][1],
        json!({"role": "assistant", "content": "```python"})
    );
    Ok(())
}

#[tokio::test]
async fn test_hidden_prefill_is_not_emitted() -> Result<()> {
    let (base_url, _) = create_mock_server(vec![MockReply::ok(message_body(
        json!([{"type": "text", "text": "\"name\": \"Max\"}"}]),
        "end_turn",
    ))])
    .await;
    let client = test_client(&base_url, HAIKU);
    let options = ClaudeOptions::from_pairs(&[("prefill", "{"), ("hide_prefill", "true")])?;
    let response = client
        .prompt(Prompt::new("A dog as JSON").with_options(options), None, None)
        .await?;
    assert_eq!(response.text(), "\"name\": \"Max\"}");
    Ok(())
}

#[tokio::test]
async fn test_schema_output_streams_as_text() -> Result<()> {
    let events = sse(&[
        json!({"type": "message_start", "message": {"id": "m", "type": "message", "role": "assistant", "model": "x", "content": [], "usage": {"input_tokens": 50, "output_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_s", "name": "output_structured_data", "input": {}}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"name\": \"Ma"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "x\", \"age\": 3}"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 12}}),
        json!({"type": "message_stop"}),
    ]);
    let (base_url, captured) = create_mock_server(vec![MockReply::Sse(events)]).await;
    let client = test_client(&base_url, HAIKU);
    let collector = ChunkCollector::new();
    let callback = collector.callback();

    let schema = json!({"type": "object", "properties": {"name": {"type": "string"}, "age": {"type": "integer"}}});
    let response = client
        .prompt(Prompt::new("Invent a good dog").with_schema(schema), None, Some(&callback))
        .await?;

    let parsed: Value = serde_json::from_str(&response.text())?;
    assert_eq!(parsed, json!({"name": "Max", "age": 3}));
    assert!(response.tool_calls().is_empty());
    assert!(collector.get_tool_chunks().is_empty());

    let requests = captured.lock().unwrap().clone();
    assert_eq!(
        requests[0].body["tool_choice"],
        json!({"type": "tool", "name": "output_structured_data"})
    );
    Ok(())
}

#[tokio::test]
async fn test_tool_chain_threads_results() -> Result<()> {
    let (base_url, captured) = create_mock_server(vec![
        MockReply::ok(message_body(
            json!([
                {"type": "text", "text": "Let me generate names."},
                {"type": "tool_use", "id": "toolu_01", "name": "pelican_name_generator", "input": {}},
                {"type": "tool_use", "id": "toolu_02", "name": "pelican_name_generator", "input": {}}
            ]),
            "tool_use",
        )),
        MockReply::ok(message_body(
            json!([{"type": "text", "text": "Charles and Sammy"}]),
            "end_turn",
        )),
    ])
    .await;
    let client = test_client(&base_url, HAIKU);

    let names = Arc::new(Mutex::new(vec!["Sammy", "Charles"]));
    let tool = Tool::function("pelican_name_generator", "Generates a pelican name", move |_| {
        Ok(names.lock().unwrap().pop().unwrap_or("Nobody").to_string())
    });

    let mut conversation = Conversation::new();
    let chain = client
        .chain(
            Prompt::new("Two names for a pet pelican").with_tools(vec![tool]),
            &mut conversation,
            vertex::DEFAULT_CHAIN_LIMIT,
            None,
        )
        .await?;

    assert_eq!(chain.responses.len(), 2);
    assert_eq!(conversation.responses.len(), 2);
    assert_eq!(chain.text(), "Let me generate names.Charles and Sammy");
    assert_eq!(chain.responses[0].tool_calls().len(), 2);

    let requests = captured.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    let messages = requests[1].body["messages"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"][1]["id"], "toolu_01");
    assert_eq!(
        messages[2],
        json!({
            "role": "user",
            "content": [
                {"type": "tool_result", "tool_use_id": "toolu_01", "content": "Charles"},
                {"type": "tool_result", "tool_use_id": "toolu_02", "content": "Sammy"}
            ]
        })
    );
    assert_eq!(requests[1].body["tool_choice"], json!({"type": "auto"}));
    Ok(())
}

#[tokio::test]
async fn test_chain_limit() -> Result<()> {
    let (base_url, _) = create_mock_server(vec![MockReply::ok(message_body(
        json!([{"type": "tool_use", "id": "toolu_loop", "name": "again", "input": {}}]),
        "tool_use",
    ))])
    .await;
    let client = test_client(&base_url, HAIKU);
    let tool = Tool::function("again", "", |_| Ok("once more".to_string()));

    let mut conversation = Conversation::new();
    let err = client
        .chain(
            Prompt::new("loop").with_tools(vec![tool]),
            &mut conversation,
            2,
            None,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Chain limit of 2 exceeded"));
    assert_eq!(conversation.responses.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_zero_chain_limit_is_unbounded() -> Result<()> {
    let tool_turn = MockReply::ok(message_body(
        json!([{"type": "tool_use", "id": "toolu_loop", "name": "again", "input": {}}]),
        "tool_use",
    ));
    let (base_url, captured) = create_mock_server(vec![
        tool_turn.clone(),
        tool_turn.clone(),
        tool_turn,
        MockReply::ok(message_body(json!([{"type": "text", "text": "done"}]), "end_turn")),
    ])
    .await;
    let client = test_client(&base_url, HAIKU);
    let tool = Tool::function("again", "", |_| Ok("once more".to_string()));

    let mut conversation = Conversation::new();
    let chain = client
        .chain(
            Prompt::new("loop").with_tools(vec![tool]),
            &mut conversation,
            0,
            None,
        )
        .await?;
    assert_eq!(chain.responses.len(), 4);
    assert_eq!(chain.text(), "done");
    assert_eq!(captured.lock().unwrap().len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_thinking_with_tools_sends_beta_header() -> Result<()> {
    let events = sse(&[
        json!({"type": "message_start", "message": {"id": "m", "type": "message", "role": "assistant", "model": "x", "content": [], "usage": {"input_tokens": 5, "output_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "Pelicans..."}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "sig"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 1, "delta": {"type": "text_delta", "text": "Pouch"}}),
        json!({"type": "content_block_stop", "index": 1}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 30}}),
    ]);
    let (base_url, captured) = create_mock_server(vec![MockReply::Sse(events)]).await;
    let client = test_client(&base_url, HAIKU);
    let collector = ChunkCollector::new();
    let callback = collector.callback();

    let prompt = Prompt::new("Name a pelican")
        .with_tools(vec![Tool::function("noop", "", |_| Ok(String::new()))])
        .with_options(ClaudeOptions::from_pairs(&[("thinking", "1"), ("thinking_budget", "2000")])?);
    let response = client.prompt(prompt, None, Some(&callback)).await?;

    assert_eq!(
        collector.get_chunks(),
        vec!["<thinking>Pelicans...</thinking>", "Pouch"]
    );
    assert_eq!(response.text(), "Pouch");
    assert!(matches!(
        &response.content[0],
        ContentBlock::Thinking { signature, .. } if signature == "sig"
    ));

    let requests = captured.lock().unwrap().clone();
    assert_eq!(
        requests[0].beta.as_deref(),
        Some("interleaved-thinking-2025-05-14")
    );
    assert_eq!(
        requests[0].body["thinking"],
        json!({"type": "enabled", "budget_tokens": 2000})
    );
    Ok(())
}

#[tokio::test]
async fn test_invalid_options_fail_before_sending() -> Result<()> {
    let (base_url, captured) = create_mock_server(vec![MockReply::ok(json!({}))]).await;
    let client = test_client(&base_url, "vertex-3.5-haiku");
    let prompt = Prompt::new("hi").with_options(ClaudeOptions {
        thinking: true,
        ..Default::default()
    });
    assert!(client.prompt(prompt, None, None).await.is_err());
    assert!(captured.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_retry() -> Result<()> {
    let rate_limited = MockReply::Json {
        status: 429,
        body: json!({"error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}}),
        headers: vec![("retry-after", "0")],
    };
    let (base_url, captured) = create_mock_server(vec![
        rate_limited.clone(),
        rate_limited,
        MockReply::ok(message_body(
            json!([{"type": "text", "text": "Success after retry!"}]),
            "end_turn",
        )),
    ])
    .await;
    let client = test_client(&base_url, HAIKU);

    let response = client.prompt(Prompt::new("Hello"), None, None).await?;
    assert_eq!(response.text(), "Success after retry!");
    assert_eq!(captured.lock().unwrap().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_stream_failing_after_output_is_not_replayed() -> Result<()> {
    let mut broken = text_stream(&["Hel"]);
    // Keep message_start, block start, ping and the first delta
    broken.truncate(4);
    broken.extend(sse(&[json!({
        "type": "error",
        "error": {"type": "overloaded_error", "message": "Overloaded"}
    })]));
    let (base_url, captured) = create_mock_server(vec![
        MockReply::Sse(broken),
        MockReply::Sse(text_stream(&["Hel", "lo"])),
    ])
    .await;
    let client = test_client(&base_url, HAIKU);
    let collector = ChunkCollector::new();
    let callback = collector.callback();

    let err = client
        .prompt(Prompt::new("Hello"), None, Some(&callback))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Stream interrupted after partial output"));
    assert!(err.downcast_ref::<ApiErrorContext>().is_none());
    assert_eq!(collector.get_chunks(), vec!["Hel"]);
    assert_eq!(captured.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_dropped_stream_before_output_is_retried() -> Result<()> {
    let mut opening = text_stream(&[]);
    opening.truncate(1);
    let (base_url, captured) = create_mock_server(vec![
        MockReply::BrokenSse(opening),
        MockReply::Sse(text_stream(&["Hel", "lo"])),
    ])
    .await;
    let client = test_client(&base_url, HAIKU);
    let collector = ChunkCollector::new();
    let callback = collector.callback();

    let response = client
        .prompt(Prompt::new("Hello"), None, Some(&callback))
        .await?;
    assert_eq!(response.text(), "Hello");
    assert_eq!(collector.get_chunks(), vec!["Hel", "lo"]);
    assert_eq!(captured.lock().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_bad_request_is_not_retried() -> Result<()> {
    let (base_url, captured) = create_mock_server(vec![MockReply::Json {
        status: 400,
        body: json!({"type": "error", "error": {"type": "invalid_request_error", "message": "bad"}}),
        headers: vec![],
    }])
    .await;
    let client = test_client(&base_url, HAIKU);

    let err = client
        .prompt(Prompt::new("Hello"), None, None)
        .await
        .unwrap_err();
    let ctx = err.downcast_ref::<ApiErrorContext>().unwrap();
    assert!(matches!(ctx.error, ApiError::InvalidRequest(_)));
    assert_eq!(captured.lock().unwrap().len(), 1);
    Ok(())
}

struct CountingSource {
    calls: AtomicUsize,
}

#[async_trait]
impl TokenSource for CountingSource {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken {
            token: format!("token-{n}"),
            expires_in: Some(std::time::Duration::from_secs(3600)),
        })
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

#[tokio::test]
async fn test_unauthorized_refreshes_token_once() -> Result<()> {
    let unauthorized = MockReply::Json {
        status: 401,
        body: json!({"error": {"code": 401, "status": "UNAUTHENTICATED"}}),
        headers: vec![],
    };
    let (base_url, captured) = create_mock_server(vec![
        unauthorized.clone(),
        MockReply::ok(message_body(json!([{"type": "text", "text": "ok"}]), "end_turn")),
    ])
    .await;
    let client = VertexClaude::new(
        find_model(HAIKU).unwrap(),
        settings(&base_url),
        Arc::new(TokenManager::new(Box::new(CountingSource {
            calls: AtomicUsize::new(0),
        }))),
    );

    let response = client.prompt(Prompt::new("Hello"), None, None).await?;
    assert_eq!(response.text(), "ok");

    let authorizations: Vec<_> = captured
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.authorization.clone().unwrap_or_default())
        .collect();
    assert_eq!(authorizations, vec!["Bearer token-0", "Bearer token-1"]);

    // A second rejection in a row is reported
    let (base_url, _) = create_mock_server(vec![unauthorized]).await;
    let client = test_client(&base_url, HAIKU);
    let err = client
        .prompt(Prompt::new("Hello"), None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Authentication failed"));

    // 403 is handled the same way
    let (base_url, captured) = create_mock_server(vec![
        MockReply::Json {
            status: 403,
            body: json!({"error": {"code": 403, "status": "PERMISSION_DENIED"}}),
            headers: vec![],
        },
        MockReply::ok(message_body(json!([{"type": "text", "text": "ok"}]), "end_turn")),
    ])
    .await;
    let client = VertexClaude::new(
        find_model(HAIKU).unwrap(),
        settings(&base_url),
        Arc::new(TokenManager::new(Box::new(CountingSource {
            calls: AtomicUsize::new(0),
        }))),
    );
    let response = client.prompt(Prompt::new("Hello"), None, None).await?;
    assert_eq!(response.text(), "ok");
    let authorizations: Vec<_> = captured
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.authorization.clone().unwrap_or_default())
        .collect();
    assert_eq!(authorizations, vec!["Bearer token-0", "Bearer token-1"]);
    Ok(())
}

#[tokio::test]
async fn test_record_and_playback() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let recording = dir.path().join("session.json");

    let (base_url, _) = create_mock_server(vec![
        MockReply::Sse(text_stream(&["Hello", " pelican"])),
        MockReply::ok(message_body(json!([{"type": "text", "text": "Plain"}]), "end_turn")),
    ])
    .await;
    let recorder = test_client(&base_url, HAIKU).with_recorder(&recording);
    let collector = ChunkCollector::new();
    let callback = collector.callback();
    recorder
        .prompt(Prompt::new("Greet"), None, Some(&callback))
        .await?;
    recorder.prompt(Prompt::new("Again"), None, None).await?;

    // Nothing listens on this port; playback must not touch the network
    let player = test_client("http://127.0.0.1:9", HAIKU)
        .with_playback(PlaybackState::from_file(&recording, true)?);
    let replay = ChunkCollector::new();
    let replay_callback = replay.callback();
    let first = player
        .prompt(Prompt::new("Greet"), None, Some(&replay_callback))
        .await?;
    assert_eq!(first.text(), "Hello pelican");
    assert_eq!(replay.get_chunks(), vec!["Hello", " pelican"]);
    assert_eq!(first.output_tokens(), 15);

    let second = player.prompt(Prompt::new("Again"), None, None).await?;
    assert_eq!(second.text(), "Plain");

    assert!(player.prompt(Prompt::new("More"), None, None).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_authorized_user_token_refresh() -> Result<()> {
    let forms: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = forms.clone();
    let app = Router::new().route(
        "/token",
        post(move |axum::Form(form): axum::Form<HashMap<String, String>>| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(form);
                axum::Json(json!({"access_token": "ya29.fresh", "expires_in": 3599, "token_type": "Bearer"}))
            }
        }),
    );
    let base_url = serve(app).await;

    let creds = AdcCredentials {
        credential_type: Some("authorized_user".to_string()),
        client_id: Some("client".to_string()),
        client_secret: Some("secret".to_string()),
        refresh_token: Some("refresh".to_string()),
        ..Default::default()
    };
    let source = AuthorizedUserTokenSource::from_credentials(&creds)
        .unwrap()
        .with_token_url(format!("{base_url}/token"));
    let manager = TokenManager::new(Box::new(source));

    assert_eq!(manager.get_valid_token().await?, "ya29.fresh");
    assert_eq!(manager.get_valid_token().await?, "ya29.fresh");

    let forms = forms.lock().unwrap().clone();
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0]["grant_type"], "refresh_token");
    assert_eq!(forms[0]["refresh_token"], "refresh");

    assert!(AuthorizedUserTokenSource::from_credentials(&AdcCredentials::default()).is_none());
    Ok(())
}

/// Integration tests for the OpenAI-compatible surface.
///
/// Most cases drive the router in-process with a scripted engine. The last
/// one serves it on a local port and talks to it through `async-openai`, so
/// off-the-shelf OpenAI clients are known to parse what we emit.
mod common;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use axum::http::StatusCode;
use common::{app, post, post_json, send, sse_payloads, Script, StubGenerator};
use futures::StreamExt;
use llama_gateway::{create_router, AppState, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

#[tokio::test]
async fn missing_messages_is_rejected_before_generation() {
    let (router, stub) = app(StubGenerator::replying(vec!["unused"]));

    let (status, body) = post_json(router, "/v1/chat/completions", json!({})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Messages array is required"}));
    assert!(stub.prompts().is_empty());
}

#[tokio::test]
async fn non_array_messages_is_rejected() {
    let (router, stub) = app(StubGenerator::replying(vec!["unused"]));

    let (status, body) =
        post_json(router, "/v1/chat/completions", json!({"messages": "hello"})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Messages array is required");
    assert!(stub.prompts().is_empty());
}

#[tokio::test]
async fn non_streaming_completion() {
    let (router, stub) = app(StubGenerator::replying(vec!["Hello", " there"]));

    let (status, body) = post_json(
        router,
        "/v1/chat/completions",
        json!({
            "model": "my-model",
            "messages": [
                {"role": "system", "content": "You are a helpful assistant."},
                {"role": "user", "content": "Hi"}
            ]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let prompt = "<s>[INST] <<SYS>>\nYou are a helpful assistant.\n<</SYS>>\n\n[INST] Hi [/INST]";
    assert_eq!(stub.prompts(), vec![prompt.to_string()]);

    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "my-model");
    assert_eq!(
        body["choices"],
        json!([{
            "message": {"role": "assistant", "content": "Hello there"},
            "index": 0,
            "finish_reason": "stop"
        }])
    );
    let prompt_tokens = (prompt.encode_utf16().count() as u64).div_ceil(4);
    assert_eq!(body["usage"]["prompt_tokens"], prompt_tokens);
    assert_eq!(body["usage"]["completion_tokens"], 3);
}

#[tokio::test]
async fn engine_failure_is_a_server_error() {
    let (router, _) = app(StubGenerator::new(Script::FailAfter(vec![], "OOM")));

    let (status, body) = post_json(
        router,
        "/v1/chat/completions",
        json!({"messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "OOM"}));
}

#[tokio::test]
async fn unknown_roles_are_skipped() {
    let (router, stub) = app(StubGenerator::replying(vec!["ok"]));

    let (status, _) = post_json(
        router,
        "/v1/chat/completions",
        json!({"messages": [
            {"role": "narrator", "content": "It was a dark and stormy night."},
            {"role": "user", "content": "hi"}
        ]}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(stub.prompts(), vec!["<s>[INST] hi [/INST]".to_string()]);
}

#[tokio::test]
async fn streaming_emits_deltas_terminal_and_done() {
    let (router, _) = app(StubGenerator::replying(vec!["Hel", "lo"]));

    let (status, content_type, body) = send(
        router,
        post(
            "/v1/chat/completions",
            &json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/event-stream"));

    let frames = sse_payloads(&body);
    assert_eq!(frames.len(), 4);
    for (frame, text) in frames[..2].iter().zip(["Hel", "lo"]) {
        assert_eq!(frame["object"], "chat.completion.chunk");
        assert_eq!(frame["model"], "llama-local");
        assert_eq!(frame["choices"][0]["delta"], json!({"content": text}));
        assert_eq!(frame["choices"][0]["finish_reason"], Value::Null);
    }
    assert_eq!(frames[2]["choices"][0]["delta"], json!({}));
    assert_eq!(frames[2]["choices"][0]["finish_reason"], "stop");
    assert_eq!(frames[3], "[DONE]");
}

#[tokio::test]
async fn streaming_failure_keeps_partial_output() {
    let (router, _) = app(StubGenerator::new(Script::FailAfter(vec!["par"], "OOM")));

    let (status, _, body) = send(
        router,
        post(
            "/v1/chat/completions",
            &json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let frames = sse_payloads(&body);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["choices"][0]["delta"]["content"], "par");
    assert_eq!(frames[1], json!({"error": "OOM"}));
}

#[tokio::test]
async fn streaming_session_failure_becomes_error_frame() {
    let (router, _) = app(StubGenerator::new(Script::FailSession("no session")));

    let (status, _, body) = send(
        router,
        post(
            "/v1/chat/completions",
            &json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(sse_payloads(&body), vec![json!({"error": "no session"})]);
}

#[tokio::test]
async fn client_disconnect_releases_the_generation_stream() {
    let (router, stub) = app(StubGenerator::new(Script::Endless("tick")));

    let response = router
        .oneshot(post(
            "/v1/chat/completions",
            &json!({"messages": [{"role": "user", "content": "hi"}], "stream": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    let frames = sse_payloads(&first);
    assert_eq!(frames[0]["choices"][0]["delta"]["content"], "tick");
    assert!(!stub.released());

    drop(body);
    assert!(stub.released());
}

#[tokio::test]
async fn async_openai_client_compatibility() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let stub = Arc::new(StubGenerator::replying(vec!["Two", " plus two", " is four."]));
    let router = create_router(AppState::new(stub.clone(), common::test_config()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server_handle = tokio::spawn(async move { axum::serve(listener, router).await });

    let config = OpenAIConfig::new()
        .with_api_base(format!("http://{}/v1", addr))
        .with_api_key("dummy-key");
    let client = Client::with_config(config);

    let models = client.models().list().await?;
    assert_eq!(models.data.len(), 1);
    assert_eq!(models.data[0].id, "llama-local");

    let request = CreateChatCompletionRequestArgs::default()
        .model("llama-local")
        .messages(vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content("You are a helpful math tutor.")
                    .build()?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content("What is 2+2?")
                    .build()?,
            ),
        ])
        .max_tokens(50u32)
        .build()?;

    let response = client.chat().create(request).await?;
    assert_eq!(
        response.choices[0].message.content.as_deref(),
        Some("Two plus two is four.")
    );

    let request = CreateChatCompletionRequestArgs::default()
        .model("llama-local")
        .messages(vec![ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content("Count to 3")
                .build()?,
        )])
        .build()?;

    let mut stream = client.chat().create_stream(request).await?;
    let mut full_response = String::new();
    while let Some(result) = stream.next().await {
        for choice in result?.choices {
            if let Some(content) = choice.delta.content {
                full_response.push_str(&content);
            }
        }
    }
    assert_eq!(full_response, "Two plus two is four.");
    assert_eq!(stub.prompts().len(), 2);

    server_handle.abort();
    Ok(())
}

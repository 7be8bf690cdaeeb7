use std::time::Duration;

use chat_api::error::parse_error_message;
use chat_api::headers::build_headers;
use chat_api::retry::{is_retryable_http_error, retry_delay, retry_delay_ms};
use chat_api::{normalize_chat_url, ChatApiConfig, ChatRequest};
use chat_protocol::{ModelSelection, TurnRequest, TurnTrigger, UiMessage};
use reqwest::StatusCode;

#[test]
fn url_normalization_targets_chat_endpoint() {
    assert_eq!(
        normalize_chat_url("https://chat.example.com"),
        "https://chat.example.com/api/chat"
    );
    assert_eq!(
        normalize_chat_url("https://chat.example.com/api/"),
        "https://chat.example.com/api/chat"
    );
    assert_eq!(
        normalize_chat_url("https://chat.example.com/api/chat"),
        "https://chat.example.com/api/chat"
    );
    assert_eq!(normalize_chat_url("  "), "http://127.0.0.1:3000/api/chat");
}

#[test]
fn headers_include_bearer_only_when_token_present() {
    let anonymous = build_headers(&ChatApiConfig::new("http://x"));
    assert_eq!(
        anonymous.get("accept").map(String::as_str),
        Some("text/event-stream")
    );
    assert!(!anonymous.contains_key("authorization"));
    assert!(anonymous
        .get("user-agent")
        .is_some_and(|value| value.starts_with("thread-session/")));

    let authed = build_headers(
        &ChatApiConfig::new("http://x")
            .with_access_token(" tok ")
            .with_user_agent("custom-agent")
            .insert_header("X-Trace", " abc "),
    );
    assert_eq!(
        authed.get("authorization").map(String::as_str),
        Some("Bearer tok")
    );
    assert_eq!(
        authed.get("user-agent").map(String::as_str),
        Some("custom-agent")
    );
    assert_eq!(authed.get("x-trace").map(String::as_str), Some("abc"));
}

#[test]
fn chat_request_carries_regeneration_target() {
    let turn = TurnRequest {
        turn_id: 4,
        thread_id: "thread-1".to_string(),
        messages: vec![UiMessage::user_text("u1", "hi")],
        model_selection: ModelSelection::new("m", "p", "low", "r"),
        trigger: TurnTrigger::RegenerateMessage {
            message_id: "a1".to_string(),
        },
    };

    let value = serde_json::to_value(ChatRequest::from(&turn)).expect("request serializes");
    assert_eq!(value["id"], "thread-1");
    assert_eq!(value["trigger"], "regenerate-message");
    assert_eq!(value["messageId"], "a1");
    assert_eq!(value["modelSelection"]["reasoningBudget"], "low");
    assert_eq!(value["messages"][0]["parts"][0]["text"], "hi");

    let submit = ChatRequest::from(&TurnRequest {
        trigger: TurnTrigger::SubmitMessage,
        ..turn
    });
    assert_eq!(submit.message_id, None);
}

#[test]
fn retry_policy_matches_transient_failures() {
    for status in [429, 500, 502, 503, 504] {
        assert!(is_retryable_http_error(status, ""));
    }
    assert!(is_retryable_http_error(400, "Rate limit exceeded"));
    assert!(is_retryable_http_error(400, "connection reset by peer"));
    assert!(!is_retryable_http_error(400, "invalid request"));
    assert!(!is_retryable_http_error(401, ""));
}

#[test]
fn retry_delay_is_exponential() {
    assert_eq!(retry_delay_ms(0).as_millis(), 1000);
    assert_eq!(retry_delay_ms(1).as_millis(), 2000);
    assert_eq!(retry_delay_ms(2).as_millis(), 4000);
    assert_eq!(
        retry_delay(Duration::from_millis(10), 3),
        Duration::from_millis(80)
    );
}

#[test]
fn error_messages_are_extracted_from_common_shapes() {
    assert_eq!(
        parse_error_message(StatusCode::BAD_REQUEST, r#"{"error":{"message":"bad input"}}"#),
        "bad input"
    );
    assert_eq!(
        parse_error_message(StatusCode::BAD_REQUEST, r#"{"error":"nope"}"#),
        "nope"
    );
    assert_eq!(
        parse_error_message(StatusCode::BAD_REQUEST, r#"{"message":"flat"}"#),
        "flat"
    );
    assert_eq!(
        parse_error_message(StatusCode::SERVICE_UNAVAILABLE, ""),
        "Service Unavailable"
    );
    assert_eq!(
        parse_error_message(StatusCode::BAD_GATEWAY, "upstream died"),
        "upstream died"
    );
}

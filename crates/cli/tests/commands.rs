//! Chat and ask commands driven against scripted backends.

use std::sync::Arc;

use parley::commands::{ask, chat};
use parley::tools;
use parley_agent::{Driver, Element, Shell};
use parley_config::{AppConfig, ShellConfig};
use parley_core::{ParamValues, Query, SingleToolCall};
use parley_providers::{ManualLlm, ScriptedLlm, ScriptedTurn};
use serde_json::{Value, json};

fn chat_driver(llm: Arc<ScriptedLlm>) -> (Driver, Query) {
    let registry = tools::chat_registry();
    let query = Query::empty()
        .with_systeminstr("S")
        .with_tools(registry.tool_dict());
    (Driver::new(llm).with_tool_fn(Arc::new(registry)), query)
}

#[tokio::test]
async fn chat_streams_answers_and_keeps_context() {
    let llm = Arc::new(ScriptedLlm::new([
        ScriptedTurn::text("hello there"),
        ScriptedTurn::text("still here"),
    ]));
    let (driver, query) = chat_driver(llm.clone());
    let input: &[u8] = b"hi\n\nagain\n/exit\nnever read\n";
    let mut output = Vec::new();

    chat::converse(&driver, &query, input, &mut output).await.unwrap();

    let printed = String::from_utf8(output).unwrap();
    assert!(printed.contains("Assistant > hello there\n"));
    assert!(printed.contains("Assistant > still here\n"));
    assert_eq!(llm.step_count(), 2);

    let seen = llm.seen_queries().await;
    let kinds: Vec<&str> = seen[1].history().iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, ["user", "assistant", "user"]);
}

#[tokio::test]
async fn chat_runs_tools_and_survives_errors() {
    let call = SingleToolCall::new("c1", "current_time", ParamValues::new());
    let llm = Arc::new(ScriptedLlm::new([
        ScriptedTurn::Calls(vec![call]),
        ScriptedTurn::text("it is late"),
        ScriptedTurn::Fail(parley_core::Error::Transport("offline".into())),
        ScriptedTurn::text("back"),
    ]));
    let (driver, query) = chat_driver(llm.clone());
    let input: &[u8] = b"what time is it\nping\npong\n";
    let mut output = Vec::new();

    chat::converse(&driver, &query, input, &mut output).await.unwrap();

    let printed = String::from_utf8(output).unwrap();
    assert!(printed.contains("it is late"));
    assert!(printed.contains("[Error] Transport error: offline"));
    assert!(printed.contains("back"));

    // The failed turn is not part of the conversation.
    let seen = llm.seen_queries().await;
    let last = seen.last().unwrap();
    assert_eq!(last.last_message(), "pong");
    assert!(!last.history().iter().any(|e| matches!(e, parley_core::Entry::User(u) if u == "ping")));
}

#[tokio::test]
async fn manual_backend_answers_with_configured_settings() {
    let config = AppConfig {
        default_provider: "manual".into(),
        ..AppConfig::default()
    };
    let console = std::io::Cursor::new(b"1\ntyped by hand\n".to_vec());
    let llm = ManualLlm::new(console, tokio::io::sink())
        .with_defaults(parley_providers::offline_defaults(&config, "manual"));

    let registry = tools::chat_registry();
    let query = Query::empty()
        .with_tools(registry.tool_dict())
        .with_user("hi");
    let reply = Driver::new(Arc::new(llm))
        .with_tool_fn(Arc::new(registry))
        .streamanswer(&query)
        .await
        .unwrap();
    assert_eq!(reply.text().await.unwrap(), "typed by hand");
}

fn shell(llm: Arc<ScriptedLlm>) -> Shell {
    let config = ShellConfig {
        answer_attempts: 2,
        ..ShellConfig::default()
    };
    tools::with_shell_tools(Shell::new(Driver::new(llm), &config))
}

#[tokio::test]
async fn ask_creates_and_extends_the_history_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");

    let llm = Arc::new(ScriptedLlm::new([
        ScriptedTurn::text(r#"{"items": [{"type": "text", "text": "first"}]}"#),
        ScriptedTurn::text("second, without JSON"),
    ]));
    let shell = shell(llm);

    let elements = ask::ask(&shell, "one", &path).await.unwrap();
    assert_eq!(elements, vec![Element::Text("first".into())]);

    let elements = ask::ask(&shell, "two", &path).await.unwrap();
    assert_eq!(elements, vec![Element::Text("second, without JSON".into())]);

    let saved: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        saved,
        vec![
            json!({"user": "one"}),
            json!({"assistant": "first"}),
            json!({"user": "two"}),
            json!({"assistant": "second, without JSON"}),
        ]
    );
}

#[tokio::test]
async fn ask_leaves_history_alone_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    std::fs::write(&path, r#"[{"user": "old"}, {"assistant": "reply"}]"#).unwrap();

    let bad = r#"{"items": [{"type": "table", "table": "made-up"}]}"#;
    let llm = Arc::new(ScriptedLlm::new([ScriptedTurn::text(bad), ScriptedTurn::text(bad)]));

    let err = ask::ask(&shell(llm.clone()), "q", &path).await.unwrap_err();
    assert!(err.to_string().contains("after 2 attempts"), "{err}");
    assert_eq!(llm.step_count(), 2);

    let saved: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved.len(), 2);
}

#[tokio::test]
async fn ask_rejects_a_broken_history_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    std::fs::write(&path, "{not json").unwrap();

    let llm = Arc::new(ScriptedLlm::new([]));
    assert!(ask::ask(&shell(llm), "q", &path).await.is_err());
}

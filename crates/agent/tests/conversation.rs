//! Whole conversations driven against a scripted backend.

use std::sync::Arc;

use futures::StreamExt;
use parley_agent::Driver;
use parley_core::{
    Continuation, Entry, Error, ParamValues, Query, SingleToolCall, StreamEvent, ToolCallFragment,
    ToolDict, ToolError, param, tool, tool_fn,
};
use parley_providers::{ScriptedLlm, ScriptedTurn};

fn base_query() -> Query {
    let mut tools = ToolDict::new();
    tools.insert("t".into(), tool("Test tool", vec![param("x", "string", "An input")]));
    Query::empty().with_systeminstr("S").with_tools(tools)
}

fn call_t(id: &str, x: &str) -> SingleToolCall {
    let mut params = ParamValues::new();
    params.insert("x".into(), x.into());
    SingleToolCall::new(id, "t", params)
}

fn upper() -> Arc<dyn parley_core::ToolFunction> {
    Arc::new(tool_fn(|_: &str, params: &ParamValues| {
        Ok::<_, ToolError>(params.get("x").cloned().unwrap_or_default().to_uppercase())
    }))
}

fn driver(llm: Arc<ScriptedLlm>) -> Driver {
    Driver::new(llm).with_tool_fn(upper())
}

#[tokio::test]
async fn plain_text_answer() {
    let llm = Arc::new(ScriptedLlm::new([ScriptedTurn::text("hello")]));
    let query = base_query().replify().newquery("hi", &[]);

    let reply = driver(llm.clone()).answer(&query).await.unwrap();

    assert_eq!(reply.text(), "hello");
    assert_eq!(reply.history(), vec![Entry::user("hi"), Entry::assistant("hello")]);
    assert_eq!(llm.step_count(), 1);
}

#[tokio::test]
async fn one_tool_round_then_text() {
    let llm = Arc::new(ScriptedLlm::new([
        ScriptedTurn::Calls(vec![call_t("c1", "abc")]),
        ScriptedTurn::text("done"),
    ]));
    let query = base_query().with_user("hi");

    let reply = driver(llm.clone()).answer(&query).await.unwrap();

    assert_eq!(
        reply.history(),
        vec![
            Entry::user("hi"),
            Entry::ToolCalls(vec![call_t("c1", "abc")]),
            Entry::tool_result("c1", "t", "ABC"),
            Entry::assistant("done"),
        ]
    );
    // The second step saw the tool exchange, with system instruction and
    // tools carried over.
    let seen = llm.seen_queries().await;
    assert_eq!(seen[1].history().len(), 3);
    assert_eq!(seen[1].systeminstr(), "S");
    assert!(seen[1].tools().contains_key("t"));
}

#[tokio::test]
async fn tool_results_follow_call_order() {
    let llm = Arc::new(ScriptedLlm::new([
        ScriptedTurn::Calls(vec![call_t("a", "first"), call_t("b", "second")]),
        ScriptedTurn::text("ok"),
    ]));
    let reply = driver(llm).answer(&base_query().with_user("go")).await.unwrap();

    let history = reply.history();
    assert_eq!(history[2], Entry::tool_result("a", "t", "FIRST"));
    assert_eq!(history[3], Entry::tool_result("b", "t", "SECOND"));
}

#[tokio::test]
async fn next_turn_drops_tool_exchanges_by_default() {
    let llm = Arc::new(ScriptedLlm::new([
        ScriptedTurn::Calls(vec![call_t("c1", "x")]),
        ScriptedTurn::text("first answer"),
        ScriptedTurn::text("second answer"),
    ]));
    let driver = driver(llm.clone());

    let first = driver.answer(&base_query().with_user("one")).await.unwrap();
    let second = driver.answer(&first.newquery("two", &[])).await.unwrap();

    assert_eq!(
        second.history(),
        vec![
            Entry::user("one"),
            Entry::assistant("first answer"),
            Entry::user("two"),
            Entry::assistant("second answer"),
        ]
    );
}

#[tokio::test]
async fn cycle_limit_allows_exactly_n_tool_rounds() {
    for limit in 0..4u32 {
        let turns = (0..10).map(|i| ScriptedTurn::Calls(vec![call_t(&format!("c{i}"), "x")]));
        let llm = Arc::new(ScriptedLlm::new(turns));
        let err = driver(llm.clone())
            .with_cycle_limit(limit)
            .answer(&base_query().with_user("loop"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CycleLimitExceeded { limit: l } if l == limit));
        assert_eq!(llm.step_count(), limit as usize + 1);
    }
}

#[tokio::test]
async fn backend_defaults_fill_cycle_limit() {
    // ScriptedLlm defaults to a cycle limit of 5.
    let turns = (0..10).map(|i| ScriptedTurn::Calls(vec![call_t(&format!("c{i}"), "x")]));
    let llm = Arc::new(ScriptedLlm::new(turns));
    let err = driver(llm.clone()).answer(&base_query()).await.unwrap_err();
    assert!(matches!(err, Error::CycleLimitExceeded { limit: 5 }));
    assert_eq!(llm.step_count(), 6);
}

#[tokio::test]
async fn no_tool_fn_anywhere_is_a_config_error() {
    let llm = Arc::new(ScriptedLlm::new([ScriptedTurn::text("never")]));
    let err = Driver::new(llm.clone()).answer(&base_query()).await.unwrap_err();
    assert!(matches!(err, Error::Config { .. }));
    assert_eq!(llm.step_count(), 0);
}

#[tokio::test]
async fn streamanswer_returns_unread_text() {
    let events = vec![
        Ok(StreamEvent::text("Hel")),
        Ok(StreamEvent::text("lo")),
        Ok(StreamEvent::finish("stop")),
    ];
    let llm = Arc::new(ScriptedLlm::new([
        ScriptedTurn::Calls(vec![call_t("c1", "q")]),
        ScriptedTurn::Events(events),
    ]));

    let reply = driver(llm)
        .streamanswer(&base_query().with_user("hi"))
        .await
        .unwrap();

    let first: Vec<String> = reply.stream().map(|t| t.unwrap()).collect().await;
    let second: Vec<String> = reply.stream().map(|t| t.unwrap()).collect().await;
    assert_eq!(first, ["Hel", "lo"]);
    assert_eq!(first, second);
    assert_eq!(reply.text().await.unwrap(), "Hello");

    let history = reply.history().await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[2], Entry::tool_result("c1", "t", "Q"));
    assert_eq!(history[3], Entry::assistant("Hello"));
}

#[tokio::test]
async fn streamed_tool_calls_are_assembled_and_evaluated() {
    let fragment = |arguments: &str, first: bool| {
        StreamEvent::fragment(ToolCallFragment {
            index: 0,
            call_id: first.then(|| "c9".to_string()),
            name: first.then(|| "t".to_string()),
            arguments: Some(arguments.to_string()),
        })
    };
    let events = vec![
        Ok(fragment("{\"x\": ", true)),
        Ok(fragment("\"split\"}", false)),
        Ok(StreamEvent::finish("tool_calls")),
    ];
    let llm = Arc::new(ScriptedLlm::new([
        ScriptedTurn::Events(events),
        ScriptedTurn::text("after tools"),
    ]));

    let reply = driver(llm)
        .streamanswer(&base_query().with_user("hi"))
        .await
        .unwrap();

    assert_eq!(reply.text().await.unwrap(), "after tools");
    let history = reply.history().await.unwrap();
    assert_eq!(history[1], Entry::ToolCalls(vec![call_t("c9", "split")]));
    assert_eq!(history[2], Entry::tool_result("c9", "t", "SPLIT"));
}

#[tokio::test]
async fn incomplete_streamed_call_fails_the_answer() {
    let events = vec![
        Ok(StreamEvent::fragment(ToolCallFragment {
            index: 0,
            call_id: Some("c1".into()),
            name: None,
            arguments: Some("{}".into()),
        })),
        Ok(StreamEvent::finish("tool_calls")),
    ];
    let llm = Arc::new(ScriptedLlm::new([ScriptedTurn::Events(events)]));

    let err = driver(llm)
        .streamanswer(&base_query().with_user("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IncompleteToolCall { index: 0, missing: "name" }));
}

#[tokio::test]
async fn continuation_is_uniform_across_reply_kinds() {
    let llm = Arc::new(ScriptedLlm::new([ScriptedTurn::text("a1"), ScriptedTurn::text("a2")]));
    let driver = driver(llm);

    let root = base_query().streamreplify();
    let mut current: Box<dyn Continuation> = Box::new(root);
    for (utterance, expected) in [("u1", "a1"), ("u2", "a2")] {
        let query = current.next_query(utterance, &[]).await.unwrap();
        let reply = driver.streamanswer(&query).await.unwrap();
        assert_eq!(reply.text().await.unwrap(), expected);
        current = Box::new(reply);
    }
}

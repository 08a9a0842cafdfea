use std::sync::Arc;

use httpmock::prelude::*;
use serde_json::json;
use tempfile::tempdir;
use toolchat::{
    Agent, AppConfig, AppContext, ChatError, Message, StorageBackend, StorageConfig,
    StorageStatus, StubModel, ToolsConfig,
};

const DIVIDE: &str =
    r#"{"action":"call_tool","name":"calculator","arguments":{"a":12,"b":4,"op":"div"}}"#;

fn memory_config() -> AppConfig {
    AppConfig {
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            ..StorageConfig::default()
        },
        ..AppConfig::default()
    }
}

async fn agent_for(cfg: &AppConfig, model: Arc<StubModel>) -> Agent {
    let context = AppContext::with_model(cfg, model).await.unwrap();
    Agent::new(context).with_agent_config(cfg)
}

fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

#[tokio::test]
async fn division_question_goes_through_the_calculator() {
    let model = StubModel::new(vec![DIVIDE.into(), "12 divided by 4 is 3.".into()]);
    let agent = agent_for(&memory_config(), model.clone()).await;

    let reply = agent.run_turn("math", "What is 12 divided by 4?").await.unwrap();

    assert!(reply.contains('3'));
    assert_eq!(model.calls(), 2);
    let messages = agent.conversation("math").await.unwrap();
    assert_eq!(messages.len(), 4);
    match &messages[2] {
        Message::ToolResult { name, content, .. } => {
            assert_eq!(name, "calculator");
            assert_eq!(content, &json!({"a": 12.0, "b": 4.0, "op": "div", "result": 3.0}));
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[cfg(feature = "persistence")]
#[tokio::test]
async fn interrupted_tool_step_resumes_after_restart() {
    let dir = tempdir().unwrap();
    let storage = StorageConfig {
        backend: StorageBackend::Sqlite,
        database_url: format!("sqlite://{}", dir.path().join("chatbot.db").display()),
        ..StorageConfig::default()
    };

    // First process: the quote service is unreachable, so the turn stops
    // after the model asked for the tool.
    let unreachable = AppConfig {
        storage: storage.clone(),
        tools: ToolsConfig {
            alphavantage_base_url: closed_port_url(),
            timeout_secs: 5,
            ..ToolsConfig::default()
        },
        ..AppConfig::default()
    };
    let first_model = StubModel::new(vec![
        r#"{"action":"call_tool","id":"call_quote","name":"get_stock_price","arguments":{"symbol":"AAPL"}}"#.into(),
    ]);
    let agent = agent_for(&unreachable, first_model).await;
    assert_eq!(
        agent.storage_status(),
        &StorageStatus::Durable {
            backend: StorageBackend::Sqlite
        }
    );
    let err = agent.run_turn("x", "What is AAPL trading at?").await.unwrap_err();
    assert!(matches!(err, ChatError::ToolInvocation { ref name, .. } if name == "get_stock_price"));
    drop(agent);

    // Second process: same database, working quote service.
    let server = MockServer::start_async().await;
    let quote = json!({"Global Quote": {"01. symbol": "AAPL", "05. price": "189.9800"}});
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/query")
                .query_param("function", "GLOBAL_QUOTE")
                .query_param("symbol", "AAPL");
            then.status(200).json_body(quote.clone());
        })
        .await;
    let reachable = AppConfig {
        storage,
        tools: ToolsConfig {
            alphavantage_base_url: server.base_url(),
            alphavantage_api_key: Some("demo".into()),
            ..ToolsConfig::default()
        },
        ..AppConfig::default()
    };
    let second_model = StubModel::new(vec!["AAPL is trading at 189.98.".into()]);
    let agent = agent_for(&reachable, second_model.clone()).await;

    assert!(agent.list_threads().await.contains("x"));
    let reply = agent.resume("x").await.unwrap();

    assert_eq!(reply.as_deref(), Some("AAPL is trading at 189.98."));
    mock.assert_async().await;
    assert_eq!(second_model.calls(), 1);
    let request = second_model.last_request().unwrap();
    match request.last() {
        Some(Message::ToolResult {
            tool_call_id,
            content,
            ..
        }) => {
            assert_eq!(tool_call_id, "call_quote");
            assert_eq!(content, &quote);
        }
        other => panic!("model called before the tool result existed: {other:?}"),
    }
}

#[cfg(feature = "persistence")]
#[tokio::test]
async fn unavailable_store_degrades_to_memory() {
    let dir = tempdir().unwrap();
    let cfg = AppConfig {
        storage: StorageConfig {
            backend: StorageBackend::Sqlite,
            database_url: format!(
                "sqlite://{}",
                dir.path().join("no-such-dir").join("chatbot.db").display()
            ),
            ..StorageConfig::default()
        },
        ..AppConfig::default()
    };
    let agent = agent_for(&cfg, StubModel::new(vec!["still here".into()])).await;

    assert!(agent.storage_status().is_degraded());
    assert!(agent.list_threads().await.is_empty());
    assert_eq!(agent.run_turn("t", "hello").await.unwrap(), "still here");
    assert!(agent.list_threads().await.contains("t"));
}

#[tokio::test]
async fn model_fault_keeps_the_last_commit() {
    let dir = tempdir().unwrap();
    let cfg = AppConfig {
        storage: StorageConfig {
            backend: StorageBackend::File,
            path: dir.path().join("threads").display().to_string(),
            ..StorageConfig::default()
        },
        ..AppConfig::default()
    };
    let model = StubModel::new(vec![
        DIVIDE.into(),
        r#"{"action":"fail","reason":"upstream timed out"}"#.into(),
        "It is 3.".into(),
    ]);
    let agent = agent_for(&cfg, model.clone()).await;

    let err = agent.run_turn("t", "12 / 4?").await.unwrap_err();
    assert!(matches!(err, ChatError::LanguageModel(_)));
    assert_eq!(agent.conversation("t").await.unwrap().len(), 3);

    assert_eq!(agent.resume("t").await.unwrap().as_deref(), Some("It is 3."));
    assert_eq!(agent.conversation("t").await.unwrap().len(), 4);
    assert_eq!(model.remaining(), 0);
}

#[tokio::test]
async fn unknown_tool_is_reported_back_to_the_model() {
    let model = StubModel::new(vec![
        r#"{"action":"call_tool","name":"launch_rockets","arguments":{}}"#.into(),
        "Sorry, I can't do that.".into(),
    ]);
    let agent = agent_for(&memory_config(), model).await;

    let reply = agent.run_turn("t", "launch").await.unwrap();

    assert_eq!(reply, "Sorry, I can't do that.");
    let messages = agent.conversation("t").await.unwrap();
    match &messages[2] {
        Message::ToolResult { content, .. } => {
            assert!(content["error"]
                .as_str()
                .unwrap()
                .contains("unknown tool `launch_rockets`"));
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn threads_are_listed_and_kept_apart() {
    let model = StubModel::new(vec!["a".into(), "b".into()]);
    let agent = agent_for(&memory_config(), model).await;

    agent.run_turn("alpha", "hi").await.unwrap();
    agent.run_turn("beta", "hi").await.unwrap();

    let first = agent.list_threads().await;
    assert_eq!(first.into_iter().collect::<Vec<_>>(), vec!["alpha", "beta"]);
    assert_eq!(agent.list_threads().await.len(), 2);
    assert_eq!(agent.conversation("alpha").await.unwrap()[1], Message::ai("a"));
    assert!(agent.conversation("gamma").await.unwrap().is_empty());
}

//! Defaults must deserialize from an empty document and stay stable —
//! config files in the field omit most sections.

use palaver_domain::config::{apply_env_overrides, Config};

#[test]
fn empty_document_yields_full_defaults() {
    let cfg: Config = serde_json::from_str("{}").unwrap();
    assert_eq!(cfg.server.port, 3210);
    assert_eq!(cfg.scheduler.workers, 8);
    assert_eq!(cfg.scheduler.queue_depth, 32);
    assert_eq!(cfg.scheduler.retry_max, 3);
    assert_eq!(cfg.conversation.history_rounds, 8);
    assert_eq!(cfg.conversation.tool_hops_max, 6);
    assert!(cfg.conversation.stream);
    assert!(!cfg.memory.enabled);
    assert_eq!(cfg.tools.confirm_ttl_secs, 300);
    assert!(cfg.tools.confirm_required.contains("shell.exec"));
    assert_eq!(cfg.tools.timeout_secs, 30);
}

#[test]
fn partial_document_keeps_sibling_defaults() {
    let cfg: Config =
        serde_json::from_str(r#"{"server": {"port": 8080}, "conversation": {"stream": false}}"#)
            .unwrap();
    assert_eq!(cfg.server.port, 8080);
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert!(!cfg.conversation.stream);
    assert_eq!(cfg.conversation.history_rounds, 8);
}

#[test]
fn required_env_subset_round_trips() {
    let mut tree = serde_json::to_value(Config::default()).unwrap();
    apply_env_overrides(
        &mut tree,
        vec![
            ("API__API_KEY".into(), "sk-live".into()),
            ("API__BASE_URL".into(), "https://llm.internal/v1".into()),
            ("API__MODEL".into(), "local-70b".into()),
            ("MEMORY__ENABLED".into(), "true".into()),
            ("MEMORY__NEO4J__ENABLED".into(), "true".into()),
            ("MEMORY__NEO4J__URI".into(), "http://graph:7474".into()),
            ("MEMORY__NEO4J__USERNAME".into(), "neo4j".into()),
            ("MEMORY__NEO4J__PASSWORD".into(), "s3cret".into()),
            ("MEMORY__NEO4J__DATABASE".into(), "facts".into()),
        ],
    );
    let cfg: Config = serde_json::from_value(tree).unwrap();
    assert_eq!(cfg.api.api_key.as_deref(), Some("sk-live"));
    assert_eq!(cfg.api.model, "local-70b");
    assert!(cfg.memory.enabled);
    assert!(cfg.memory.neo4j.enabled);
    assert_eq!(cfg.memory.neo4j.username.as_deref(), Some("neo4j"));
    assert_eq!(cfg.memory.neo4j.password.as_deref(), Some("s3cret"));
    assert_eq!(cfg.memory.neo4j.database, "facts");
}

mod common;

use cadence_bridge::{BridgeValue, CallbackOutcome, CapabilityFlags, ResolverEventKind, ResultKind};
use common::{attach_scripted, call, registry_at};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ─── Fuzzy index ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reported_fuzzy_capability_enables_search() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let script = attach_scripted(&registry, "fuzzy", CapabilityFlags::NONE).await;

    let results = script
        .run(
            &registry,
            json!([
                call("reportCapabilities", json!([0b10])),
                call("hasFuzzyIndex", json!([])),
                call("createFuzzyIndex", json!(["[]"])),
                call(
                    "addToFuzzyIndex",
                    json!([r#"[{"title": "Songbird"}, {"title": "Song A"}]"#])
                ),
                call("search", json!(["song"])),
            ]),
        )
        .await;

    assert_eq!(results[1], BridgeValue::Bool(true));
    let BridgeValue::Str(matrix) = &results[4] else {
        panic!("search returned {:?}", results[4]);
    };
    let matrix: Vec<Vec<f64>> = serde_json::from_str(matrix).unwrap();
    assert_eq!(matrix.len(), 1);
    assert_eq!(matrix[0].len(), 2);
    assert!(matrix[0].iter().all(|s| *s > 0.0));
    assert!(matrix[0][1] > matrix[0][0], "exact term should win: {matrix:?}");

    registry.unload_all().await;
}

#[tokio::test]
async fn test_fuzzy_mutations_before_create_are_noops() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let script = attach_scripted(&registry, "early", CapabilityFlags::FUZZY_INDEX).await;

    let results = script
        .run(
            &registry,
            json!([
                call("addToFuzzyIndex", json!([r#"[{"title": "x"}]"#])),
                call("search", json!(["x"])),
                call("deleteFuzzyIndex", json!([])),
            ]),
        )
        .await;
    assert_eq!(results, vec![BridgeValue::Null; 3]);

    let gateway = registry.gateway("early").await.unwrap();
    assert_eq!(gateway.fuzzy().entry_count(), None);
    registry.unload_all().await;
}

#[tokio::test]
async fn test_delete_then_create_rebuilds_index() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let script = attach_scripted(&registry, "refresh", CapabilityFlags::FUZZY_INDEX).await;

    let results = script
        .run(
            &registry,
            json!([
                call("deleteFuzzyIndex", json!([])),
                call("createFuzzyIndex", json!(["[]"])),
                call("addToFuzzyIndex", json!([r#"[{"title": "Song A"}]"#])),
                call("search", json!(["song"])),
            ]),
        )
        .await;

    let BridgeValue::Str(matrix) = &results[3] else {
        panic!("search returned {:?}", results[3]);
    };
    let matrix: Vec<Vec<f64>> = serde_json::from_str(matrix).unwrap();
    assert_eq!(matrix.len(), 1);
    assert_eq!(matrix[0].len(), 1);
    assert!(matrix[0][0] > 0.0);

    let gateway = registry.gateway("refresh").await.unwrap();
    assert_eq!(gateway.fuzzy().entry_count(), Some(1));
    drop(gateway);
    registry.unload_all().await;
}

#[tokio::test]
async fn test_fuzzy_without_capability_is_always_noop() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let script = attach_scripted(&registry, "plain", CapabilityFlags::NONE).await;

    let results = script
        .run(
            &registry,
            json!([
                call("hasFuzzyIndex", json!([])),
                call("createFuzzyIndex", json!([r#"[{"title": "x"}]"#])),
                call("addToFuzzyIndex", json!([r#"[{"title": "y"}]"#])),
                call("search", json!(["x"])),
                call("searchStructured", json!(["x", "", ""])),
                call("deleteFuzzyIndex", json!([])),
            ]),
        )
        .await;
    assert_eq!(results[0], BridgeValue::Bool(false));
    assert!(results[1..].iter().all(|v| *v == BridgeValue::Null));
    registry.unload_all().await;
}

// ─── Key/value store ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = registry_at(dir.path());
    let script = attach_scripted(&first, "spotify", CapabilityFlags::NONE).await;
    script
        .run(&first, json!([call("set", json!(["lastQuery", "hello"]))]))
        .await;
    first.unload_all().await;

    let second = registry_at(dir.path());
    let script = attach_scripted(&second, "spotify", CapabilityFlags::NONE).await;
    let results = script
        .run(&second, json!([call("get", json!(["lastQuery"]))]))
        .await;
    assert_eq!(results, vec![BridgeValue::Str("hello".into())]);
    second.unload_all().await;
}

#[tokio::test]
async fn test_kv_round_trip_through_script() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let script = attach_scripted(&registry, "kv", CapabilityFlags::NONE).await;

    let results = script
        .run(
            &registry,
            json!([
                call("set", json!(["a", "1"])),
                call("set", json!(["b", "{\"nested\": true}"])),
                call("get", json!(["b"])),
                call("listKeys", json!([])),
                call("remove", json!(["a"])),
                call("get", json!(["a"])),
                call("listValues", json!([])),
            ]),
        )
        .await;
    assert_eq!(results[2], BridgeValue::Str("{\"nested\": true}".into()));
    assert_eq!(
        results[3],
        BridgeValue::List(vec![Some("a".into()), Some("b".into())])
    );
    assert_eq!(results[5], BridgeValue::Null);
    assert_eq!(
        results[6],
        BridgeValue::List(vec![Some("{\"nested\": true}".into())])
    );
    registry.unload_all().await;
}

#[tokio::test]
async fn test_list_values_aligned_under_concurrent_removal() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let _script = attach_scripted(&registry, "racy", CapabilityFlags::NONE).await;
    let gateway = registry.gateway("racy").await.unwrap();

    for i in 0..50 {
        gateway.set(&format!("key-{i:02}"), "v");
    }
    let remover = {
        let gateway = gateway.clone();
        std::thread::spawn(move || {
            for i in 0..50 {
                gateway.remove(&format!("key-{i:02}"));
            }
        })
    };
    for _ in 0..20 {
        let values = gateway.list_values();
        assert!(values.len() <= 50);
    }
    remover.join().unwrap();
    assert!(gateway.list_keys().is_empty());
    assert!(gateway.list_values().is_empty());

    drop(gateway);
    registry.unload_all().await;
}

// ─── Control surface ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_descriptor_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let script = attach_scripted(&registry, "desc", CapabilityFlags::NONE).await;

    let results = script
        .run(
            &registry,
            json!([call("descriptor", json!([])), call("descriptor", json!([]))]),
        )
        .await;
    assert_eq!(results[0], results[1]);
    let BridgeValue::Str(json) = &results[0] else {
        panic!("descriptor returned {:?}", results[0]);
    };
    let parsed: serde_json::Value = serde_json::from_str(json).unwrap();
    assert_eq!(parsed["scriptPath"], "desc/resolver.wasm");
    registry.unload_all().await;
}

#[tokio::test]
async fn test_results_reach_the_surface() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let script = attach_scripted(&registry, "results", CapabilityFlags::NONE).await;
    let surface = registry.surface("results").await.unwrap();
    let mut events = surface.subscribe();

    script
        .run(
            &registry,
            json!([call(
                "deliverResults",
                json!(["track", r#"{"qid": "q1", "results": [{"track": "Yellow", "artist": "Coldplay"}]}"#])
            )]),
        )
        .await;

    let event = events.recv().await.unwrap();
    assert!(matches!(
        event.kind,
        ResolverEventKind::Results { kind: ResultKind::Track, count: 1, .. }
    ));
    let playlist = surface.playlist_from_tracks("search", "q1");
    assert_eq!(playlist.len(), 1);
    assert_eq!(playlist.id(), 0);
    registry.unload_all().await;
}

// ─── Async request relay ─────────────────────────────────────────────────

#[tokio::test]
async fn test_success_callback_runs_once_on_script_thread() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(header("x-api-key", "secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("[]")
                .insert_header("x-total", "0"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let mut script = attach_scripted(&registry, "relay", CapabilityFlags::NONE).await;

    let results = script
        .run(
            &registry,
            json!([call(
                "asyncHttpRequest",
                json!([
                    format!("{}/search", server.uri()),
                    1,
                    r#"{"x-api-key": "secret"}"#,
                    null,
                    2
                ])
            )]),
        )
        .await;
    assert_eq!(results, vec![BridgeValue::Null]);

    let delivered = script.next_delivery().await;
    assert_eq!(delivered.thread.as_deref(), Some("script-relay"));
    assert_eq!(delivered.invocation.id, 1);
    assert_eq!(delivered.invocation.outcome, CallbackOutcome::Success);
    assert_eq!(delivered.invocation.reply.response_text, "[]");
    assert_eq!(delivered.invocation.reply.response_headers["x-total"], vec!["0"]);
    script.assert_no_more_deliveries().await;

    registry.unload_all().await;
}

#[tokio::test]
async fn test_valid_requests_fire_exactly_one_callback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/fail"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let mut script = attach_scripted(&registry, "exactly-once", CapabilityFlags::NONE).await;

    let cases = [
        (format!("{}/ok", server.uri()), json!(null), CallbackOutcome::Success),
        (
            format!("{}/fail", server.uri()),
            json!(r#"{"method": "post", "data": "q=1"}"#),
            CallbackOutcome::Error,
        ),
        ("http://127.0.0.1:1/".to_string(), json!(null), CallbackOutcome::Error),
    ];

    for (i, (url, options, expected)) in cases.into_iter().enumerate() {
        let success = (i as i64) * 10 + 1;
        let error = (i as i64) * 10 + 2;
        script
            .run(
                &registry,
                json!([call(
                    "asyncHttpRequest",
                    json!([url, success, null, options, error])
                )]),
            )
            .await;

        let delivered = script.next_delivery().await;
        assert_eq!(delivered.invocation.outcome, expected, "case {i}");
        let expected_id = match expected {
            CallbackOutcome::Success => success,
            CallbackOutcome::Error => error,
        };
        assert_eq!(delivered.invocation.id, expected_id, "case {i}");
        script.assert_no_more_deliveries().await;
    }

    let gateway = registry.gateway("exactly-once").await.unwrap();
    assert_eq!(gateway.callbacks().pending_count(), 0);
    drop(gateway);
    registry.unload_all().await;
}

#[tokio::test]
async fn test_transport_failure_reports_status_zero() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let mut script = attach_scripted(&registry, "offline", CapabilityFlags::NONE).await;

    script
        .run(
            &registry,
            json!([call(
                "asyncHttpRequest",
                json!(["http://127.0.0.1:1/", null, null, null, 7])
            )]),
        )
        .await;
    let delivered = script.next_delivery().await;
    assert_eq!(delivered.invocation.id, 7);
    assert_eq!(delivered.invocation.reply.status, 0);
    assert!(delivered.invocation.reply.response_text.is_empty());
    assert!(!delivered.invocation.reply.status_text.is_empty());
    registry.unload_all().await;
}

#[tokio::test]
async fn test_malformed_options_fire_no_callback() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_at(dir.path());
    let mut script = attach_scripted(&registry, "malformed", CapabilityFlags::NONE).await;

    let results = script
        .run(
            &registry,
            json!([call(
                "asyncHttpRequest",
                json!(["https://example.invalid/", 1, null, "{\"method\": ", 2])
            )]),
        )
        .await;
    assert_eq!(results, vec![BridgeValue::Null]);

    let gateway = registry.gateway("malformed").await.unwrap();
    assert_eq!(gateway.callbacks().pending_count(), 0);
    script.assert_no_more_deliveries().await;
    drop(gateway);
    registry.unload_all().await;
}

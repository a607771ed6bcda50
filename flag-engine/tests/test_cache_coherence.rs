use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::common::*;

use flag_engine::test_utils::{eventually, TestCluster};

pub mod common;

const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(2);

async fn value_on(server: &ServerHandle, key: &str) -> Value {
    server.evaluate(key, json!({"user_id": "u1"})).await["value"].clone()
}

async fn assert_mutation_propagates(cluster: TestCluster) -> Result<()> {
    let writer = ServerHandle::for_cluster(&cluster, "instance-a").await;
    let reader = ServerHandle::for_cluster(&cluster, "instance-b").await;

    let res = writer
        .post(
            "/admin/flags",
            &json!({"key": "banner", "name": "Banner", "type": "boolean", "default_value": true}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);

    // the reader caches the current value in its local tier
    assert_eq!(value_on(&reader, "banner").await, json!(true));

    let res = writer
        .patch(
            "/admin/flags/banner",
            &json!({"expected_version": 1, "is_enabled": false, "default_value": false}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);

    // well inside the local TTL, so only the broadcast can explain the change
    let propagated = eventually(PROPAGATION_TIMEOUT, || async {
        value_on(&reader, "banner").await == json!(false)
    })
    .await;
    assert!(propagated, "instance-b still serves the old value");
    Ok(())
}

#[tokio::test]
async fn it_propagates_mutations_over_the_local_bus() -> Result<()> {
    assert_mutation_propagates(TestCluster::new()).await
}

#[tokio::test]
async fn it_propagates_mutations_through_redis() -> Result<()> {
    assert_mutation_propagates(TestCluster::with_redis()).await
}

#[tokio::test]
async fn it_overwrites_the_shared_tier_on_mutation() -> Result<()> {
    let cluster = TestCluster::with_redis();
    let server = ServerHandle::for_cluster(&cluster, "instance-a").await;

    let res = server
        .post(
            "/admin/flags",
            &json!({"key": "banner", "name": "Banner", "type": "boolean", "default_value": true}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    value_on(&server, "banner").await;

    let redis = cluster.redis.as_ref().unwrap();
    assert!(redis.stored_value("flag_engine:flag:banner").is_some());

    let res = server
        .patch(
            "/admin/flags/banner",
            &json!({"expected_version": 1, "name": "Renamed"}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);

    // rewritten before the response, not merely dropped
    let raw = redis.stored_value("flag_engine:flag:banner").unwrap();
    let cached: Value = serde_json::from_str(&raw)?;
    assert_eq!(cached["definition"]["name"], json!("Renamed"));
    assert_eq!(cached["definition"]["version"], json!(2));
    Ok(())
}

#[tokio::test]
async fn it_keeps_evaluating_when_redis_is_down() -> Result<()> {
    let cluster = TestCluster::with_redis();
    let server = ServerHandle::for_cluster(&cluster, "instance-a").await;

    let res = server
        .post(
            "/admin/flags",
            &json!({"key": "banner", "name": "Banner", "type": "boolean", "default_value": true}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);

    cluster.redis.as_ref().unwrap().set_unavailable(true);

    // the store still answers, so this is not a degraded result
    let result = server.evaluate("banner", json!({"user_id": "u1"})).await;
    assert_eq!(result["value"], json!(true));
    assert_eq!(result["source"], json!("default"));
    Ok(())
}

use anyhow::Result;
use assert_json_diff::assert_json_include;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::common::*;

use flag_engine::test_utils::TestCluster;

pub mod common;

async fn setup() -> (TestCluster, ServerHandle) {
    let cluster = TestCluster::new();
    let server = ServerHandle::for_cluster(&cluster, "instance-a").await;
    let res = server
        .post(
            "/admin/flags",
            &json!({
                "key": "checkout",
                "name": "Checkout",
                "type": "percentage",
                "default_value": false,
                "percentage": 0,
            }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    (cluster, server)
}

fn next_advance_at(plan: &Value) -> DateTime<Utc> {
    plan["state"]["next_advance_at"]
        .as_str()
        .expect("plan is staged")
        .parse()
        .expect("timestamp")
}

async fn percentage(server: &ServerHandle) -> Value {
    server.get("/admin/flags/checkout").await.json::<Value>().await.unwrap()["percentage"].clone()
}

#[tokio::test]
async fn it_runs_a_staged_rollout_to_completion() -> Result<()> {
    let (_cluster, server) = setup().await;

    let res = server
        .post(
            "/admin/flags/checkout/rollout",
            &json!({"steps": [10, 50, 100], "step_interval_secs": 3600}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let plan = res.json::<Value>().await?;
    assert_json_include!(
        actual: plan.clone(),
        expected: json!({
            "flag_key": "checkout",
            "steps": [10, 50, 100],
            "state": {"status": "staged", "current_index": 0},
        })
    );
    assert_eq!(percentage(&server).await, json!(10));

    let controller = server.registry().rollouts();
    assert_eq!(controller.tick_at(next_advance_at(&plan)).await?, 1);
    assert_eq!(percentage(&server).await, json!(50));

    let plan = server.get("/admin/flags/checkout/rollout").await.json::<Value>().await?;
    assert_eq!(controller.tick_at(next_advance_at(&plan)).await?, 1);
    assert_eq!(percentage(&server).await, json!(100));

    let plan = server.get("/admin/flags/checkout/rollout").await.json::<Value>().await?;
    assert_eq!(plan["state"]["status"], json!("completed"));

    let result = server.evaluate("checkout", json!({"user_id": "u1"})).await;
    assert_json_include!(
        actual: result,
        expected: json!({"value": true, "source": "rollout"})
    );
    Ok(())
}

#[tokio::test]
async fn it_validates_rollout_requests() -> Result<()> {
    let (_cluster, server) = setup().await;

    for steps in [json!([]), json!([50, 10]), json!([10, 10]), json!([10, 101])] {
        let res = server
            .post(
                "/admin/flags/checkout/rollout",
                &json!({"steps": steps, "step_interval_secs": 60}),
            )
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "steps {steps}");
    }

    let missing = server
        .post(
            "/admin/flags/missing/rollout",
            &json!({"steps": [10], "step_interval_secs": 60}),
        )
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let no_plan = server.get("/admin/flags/checkout/rollout").await;
    assert_eq!(no_plan.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn it_kills_a_flag_mid_rollout() -> Result<()> {
    let (_cluster, server) = setup().await;

    let res = server
        .post(
            "/admin/flags/checkout/rollout",
            &json!({"steps": [10, 50, 100], "step_interval_secs": 3600}),
        )
        .await;
    let plan = res.json::<Value>().await?;
    server
        .registry()
        .rollouts()
        .tick_at(next_advance_at(&plan))
        .await?;
    assert_eq!(percentage(&server).await, json!(50));

    let override_res = server
        .post(
            "/admin/flags/checkout/overrides",
            &json!({"user_id": "vip", "value": true}),
        )
        .await;
    assert_eq!(override_res.status(), StatusCode::CREATED);

    let empty_reason = server
        .post("/admin/flags/checkout/kill_switch", &json!({"reason": "  "}))
        .await;
    assert_eq!(empty_reason.status(), StatusCode::BAD_REQUEST);

    let audit_before = server
        .get("/admin/flags/checkout/audit")
        .await
        .json::<Value>()
        .await?
        .as_array()
        .unwrap()
        .len();

    let res = server
        .post(
            "/admin/flags/checkout/kill_switch",
            &json!({"reason": "checkout errors spiking"}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_json_include!(
        actual: res.json::<Value>().await?,
        expected: json!({"is_enabled": false, "percentage": 0})
    );

    for user in ["vip", "u1", "u2"] {
        let result = server.evaluate("checkout", json!({"user_id": user})).await;
        assert_json_include!(
            actual: result,
            expected: json!({"value": false, "source": "disabled"})
        );
    }

    let records = server
        .get("/admin/flags/checkout/audit")
        .await
        .json::<Value>()
        .await?;
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), audit_before + 1);
    assert_json_include!(
        actual: records[0].clone(),
        expected: json!({
            "action": "disabled",
            "reason": "checkout errors spiking",
            "emergency": true,
            "actor": ACTOR,
        })
    );

    let plan = server.get("/admin/flags/checkout/rollout").await.json::<Value>().await?;
    assert_json_include!(
        actual: plan,
        expected: json!({
            "state": {"status": "aborted", "reason": "kill switch: checkout errors spiking"}
        })
    );
    Ok(())
}

#[tokio::test]
async fn it_aborts_on_a_tripped_guardrail() -> Result<()> {
    let (_cluster, server) = setup().await;

    let plan = server
        .post(
            "/admin/flags/checkout/rollout",
            &json!({"steps": [10, 50], "step_interval_secs": 60}),
        )
        .await
        .json::<Value>()
        .await?;

    let res = server
        .post(
            "/admin/flags/checkout/guardrail",
            &json!({"reason": "p99 latency regression"}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    server
        .registry()
        .rollouts()
        .tick_at(next_advance_at(&plan))
        .await?;

    assert_eq!(percentage(&server).await, json!(10));
    let plan = server.get("/admin/flags/checkout/rollout").await.json::<Value>().await?;
    assert_json_include!(
        actual: plan,
        expected: json!({
            "state": {"status": "aborted", "reason": "guardrail: p99 latency regression"}
        })
    );
    Ok(())
}

#[tokio::test]
async fn it_aborts_a_rollout_on_request() -> Result<()> {
    let (_cluster, server) = setup().await;

    server
        .post(
            "/admin/flags/checkout/rollout",
            &json!({"steps": [10, 50], "step_interval_secs": 60}),
        )
        .await;

    let res = server
        .post(
            "/admin/flags/checkout/rollout/abort",
            &json!({"reason": "holding for the launch"}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);

    let again = server
        .post(
            "/admin/flags/checkout/rollout/abort",
            &json!({"reason": "twice"}),
        )
        .await;
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);

    // the flag keeps the percentage it had reached
    assert_eq!(percentage(&server).await, json!(10));
    Ok(())
}

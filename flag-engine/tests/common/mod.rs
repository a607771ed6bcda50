#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use flag_engine::config::{Config, DEFAULT_TEST_CONFIG};
use flag_engine::registry::Registry;
use flag_engine::server::{serve, serve_registry};
use flag_engine::test_utils::TestCluster;

pub const ACTOR: &str = "admin@example.com";

pub struct ServerHandle {
    pub addr: SocketAddr,
    /// Set when the server was built from a test cluster, so tests can drive
    /// the rollout controller or break the store directly.
    pub registry: Option<Arc<Registry>>,
    shutdown: Arc<Notify>,
    client: reqwest::Client,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            registry: None,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    /// One instance of a multi-instance deployment sharing `cluster`'s
    /// store, Redis and bus.
    pub async fn for_cluster(cluster: &TestCluster, instance_id: &str) -> ServerHandle {
        let config = DEFAULT_TEST_CONFIG.clone();
        let registry = Arc::new(Registry::new(instance_id, cluster.backends(), &config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let served = registry.clone();
        tokio::spawn(async move {
            serve_registry(served, &config, listener, async move {
                notify.notified().await
            })
            .await
        });
        ServerHandle {
            addr,
            registry: Some(registry),
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        self.registry
            .as_deref()
            .expect("server was not built from a test cluster")
    }

    fn url(&self, path: &str) -> String {
        format!("http://{:?}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn post(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(CONTENT_TYPE, "application/json")
            .header("x-actor", ACTOR)
            .body(body.to_string())
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn post_raw(&self, path: &str, body: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(CONTENT_TYPE, "application/json")
            .header("x-actor", ACTOR)
            .body(body.to_string())
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn post_anonymous(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn patch(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .patch(self.url(path))
            .header(CONTENT_TYPE, "application/json")
            .header("x-actor", ACTOR)
            .body(body.to_string())
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .header("x-actor", ACTOR)
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn evaluate(&self, key: &str, context: Value) -> Value {
        let res = self
            .post(
                "/flags/evaluate",
                &serde_json::json!({"key": key, "context": context}),
            )
            .await;
        assert_eq!(res.status(), reqwest::StatusCode::OK);
        res.json::<Value>().await.expect("evaluation is json")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}

// tests/fleet_http.rs
//! End-to-end routing against in-process HTTP workers
//!
//! The test launcher starts a hyper server per "process", binding the port it
//! reads from the `{AGENT_TYPE}_PORT` variable, exactly as a real worker must.

use agent_fleet::coordinator::Coordinator;
use agent_fleet::fleet::{
    KillOutcome, LaunchSpec, PortProbe, ProcessHandle, ProcessLauncher, TcpPortProbe, Termination,
};
use agent_fleet::gateway::Gateway;
use agent_fleet::routing::{HttpTransport, RouteResponse};
use agent_fleet::utils::config::{port_env_var, AgentTypeConfig, CoordinatorConfig, SpawnerConfig};
use agent_fleet::{FleetError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};

/// Ports whose workers answer 500
type FailingPorts = Arc<Mutex<HashSet<u16>>>;

#[derive(Debug)]
struct InProcessWorker {
    pid: u32,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ProcessHandle for InProcessWorker {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    fn terminate(&self, _mode: Termination) -> Result<()> {
        // aborting drops the listener and every connection it served
        self.task.abort();
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct InProcessLauncher {
    next_pid: AtomicU32,
    failing: FailingPorts,
}

impl ProcessLauncher for InProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
        let var = port_env_var(&spec.agent_type);
        let port: u16 = spec
            .env
            .iter()
            .find(|(key, _)| *key == var)
            .and_then(|(_, value)| value.parse().ok())
            .ok_or_else(|| FleetError::SpawnFailed {
                agent_type: spec.agent_type.clone(),
                reason: format!("{} not set", var),
            })?;

        let listener = std::net::TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;

        let failing = Arc::clone(&self.failing);
        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            while let Ok((stream, _)) = listener.accept().await {
                let failing = Arc::clone(&failing);
                connections.spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let failing = Arc::clone(&failing);
                        async move {
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                            let (status, reply) = if failing.lock().contains(&port) {
                                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "boom"}))
                            } else {
                                (StatusCode::OK, json!({"port": port, "echo": payload}))
                            };
                            let mut response = Response::new(Full::new(Bytes::from(reply.to_string())));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Ok(Arc::new(InProcessWorker {
            pid: 50_000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            alive: Arc::new(AtomicBool::new(true)),
            task,
        }))
    }
}

fn config(base_port: u16, min: usize, max: usize) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.spawner = SpawnerConfig {
        startup_grace_ms: 20,
        startup_attempts: 3,
        kill_grace_ms: 100,
        ..Default::default()
    };
    config.agents.insert(
        "odds".into(),
        AgentTypeConfig::new("in-process", base_port).with_bounds(min, max),
    );
    config
}

fn coordinator(config: CoordinatorConfig, launcher: Arc<InProcessLauncher>) -> Arc<Coordinator> {
    Arc::new(
        Coordinator::with_components(
            config,
            launcher,
            Arc::new(TcpPortProbe::default()),
            Arc::new(HttpTransport::default()),
        )
        .unwrap(),
    )
}

async fn post(addr: std::net::SocketAddr, path: &str, body: &str) -> (StatusCode, Value) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let request = Request::post(format!("http://{}{}", addr, path))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();
    let response = client.request(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_routes_through_gateway() {
    let launcher = Arc::new(InProcessLauncher::default());
    let coordinator = coordinator(config(41_210, 2, 3), Arc::clone(&launcher));
    coordinator.start().await;
    assert_eq!(coordinator.registry().list_healthy("odds").len(), 2);

    let gateway = Gateway::bind(Arc::clone(&coordinator), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = gateway.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(gateway.serve(async move {
        let _ = stop_rx.await;
    }));

    let (status, body) = post(addr, "/route/odds", r#"{"fixture": 42}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["echo"]["fixture"], 42);

    let (status, body) = post(addr, "/route/tennis", "{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");

    let (status, _) = post(addr, "/route/odds", "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(addr, "/elsewhere", "{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let _ = stop_tx.send(());
    server.await.unwrap();
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_failover_between_workers() {
    let launcher = Arc::new(InProcessLauncher::default());
    let coordinator = coordinator(config(41_220, 2, 3), Arc::clone(&launcher));
    coordinator.start().await;

    let instances = coordinator.registry().list("odds");
    let broken = instances[0].port;
    launcher.failing.lock().insert(broken);

    let response = coordinator.route("odds", &json!({"q": 1})).await;
    match response {
        RouteResponse::Success { attempts, body, .. } => {
            assert_eq!(attempts, 2);
            assert_eq!(body["port"], instances[1].port);
        }
        RouteResponse::Error(e) => panic!("expected failover, got {:?}", e),
    }

    let healthy: Vec<u16> = coordinator
        .registry()
        .list_healthy("odds")
        .iter()
        .map(|i| i.port)
        .collect();
    assert_eq!(healthy, vec![instances[1].port]);
    assert_eq!(coordinator.registry().active_connections("odds"), 0);

    // both broken: terminal error after the single failover
    launcher.failing.lock().insert(instances[1].port);
    coordinator.registry().mark_healthy("odds", &instances[0].id);
    let response = coordinator.route("odds", &json!({"q": 2})).await;
    assert!(!response.is_success());
    assert_eq!(response.into_json()["status"], "error");

    let stats = coordinator.stats();
    assert_eq!(stats.total_routes, 2);
    assert_eq!(stats.successful_routes, 1);
    assert_eq!(stats.failed_routes, 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_kill_releases_port() {
    let launcher = Arc::new(InProcessLauncher::default());
    let coordinator = coordinator(config(41_230, 0, 2), Arc::clone(&launcher));

    let instance = coordinator.spawner().spawn("odds", None).await.unwrap();
    let probe = TcpPortProbe::default();
    assert!(probe.is_accepting(instance.port).await);

    let outcome = coordinator.spawner().kill("odds", &instance.id).await;
    assert_eq!(outcome, KillOutcome::ConfirmedDead);
    assert_eq!(coordinator.registry().count("odds"), 0);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(probe.is_free(instance.port));
    assert_eq!(
        coordinator.spawner().find_available_port("odds"),
        Some(instance.port)
    );
}

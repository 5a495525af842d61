#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_agent::config::AgentConfig;
use tether_agent::{builtin, AgentState};
use tether_common::{CipherSpec, HeartbeatConfig, SessionKey};
use tether_controller::config::ControllerConfig;
use tether_controller::{connect, ConnectOptions, RemoteAgent};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const SECRET: &[u8] = b"integration secret";

pub fn test_config(listen: SocketAddr) -> AgentConfig {
    AgentConfig {
        listen,
        metrics_addr: None,
        slots: 2,
        kill_grace: Duration::from_millis(500),
        banner: "test agent".into(),
        session_key: None,
        cipher: CipherSpec::default(),
    }
}

pub struct TestAgent {
    pub addr: SocketAddr,
    pub state: Arc<AgentState>,
    pub shutdown: CancellationToken,
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_agent(slots: usize, encrypted: bool) -> TestAgent {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    config.slots = slots;
    let key = encrypted.then(|| SessionKey::derive(SECRET, config.cipher).unwrap());
    let state = Arc::new(AgentState::new(config, builtin::registry(), key));
    let shutdown = CancellationToken::new();

    let server_state = Arc::clone(&state);
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tether_agent::run_with_shutdown(listener, server_state, server_shutdown).await {
            eprintln!("agent error in test: {e}");
        }
    });

    TestAgent {
        addr,
        state,
        shutdown,
    }
}

pub fn controller_config(addr: SocketAddr) -> ControllerConfig {
    ControllerConfig {
        agent: addr.to_string(),
        connect_timeout_ms: 5_000,
        ..ControllerConfig::default()
    }
}

pub async fn connect_with(addr: SocketAddr, encrypted: bool, heartbeat: HeartbeatConfig) -> RemoteAgent {
    let options = ConnectOptions {
        session_key: encrypted.then(|| SessionKey::derive(SECRET, CipherSpec::default()).unwrap()),
        heartbeat,
    };
    connect(&controller_config(addr), &options).await.unwrap()
}

pub async fn connect_plain(addr: SocketAddr) -> RemoteAgent {
    connect_with(addr, false, HeartbeatConfig::default()).await
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

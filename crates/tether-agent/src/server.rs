use crate::config::AgentConfig;
use crate::dispatch::serve;
use crate::error::AgentError;
use crate::metrics::gauges;
use crate::slot::SlotPool;
use crate::task::TaskRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_common::marker::MARK;
use tether_common::types::PROTOCOL_VERSION;
use tether_common::{Cause, Role, SecureConnection, SecurityPolicy, SessionKey};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state for the agent daemon.
pub struct AgentState {
    /// Runtime agent configuration.
    pub config: AgentConfig,
    /// Slots every connection submits into.
    pub pool: Arc<SlotPool>,
    /// Handlers tasks are resolved against.
    pub registry: Arc<TaskRegistry>,
    /// Key to upgrade connections with. Plaintext when `None`.
    pub session_key: Option<SessionKey>,
}

impl AgentState {
    /// Builds the state and provisions the slot pool. Must be called inside
    /// a tokio runtime.
    #[must_use]
    pub fn new(config: AgentConfig, registry: TaskRegistry, session_key: Option<SessionKey>) -> Self {
        let pool = Arc::new(SlotPool::new(config.slots, config.kill_grace));
        Self {
            config,
            pool,
            registry: Arc::new(registry),
            session_key,
        }
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<AgentState>) -> Result<(), AgentError> {
    run_with_shutdown(listener, state, CancellationToken::new()).await
}

/// Run the accept loop with an externally-controlled shutdown signal.
///
/// Once `shutdown` is cancelled the loop stops accepting, drops open
/// connections, interrupts every running task and waits for the connection
/// tasks to finish.
///
/// # Errors
///
/// Returns an error if the listener address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<AgentState>,
    shutdown: CancellationToken,
) -> Result<(), AgentError> {
    let local_addr = listener.local_addr()?;
    info!(
        slots = state.config.slots,
        encrypted = state.session_key.is_some(),
        "agent listening on {}",
        local_addr
    );
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            tokio::select! {
                                result = handle_connection(stream, addr, state) => {
                                    if let Err(e) = result {
                                        debug!("connection from {} ended: {}", addr, e);
                                    }
                                }
                                () = shutdown.cancelled() => {
                                    debug!("dropping connection from {} for shutdown", addr);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            () = shutdown.cancelled() => {
                info!("shutdown signal received, draining {} connections", connections.len());
                break;
            }
        }
    }

    let interrupted = state.pool.interrupt_all(&[Cause::ChannelClosed {
        detail: "agent shutting down".into(),
    }]);
    if interrupted > 0 {
        info!(interrupted, "interrupted running tasks");
    }

    let drain_timeout = std::time::Duration::from_secs(30);
    if tokio::time::timeout(drain_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!(
            "drain timeout reached with {} connections still active",
            connections.len()
        );
        connections.abort_all();
    }

    info!("agent shut down gracefully");
    Ok(())
}

/// Writes the banner and marker, sets up the channel and serves it.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    state: Arc<AgentState>,
) -> Result<(), AgentError> {
    info!(peer = %addr, "controller connected");
    stream.set_nodelay(true)?;
    let banner = format!("{} ({PROTOCOL_VERSION})\n", state.config.banner);
    stream.write_all(banner.as_bytes()).await?;
    stream.write_all(MARK).await?;
    stream.flush().await?;

    let (rd, wr) = stream.into_split();
    let mut conn = SecureConnection::open(rd, wr, SecurityPolicy::agent());
    if let Some(key) = &state.session_key {
        conn.upgrade(key, Role::Agent).await?;
    }

    gauges::inc_connections_active();
    let result = serve(conn, Arc::clone(&state.pool), Arc::clone(&state.registry)).await;
    gauges::dec_connections_active();
    info!(peer = %addr, "controller disconnected");
    Ok(result?)
}

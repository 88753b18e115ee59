//! Broker lifecycle: the control listener and the set of attached agents.

use crate::config::BrokerConfig;
use crate::session::{self, AgentMap, SessionEvent};
use burrow_core::{TunnelError, TunnelResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// The public rendezvous point: accepts agent control connections and
/// exposes one public port per agent.
pub struct Broker {
    local_addr: SocketAddr,
    accept_cancel: mpsc::Sender<()>,
    agents: AgentMap,
}

impl Broker {
    /// Bind the control listener and start accepting agents.
    ///
    /// Returns [`TunnelError::Bind`] when the configured port is taken.
    pub async fn start(config: BrokerConfig) -> TunnelResult<Self> {
        let listener = TcpListener::bind((config.bind_ip, config.port))
            .await
            .map_err(TunnelError::Bind)?;
        let local_addr = listener.local_addr().map_err(TunnelError::Bind)?;
        info!(addr = %local_addr, "broker listening for agents");

        let agents: AgentMap = Arc::new(Mutex::new(HashMap::new()));
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        tokio::spawn(accept_loop(listener, cancel_rx, agents.clone(), config));

        Ok(Self {
            local_addr,
            accept_cancel: cancel_tx,
            agents,
        })
    }

    /// The bound address of the control listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tear everything down: the control listener, every agent's public
    /// listener, every user connection, every control channel. Idempotent.
    pub async fn stop(&self) {
        let _ = self.accept_cancel.send(()).await;
        let agents: Vec<(u64, mpsc::Sender<SessionEvent>)> =
            self.agents.lock().await.drain().collect();
        for (agent_id, events) in agents {
            debug!(agent_id, "stopping agent session");
            let _ = events.send(SessionEvent::Shutdown).await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    agents: AgentMap,
    config: BrokerConfig,
) {
    let mut next_agent_id: u64 = 1;
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("agent accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let agent_id = next_agent_id;
                        next_agent_id += 1;
                        info!(agent_id, peer = %peer, "agent control connection accepted");
                        if let Err(e) =
                            session::attach(agent_id, stream, &config, agents.clone()).await
                        {
                            warn!(agent_id, error = %e, "agent attach failed");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "agent accept failed");
                    }
                }
            }
        }
    }
}

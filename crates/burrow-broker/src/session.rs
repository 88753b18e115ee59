//! Per-agent session actor.
//!
//! One actor task per attached agent owns the control-channel write half
//! and the session-id → user-connection map. The user acceptor, per-user
//! readers, and the control reader all feed it events through an `mpsc`
//! channel, so control writes are serialized and a session lookup can
//! never race a concurrent close.

use burrow_core::{
    read_frame, write_frame, Frame, FrameType, TunnelError, TunnelResult, CONTROL_SESSION,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;

/// Read buffer for forwarded sockets.
const READ_BUF: usize = 8192;

/// Attached agents, keyed by agent id. Shared between the broker's accept
/// loop (insert), `Broker::stop` (drain), and each actor (self-removal).
pub(crate) type AgentMap = Arc<Mutex<HashMap<u64, mpsc::Sender<SessionEvent>>>>;

/// Events driving a per-agent session actor.
pub(crate) enum SessionEvent {
    /// A user connected on this agent's public port.
    UserConnected(TcpStream),
    /// Bytes read from a user socket, to forward to the agent.
    UserData { session: i32, bytes: Vec<u8> },
    /// A user socket hit EOF or failed.
    UserEof { session: i32 },
    /// A frame arrived on the control channel.
    AgentFrame(Frame),
    /// The control channel closed or failed.
    ControlClosed,
    /// `Broker::stop` wants this agent gone.
    Shutdown,
}

/// Whether the actor keeps running after handling an event.
enum Flow {
    Continue,
    Stop,
}

/// Bind a public listener for a freshly accepted agent, announce its port,
/// and start the actor plus its acceptor and control-reader tasks.
///
/// Registers the actor in `agents` before it starts; the actor removes
/// itself on exit.
pub(crate) async fn attach(
    agent_id: u64,
    control: TcpStream,
    config: &BrokerConfig,
    agents: AgentMap,
) -> TunnelResult<()> {
    let public_listener = TcpListener::bind((config.bind_ip, 0))
        .await
        .map_err(TunnelError::Bind)?;
    let public_addr = public_listener.local_addr().map_err(TunnelError::Bind)?;

    let (control_read, mut control_write) = control.into_split();

    // The handshake must be the first frame on the channel, sent before
    // any user can be accepted. The timeout stops a stalled agent from
    // wedging the accept path.
    let handshake = Frame::handshake(public_addr.port());
    match time::timeout(config.handshake_timeout, write_frame(&mut control_write, &handshake)).await
    {
        Ok(result) => result?,
        Err(_) => return Err(TunnelError::Timeout),
    }
    info!(agent_id, public = %public_addr, "tunnel attached, public port announced");

    let (events_tx, events_rx) = mpsc::channel(256);
    let (accept_cancel_tx, accept_cancel_rx) = mpsc::channel::<()>(1);

    agents.lock().await.insert(agent_id, events_tx.clone());

    tokio::spawn(user_accept_loop(
        public_listener,
        accept_cancel_rx,
        events_tx.clone(),
        agent_id,
    ));
    tokio::spawn(control_read_loop(control_read, events_tx.clone(), agent_id));

    let actor = AgentSession {
        agent_id,
        control_write,
        users: HashMap::new(),
        next_session: 1,
        accept_cancel: accept_cancel_tx,
        events_tx,
    };
    tokio::spawn(async move {
        actor.run(events_rx).await;
        agents.lock().await.remove(&agent_id);
        debug!(agent_id, "agent session ended");
    });

    Ok(())
}

struct AgentSession {
    agent_id: u64,
    /// Sole writer to the control channel.
    control_write: OwnedWriteHalf,
    /// Write halves of the user connections; the read halves live in
    /// their reader tasks.
    users: HashMap<i32, OwnedWriteHalf>,
    /// Monotonic session-id counter; ids are never reused on a channel.
    next_session: i32,
    /// Cancels the user accept loop, closing the public listener.
    accept_cancel: mpsc::Sender<()>,
    /// Handed to user readers spawned by this actor.
    events_tx: mpsc::Sender<SessionEvent>,
}

impl AgentSession {
    async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            let flow = match event {
                SessionEvent::UserConnected(stream) => self.on_user_connected(stream).await,
                SessionEvent::UserData { session, bytes } => {
                    self.on_user_data(session, bytes).await
                }
                SessionEvent::UserEof { session } => self.on_user_eof(session).await,
                SessionEvent::AgentFrame(frame) => self.on_agent_frame(frame).await,
                SessionEvent::ControlClosed => {
                    debug!(agent_id = self.agent_id, "control channel closed");
                    Ok(Flow::Stop)
                }
                SessionEvent::Shutdown => Ok(Flow::Stop),
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    warn!(agent_id = self.agent_id, error = %e, "agent session failed");
                    break;
                }
            }
        }
        self.teardown().await;
    }

    async fn on_user_connected(&mut self, stream: TcpStream) -> TunnelResult<Flow> {
        let session = self.next_session;
        self.next_session += 1;

        let (read_half, write_half) = stream.into_split();
        self.users.insert(session, write_half);
        write_frame(&mut self.control_write, &Frame::open(session)).await?;
        debug!(agent_id = self.agent_id, session, "user session opened");

        // Spawned after the Open frame is out, so Data can never precede it.
        tokio::spawn(user_read_loop(
            read_half,
            session,
            self.events_tx.clone(),
            self.agent_id,
        ));
        Ok(Flow::Continue)
    }

    async fn on_user_data(&mut self, session: i32, bytes: Vec<u8>) -> TunnelResult<Flow> {
        // A session the agent already closed must not produce more frames.
        if !self.users.contains_key(&session) {
            return Ok(Flow::Continue);
        }
        write_frame(&mut self.control_write, &Frame::data(session, bytes)).await?;
        Ok(Flow::Continue)
    }

    async fn on_user_eof(&mut self, session: i32) -> TunnelResult<Flow> {
        if self.users.remove(&session).is_some() {
            debug!(agent_id = self.agent_id, session, "user disconnected");
            write_frame(&mut self.control_write, &Frame::close(session)).await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_agent_frame(&mut self, frame: Frame) -> TunnelResult<Flow> {
        match frame.frame_type {
            FrameType::Data => {
                if frame.session == CONTROL_SESSION {
                    return Err(TunnelError::Protocol("data frame on control session".into()));
                }
                let Some(conn) = self.users.get_mut(&frame.session) else {
                    // The user already closed; the agent's Close is in flight.
                    debug!(
                        agent_id = self.agent_id,
                        session = frame.session,
                        "dropping data for closed user session"
                    );
                    return Ok(Flow::Continue);
                };
                if let Err(e) = conn.write_all(&frame.payload).await {
                    debug!(
                        agent_id = self.agent_id,
                        session = frame.session,
                        error = %e,
                        "user write failed"
                    );
                    self.users.remove(&frame.session);
                    write_frame(&mut self.control_write, &Frame::close(frame.session)).await?;
                }
                Ok(Flow::Continue)
            }
            FrameType::Close if frame.session == CONTROL_SESSION => {
                info!(agent_id = self.agent_id, "agent requested teardown");
                Ok(Flow::Stop)
            }
            FrameType::Close => {
                if self.users.remove(&frame.session).is_some() {
                    debug!(
                        agent_id = self.agent_id,
                        session = frame.session,
                        "user session closed by agent"
                    );
                }
                Ok(Flow::Continue)
            }
            FrameType::Open => {
                Err(TunnelError::Protocol("unexpected open frame from agent".into()))
            }
        }
    }

    /// Cascading teardown: public listener first, then every user
    /// connection, then the control channel. Dropping a write half sends
    /// FIN, so users and agent observe EOF.
    async fn teardown(mut self) {
        let _ = self.accept_cancel.send(()).await;
        let sessions = self.users.len();
        self.users.clear();
        info!(agent_id = self.agent_id, sessions, "agent torn down");
    }
}

async fn user_accept_loop(
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    events: mpsc::Sender<SessionEvent>,
    agent_id: u64,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(agent_id, "user accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(agent_id, peer = %peer, "user connection accepted");
                        if events.send(SessionEvent::UserConnected(stream)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(agent_id, error = %e, "user accept failed");
                    }
                }
            }
        }
    }
}

async fn user_read_loop(
    mut read_half: OwnedReadHalf,
    session: i32,
    events: mpsc::Sender<SessionEvent>,
    agent_id: u64,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let event = SessionEvent::UserData {
                    session,
                    bytes: buf[..n].to_vec(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(agent_id, session, error = %e, "user read failed");
                break;
            }
        }
    }
    let _ = events.send(SessionEvent::UserEof { session }).await;
}

async fn control_read_loop(
    mut read_half: OwnedReadHalf,
    events: mpsc::Sender<SessionEvent>,
    agent_id: u64,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(frame) => {
                if events.send(SessionEvent::AgentFrame(frame)).await.is_err() {
                    return;
                }
            }
            Err(TunnelError::Eof) => {
                debug!(agent_id, "agent closed control channel");
                break;
            }
            Err(e) => {
                warn!(agent_id, error = %e, "control channel read failed");
                break;
            }
        }
    }
    let _ = events.send(SessionEvent::ControlClosed).await;
}

//! The agent-side tunnel: control loop and dial-on-demand sessions.
//!
//! Mirrors the broker's actor layout: one task owns the control write
//! half and the session-id → protected-connection map; the control reader
//! and per-session protected readers feed it events over `mpsc`.

use burrow_core::{
    read_frame, write_frame, Frame, FrameType, TunnelError, TunnelResult, CONTROL_SESSION,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

/// Read buffer for forwarded sockets.
const READ_BUF: usize = 8192;

/// How long to wait for the broker's port-announcement frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Events driving the tunnel actor.
enum TunnelEvent {
    /// A frame arrived on the control channel.
    BrokerFrame(Frame),
    /// Bytes read from a protected-service socket.
    ProtectedData { session: i32, bytes: Vec<u8> },
    /// A protected-service socket hit EOF or failed.
    ProtectedEof { session: i32 },
    /// The control channel closed or failed.
    ControlClosed,
    /// `Tunnel::stop` was called.
    Shutdown,
}

/// Whether the actor keeps running after handling an event.
enum Flow {
    Continue,
    Stop,
}

/// An open tunnel to a broker.
///
/// Dropping the handle does not stop the tunnel; call [`Tunnel::stop`].
#[derive(Debug)]
pub struct Tunnel {
    public_port: u16,
    events: mpsc::Sender<TunnelEvent>,
}

impl Tunnel {
    /// Dial the broker, consume the handshake frame, and start relaying.
    ///
    /// Returns [`TunnelError::Connect`] when the broker cannot be reached
    /// and [`TunnelError::Handshake`] when the first frame does not
    /// announce a public port within five seconds.
    pub async fn open(protected_port: u16, broker_addr: impl ToSocketAddrs) -> TunnelResult<Self> {
        let stream = TcpStream::connect(broker_addr)
            .await
            .map_err(TunnelError::Connect)?;
        let broker = stream.peer_addr().map_err(TunnelError::Connect)?;
        info!(broker = %broker, "control connection established");

        let (mut control_read, control_write) = stream.into_split();

        // The first frame must be the handshake announcing the public port.
        let handshake = match time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut control_read)).await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                return Err(TunnelError::Handshake(format!("reading handshake: {e}")));
            }
            Err(_) => {
                return Err(TunnelError::Handshake("no handshake frame within 5s".into()));
            }
        };
        let public_port = handshake.handshake_port().ok_or_else(|| {
            TunnelError::Handshake("first frame did not announce a public port".into())
        })?;
        info!(public_port, protected_port, "tunnel open");

        let (events_tx, events_rx) = mpsc::channel(256);
        tokio::spawn(control_read_loop(control_read, events_tx.clone()));

        let actor = TunnelActor {
            protected_port,
            control_write,
            sessions: HashMap::new(),
            events_tx: events_tx.clone(),
        };
        tokio::spawn(actor.run(events_rx));

        Ok(Self {
            public_port,
            events: events_tx,
        })
    }

    /// The public port users hit on the broker to reach the service.
    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    /// Announce teardown to the broker (best effort), close every
    /// protected connection and the control channel. Idempotent.
    pub async fn stop(&self) {
        let _ = self.events.send(TunnelEvent::Shutdown).await;
    }
}

struct TunnelActor {
    protected_port: u16,
    /// Sole writer to the control channel.
    control_write: OwnedWriteHalf,
    /// Write halves of the protected-service connections.
    sessions: HashMap<i32, OwnedWriteHalf>,
    /// Handed to protected readers spawned by this actor.
    events_tx: mpsc::Sender<TunnelEvent>,
}

impl TunnelActor {
    async fn run(mut self, mut events: mpsc::Receiver<TunnelEvent>) {
        let mut announce = false;
        while let Some(event) = events.recv().await {
            let flow = match event {
                TunnelEvent::BrokerFrame(frame) => self.on_broker_frame(frame).await,
                TunnelEvent::ProtectedData { session, bytes } => {
                    self.on_protected_data(session, bytes).await
                }
                TunnelEvent::ProtectedEof { session } => self.on_protected_eof(session).await,
                TunnelEvent::ControlClosed => {
                    debug!("control channel closed by broker");
                    Ok(Flow::Stop)
                }
                TunnelEvent::Shutdown => {
                    announce = true;
                    Ok(Flow::Stop)
                }
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    warn!(error = %e, "tunnel failed");
                    break;
                }
            }
        }
        self.teardown(announce).await;
    }

    async fn on_broker_frame(&mut self, frame: Frame) -> TunnelResult<Flow> {
        if frame.session == CONTROL_SESSION {
            return match frame.frame_type {
                // Broker teardown normally arrives as plain EOF; honor an
                // explicit close as well.
                FrameType::Close => Ok(Flow::Stop),
                _ => Err(TunnelError::Protocol(
                    "unexpected control-session frame after handshake".into(),
                )),
            };
        }

        match frame.frame_type {
            FrameType::Open => {
                if self.sessions.contains_key(&frame.session) {
                    debug!(session = frame.session, "session already open");
                    return Ok(Flow::Continue);
                }
                self.open_session(frame.session).await?;
                Ok(Flow::Continue)
            }
            FrameType::Data => {
                // An unknown session is opened lazily: a safety net for
                // the case where the broker's Open never arrived.
                if !self.sessions.contains_key(&frame.session) {
                    debug!(session = frame.session, "implicit open on first data");
                    self.open_session(frame.session).await?;
                }
                let Some(conn) = self.sessions.get_mut(&frame.session) else {
                    // Dial failed and Close is already on its way out.
                    return Ok(Flow::Continue);
                };
                if let Err(e) = conn.write_all(&frame.payload).await {
                    debug!(session = frame.session, error = %e, "protected write failed");
                    self.sessions.remove(&frame.session);
                    write_frame(&mut self.control_write, &Frame::close(frame.session)).await?;
                }
                Ok(Flow::Continue)
            }
            FrameType::Close => {
                if self.sessions.remove(&frame.session).is_some() {
                    debug!(session = frame.session, "session closed by broker");
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Dial the protected service for a new session. A refused dial is
    /// per-session: the broker gets a Close and the tunnel keeps running.
    async fn open_session(&mut self, session: i32) -> TunnelResult<()> {
        let target = (Ipv4Addr::LOCALHOST, self.protected_port);
        match TcpStream::connect(target).await {
            Ok(stream) => {
                debug!(session, port = self.protected_port, "protected connection opened");
                let (read_half, write_half) = stream.into_split();
                self.sessions.insert(session, write_half);
                tokio::spawn(protected_read_loop(
                    read_half,
                    session,
                    self.events_tx.clone(),
                ));
            }
            Err(e) => {
                warn!(session, port = self.protected_port, error = %e, "protected dial failed");
                write_frame(&mut self.control_write, &Frame::close(session)).await?;
            }
        }
        Ok(())
    }

    async fn on_protected_data(&mut self, session: i32, bytes: Vec<u8>) -> TunnelResult<Flow> {
        // Closed sessions must not produce more frames.
        if !self.sessions.contains_key(&session) {
            return Ok(Flow::Continue);
        }
        write_frame(&mut self.control_write, &Frame::data(session, bytes)).await?;
        Ok(Flow::Continue)
    }

    async fn on_protected_eof(&mut self, session: i32) -> TunnelResult<Flow> {
        if self.sessions.remove(&session).is_some() {
            debug!(session, "protected service closed session");
            write_frame(&mut self.control_write, &Frame::close(session)).await?;
        }
        Ok(Flow::Continue)
    }

    /// Close every protected connection and the control channel. When the
    /// shutdown is local, tell the broker first so it can release the
    /// public listener and its user connections.
    async fn teardown(mut self, announce: bool) {
        if announce {
            let _ = write_frame(&mut self.control_write, &Frame::close(CONTROL_SESSION)).await;
        }
        let sessions = self.sessions.len();
        self.sessions.clear();
        info!(sessions, "tunnel closed");
    }
}

async fn control_read_loop(mut read_half: OwnedReadHalf, events: mpsc::Sender<TunnelEvent>) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(frame) => {
                if events.send(TunnelEvent::BrokerFrame(frame)).await.is_err() {
                    return;
                }
            }
            Err(TunnelError::Eof) => {
                debug!("broker closed control channel");
                break;
            }
            Err(e) => {
                warn!(error = %e, "control channel read failed");
                break;
            }
        }
    }
    let _ = events.send(TunnelEvent::ControlClosed).await;
}

async fn protected_read_loop(
    mut read_half: OwnedReadHalf,
    session: i32,
    events: mpsc::Sender<TunnelEvent>,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let event = TunnelEvent::ProtectedData {
                    session,
                    bytes: buf[..n].to_vec(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(session, error = %e, "protected read failed");
                break;
            }
        }
    }
    let _ = events.send(TunnelEvent::ProtectedEof { session }).await;
}

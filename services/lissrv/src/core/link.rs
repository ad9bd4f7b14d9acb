//! Instrument link: owns one TCP connection and drives its lifecycle
//!
//! A link runs as one task. In client role it dials the instrument and
//! reconnects with bounded backoff; in server role it listens and spawns
//! one handler task per accepted peer. Every connection gets its own
//! exclusively-owned [`ConnectionSession`]; no state is shared across
//! connections.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineLimits, InstrumentConfig, ProtocolChoice, ReconnectPolicy, Role};
use crate::core::session::{ConnectionSession, GuardVerdict};
use crate::error::{LisSrvError, Result};
use crate::events::{EngineEvent, EventSink, LinkStatus, ReassembledMessage};
use crate::protocols::{self, SessionNote, WireProtocol};

const READ_CHUNK: usize = 4 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Link operation counters, queryable through the supervisor
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LinkState {
    pub connected: bool,
    pub active_connections: u32,
    pub messages: u64,
    pub reconnects: u32,
    pub last_error: Option<String>,
}

pub struct InstrumentLink {
    config: Arc<InstrumentConfig>,
    limits: EngineLimits,
    reconnect: ReconnectPolicy,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    state: Arc<RwLock<LinkState>>,
}

impl InstrumentLink {
    pub fn new(
        config: Arc<InstrumentConfig>,
        limits: EngineLimits,
        reconnect: ReconnectPolicy,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            limits,
            reconnect,
            events,
            cancel,
            state: Arc::new(RwLock::new(LinkState::default())),
        }
    }

    pub fn state_handle(&self) -> Arc<RwLock<LinkState>> {
        Arc::clone(&self.state)
    }

    /// Drive the link until it is stopped, the reconnect budget is
    /// exhausted, or (server role) the listener fails.
    pub async fn run(self: Arc<Self>) {
        let result = match self.config.role {
            Role::Server => Arc::clone(&self).run_server().await,
            Role::Client => Arc::clone(&self).run_client().await,
        };
        if let Err(e) = result {
            error!(instrument = %self.config.id, "link stopped: {}", e);
        }
    }

    async fn run_client(self: Arc<Self>) -> Result<()> {
        let mut failed_attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.connect().await {
                Ok(stream) => {
                    // Any successful connection resets the backoff
                    failed_attempts = 0;
                    let outcome = self.serve_connection(stream).await;
                    if let Err(e) = outcome {
                        warn!(instrument = %self.config.id, "connection ended: {}", e);
                        self.record_error(&e).await;
                    }
                    if self.cancel.is_cancelled() || !self.config.auto_reconnect {
                        return Ok(());
                    }
                    self.state.write().await.reconnects += 1;
                    // Brief pause so an instrument that drops us
                    // immediately cannot spin the loop hot
                    let delay = self.reconnect.delay_for(1);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.record_error(&e).await;
                    if !self.config.auto_reconnect {
                        return Err(e);
                    }
                    failed_attempts += 1;
                    if failed_attempts >= self.reconnect.max_attempts {
                        error!(
                            instrument = %self.config.id,
                            "reconnect budget exhausted after {} attempts",
                            failed_attempts
                        );
                        self.emit(LinkStatus::ReconnectExhausted, None).await;
                        return Err(LisSrvError::ReconnectExhausted(self.config.id.clone()));
                    }
                    let delay = self.backoff_delay(failed_attempts);
                    warn!(
                        instrument = %self.config.id,
                        "connect failed ({}), retry {}/{} in {:?}",
                        e, failed_attempts, self.reconnect.max_attempts, delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_server(self: Arc<Self>) -> Result<()> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| LisSrvError::connection(format!("failed to bind {}: {}", addr, e)))?;
        info!(instrument = %self.config.id, "listening on {}", addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(instrument = %self.config.id, "stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(instrument = %self.config.id, %peer, "peer accepted");
                        let link = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = link.serve_connection(stream).await {
                                warn!(
                                    instrument = %link.config.id, %peer,
                                    "peer connection ended: {}", e
                                );
                                link.record_error(&e).await;
                            }
                        });
                    }
                    // A failed accept must not take down the other peers
                    Err(e) => warn!(instrument = %self.config.id, "accept failed: {}", e),
                }
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.config.addr();
        debug!(instrument = %self.config.id, "connecting to {}", addr);
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                info!(instrument = %self.config.id, "connected to {}", addr);
                Ok(stream)
            }
            Ok(Err(e)) => Err(LisSrvError::connection(format!(
                "failed to connect to {}: {}",
                addr, e
            ))),
            Err(_) => Err(LisSrvError::timeout(format!(
                "connection to {} timed out",
                addr
            ))),
        }
    }

    /// Wrap one connection: status events and state counters around the
    /// read loop, with cleanup exactly once on every exit path. The
    /// socket closes when `stream` drops here; the session is owned by
    /// the loop and dropped with it.
    async fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(instrument = %self.config.id, "failed to set TCP_NODELAY: {}", e);
        }
        let peer = stream
            .peer_addr()
            .map(|p| p.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        {
            let mut state = self.state.write().await;
            state.active_connections += 1;
            state.connected = true;
        }
        self.emit(LinkStatus::Connected, Some(peer.clone())).await;

        let result = self.connection_loop(stream).await;

        {
            let mut state = self.state.write().await;
            state.active_connections = state.active_connections.saturating_sub(1);
            state.connected = state.active_connections > 0;
        }
        self.emit(LinkStatus::Disconnected, Some(peer)).await;

        result
    }

    /// The read/dispatch/write loop for one connection.
    async fn connection_loop(&self, mut stream: TcpStream) -> Result<()> {
        let mut session = ConnectionSession::new(self.limits.clone());
        let mut handler: Option<Box<dyn WireProtocol>> = match self.config.protocol {
            ProtocolChoice::Astm => Some(protocols::handler_for(
                protocols::ProtocolKind::Astm,
                self.config.encoding,
            )),
            ProtocolChoice::Hl7 => Some(protocols::handler_for(
                protocols::ProtocolKind::Hl7,
                self.config.encoding,
            )),
            ProtocolChoice::Auto => None,
        };
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = timeout(self.limits.read_poll(), stream.read(&mut chunk)) => r,
            };

            let n = match read {
                // Bounded wait elapsed: re-evaluate the timeout guard even
                // though no bytes arrived. Not an error by itself.
                Err(_) => {
                    if session.timed_out(Instant::now()) {
                        warn!(instrument = %self.config.id, "message timed out, resetting session");
                        self.emit(LinkStatus::MessageTimedOut, None).await;
                        // The sender is presumed gone; no NAK is owed
                        self.reset_session(&mut session, &mut handler);
                    }
                    continue;
                }
                Ok(Ok(0)) => {
                    debug!(instrument = %self.config.id, "peer closed connection");
                    return Ok(());
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(LisSrvError::io(format!("read error: {}", e))),
            };

            let now = Instant::now();
            let mut verdict = session.guard(n, now);

            if verdict == GuardVerdict::TimedOut {
                warn!(instrument = %self.config.id, "message timed out, resetting session");
                self.emit(LinkStatus::MessageTimedOut, None).await;
                // Bytes did arrive, so the sender is still there: answer
                // with the protocol's abort reply before starting over.
                self.write_abort_reply(&mut stream, handler.as_deref()).await?;
                self.reset_session(&mut session, &mut handler);
                // The new bytes begin a fresh attempt; only the size
                // guard can still reject them.
                verdict = session.guard(n, now);
            }

            if verdict == GuardVerdict::Oversized {
                warn!(
                    instrument = %self.config.id,
                    "message size limit exceeded ({} + {} bytes), resetting session",
                    session.total_bytes(), n
                );
                self.emit(
                    LinkStatus::MessageOversized,
                    Some(format!("{} bytes", session.total_bytes() + n)),
                )
                .await;
                self.write_abort_reply(&mut stream, handler.as_deref()).await?;
                self.reset_session(&mut session, &mut handler);
                // Never accumulate past the limit: the read is dropped
                continue;
            }

            // Resolve the protocol from the lead byte of a fresh session
            if handler.is_none() {
                match protocols::detect(chunk[0]) {
                    Some(kind) => {
                        debug!(
                            instrument = %self.config.id,
                            "session protocol detected as {}", kind.as_str()
                        );
                        handler = Some(protocols::handler_for(kind, self.config.encoding));
                    }
                    None => {
                        // Guessing wrong is worse than refusing
                        warn!(
                            instrument = %self.config.id,
                            "unrecognized protocol lead byte 0x{:02X}, closing", chunk[0]
                        );
                        return Err(LisSrvError::protocol(format!(
                            "unrecognized lead byte 0x{:02X}",
                            chunk[0]
                        )));
                    }
                }
            }

            session.push(&chunk[..n], now);
            let output = match handler.as_mut() {
                Some(h) => h.on_bytes(&mut session),
                None => continue,
            };

            // The response must be on the wire before the next read
            if !output.reply.is_empty() {
                stream
                    .write_all(&output.reply)
                    .await
                    .map_err(|e| LisSrvError::io(format!("write error: {}", e)))?;
                stream
                    .flush()
                    .await
                    .map_err(|e| LisSrvError::io(format!("flush error: {}", e)))?;
            }

            for note in &output.notes {
                let status = match note {
                    SessionNote::TransferStarted => LinkStatus::TransferStarted,
                    SessionNote::TransferEnded => LinkStatus::TransferEnded,
                };
                self.emit(status, None).await;
            }

            if !output.messages.is_empty() {
                let kind = handler
                    .as_ref()
                    .map(|h| h.kind())
                    .unwrap_or(protocols::ProtocolKind::Astm);
                for text in output.messages {
                    info!(
                        instrument = %self.config.id,
                        bytes = text.len(),
                        "message reassembled"
                    );
                    self.state.write().await.messages += 1;
                    self.events
                        .publish(EngineEvent::Message(ReassembledMessage {
                            instrument_id: self.config.id.clone(),
                            instrument_name: self.config.display_name().to_string(),
                            protocol: kind,
                            text,
                            received_at: Utc::now(),
                        }))
                        .await;
                }
                // Message complete = session boundary: restart the guards
                // and, with auto-detection and a drained buffer, allow the
                // next session to re-resolve its protocol.
                session.rearm(now);
                if self.config.protocol == ProtocolChoice::Auto && session.is_fresh() {
                    handler = None;
                }
            }
        }
    }

    async fn write_abort_reply(
        &self,
        stream: &mut TcpStream,
        handler: Option<&dyn WireProtocol>,
    ) -> Result<()> {
        let reply = handler.map(|h| h.abort_reply()).unwrap_or_default();
        if reply.is_empty() {
            return Ok(());
        }
        stream
            .write_all(&reply)
            .await
            .map_err(|e| LisSrvError::io(format!("write error: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| LisSrvError::io(format!("flush error: {}", e)))?;
        Ok(())
    }

    /// Discard the current message attempt. With a fixed protocol the
    /// handler survives and is reset; with auto-detection it is dropped
    /// so the next session re-resolves from its lead byte.
    fn reset_session(
        &self,
        session: &mut ConnectionSession,
        handler: &mut Option<Box<dyn WireProtocol>>,
    ) {
        session.reset();
        if self.config.protocol == ProtocolChoice::Auto {
            *handler = None;
        } else if let Some(h) = handler.as_mut() {
            h.reset();
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.reconnect.delay_for(attempt);
        // Up to 25% jitter keeps simultaneous reconnects from aligning
        let jitter_ms = base.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    async fn record_error(&self, error: &LisSrvError) {
        self.state.write().await.last_error = Some(error.to_string());
    }

    async fn emit(&self, status: LinkStatus, detail: Option<String>) {
        let event = match detail {
            Some(d) => EngineEvent::status_with_detail(&self.config.id, status, d),
            None => EngineEvent::status(&self.config.id, status),
        };
        self.events.publish(event).await;
    }
}

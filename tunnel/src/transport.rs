//! Framed tunnel transport over a byte-stream conduit.
//!
//! The conduit is anything `AsyncRead + AsyncWrite + Unpin`; the codec
//! supplies framing, so no datagram semantics are assumed. The transport
//! multiplexes data and control records on the single conduit: Rekey, Ping,
//! Pong and Close are sealed records sharing the data sequence space, while
//! alerts travel in the clear.
//!
//! Rekey handoff: either side may request. The requester sends a fresh
//! CH-KEM public key and an activation sequence; the peer answers with the
//! encapsulation ciphertext in a second Rekey record. Both sides keep using
//! the old keys until their send counter reaches the activation sequence
//! (outbound) or they observe a record at or past it (inbound), then swap.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use tokio_util::codec::Framed;

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::handshake::Handshake;
use crate::session::{Session, SessionStats};
use crate::types::{Role, SessionId, SessionState, REKEY_ACTIVATION_LEAD};
use crate::wire::{
    Alert, AlertCode, AlertLevel, FrameCodec, Message, Record, RekeyBody, TYPE_CLOSE, TYPE_DATA,
    TYPE_PING, TYPE_PONG, TYPE_REKEY,
};
use crypto::aead::{CipherSuite, AEAD_TAG_LEN};

/// Per-record overhead: 8-byte sequence prefix plus the AEAD tag.
const RECORD_OVERHEAD: usize = 8 + AEAD_TAG_LEN;

/// How long `close` keeps draining in-flight inbound frames.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

enum Inbound {
    Data(Vec<u8>),
    Control,
    Closed,
}

/// An established tunnel endpoint.
pub struct Tunnel<S> {
    framed: Framed<S, FrameCodec>,
    session: Arc<Session>,
    config: TunnelConfig,
    /// Data records decrypted while waiting for control traffic (for
    /// example a rekey response); drained by the next `recv`.
    pending_inbound: VecDeque<Vec<u8>>,
}

impl<S> Tunnel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Connect as the initiator: run the handshake under its overall
    /// deadline and return the established tunnel.
    pub async fn connect(stream: S, config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        if config.fips_mode {
            crypto::selftest::ensure_post()
                .map_err(|e| TunnelError::from_crypto(e, "power-on self-test"))?;
        }
        let deadline = config.handshake_timeout;
        timeout(deadline, Self::drive_initiator(stream, config))
            .await
            .map_err(|_| TunnelError::Timeout)?
    }

    /// Accept as the responder.
    pub async fn accept(stream: S, config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        if config.fips_mode {
            crypto::selftest::ensure_post()
                .map_err(|e| TunnelError::from_crypto(e, "power-on self-test"))?;
        }
        let deadline = config.handshake_timeout;
        timeout(deadline, Self::drive_responder(stream, config))
            .await
            .map_err(|_| TunnelError::Timeout)?
    }

    async fn drive_initiator(stream: S, config: TunnelConfig) -> Result<Self> {
        let mut framed = Framed::new(stream, FrameCodec::new(config.max_message_size));
        let mut handshake = Handshake::initiator(config.clone());

        let hello = handshake.initiator_hello()?;
        framed.send(hello).await?;

        let server_hello = match read_handshake_frame(&mut framed).await? {
            Message::ServerHello(hello) => hello,
            Message::Alert(alert) => return Err(alert_error(alert)),
            other => {
                return Err(
                    fail_handshake(
                        &mut framed,
                        TunnelError::ProtocolViolation("unexpected handshake message"),
                        other.type_name(),
                    )
                    .await,
                )
            }
        };
        let finished = match handshake.initiator_process_server_hello(server_hello) {
            Ok(message) => message,
            Err(err) => return Err(fail_handshake(&mut framed, err, "ServerHello").await),
        };
        framed.send(finished).await?;

        let server_finished = match read_handshake_frame(&mut framed).await? {
            Message::ServerFinished(finished) => finished,
            Message::Alert(alert) => return Err(alert_error(alert)),
            other => {
                return Err(
                    fail_handshake(
                        &mut framed,
                        TunnelError::ProtocolViolation("unexpected handshake message"),
                        other.type_name(),
                    )
                    .await,
                )
            }
        };
        if let Err(err) = handshake.initiator_process_server_finished(server_finished) {
            return Err(fail_handshake(&mut framed, err, "ServerFinished").await);
        }

        let session = Arc::new(handshake.into_session()?);
        Ok(Self {
            framed,
            session,
            config,
            pending_inbound: VecDeque::new(),
        })
    }

    async fn drive_responder(stream: S, config: TunnelConfig) -> Result<Self> {
        let mut framed = Framed::new(stream, FrameCodec::new(config.max_message_size));
        let mut handshake = Handshake::responder(config.clone());

        let client_hello = match read_handshake_frame(&mut framed).await? {
            Message::ClientHello(hello) => hello,
            Message::Alert(alert) => return Err(alert_error(alert)),
            other => {
                return Err(
                    fail_handshake(
                        &mut framed,
                        TunnelError::ProtocolViolation("unexpected handshake message"),
                        other.type_name(),
                    )
                    .await,
                )
            }
        };
        let server_hello = match handshake.responder_process_client_hello(client_hello) {
            Ok(message) => message,
            Err(err) => return Err(fail_handshake(&mut framed, err, "ClientHello").await),
        };
        framed.send(server_hello).await?;

        let client_finished = match read_handshake_frame(&mut framed).await? {
            Message::ClientFinished(finished) => finished,
            Message::Alert(alert) => return Err(alert_error(alert)),
            other => {
                return Err(
                    fail_handshake(
                        &mut framed,
                        TunnelError::ProtocolViolation("unexpected handshake message"),
                        other.type_name(),
                    )
                    .await,
                )
            }
        };
        let server_finished = match handshake.responder_process_client_finished(client_finished) {
            Ok(message) => message,
            Err(err) => return Err(fail_handshake(&mut framed, err, "ClientFinished").await),
        };
        framed.send(server_finished).await?;

        let session = Arc::new(handshake.into_session()?);
        Ok(Self {
            framed,
            session,
            config,
            pending_inbound: VecDeque::new(),
        })
    }

    /// The shared session handle (statistics, state, identifiers).
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn role(&self) -> Role {
        self.session.role()
    }

    pub fn session_id(&self) -> &SessionId {
        self.session.session_id()
    }

    pub fn suite(&self) -> CipherSuite {
        self.session.suite()
    }

    /// Send application data as one encrypted record.
    ///
    /// Runs the rekey triggers first; if the send counter has crossed a
    /// pending rekey's activation point, the call waits for the rekey
    /// response before sealing under the new keys.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let max_payload = self.config.max_message_size - RECORD_OVERHEAD;
        if data.len() > max_payload {
            return Err(TunnelError::MessageTooLarge {
                size: data.len(),
                max: max_payload,
            });
        }

        if self.session.needs_rekey() {
            self.request_rekey().await?;
        }

        for _ in 0..2 {
            match self.session.seal_record(TYPE_DATA, data) {
                Ok((seq, ciphertext)) => {
                    return self.send_frame(Message::Data(Record { seq, ciphertext })).await;
                }
                Err(TunnelError::RekeyRequired) => {
                    self.await_rekey_response().await?;
                }
                Err(TunnelError::NonceExhausted) => {
                    if self.session.rekey_pending() {
                        // A rekey is already pending and the counter is
                        // spent; nothing left but to shut down.
                        self.session.close();
                        return Err(TunnelError::RekeyInProgress);
                    }
                    tracing::warn!("nonce counter exhausted, forcing emergency rekey");
                    self.initiate_rekey(1).await?;
                    self.await_rekey_response().await?;
                }
                Err(err) => return Err(err),
            }
        }
        Err(TunnelError::RekeyRequired)
    }

    /// Receive the next application payload. Control records are handled
    /// internally; `Ok(None)` means the peer closed the tunnel.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(payload) = self.pending_inbound.pop_front() {
            return Ok(Some(payload));
        }
        loop {
            let Some(message) = self.next_frame().await? else {
                self.session.close();
                return Ok(None);
            };
            match self.handle_frame(message).await? {
                Inbound::Data(payload) => return Ok(Some(payload)),
                Inbound::Control => continue,
                Inbound::Closed => return Ok(None),
            }
        }
    }

    /// Request a planned rekey. Returns `false` when one is already
    /// pending (the request is idempotent).
    pub async fn request_rekey(&mut self) -> Result<bool> {
        self.initiate_rekey(REKEY_ACTIVATION_LEAD).await
    }

    async fn initiate_rekey(&mut self, activation_lead: u64) -> Result<bool> {
        let Some(body) = self.session.begin_rekey(activation_lead)? else {
            return Ok(false);
        };
        let encoded = body.encode();
        let (seq, ciphertext) = self.session.seal_record(TYPE_REKEY, &encoded)?;
        self.send_frame(Message::Rekey(Record { seq, ciphertext }))
            .await?;
        Ok(true)
    }

    /// Send a keepalive probe; the peer echoes the payload in a Pong.
    /// Scheduling is the caller's policy, not the transport's.
    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        let (seq, ciphertext) = self.session.seal_record(TYPE_PING, payload)?;
        self.send_frame(Message::Ping(Record { seq, ciphertext }))
            .await
    }

    /// Close gracefully: send a Close record, drain in-flight inbound
    /// frames briefly, and shut the conduit down.
    pub async fn close(mut self) -> Result<()> {
        if matches!(
            self.session.state(),
            SessionState::Established | SessionState::Rekeying
        ) {
            if let Ok((seq, ciphertext)) = self.session.seal_record(TYPE_CLOSE, b"") {
                let _ = self
                    .send_frame(Message::Close(Record { seq, ciphertext }))
                    .await;
            }
        }
        loop {
            match timeout(DRAIN_TIMEOUT, self.framed.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) => break,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => break,
            }
        }
        self.session.close();
        self.framed.close().await
    }

    /// Consume the tunnel, returning the framed conduit.
    pub fn into_inner(self) -> Framed<S, FrameCodec> {
        self.framed
    }

    /// Shared access to the underlying conduit, for address lookups and
    /// similar stream-specific queries.
    pub fn get_ref(&self) -> &S {
        self.framed.get_ref()
    }

    /// Read frames until the outstanding rekey response has been
    /// processed, buffering any data records for later `recv` calls.
    async fn await_rekey_response(&mut self) -> Result<()> {
        while self.session.rekey_awaiting_response() {
            let Some(message) = self.next_frame().await? else {
                self.session.close();
                return Err(TunnelError::Closed);
            };
            match self.handle_frame(message).await? {
                Inbound::Data(payload) => self.pending_inbound.push_back(payload),
                Inbound::Control => {}
                Inbound::Closed => return Err(TunnelError::Closed),
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, message: Message) -> Result<Inbound> {
        match message {
            Message::Data(record) => {
                match self.session.open_record(TYPE_DATA, record.seq, &record.ciphertext) {
                    Ok(payload) => Ok(Inbound::Data(payload)),
                    Err(err) => self.handle_record_error(err, "data record").await,
                }
            }
            Message::Rekey(record) => {
                let body_bytes =
                    match self
                        .session
                        .open_record(TYPE_REKEY, record.seq, &record.ciphertext)
                    {
                        Ok(bytes) => bytes,
                        Err(err) => return self.handle_record_error(err, "rekey record").await,
                    };
                let body = match RekeyBody::decode(&body_bytes) {
                    Ok(body) => body,
                    Err(err) => {
                        self.fatal(AlertCode::ProtocolViolation).await;
                        return Err(err);
                    }
                };
                match self.session.process_rekey(&body) {
                    Ok(Some(reply)) => {
                        let encoded = reply.encode();
                        let (seq, ciphertext) = self.session.seal_record(TYPE_REKEY, &encoded)?;
                        self.send_frame(Message::Rekey(Record { seq, ciphertext }))
                            .await?;
                        Ok(Inbound::Control)
                    }
                    Ok(None) => Ok(Inbound::Control),
                    Err(err) => {
                        let code = match err {
                            TunnelError::ProtocolViolation(_) => AlertCode::ProtocolViolation,
                            _ => AlertCode::InternalError,
                        };
                        self.fatal(code).await;
                        Err(err)
                    }
                }
            }
            Message::Ping(record) => {
                let payload =
                    match self
                        .session
                        .open_record(TYPE_PING, record.seq, &record.ciphertext)
                    {
                        Ok(payload) => payload,
                        Err(err) => return self.handle_record_error(err, "ping record").await,
                    };
                let (seq, ciphertext) = self.session.seal_record(TYPE_PONG, &payload)?;
                self.send_frame(Message::Pong(Record { seq, ciphertext }))
                    .await?;
                Ok(Inbound::Control)
            }
            Message::Pong(record) => {
                match self
                    .session
                    .open_record(TYPE_PONG, record.seq, &record.ciphertext)
                {
                    Ok(_) => {
                        tracing::trace!("pong received");
                        Ok(Inbound::Control)
                    }
                    Err(err) => self.handle_record_error(err, "pong record").await,
                }
            }
            Message::Close(record) => {
                // Validate when possible, but honor the close regardless.
                let _ = self
                    .session
                    .open_record(TYPE_CLOSE, record.seq, &record.ciphertext);
                tracing::debug!("peer closed the tunnel");
                self.session.close();
                Ok(Inbound::Closed)
            }
            Message::Alert(alert) => match alert.level {
                AlertLevel::Warning => {
                    tracing::debug!(code = %alert.code, "peer warning alert");
                    Ok(Inbound::Control)
                }
                AlertLevel::Fatal => {
                    if alert.code == AlertCode::CloseNotify {
                        self.session.close();
                        return Ok(Inbound::Closed);
                    }
                    tracing::warn!(code = %alert.code, "peer fatal alert");
                    self.session.fail();
                    Err(TunnelError::PeerAlert {
                        level: alert.level,
                        code: alert.code,
                    })
                }
            },
            Message::ClientHello(_)
            | Message::ServerHello(_)
            | Message::ClientFinished(_)
            | Message::ServerFinished(_) => {
                self.fatal(AlertCode::ProtocolViolation).await;
                Err(TunnelError::ProtocolViolation(
                    "handshake message after establishment",
                ))
            }
        }
    }

    /// Decide whether a failed record is dropped or fatal. The session has
    /// already counted the failure and may have transitioned to Failed.
    async fn handle_record_error(
        &mut self,
        err: TunnelError,
        context: &'static str,
    ) -> Result<Inbound> {
        match err {
            TunnelError::ReplayedRecord => {
                tracing::debug!(context, "dropped replayed or stale record");
                Ok(Inbound::Control)
            }
            TunnelError::AuthenticationFailed => {
                if self.session.state() == SessionState::Failed {
                    let _ = self
                        .framed
                        .send(Message::Alert(Alert::fatal(
                            AlertCode::DecryptionFailed,
                            "too many authentication failures",
                        )))
                        .await;
                    return Err(TunnelError::AuthenticationFailed);
                }
                tracing::debug!(context, "dropped record failing authentication");
                Ok(Inbound::Control)
            }
            other => Err(other),
        }
    }

    /// Emit a single fatal alert and mark the session failed.
    async fn fatal(&mut self, code: AlertCode) {
        let _ = self
            .framed
            .send(Message::Alert(Alert::fatal(code, "")))
            .await;
        self.session.fail();
    }

    async fn next_frame(&mut self) -> Result<Option<Message>> {
        let item = match self.config.read_timeout {
            Some(deadline) => match timeout(deadline, self.framed.next()).await {
                Ok(item) => item,
                Err(_) => return Err(TunnelError::Timeout),
            },
            None => self.framed.next().await,
        };
        match item {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    async fn send_frame(&mut self, message: Message) -> Result<()> {
        match self.config.write_timeout {
            Some(deadline) => timeout(deadline, self.framed.send(message))
                .await
                .map_err(|_| TunnelError::Timeout)?,
            None => self.framed.send(message).await,
        }
    }

    #[cfg(test)]
    pub(crate) async fn send_raw(&mut self, message: Message) -> Result<()> {
        self.framed.send(message).await
    }
}

async fn read_handshake_frame<S>(framed: &mut Framed<S, FrameCodec>) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(message)) => Ok(message),
        Some(Err(err)) => Err(err),
        None => Err(TunnelError::Closed),
    }
}

/// Emit a single fatal alert for a handshake failure and pass the error on.
async fn fail_handshake<S>(
    framed: &mut Framed<S, FrameCodec>,
    err: TunnelError,
    context: &'static str,
) -> TunnelError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::warn!(context, error = %err, "handshake failed");
    let _ = framed
        .send(Message::Alert(Alert::fatal(alert_code_for(&err), "")))
        .await;
    err
}

fn alert_code_for(err: &TunnelError) -> AlertCode {
    match err {
        TunnelError::UnsupportedVersion { .. } => AlertCode::UnsupportedVersion,
        TunnelError::ProtocolViolation(_)
        | TunnelError::InvalidMessage(_)
        | TunnelError::MessageTooLarge { .. } => AlertCode::ProtocolViolation,
        TunnelError::Crypto { .. } => AlertCode::InternalError,
        _ => AlertCode::HandshakeFailure,
    }
}

fn alert_error(alert: Alert) -> TunnelError {
    if alert.code == AlertCode::CloseNotify {
        TunnelError::Closed
    } else {
        TunnelError::PeerAlert {
            level: alert.level,
            code: alert.code,
        }
    }
}

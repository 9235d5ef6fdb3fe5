//! Four-message handshake state machine.
//!
//! ```text
//! Initiator                             Responder
//!    | -- ClientHello ------------------->  |
//!    | <------------------- ServerHello --  |
//!    | -- ClientFinished ---------------->  |
//!    | <--------------- ServerFinished ---  |
//! ```
//!
//! The state machine is pure: it consumes and produces wire messages and
//! never touches the conduit. The transport drives it and owns the overall
//! deadline. Any validation failure moves it to `Failed`; the transport
//! then emits a single fatal alert and closes.

use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::session::{RekeyLimits, Session};
use crate::types::{
    generate_session_id, KeyMaterial, ProtocolVersion, Role, SessionId, SESSION_ID_LEN,
};
use crate::wire::{
    ClientHello, Finished, Message, ServerHello, FINISHED_PAYLOAD_LEN, TYPE_CLIENT_FINISHED,
    TYPE_SERVER_FINISHED,
};
use crypto::aead::{AeadCipher, CipherSuite};
use crypto::chkem::{self, ChKemKeyPair, ChKemPublicKey, CHKEM_CIPHERTEXT_LEN};
use crypto::kdf;

/// Finished derivation labels; fixed by protocol, pinned by tests.
const CLIENT_FINISHED_LABEL: &str = "CH-KEM-VPN-v1 client finished";
const SERVER_FINISHED_LABEL: &str = "CH-KEM-VPN-v1 server finished";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandshakeState {
    Initial,
    AwaitingServerHello,
    AwaitingServerFinished,
    AwaitingClientFinished,
    Established,
    Failed,
}

/// Handshake driver for one side of the connection.
pub struct Handshake {
    config: TunnelConfig,
    role: Role,
    state: HandshakeState,
    keypair: Option<ChKemKeyPair>,
    suite: Option<CipherSuite>,
    session_id: Option<SessionId>,
    client_hello_bytes: Vec<u8>,
    server_hello_bytes: Vec<u8>,
    master: Option<Zeroizing<[u8; 32]>>,
    handshake_keys: Option<KeyMaterial>,
    started_at: Instant,
}

impl Handshake {
    pub fn initiator(config: TunnelConfig) -> Self {
        Self::new(config, Role::Initiator)
    }

    pub fn responder(config: TunnelConfig) -> Self {
        Self::new(config, Role::Responder)
    }

    fn new(config: TunnelConfig, role: Role) -> Self {
        Self {
            config,
            role,
            state: HandshakeState::Initial,
            keypair: None,
            suite: None,
            session_id: None,
            client_hello_bytes: Vec::new(),
            server_hello_bytes: Vec::new(),
            master: None,
            handshake_keys: None,
            started_at: Instant::now(),
        }
    }

    fn fail(&mut self, err: TunnelError) -> TunnelError {
        self.state = HandshakeState::Failed;
        err
    }

    fn expect_state(&mut self, expected: HandshakeState) -> Result<()> {
        if self.state != expected {
            return Err(self.fail(TunnelError::HandshakeFailure("unexpected handshake state")));
        }
        Ok(())
    }

    /// Initiator step 1: generate the long-term keypair and ClientHello.
    pub fn initiator_hello(&mut self) -> Result<Message> {
        self.expect_state(HandshakeState::Initial)?;

        let keypair = ChKemKeyPair::generate();
        if self.config.fips_mode {
            crypto::selftest::pairwise_consistency(&keypair)
                .map_err(|e| self.fail(TunnelError::from_crypto(e, "pairwise test")))?;
        }

        let hello = Message::ClientHello(ClientHello {
            version: ProtocolVersion::CURRENT,
            random: crypto::rng::random_array(),
            session_id: Vec::new(),
            public_key: keypair.public_key_bytes(),
            cipher_suites: self
                .config
                .cipher_suite_preference
                .iter()
                .map(|suite| suite.wire_id())
                .collect(),
        });

        self.keypair = Some(keypair);
        self.client_hello_bytes = hello.encode_frame();
        self.state = HandshakeState::AwaitingServerHello;
        tracing::debug!("sent ClientHello");
        Ok(hello)
    }

    /// Responder step 1: validate the ClientHello, encapsulate, and build
    /// the ServerHello. Keys are derived as soon as both hello frames are
    /// fixed.
    pub fn responder_process_client_hello(&mut self, hello: ClientHello) -> Result<Message> {
        self.expect_state(HandshakeState::Initial)?;

        if !hello.version.is_compatible(ProtocolVersion::CURRENT) {
            return Err(self.fail(TunnelError::UnsupportedVersion {
                major: hello.version.major,
                minor: hello.version.minor,
            }));
        }

        let suite = self
            .select_suite(&hello.cipher_suites)
            .map_err(|e| self.fail(e))?;

        let public_key = ChKemPublicKey::from_bytes(&hello.public_key)
            .map_err(|_| self.fail(TunnelError::InvalidPublicKey))?;
        let (ciphertext, master) =
            chkem::encapsulate(&public_key).map_err(|e| {
                let err = TunnelError::from_crypto(e, "encapsulate");
                self.fail(err)
            })?;

        let session_id = generate_session_id();
        let server_hello = Message::ServerHello(ServerHello {
            version: ProtocolVersion::CURRENT,
            random: crypto::rng::random_array(),
            session_id: session_id.to_vec(),
            ciphertext,
            cipher_suite: suite.wire_id(),
        });

        self.client_hello_bytes = Message::ClientHello(hello).encode_frame();
        self.server_hello_bytes = server_hello.encode_frame();
        self.suite = Some(suite);
        self.session_id = Some(session_id);
        self.master = Some(Zeroizing::new(*master));
        self.derive_handshake_keys()?;
        self.state = HandshakeState::AwaitingClientFinished;
        tracing::debug!(suite = %suite, "sent ServerHello");
        Ok(server_hello)
    }

    /// Initiator step 2: validate the ServerHello, decapsulate, derive
    /// keys, and build the ClientFinished.
    pub fn initiator_process_server_hello(&mut self, hello: ServerHello) -> Result<Message> {
        self.expect_state(HandshakeState::AwaitingServerHello)?;

        if !hello.version.is_compatible(ProtocolVersion::CURRENT) {
            return Err(self.fail(TunnelError::UnsupportedVersion {
                major: hello.version.major,
                minor: hello.version.minor,
            }));
        }

        let offered = &self.config.cipher_suite_preference;
        let suite = match CipherSuite::from_wire(hello.cipher_suite) {
            Some(suite)
                if offered.contains(&suite)
                    && CipherSuite::supported(self.config.fips_mode).contains(&suite) =>
            {
                suite
            }
            _ => {
                return Err(self.fail(TunnelError::UnsupportedCipherSuite(hello.cipher_suite)));
            }
        };

        if hello.session_id.len() != SESSION_ID_LEN {
            return Err(self.fail(TunnelError::InvalidMessage("bad session id length")));
        }
        let mut session_id: SessionId = [0u8; SESSION_ID_LEN];
        session_id.copy_from_slice(&hello.session_id);

        if hello.ciphertext.len() != CHKEM_CIPHERTEXT_LEN {
            return Err(self.fail(TunnelError::InvalidCiphertext));
        }
        let keypair = self
            .keypair
            .as_ref()
            .ok_or(TunnelError::HandshakeFailure("missing keypair"))?;
        let master = match keypair.decapsulate(&hello.ciphertext) {
            Ok(master) => master,
            Err(e) => {
                let err = TunnelError::from_crypto(e, "decapsulate");
                return Err(self.fail(err));
            }
        };

        self.server_hello_bytes = Message::ServerHello(hello).encode_frame();
        self.suite = Some(suite);
        self.session_id = Some(session_id);
        self.master = Some(Zeroizing::new(*master));
        self.derive_handshake_keys()?;

        let finished = self.seal_finished(Role::Initiator)?;
        self.state = HandshakeState::AwaitingServerFinished;
        tracing::debug!(suite = %suite, "sent ClientFinished");
        Ok(Message::ClientFinished(finished))
    }

    /// Responder step 2: verify the ClientFinished and answer with the
    /// ServerFinished.
    pub fn responder_process_client_finished(&mut self, finished: Finished) -> Result<Message> {
        self.expect_state(HandshakeState::AwaitingClientFinished)?;
        self.verify_finished(Role::Initiator, &finished)?;
        let reply = self.seal_finished(Role::Responder)?;
        self.state = HandshakeState::Established;
        tracing::debug!("handshake established (responder)");
        Ok(Message::ServerFinished(reply))
    }

    /// Initiator step 3: verify the ServerFinished.
    pub fn initiator_process_server_finished(&mut self, finished: Finished) -> Result<()> {
        self.expect_state(HandshakeState::AwaitingServerFinished)?;
        self.verify_finished(Role::Responder, &finished)?;
        self.state = HandshakeState::Established;
        tracing::debug!("handshake established (initiator)");
        Ok(())
    }

    /// Responder suite selection: first entry of the client's preference
    /// list that this build supports.
    fn select_suite(&self, offered: &[u16]) -> Result<CipherSuite> {
        if offered.is_empty() {
            return Err(TunnelError::InvalidMessage("empty cipher suite list"));
        }
        let supported = CipherSuite::supported(self.config.fips_mode);
        for &wire_id in offered {
            if let Some(suite) = CipherSuite::from_wire(wire_id) {
                if supported.contains(&suite) && self.config.cipher_suite_preference.contains(&suite)
                {
                    return Ok(suite);
                }
            }
        }
        Err(TunnelError::UnsupportedCipherSuite(offered[0]))
    }

    /// Handshake transcript: SHA3-256 over the exact encoded hello frames.
    fn transcript(&self) -> [u8; 32] {
        kdf::transcript_hash(&[&self.client_hello_bytes, &self.server_hello_bytes])
    }

    fn derive_handshake_keys(&mut self) -> Result<()> {
        let master = self
            .master
            .as_ref()
            .ok_or(TunnelError::HandshakeFailure("missing master secret"))?;
        self.handshake_keys = Some(KeyMaterial::for_handshake(master)?);
        Ok(())
    }

    /// `verify_data = derive(label, transcript || master, 32)`.
    fn verify_data(&self, sender: Role) -> Result<[u8; 32]> {
        let master = self
            .master
            .as_ref()
            .ok_or(TunnelError::HandshakeFailure("missing master secret"))?;
        let label = match sender {
            Role::Initiator => CLIENT_FINISHED_LABEL,
            Role::Responder => SERVER_FINISHED_LABEL,
        };
        let mut input = Zeroizing::new([0u8; 64]);
        input[..32].copy_from_slice(&self.transcript());
        input[32..].copy_from_slice(master.as_ref());
        let out = kdf::derive(label, input.as_ref(), 32)?;
        let mut verify = [0u8; 32];
        verify.copy_from_slice(&out);
        Ok(verify)
    }

    fn finished_cipher(&self, sender: Role) -> Result<(AeadCipher, [u8; 12])> {
        let suite = self
            .suite
            .ok_or(TunnelError::HandshakeFailure("suite not negotiated"))?;
        let keys = self
            .handshake_keys
            .as_ref()
            .ok_or(TunnelError::HandshakeFailure("handshake keys missing"))?;
        let (key, iv) = keys.write_half(sender);
        let cipher = AeadCipher::new(suite, key)
            .map_err(|e| TunnelError::from_crypto(e, "finished cipher"))?;
        Ok((cipher, *iv))
    }

    /// Seal our Finished message under our handshake write key with
    /// `nonce = iv XOR be64(0)`.
    fn seal_finished(&mut self, sender: Role) -> Result<Finished> {
        let verify = self.verify_data(sender)?;
        let (cipher, iv) = self.finished_cipher(sender)?;
        let nonce = crate::types::record_nonce(&iv, 0);
        let message_type = match sender {
            Role::Initiator => TYPE_CLIENT_FINISHED,
            Role::Responder => TYPE_SERVER_FINISHED,
        };
        let aad = crate::types::record_aad(message_type, 0);
        let payload = cipher
            .seal_with_nonce(&nonce, &verify, &aad)
            .map_err(|e| TunnelError::from_crypto(e, "finished seal"))?;
        Ok(Finished { payload })
    }

    /// Open and constant-time-verify the peer's Finished message.
    fn verify_finished(&mut self, sender: Role, finished: &Finished) -> Result<()> {
        if finished.payload.len() != FINISHED_PAYLOAD_LEN {
            return Err(self.fail(TunnelError::HandshakeFailure("bad finished length")));
        }
        let expected = self.verify_data(sender)?;
        let (cipher, iv) = self.finished_cipher(sender)?;
        let nonce = crate::types::record_nonce(&iv, 0);
        let message_type = match sender {
            Role::Initiator => TYPE_CLIENT_FINISHED,
            Role::Responder => TYPE_SERVER_FINISHED,
        };
        let aad = crate::types::record_aad(message_type, 0);
        let opened = cipher
            .open_with_nonce(&nonce, &finished.payload, &aad)
            .map_err(|_| ())
            .and_then(|opened| {
                if crypto::ct::ct_eq(&opened, &expected) {
                    Ok(())
                } else {
                    Err(())
                }
            });
        // A decapsulation mismatch surfaces here as an authentication
        // failure; both collapse into one handshake failure.
        opened.map_err(|_| self.fail(TunnelError::HandshakeFailure("finished verification")))
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Consume the handshake and build the established session. Handshake
    /// keys and the raw master secret move out or are zeroized here.
    pub fn into_session(mut self) -> Result<Session> {
        if self.state != HandshakeState::Established {
            return Err(TunnelError::HandshakeFailure("handshake not complete"));
        }
        let suite = self
            .suite
            .ok_or(TunnelError::HandshakeFailure("suite not negotiated"))?;
        let session_id = self
            .session_id
            .ok_or(TunnelError::HandshakeFailure("missing session id"))?;
        let master = self
            .master
            .take()
            .ok_or(TunnelError::HandshakeFailure("missing master secret"))?;
        // Handshake keys are dropped (and zeroized) with `self`.
        let traffic = KeyMaterial::for_traffic(&master)?;

        let limits = RekeyLimits {
            after_bytes: self.config.rekey_after_bytes,
            after_packets: self.config.rekey_after_packets,
            after: self.config.rekey_after,
        };
        let observer = self.config.make_observer();
        let handshake_duration = self.started_at.elapsed();

        tracing::info!(
            session_id = %hex::encode(session_id),
            role = %self.role,
            suite = %suite,
            elapsed_ms = handshake_duration.as_millis() as u64,
            "session established"
        );

        Session::new(
            self.role,
            session_id,
            suite,
            master,
            traffic,
            limits,
            self.config.fips_mode,
            observer,
            handshake_duration,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TYPE_DATA;

    fn configs() -> (TunnelConfig, TunnelConfig) {
        (TunnelConfig::new(), TunnelConfig::new())
    }

    fn run_handshake(
        initiator_config: TunnelConfig,
        responder_config: TunnelConfig,
    ) -> (Session, Session) {
        let mut initiator = Handshake::initiator(initiator_config);
        let mut responder = Handshake::responder(responder_config);

        let client_hello = match initiator.initiator_hello().unwrap() {
            Message::ClientHello(hello) => hello,
            other => panic!("expected ClientHello, got {}", other.type_name()),
        };
        let server_hello = match responder
            .responder_process_client_hello(client_hello)
            .unwrap()
        {
            Message::ServerHello(hello) => hello,
            other => panic!("expected ServerHello, got {}", other.type_name()),
        };
        let client_finished = match initiator
            .initiator_process_server_hello(server_hello)
            .unwrap()
        {
            Message::ClientFinished(finished) => finished,
            other => panic!("expected ClientFinished, got {}", other.type_name()),
        };
        let server_finished = match responder
            .responder_process_client_finished(client_finished)
            .unwrap()
        {
            Message::ServerFinished(finished) => finished,
            other => panic!("expected ServerFinished, got {}", other.type_name()),
        };
        initiator
            .initiator_process_server_finished(server_finished)
            .unwrap();

        assert!(initiator.is_established());
        assert!(responder.is_established());
        (
            initiator.into_session().unwrap(),
            responder.into_session().unwrap(),
        )
    }

    #[test]
    fn test_full_handshake_produces_matching_sessions() {
        let (initiator_config, responder_config) = configs();
        let (initiator, responder) = run_handshake(initiator_config, responder_config);

        assert_eq!(initiator.session_id(), responder.session_id());
        assert_eq!(initiator.suite(), responder.suite());
        assert_eq!(initiator.suite(), CipherSuite::Aes256Gcm);

        // Traffic keys agree in both directions.
        let (seq, ciphertext) = initiator.seal_record(TYPE_DATA, b"from initiator").unwrap();
        assert_eq!(
            responder.open_record(TYPE_DATA, seq, &ciphertext).unwrap(),
            b"from initiator"
        );
        let (seq, ciphertext) = responder.seal_record(TYPE_DATA, b"from responder").unwrap();
        assert_eq!(
            initiator.open_record(TYPE_DATA, seq, &ciphertext).unwrap(),
            b"from responder"
        );
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let (initiator_config, responder_config) = configs();
        let mut initiator = Handshake::initiator(initiator_config);
        let mut responder = Handshake::responder(responder_config);

        let mut client_hello = match initiator.initiator_hello().unwrap() {
            Message::ClientHello(hello) => hello,
            _ => unreachable!(),
        };
        client_hello.version = ProtocolVersion { major: 2, minor: 0 };

        assert!(matches!(
            responder.responder_process_client_hello(client_hello),
            Err(TunnelError::UnsupportedVersion { major: 2, minor: 0 })
        ));
    }

    #[test]
    fn test_minor_version_difference_tolerated() {
        let (initiator_config, responder_config) = configs();
        let mut initiator = Handshake::initiator(initiator_config);
        let mut responder = Handshake::responder(responder_config);

        let mut client_hello = match initiator.initiator_hello().unwrap() {
            Message::ClientHello(hello) => hello,
            _ => unreachable!(),
        };
        client_hello.version = ProtocolVersion { major: 1, minor: 9 };
        assert!(responder.responder_process_client_hello(client_hello).is_ok());
    }

    #[test]
    fn test_unknown_suites_only_rejected() {
        let (initiator_config, responder_config) = configs();
        let mut initiator = Handshake::initiator(initiator_config);
        let mut responder = Handshake::responder(responder_config);

        let mut client_hello = match initiator.initiator_hello().unwrap() {
            Message::ClientHello(hello) => hello,
            _ => unreachable!(),
        };
        client_hello.cipher_suites = vec![0x7777];
        assert!(matches!(
            responder.responder_process_client_hello(client_hello),
            Err(TunnelError::UnsupportedCipherSuite(0x7777))
        ));
    }

    #[test]
    fn test_fips_responder_rejects_chacha_only_offer() {
        let mut initiator = Handshake::initiator(TunnelConfig::new());
        let mut responder = Handshake::responder(TunnelConfig::fips());

        let mut client_hello = match initiator.initiator_hello().unwrap() {
            Message::ClientHello(hello) => hello,
            _ => unreachable!(),
        };
        client_hello.cipher_suites = vec![CipherSuite::ChaCha20Poly1305.wire_id()];
        assert!(matches!(
            responder.responder_process_client_hello(client_hello),
            Err(TunnelError::UnsupportedCipherSuite(_))
        ));
    }

    #[test]
    fn test_fips_negotiates_aes() {
        let (initiator, responder) = run_handshake(TunnelConfig::fips(), TunnelConfig::fips());
        assert_eq!(initiator.suite(), CipherSuite::Aes256Gcm);
        assert_eq!(responder.suite(), CipherSuite::Aes256Gcm);
    }

    #[test]
    fn test_tampered_finished_rejected() {
        let (initiator_config, responder_config) = configs();
        let mut initiator = Handshake::initiator(initiator_config);
        let mut responder = Handshake::responder(responder_config);

        let client_hello = match initiator.initiator_hello().unwrap() {
            Message::ClientHello(hello) => hello,
            _ => unreachable!(),
        };
        let server_hello = match responder
            .responder_process_client_hello(client_hello)
            .unwrap()
        {
            Message::ServerHello(hello) => hello,
            _ => unreachable!(),
        };
        let mut client_finished = match initiator
            .initiator_process_server_hello(server_hello)
            .unwrap()
        {
            Message::ClientFinished(finished) => finished,
            _ => unreachable!(),
        };
        client_finished.payload[0] ^= 0x01;

        assert!(matches!(
            responder.responder_process_client_finished(client_finished),
            Err(TunnelError::HandshakeFailure("finished verification"))
        ));
    }

    #[test]
    fn test_tampered_server_hello_surfaces_at_finished() {
        let (initiator_config, responder_config) = configs();
        let mut initiator = Handshake::initiator(initiator_config);
        let mut responder = Handshake::responder(responder_config);

        let client_hello = match initiator.initiator_hello().unwrap() {
            Message::ClientHello(hello) => hello,
            _ => unreachable!(),
        };
        let mut server_hello = match responder
            .responder_process_client_hello(client_hello)
            .unwrap()
        {
            Message::ServerHello(hello) => hello,
            _ => unreachable!(),
        };
        // Malleate the encapsulation: decapsulation still succeeds
        // (implicit rejection) but the keys diverge, so the responder's
        // Finished check fails.
        let last = server_hello.ciphertext.len() - 1;
        server_hello.ciphertext[last] ^= 0x01;

        let client_finished = match initiator
            .initiator_process_server_hello(server_hello)
            .unwrap()
        {
            Message::ClientFinished(finished) => finished,
            _ => unreachable!(),
        };
        assert!(matches!(
            responder.responder_process_client_finished(client_finished),
            Err(TunnelError::HandshakeFailure("finished verification"))
        ));
    }

    #[test]
    fn test_verify_data_labels_disjoint() {
        let (initiator_config, responder_config) = configs();
        let mut initiator = Handshake::initiator(initiator_config);
        let mut responder = Handshake::responder(responder_config);

        let client_hello = match initiator.initiator_hello().unwrap() {
            Message::ClientHello(hello) => hello,
            _ => unreachable!(),
        };
        let server_hello = match responder
            .responder_process_client_hello(client_hello)
            .unwrap()
        {
            Message::ServerHello(hello) => hello,
            _ => unreachable!(),
        };
        initiator
            .initiator_process_server_hello(server_hello)
            .unwrap();

        let client_verify = initiator.verify_data(Role::Initiator).unwrap();
        let server_verify = initiator.verify_data(Role::Responder).unwrap();
        assert_ne!(client_verify, server_verify);

        // Both sides compute identical verify_data from identical
        // transcripts and secrets.
        assert_eq!(initiator.transcript(), responder.transcript());
        assert_eq!(
            client_verify,
            responder.verify_data(Role::Initiator).unwrap()
        );
    }

    #[test]
    fn test_bad_session_id_length_rejected() {
        let (initiator_config, responder_config) = configs();
        let mut initiator = Handshake::initiator(initiator_config);
        let mut responder = Handshake::responder(responder_config);

        let client_hello = match initiator.initiator_hello().unwrap() {
            Message::ClientHello(hello) => hello,
            _ => unreachable!(),
        };
        let mut server_hello = match responder
            .responder_process_client_hello(client_hello)
            .unwrap()
        {
            Message::ServerHello(hello) => hello,
            _ => unreachable!(),
        };
        server_hello.session_id.truncate(8);

        assert!(matches!(
            initiator.initiator_process_server_hello(server_hello),
            Err(TunnelError::InvalidMessage("bad session id length"))
        ));
    }

    #[test]
    fn test_out_of_order_message_fails() {
        let (_, responder_config) = configs();
        let mut responder = Handshake::responder(responder_config);
        let bogus = Finished {
            payload: vec![0u8; FINISHED_PAYLOAD_LEN],
        };
        assert!(matches!(
            responder.responder_process_client_finished(bogus),
            Err(TunnelError::HandshakeFailure("unexpected handshake state"))
        ));
    }
}

//! Tunnel configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TunnelError};
use crate::observer::{NoopObserver, SessionObserver};
use crate::types::{
    DEFAULT_REKEY_AFTER_BYTES, DEFAULT_REKEY_AFTER_PACKETS, DEFAULT_REKEY_AFTER_SECS,
    MAX_MESSAGE_SIZE,
};
use crypto::aead::CipherSuite;

/// Builds one observer per session.
pub type ObserverFactory = Arc<dyn Fn() -> Arc<dyn SessionObserver> + Send + Sync>;

/// Configuration for tunnel endpoints.
#[derive(Clone)]
pub struct TunnelConfig {
    /// Per-call receive deadline; `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Per-call send deadline; `None` waits indefinitely.
    pub write_timeout: Option<Duration>,
    /// Overall deadline for the four-message handshake.
    pub handshake_timeout: Duration,
    /// Cap on a decoded frame payload.
    pub max_message_size: usize,
    /// Suites offered in the ClientHello, in preference order.
    pub cipher_suite_preference: Vec<CipherSuite>,
    /// Rekey triggers.
    pub rekey_after_bytes: u64,
    pub rekey_after_packets: u64,
    pub rekey_after: Duration,
    /// Restrict suites to the FIPS-approved set and run power-on self-tests.
    pub fips_mode: bool,
    /// Optional per-session observer factory.
    pub observer_factory: Option<ObserverFactory>,
}

impl TunnelConfig {
    pub fn new() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            handshake_timeout: Duration::from_secs(30),
            max_message_size: MAX_MESSAGE_SIZE,
            cipher_suite_preference: CipherSuite::supported(false).to_vec(),
            rekey_after_bytes: DEFAULT_REKEY_AFTER_BYTES,
            rekey_after_packets: DEFAULT_REKEY_AFTER_PACKETS,
            rekey_after: Duration::from_secs(DEFAULT_REKEY_AFTER_SECS),
            fips_mode: false,
            observer_factory: None,
        }
    }

    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::new()
    }

    /// FIPS-restricted configuration: AES-256-GCM only, self-tests on.
    pub fn fips() -> Self {
        let mut config = Self::new();
        config.fips_mode = true;
        config.cipher_suite_preference = CipherSuite::supported(true).to_vec();
        config
    }

    /// Check internal consistency; called by the transport before use.
    pub fn validate(&self) -> Result<()> {
        if self.cipher_suite_preference.is_empty() {
            return Err(TunnelError::InvalidMessage("empty cipher suite preference"));
        }
        if self.fips_mode {
            for suite in &self.cipher_suite_preference {
                if !suite.is_fips_approved() {
                    return Err(TunnelError::CipherSuiteNotFipsApproved(*suite));
                }
            }
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_MESSAGE_SIZE {
            return Err(TunnelError::InvalidMessage("bad max message size"));
        }
        Ok(())
    }

    /// Instantiate the per-session observer.
    pub fn make_observer(&self) -> Arc<dyn SessionObserver> {
        match &self.observer_factory {
            Some(factory) => factory(),
            None => Arc::new(NoopObserver),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`TunnelConfig`].
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl Default for TunnelConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TunnelConfig::new(),
        }
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn cipher_suite_preference(mut self, suites: impl Into<Vec<CipherSuite>>) -> Self {
        self.config.cipher_suite_preference = suites.into();
        self
    }

    pub fn rekey_after_bytes(mut self, bytes: u64) -> Self {
        self.config.rekey_after_bytes = bytes;
        self
    }

    pub fn rekey_after_packets(mut self, packets: u64) -> Self {
        self.config.rekey_after_packets = packets;
        self
    }

    pub fn rekey_after(mut self, age: Duration) -> Self {
        self.config.rekey_after = age;
        self
    }

    pub fn fips_mode(mut self, enabled: bool) -> Self {
        self.config.fips_mode = enabled;
        if enabled {
            self.config.cipher_suite_preference = CipherSuite::supported(true).to_vec();
        }
        self
    }

    pub fn observer_factory(mut self, factory: ObserverFactory) -> Self {
        self.config.observer_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<TunnelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

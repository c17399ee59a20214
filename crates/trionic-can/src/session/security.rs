//! Seed/key security access

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{SecurityLevel, Session};
use crate::config::SecurityConfig;
use crate::error::{ProtocolError, SecurityError};
use crate::events::{Activity, EventSink, Severity};
use crate::kwp::{KwpService, NegativeResponseCode};

/// Turns an ECU seed into the matching key
///
/// Implemented for plain closures, so a test or an application can inject
/// any transform without a wrapper type.
pub trait KeyAlgorithm: Send + Sync {
    fn compute_key(&self, seed: &[u8], level: SecurityLevel) -> Vec<u8>;
}

impl<F> KeyAlgorithm for F
where
    F: Fn(&[u8], SecurityLevel) -> Vec<u8> + Send + Sync,
{
    fn compute_key(&self, seed: &[u8], level: SecurityLevel) -> Vec<u8> {
        self(seed, level)
    }
}

/// XOR the seed with a secret, cycling over the secret bytes
#[derive(Debug, Clone)]
pub struct XorKeyAlgorithm {
    secret: Vec<u8>,
}

impl XorKeyAlgorithm {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Build from a hex string such as `"A5C3"`
    pub fn from_hex(secret: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self::new(hex::decode(secret)?))
    }
}

impl KeyAlgorithm for XorKeyAlgorithm {
    fn compute_key(&self, seed: &[u8], _level: SecurityLevel) -> Vec<u8> {
        if self.secret.is_empty() {
            return seed.to_vec();
        }
        seed.iter()
            .enumerate()
            .map(|(i, b)| b ^ self.secret[i % self.secret.len()])
            .collect()
    }
}

/// Runs the seed/key handshake and records the granted level on the session
#[derive(Clone)]
pub struct SecurityAccess {
    kwp: KwpService,
    config: SecurityConfig,
    algorithm: Arc<dyn KeyAlgorithm>,
    session: Arc<RwLock<Session>>,
    events: Arc<dyn EventSink>,
}

impl SecurityAccess {
    pub(crate) fn new(
        kwp: KwpService,
        config: SecurityConfig,
        algorithm: Arc<dyn KeyAlgorithm>,
        session: Arc<RwLock<Session>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            kwp,
            config,
            algorithm,
            session,
            events,
        }
    }

    /// Currently granted level
    pub fn granted(&self) -> SecurityLevel {
        self.session.read().security_level
    }

    /// Seed request mode for a level
    pub fn access_mode(&self, level: SecurityLevel) -> Option<u8> {
        match level {
            SecurityLevel::None => None,
            SecurityLevel::Read => Some(self.config.read_access_mode),
            SecurityLevel::Write => Some(self.config.write_access_mode),
        }
    }

    /// Obtain at least `level`
    ///
    /// Does nothing on the bus when the granted level already covers the
    /// request. An invalid key is retried with a fresh seed until
    /// `max_key_attempts` keys have been sent.
    pub async fn request_access(&self, level: SecurityLevel) -> Result<(), SecurityError> {
        let granted = self.granted();
        let Some(mode) = self.access_mode(level).filter(|_| granted < level) else {
            debug!(%granted, requested = %level, "Security level already granted");
            return Ok(());
        };

        self.events.on_info(
            &format!("Requesting {} access", level),
            Severity::Info,
            Activity::SecurityAccess,
        );

        let max_attempts = self.config.max_key_attempts;
        let mut attempts = 0u32;
        loop {
            let seed = self
                .kwp
                .request_seed(mode)
                .await
                .map_err(|e| seed_error(e, attempts))?;

            if seed.is_empty() {
                return Err(SecurityError::SeedRejected("ECU sent an empty seed".to_string()));
            }
            if seed.iter().all(|&b| b == 0) {
                // Zero seed means already unlocked
                debug!(mode = format!("0x{:02X}", mode), "Security already unlocked (zero seed)");
                self.grant(level);
                return Ok(());
            }

            let key = self.algorithm.compute_key(&seed, level);
            if key.is_empty() {
                return Err(SecurityError::SeedRejected(format!(
                    "No key for seed {}",
                    hex::encode(&seed)
                )));
            }

            attempts += 1;
            match self.kwp.send_key(mode, &key).await {
                Ok(()) => {
                    self.grant(level);
                    return Ok(());
                }
                Err(ProtocolError::NegativeResponse {
                    nrc: NegativeResponseCode::InvalidKey,
                    ..
                }) if attempts < max_attempts => {
                    warn!(attempts, max_attempts, "Key rejected, requesting a new seed");
                }
                Err(ProtocolError::NegativeResponse { nrc, .. })
                    if nrc == NegativeResponseCode::InvalidKey || nrc.is_lockout() =>
                {
                    return Err(SecurityError::KeyRejected { attempts });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fail unless at least `required` has been granted
    pub fn require(&self, required: SecurityLevel) -> Result<(), SecurityError> {
        let granted = self.granted();
        if granted < required {
            return Err(SecurityError::InsufficientLevel { required, granted });
        }
        Ok(())
    }

    fn grant(&self, level: SecurityLevel) {
        self.session.write().security_level = level;
        info!(%level, "Security access granted");
        self.events.on_info(
            &format!("{} access granted", level),
            Severity::Info,
            Activity::SecurityAccess,
        );
    }
}

fn seed_error(err: ProtocolError, attempts: u32) -> SecurityError {
    match err {
        ProtocolError::NegativeResponse { nrc, .. } if nrc.is_lockout() => {
            SecurityError::KeyRejected { attempts }
        }
        ProtocolError::NegativeResponse { nrc, .. } => {
            SecurityError::SeedRejected(format!("{} (0x{:02X})", nrc, nrc))
        }
        other => other.into(),
    }
}

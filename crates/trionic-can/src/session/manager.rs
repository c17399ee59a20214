//! Session manager for ECU communication

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::security::{KeyAlgorithm, SecurityAccess};
use super::{SecurityLevel, Session, SessionState, IBUS_BAUD_RATE, PBUS_BAUD_RATE};
use crate::config::FlashConfig;
use crate::error::{ProtocolError, TransferError};
use crate::events::{Activity, EventSink, Severity};
use crate::kwp::{KwpService, ServiceIds};
use crate::transport::{CanTransport, Channel};

/// Owns the bus connection and the diagnostic session on it
pub struct SessionManager {
    channel: Arc<Channel>,
    kwp: KwpService,
    config: Arc<FlashConfig>,
    security: SecurityAccess,
    session: Arc<RwLock<Session>>,
    events: Arc<dyn EventSink>,
    keepalive_handle: Mutex<Option<JoinHandle<()>>>,
    job_active: AtomicBool,
}

/// Admission to the session's single transfer slot, released on drop
pub struct JobGuard<'a> {
    active: &'a AtomicBool,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl SessionManager {
    /// Create a manager for a transport
    ///
    /// The configuration is expected to be validated already (see
    /// [`FlashConfig::validate`]) and stays fixed for the manager's lifetime.
    pub fn new(
        transport: Box<dyn CanTransport>,
        config: FlashConfig,
        key_algorithm: Arc<dyn KeyAlgorithm>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let channel = Arc::new(Channel::new(transport, &config));
        let kwp = KwpService::with_service_ids(
            channel.clone(),
            ServiceIds::from_overrides(&config.service_overrides),
        )
        .with_timeout(config.transfer.frame_timeout())
        .with_pending_timeout(config.transfer.response_pending_timeout());

        let session = Arc::new(RwLock::new(Session {
            state: SessionState::Closed,
            baud_rate: None,
            comport: None,
            only_pbus: config.only_pbus,
            forced_baud_rate: (config.forced_baud_rate != 0).then_some(config.forced_baud_rate),
            forced_comport: config.comport().map(str::to_string),
            sleep_time: config.sleep_time.as_duration(),
            connection_check_disabled: config.disable_connection_check,
            security_level: SecurityLevel::None,
        }));

        let security = SecurityAccess::new(
            kwp.clone(),
            config.security.clone(),
            key_algorithm,
            session.clone(),
            events.clone(),
        );

        Self {
            channel,
            kwp,
            config: Arc::new(config),
            security,
            session,
            events,
            keepalive_handle: Mutex::new(None),
            job_active: AtomicBool::new(false),
        }
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.session.read().state
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.session.read().security_level
    }

    pub fn security(&self) -> &SecurityAccess {
        &self.security
    }

    pub fn kwp(&self) -> &KwpService {
        &self.kwp
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Claim the transfer slot
    ///
    /// At most one read or write job runs per session, no matter how many
    /// orchestrators or engines share it. Fails with [`TransferError::Busy`]
    /// while another job holds the slot.
    pub fn begin_job(&self) -> Result<JobGuard<'_>, TransferError> {
        self.job_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TransferError::Busy)?;
        Ok(JobGuard {
            active: &self.job_active,
        })
    }

    pub fn is_job_active(&self) -> bool {
        self.job_active.load(Ordering::SeqCst)
    }

    /// Open the bus and establish the diagnostic session
    ///
    /// Tries the forced bitrate, or the P-bus and then (unless `only_pbus`)
    /// the I-bus bitrate, probing each with TesterPresent. With
    /// `request_security_access` (or `security_access_on_open`) write access
    /// is negotiated before the session counts as open.
    pub async fn open(&self, request_security_access: bool) -> Result<Session, ProtocolError> {
        let previous = {
            let mut session = self.session.write();
            match session.state {
                SessionState::Closed | SessionState::Faulted => {
                    let previous = session.state;
                    session.state = SessionState::Connecting;
                    session.security_level = SecurityLevel::None;
                    session.baud_rate = None;
                    previous
                }
                other => {
                    return Err(ProtocolError::InvalidState(format!(
                        "Cannot open a session that is {}",
                        other
                    )))
                }
            }
        };

        if previous == SessionState::Faulted {
            self.stop_keepalive().await;
            self.channel.close().await;
        }

        self.events
            .on_info("Connecting to ECU", Severity::Info, Activity::Connecting);

        let baud_rate = match self.connect().await {
            Ok(baud_rate) => baud_rate,
            Err(e) => {
                self.abort_open(&e, Activity::Connecting).await;
                return Err(e);
            }
        };

        {
            let mut session = self.session.write();
            session.baud_rate = Some(baud_rate);
            session.comport = self.config.comport().map(str::to_string);
        }

        if request_security_access || self.config.security_access_on_open {
            self.session.write().state = SessionState::SecurityPending;
            if let Err(e) = self.security.request_access(SecurityLevel::Write).await {
                let err = ProtocolError::Security(e);
                self.abort_open(&err, Activity::SecurityAccess).await;
                return Err(err);
            }
        }

        self.session.write().state = SessionState::Open;
        self.start_keepalive().await;

        info!(baud_rate, "Session open");
        self.events.on_info(
            &format!("Connected at {} bit/s", baud_rate),
            Severity::Info,
            Activity::Connecting,
        );

        Ok(self.session())
    }

    /// Close the session and release the transport
    ///
    /// Safe to call in any state, including repeatedly.
    pub async fn close(&self) {
        self.stop_keepalive().await;
        self.channel.close().await;

        let previous = {
            let mut session = self.session.write();
            let previous = session.state;
            session.state = SessionState::Closed;
            session.security_level = SecurityLevel::None;
            session.baud_rate = None;
            previous
        };

        if previous != SessionState::Closed {
            info!("Session closed");
            self.events
                .on_info("Session closed", Severity::Info, Activity::Idle);
        }
    }

    /// Mark the session unusable after a fatal link fault
    pub fn mark_faulted(&self, reason: &str) {
        if fault(&self.session) {
            error!(reason, "Session faulted");
            self.events.on_info(
                &format!("Session faulted: {}", reason),
                Severity::Error,
                Activity::Idle,
            );
        }
    }

    /// Forget granted security after the ECU was reset
    ///
    /// The ECU comes back in its default diagnostic session with security
    /// locked. The bus connection and keepalive stay as they are.
    pub fn notify_ecu_reset(&self) {
        self.session.write().security_level = SecurityLevel::None;
        info!("Security level cleared (ECU reset)");
    }

    fn baud_candidates(&self) -> Vec<u32> {
        if self.config.forced_baud_rate != 0 {
            return vec![self.config.forced_baud_rate];
        }
        if self.config.only_pbus {
            vec![PBUS_BAUD_RATE]
        } else {
            vec![PBUS_BAUD_RATE, IBUS_BAUD_RATE]
        }
    }

    async fn connect(&self) -> Result<u32, ProtocolError> {
        let comport = self.config.comport();
        let probe_timeout = self.config.keepalive.timeout();
        let mut last_timeout = None;

        for baud_rate in self.baud_candidates() {
            debug!(baud_rate, ?comport, "Opening adapter");
            self.channel.open(comport, Some(baud_rate)).await?;

            if self.config.disable_connection_check {
                return Ok(baud_rate);
            }

            match self.kwp.tester_present(probe_timeout).await {
                Ok(()) => return Ok(baud_rate),
                Err(ProtocolError::Timeout(e)) => {
                    warn!(baud_rate, "No response from ECU, trying next bitrate");
                    self.channel.close().await;
                    last_timeout = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(match last_timeout {
            Some(e) => ProtocolError::Timeout(e),
            None => ProtocolError::InvalidState("No bitrate to try".to_string()),
        })
    }

    async fn abort_open(&self, err: &ProtocolError, activity: Activity) {
        self.channel.close().await;
        {
            let mut session = self.session.write();
            session.state = SessionState::Closed;
            session.security_level = SecurityLevel::None;
            session.baud_rate = None;
        }
        error!(error = %err, "Failed to open session");
        self.events.on_info(
            &format!("Failed to open session: {}", err),
            Severity::Error,
            activity,
        );
    }

    async fn start_keepalive(&self) {
        if !self.config.keepalive.enabled {
            return;
        }

        self.stop_keepalive().await;

        let kwp = self.kwp.clone();
        let session = self.session.clone();
        let events = self.events.clone();
        let interval = self.config.keepalive.interval();
        let timeout = self.config.keepalive.timeout();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if session.read().state != SessionState::Open {
                    break;
                }

                match kwp.tester_present(timeout).await {
                    Ok(()) => {
                        debug!("Tester present OK");
                    }
                    Err(e) => {
                        if fault(&session) {
                            error!(error = %e, "Tester present failed, session faulted");
                            events.on_info(
                                &format!("Keepalive failed: {}", e),
                                Severity::Error,
                                Activity::Idle,
                            );
                        }
                        break;
                    }
                }
            }
        });

        *self.keepalive_handle.lock().await = Some(handle);
        debug!(
            interval_ms = self.config.keepalive.interval_ms,
            "Keepalive started"
        );
    }

    async fn stop_keepalive(&self) {
        let mut handle = self.keepalive_handle.lock().await;
        if let Some(h) = handle.take() {
            h.abort();
            debug!("Keepalive stopped");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Move an active session to Faulted; returns false if it was not active
fn fault(session: &RwLock<Session>) -> bool {
    let mut session = session.write();
    match session.state {
        SessionState::Open | SessionState::SecurityPending | SessionState::Connecting => {
            session.state = SessionState::Faulted;
            session.security_level = SecurityLevel::None;
            true
        }
        SessionState::Closed | SessionState::Faulted => false,
    }
}

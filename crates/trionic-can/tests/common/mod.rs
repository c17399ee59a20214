//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use trionic_can::config::{KeepaliveConfig, TransferConfig};
use trionic_can::{
    Activity, EventSink, FlashConfig, FlashEvent, KeyAlgorithm, SessionManager, Severity,
    SimulatedEcu, SleepTime, WriteProgress, XorKeyAlgorithm,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast timings, no inter-frame delay, keepalive off
pub fn test_config() -> FlashConfig {
    FlashConfig {
        sleep_time: SleepTime::Custom(0),
        keepalive: KeepaliveConfig {
            enabled: false,
            interval_ms: 100,
            timeout_ms: 50,
            ecu_session_timeout_ms: 500,
        },
        transfer: TransferConfig {
            frame_timeout_ms: 50,
            retry_delay_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Matches the simulated ECU's default XOR `FF FF` key
pub fn key_algorithm() -> Arc<dyn KeyAlgorithm> {
    Arc::new(XorKeyAlgorithm::new(vec![0xFF, 0xFF]))
}

type ProgressHook = Box<dyn Fn(&WriteProgress) + Send + Sync>;

/// Records every event; optionally runs a hook on write progress
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FlashEvent>>,
    hook: Option<ProgressHook>,
}

impl RecordingSink {
    pub fn with_hook(hook: impl Fn(&WriteProgress) + Send + Sync + 'static) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            hook: Some(Box::new(hook)),
        }
    }

    pub fn events(&self) -> Vec<FlashEvent> {
        self.events.lock().clone()
    }

    pub fn write_progress(&self) -> Vec<WriteProgress> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::WriteProgress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn read_progress(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::ReadProgress { percentage } => Some(percentage),
                _ => None,
            })
            .collect()
    }

    pub fn infos(&self, severity: Severity) -> Vec<(String, Activity)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Info {
                    message,
                    severity: s,
                    activity,
                } if s == severity => Some((message, activity)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn on_write_progress(&self, progress: WriteProgress) {
        self.events.lock().push(FlashEvent::WriteProgress(progress));
        if let Some(hook) = &self.hook {
            hook(&progress);
        }
    }

    fn on_read_progress(&self, percentage: u8) {
        self.events
            .lock()
            .push(FlashEvent::ReadProgress { percentage });
    }

    fn on_info(&self, message: &str, severity: Severity, activity: Activity) {
        self.events.lock().push(FlashEvent::Info {
            message: message.to_string(),
            severity,
            activity,
        });
    }
}

pub fn manager_with_sink(
    ecu: &SimulatedEcu,
    config: FlashConfig,
    sink: Arc<RecordingSink>,
) -> Arc<SessionManager> {
    init_tracing();
    Arc::new(SessionManager::new(
        Box::new(ecu.clone()),
        config,
        key_algorithm(),
        sink,
    ))
}

pub fn manager(ecu: &SimulatedEcu, config: FlashConfig) -> (Arc<SessionManager>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    (manager_with_sink(ecu, config, sink.clone()), sink)
}

/// Open a session and forget the requests it took
pub async fn open_session(
    ecu: &SimulatedEcu,
    config: FlashConfig,
    security: bool,
) -> (Arc<SessionManager>, Arc<RecordingSink>) {
    let (manager, sink) = manager(ecu, config);
    manager.open(security).await.unwrap();
    ecu.clear_requests();
    (manager, sink)
}

/// Deterministic test image
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

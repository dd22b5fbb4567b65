//! Fixtures shared by the protocol tests.
use std::{
    sync::{Mutex, Once, PoisonError},
    thread,
    time::Duration,
};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::config::MllpConfig;

pub const TEST_MESSAGE: &[u8] = b"MSH|^~\\&|REQUESTING|ICE|INHOUSE|RTH00|20161206193919||ORM^O01|00001|D|2.3|||||||\rPID|1||ICE999999^^^ICE^ICE||Testpatient^Testy^^^Mr||19740401|M\rNTE|1||Free text for entering clinical details|\r";

/// An ADT message carrying `control_id` in MSH-10.
pub fn message(control_id: &str) -> Vec<u8> {
    format!(
        "MSH|^~\\&|SENDER|FAC|RECEIVER|FAC|20240101120000||ADT^A01|{control_id}|P|2.5\rPID|1||{control_id}^^^HOSP||Doe^Jane\r"
    )
    .into_bytes()
}

/// Loopback configuration with an ephemeral port and short timeouts.
pub fn test_config() -> MllpConfig {
    MllpConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        connect_timeout: Duration::from_secs(1),
        receive_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_millis(300),
        bind_timeout: Duration::from_secs(1),
        bind_retry_interval: Duration::from_millis(100),
        max_concurrent_consumers: 4,
        ..MllpConfig::default()
    }
}

/// Keeps every log record in memory with the name of the thread that wrote it.
struct CapturingLogger {
    records: Mutex<Vec<(String, Level, String)>>,
}

static LOGGER: CapturingLogger = CapturingLogger {
    records: Mutex::new(Vec::new()),
};

impl Log for CapturingLogger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let thread = thread::current().name().unwrap_or_default().to_string();
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((thread, record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

/// Installs the in-memory logger for the whole test binary and returns the
/// position from which records written from now on can be read.
pub fn capture_logs() -> usize {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    });
    LOGGER.records.lock().unwrap_or_else(PoisonError::into_inner).len()
}

/// Records written after `from` by the accept loop or workers of the listener on `port`.
pub fn server_logs(port: u16, from: usize) -> Vec<(Level, String)> {
    let accept = format!("mllp-accept-{port}");
    let worker = format!("mllp-{port}-");

    LOGGER
        .records
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .skip(from)
        .filter(|(thread, ..)| *thread == accept || thread.starts_with(&worker))
        .map(|(_, level, message)| (*level, message.clone()))
        .collect()
}

use std::sync::OnceLock;

use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::broadcast;

static LOGGER: OnceLock<BroadcastLogger> = OnceLock::new();

const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub target: String,
    pub timestamp: String,
}

/// Writes records to stderr and fans them out to any number of subscribers,
/// typically a UI showing engine activity.
pub struct BroadcastLogger {
    level: Level,
    sender: broadcast::Sender<LogMessage>,
}

impl BroadcastLogger {
    pub fn new(level: Level) -> Self {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self { level, sender }
    }

    /// Installs the logger process-wide.
    pub fn init(level: Level) -> Result<&'static BroadcastLogger, SetLoggerError> {
        let logger = LOGGER.get_or_init(|| BroadcastLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(level.to_level_filter()))?;
        Ok(logger)
    }

    /// The installed logger, if [`init`](Self::init) succeeded.
    pub fn installed() -> Option<&'static BroadcastLogger> {
        LOGGER.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogMessage> {
        self.sender.subscribe()
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            target: record.target().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };
        // Nobody listening is the common case.
        let _ = self.sender.send(log_message);
    }
}

impl log::Log for BroadcastLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}

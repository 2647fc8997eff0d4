//! Embeddable request/response logging.
//!
//! Host applications that integrate the stack often have their own logging
//! pipeline, so the connection layer logs through a caller-supplied
//! callback rather than a global subscriber. The logger can render frames
//! raw (hex dump), interpreted (named function, address, quantity) or
//! both.

use std::sync::Arc;

/// Severity levels for the callback logging system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// The level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// How packet traffic is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Hex dump only.
    Raw,
    /// Decoded field summary only.
    Interpreted,
    /// Summary at info, hex dump at debug.
    Both,
}

/// Callback signature: receives the level and the rendered message.
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger delivering traffic summaries to a host-supplied callback.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a logger with a callback and minimum level.
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Interpreted,
        }
    }

    /// Create a logger with an explicit rendering mode.
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// A logger printing to stdout/stderr with timestamps.
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                _ => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// A logger that emits nothing.
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// The current rendering mode.
    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    /// Change the rendering mode.
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Deliver a message at the given level.
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(callback) = &self.callback {
                callback(level, message);
            }
        }
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log an outbound request.
    pub fn log_request(&self, unit_id: u8, function_code: u8, address: u16, quantity: u16, data: &[u8]) {
        match self.mode {
            LoggingMode::Raw => {
                self.log(
                    LogLevel::Info,
                    &format!(
                        "Modbus request -> unit {} fn 0x{:02X} raw: {}",
                        unit_id,
                        function_code,
                        hex::encode_upper(data)
                    ),
                );
            }
            LoggingMode::Interpreted => {
                self.log(LogLevel::Info, &Self::describe_request(unit_id, function_code, address, quantity));
            }
            LoggingMode::Both => {
                self.log(LogLevel::Info, &Self::describe_request(unit_id, function_code, address, quantity));
                self.log(
                    LogLevel::Debug,
                    &format!("Modbus request -> raw: {}", hex::encode_upper(data)),
                );
            }
        }
    }

    /// Log an inbound response.
    pub fn log_response(&self, unit_id: u8, function_code: u8, data: &[u8]) {
        match self.mode {
            LoggingMode::Raw => {
                self.log(
                    LogLevel::Info,
                    &format!(
                        "Modbus response <- unit {} fn 0x{:02X} raw: {}",
                        unit_id,
                        function_code,
                        hex::encode_upper(data)
                    ),
                );
            }
            LoggingMode::Interpreted => {
                self.log(
                    LogLevel::Info,
                    &format!(
                        "Modbus response <- unit {} {} ({} bytes)",
                        unit_id,
                        Self::function_name(function_code),
                        data.len()
                    ),
                );
            }
            LoggingMode::Both => {
                self.log(
                    LogLevel::Info,
                    &format!(
                        "Modbus response <- unit {} {} ({} bytes)",
                        unit_id,
                        Self::function_name(function_code),
                        data.len()
                    ),
                );
                self.log(
                    LogLevel::Debug,
                    &format!("Modbus response <- raw: {}", hex::encode_upper(data)),
                );
            }
        }
    }

    fn describe_request(unit_id: u8, function_code: u8, address: u16, quantity: u16) -> String {
        format!(
            "Modbus request -> unit {} {} @ {} x{}",
            unit_id,
            Self::function_name(function_code),
            address,
            quantity
        )
    }

    fn function_name(function_code: u8) -> &'static str {
        match function_code {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x0F => "Write Multiple Coils",
            0x10 => "Write Multiple Registers",
            _ => "Unknown Function",
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_callback_receives_messages() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });

        let logger = CallbackLogger::new(Some(callback), LogLevel::Info);
        logger.log_request(1, 0x03, 100, 2, &[]);
        logger.log_response(1, 0x03, &[0x04, 0x00, 0x01, 0x00, 0x02]);

        let messages = captured.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].1.contains("Read Holding Registers"));
        assert!(messages[1].1.contains("5 bytes"));
    }

    #[test]
    fn test_level_filtering() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });

        let logger = CallbackLogger::with_mode(Some(callback), LogLevel::Warn, LoggingMode::Both);
        // Both mode logs the summary at info, which is below warn
        logger.log_request(1, 0x03, 0, 1, &[]);
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = CallbackLogger::disabled();
        // must not panic
        logger.log(LogLevel::Error, "nothing happens");
    }
}

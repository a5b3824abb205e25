//! Server-side logging helpers: timestamped, level-tagged console output.

use chrono::Local;

#[derive(Clone, Copy)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Auth,
    Room,
    Transfer,
    Game,
    Request,
}

impl LogLevel {
    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Auth => "AUTH",
            LogLevel::Room => "ROOM",
            LogLevel::Transfer => "TRANSFER",
            LogLevel::Game => "GAME",
            LogLevel::Request => "REQ",
        }
    }
}

pub fn log(level: LogLevel, message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    println!("[{}] [{}] {}", timestamp, level.prefix(), message);
}

pub fn log_error(context: &str, error: &dyn std::fmt::Display) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    eprintln!("[{}] [ERROR] {}: {}", timestamp, context, error);
}

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line of engine console output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub level: Level,
    pub message: String,
}

/// Engine console. Output is fanned out to every connected session as
/// `stdout` events.
#[derive(Clone)]
pub struct Console {
    tx: broadcast::Sender<ConsoleMessage>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        let _ = self.tx.send(ConsoleMessage {
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_reaches_subscribers() {
        let console = Console::new();
        let mut rx = console.subscribe();
        console.error("boom");
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.level, Level::Error);
        assert_eq!(msg.message, "boom");
    }

    #[test]
    fn log_without_subscribers_is_silent() {
        Console::new().info("nobody listening");
    }

    #[test]
    fn level_serializes_lowercase() {
        let v = serde_json::to_value(Level::Warn).unwrap();
        assert_eq!(v, "warn");
    }
}

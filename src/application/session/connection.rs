//! WebSocket connection handle

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Outbox of a live station connection
#[derive(Debug)]
pub struct Connection {
    /// Distinguishes successive connections of the same station
    pub connection_id: u64,
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Connection {
    pub fn new(connection_id: u64, sender: mpsc::UnboundedSender<String>) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            sender,
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn send(&self, message: String) -> Result<(), String> {
        self.sender
            .send(message)
            .map_err(|e| format!("Failed to send message: {}", e))
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

use crate::counters::Counter;
use serde::Deserialize;
use std::error::Error;
use std::time::Duration;

/// Settings for a [`Server`](crate::Server) and the recording pipeline
/// behind it. Every field has a default, so a JSON document only needs to
/// name what it changes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub address: String,
    /// Size in bytes of every pooled buffer.
    pub buffer_size: usize,
    /// Fill ratio after which a thread's buffer is queued for sending.
    pub high_water_mark: f64,
    /// Upper bound on pooled buffers, `None` for unbounded.
    pub max_buffers: Option<usize>,
    /// Number of filled buffers that may wait for the sender.
    pub queue_capacity: usize,
    /// How often partially filled buffers are flushed while idle.
    pub flush_interval_ms: u64,
    /// How often the listener checks for a connection or a stop request.
    pub accept_poll_interval_ms: u64,
    /// How long a single socket write may block. Also bounds how long a
    /// stop waits for a viewer that stopped reading.
    pub write_timeout_ms: u64,
    /// Timestamp source, see [`Counter::by_name`].
    pub counter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "127.0.0.1:28077".to_string(),
            buffer_size: 64 * 1024,
            high_water_mark: 0.9,
            max_buffers: Some(256),
            queue_capacity: 128,
            flush_interval_ms: 50,
            accept_poll_interval_ms: 20,
            write_timeout_ms: 1000,
            counter: "wall-time".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_json(json: &str) -> Result<ServerConfig, Box<dyn Error + Send + Sync>> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.buffer_size < 64 {
            return Err(format!("buffer_size must be at least 64, got {}", self.buffer_size).into());
        }
        if !(self.high_water_mark > 0.0 && self.high_water_mark <= 1.0) {
            return Err(format!(
                "high_water_mark must be in (0, 1], got {}",
                self.high_water_mark
            )
            .into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must not be zero".into());
        }
        if self.max_buffers == Some(0) {
            return Err("max_buffers must not be zero".into());
        }
        Counter::by_name(&self.counter)?;
        Ok(())
    }

    /// The high-water mark in bytes.
    pub fn high_water_bytes(&self) -> usize {
        ((self.buffer_size as f64) * self.high_water_mark) as usize
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }
}

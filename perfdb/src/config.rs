use serde::Deserialize;
use std::error::Error;
use std::time::Duration;

/// Settings for a [`Visualizer`](crate::Visualizer). All fields are
/// optional in JSON.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VisualizerConfig {
    /// How long connecting and receiving the handshake may take.
    pub connect_timeout_ms: u64,
    /// Size of a single socket read.
    pub read_chunk_size: usize,
    /// Frames declaring a longer body end the session.
    pub max_frame_len: usize,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        VisualizerConfig {
            connect_timeout_ms: 2000,
            read_chunk_size: 64 * 1024,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

impl VisualizerConfig {
    pub fn from_json(json: &str) -> Result<VisualizerConfig, Box<dyn Error + Send + Sync>> {
        let config: VisualizerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.read_chunk_size == 0 {
            return Err("read_chunk_size must not be zero".into());
        }
        if self.max_frame_len < 4 {
            return Err(format!("max_frame_len must be at least 4, got {}", self.max_frame_len).into());
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = VisualizerConfig::from_json(r#"{ "read_chunk_size": 4096 }"#).unwrap();
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.max_frame_len, VisualizerConfig::default().max_frame_len);
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        assert!(VisualizerConfig::from_json(r#"{ "read_chunk_size": 0 }"#).is_err());
        assert!(VisualizerConfig::from_json(r#"{ "max_frame_len": "big" }"#).is_err());
    }
}

//! Application configuration
//!
//! Loaded from TOML. Every section falls back to defaults, so an empty file
//! (or no file at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub ui: UiConfig,
}

impl AppConfig {
    /// Load configuration from `path`, or from the per-user config file when
    /// `path` is `None`. A missing per-user file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(Self::default()),
            },
        };

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/term-relay/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "term-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_clients == 0 {
            return Err(Error::Config("server.max_clients must be at least 1".into()));
        }
        if self.server.audio_queue_capacity == 0 || self.server.video_queue_capacity == 0 {
            return Err(Error::Config("relay queue capacities must be non-zero".into()));
        }
        if self.server.video_ring_capacity < 2 {
            return Err(Error::Config("server.video_ring_capacity must be at least 2".into()));
        }
        if self.server.max_image_pixels == 0 {
            return Err(Error::Config("server.max_image_pixels must be non-zero".into()));
        }
        if self.server.video_fps == 0 {
            return Err(Error::Config("server.video_fps must be non-zero".into()));
        }
        self.audio.validate()?;
        if self.client.reconnect_base_ms == 0 || self.client.reconnect_max_ms < self.client.reconnect_base_ms {
            return Err(Error::Config(
                "client.reconnect_max_ms must be >= client.reconnect_base_ms > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Relay server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Admission control limit
    pub max_clients: usize,
    /// Stored display names are truncated to this many bytes
    pub max_display_name_len: usize,
    /// Base composition rate; doubled under backlog
    pub video_fps: u32,
    pub audio_mix_interval_ms: u64,
    pub audio_queue_capacity: usize,
    pub video_queue_capacity: usize,
    pub video_ring_capacity: usize,
    /// Largest inbound image a client may send, in pixels
    pub max_image_pixels: usize,
    pub recv_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_display_name_len: DISPLAY_NAME_FIELD_LEN - 1,
            video_fps: 60,
            audio_mix_interval_ms: 6,
            audio_queue_capacity: 64,
            video_queue_capacity: 8,
            video_ring_capacity: 16,
            max_image_pixels: 1920 * 1080,
            recv_timeout_ms: 30_000,
            send_timeout_ms: 5_000,
            stats_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    pub port: u16,
    pub display_name: String,
    pub send_video: bool,
    pub send_audio: bool,
    pub color: bool,
    pub stretch: bool,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Give up after this many consecutive failures; 0 retries forever
    pub max_reconnect_attempts: u32,
    pub keepalive_interval_ms: u64,
    /// Connection is considered lost when nothing arrives for this long
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub desired_fps: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            display_name: "TermChatter".to_string(),
            send_video: true,
            send_audio: true,
            color: false,
            stretch: false,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 0,
            keepalive_interval_ms: 3_000,
            idle_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            desired_fps: 30,
        }
    }
}

/// Audio engine and ring buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames_per_buffer: usize,
    pub ring_capacity: usize,
    pub jitter_threshold: usize,
    pub low_water_mark: usize,
    pub high_water_mark: usize,
    pub target_occupancy: usize,
    pub crossfade_samples: usize,
    pub input_gain: f32,
    pub echo_cancellation: bool,
    /// Worker wake-up timeout when no callback signal arrives
    pub worker_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frames_per_buffer: FRAMES_PER_BUFFER,
            ring_capacity: AUDIO_RING_BUFFER_SIZE,
            jitter_threshold: AUDIO_JITTER_THRESHOLD,
            low_water_mark: AUDIO_LOW_WATER_MARK,
            high_water_mark: AUDIO_HIGH_WATER_MARK,
            target_occupancy: AUDIO_TARGET_OCCUPANCY,
            crossfade_samples: AUDIO_CROSSFADE_SAMPLES,
            input_gain: 1.0,
            echo_cancellation: true,
            worker_timeout_ms: 5,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity < 2 {
            return Err(Error::Config("audio.ring_capacity must be at least 2".into()));
        }
        if self.low_water_mark > self.high_water_mark {
            return Err(Error::Config(
                "audio.low_water_mark must not exceed audio.high_water_mark".into(),
            ));
        }
        if self.target_occupancy > self.high_water_mark {
            return Err(Error::Config(
                "audio.target_occupancy must not exceed audio.high_water_mark".into(),
            ));
        }
        if self.high_water_mark >= self.ring_capacity || self.jitter_threshold >= self.ring_capacity {
            return Err(Error::Config(
                "audio water marks and jitter threshold must be below ring_capacity".into(),
            ));
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(Error::Config("audio.sample_rate and channels must be non-zero".into()));
        }
        Ok(())
    }
}

/// Local video source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            fps: 30,
        }
    }
}

/// Status API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_UI_PORT,
        }
    }
}

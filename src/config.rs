use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Backend used for the per-guild queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Json,
    Memory,
}

impl std::str::FromStr for QueueBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("QUEUE_BACKEND desconocido: {}", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Audio
    pub default_volume: f32,
    pub resolve_timeout: Duration,
    pub ytdlp_path: String,

    // Playlists
    pub max_playlist_size: usize,
    pub youtube_api_key: Option<String>,

    // Almacenamiento
    pub data_dir: PathBuf,
    pub queue_backend: QueueBackend,

    // Rendimiento
    pub worker_threads: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Audio
            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,
            resolve_timeout: humantime::parse_duration(
                &std::env::var("RESOLVE_TIMEOUT").unwrap_or_else(|_| "30s".to_string()),
            )?,
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),

            // Playlists
            max_playlist_size: std::env::var("MAX_PLAYLIST_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            youtube_api_key: std::env::var("YOUTUBE_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),

            // Almacenamiento
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "/app/data".to_string())
                .into(),
            queue_backend: std::env::var("QUEUE_BACKEND")
                .unwrap_or_else(|_| "json".to_string())
                .parse()?,

            // Rendimiento
            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Default volume must be a fraction between 0.0 and 1.0
    /// - Playlist cap must be greater than zero
    /// - Resolve timeout must be non-zero
    /// - At least one worker thread
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_volume) {
            anyhow::bail!(
                "Default volume must be between 0.0 and 1.0, got: {}",
                self.default_volume
            );
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        if self.resolve_timeout.is_zero() {
            anyhow::bail!("Resolve timeout must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the Discord token and the API key.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: commands {}\n  \
            Audio: {}% vol, resolve timeout {}, yt-dlp '{}'\n  \
            Playlists: cap {}, YouTube API {}\n  \
            Storage: {:?} en {}\n  \
            Workers: {}",
            self.guild_id.map_or("global".to_string(), |id| format!("guild {}", id)),
            (self.default_volume * 100.0).round() as u32,
            humantime::format_duration(self.resolve_timeout),
            self.ytdlp_path,
            self.max_playlist_size,
            if self.youtube_api_key.is_some() { "on" } else { "off" },
            self.queue_backend,
            self.data_dir.display(),
            self.worker_threads,
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            guild_id: None,

            default_volume: 0.5,
            resolve_timeout: Duration::from_secs(30),
            ytdlp_path: "yt-dlp".to_string(),

            max_playlist_size: 100,
            youtube_api_key: None,

            data_dir: "/app/data".into(),
            queue_backend: QueueBackend::Json,

            worker_threads: num_cpus::get(),
        }
    }
}

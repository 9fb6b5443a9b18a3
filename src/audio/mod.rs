//! # Audio Module
//!
//! Per-guild playback orchestration.
//!
//! ## Architecture
//!
//! ### [`session`] - Guild Audio Session
//! - Plays the guild queue one head at a time ("cycles")
//! - Pause/resume/skip/loop/volume controls, callable mid-cycle
//! - Owns the optional voice connection and tears it down idempotently
//!
//! ### [`registry`] - Session Registry
//! - One session per guild, created on first lookup
//!
//! ### [`events`] - Device Notifications
//! - One-shot watchers over a device's state changes and stream errors
//!
//! ### [`device`] / [`connection`] - Songbird adapters
//! - [`device::SongbirdDevice`] plays HTTP streams on the guild call
//! - [`connection::SongbirdConnection`] joins and leaves voice channels
//!
//! ## Cycle guarantees
//!
//! - The finish watcher is armed *before* resolution starts, so a completion
//!   that arrives while resolving is never missed.
//! - A head that fails to resolve or breaks mid-stream is consumed, never
//!   retried.
//! - At most one cycle runs per session; the head is popped exactly once.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use guild_jukebox::audio::{GuildAudioSession, SessionRegistry, SongbirdDevice};
//! use guild_jukebox::sources::YtDlpResolver;
//! use guild_jukebox::storage::MemoryQueueStore;
//! use serenity::all::GuildId;
//! use std::{sync::Arc, time::Duration};
//!
//! # async fn example(songbird: Arc<songbird::Songbird>) -> anyhow::Result<()> {
//! let store = Arc::new(MemoryQueueStore::new());
//! let resolver = Arc::new(YtDlpResolver::new("yt-dlp", Duration::from_secs(30)));
//! let http = reqwest::Client::new();
//!
//! let registry = SessionRegistry::new(move |guild_id| {
//!     let device = SongbirdDevice::new(songbird.clone(), guild_id, http.clone());
//!     GuildAudioSession::new(guild_id, store.clone(), resolver.clone(), Arc::new(device), 0.5)
//! });
//!
//! let session = registry.get_or_create(GuildId::new(123456789));
//! session.enqueue("dQw4w9WgXcQ").await?;
//! session.ensure_playing();
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod device;
pub mod events;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{SongbirdConnection, VoiceConnection};
pub use device::{PlaybackDevice, SongbirdDevice};
pub use events::{DeviceEvent, DeviceEvents, DeviceState, Watcher};
pub use registry::SessionRegistry;
pub use session::{CycleOutcome, GuildAudioSession};

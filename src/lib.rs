//! # Guild Jukebox
//!
//! Per-guild media queue orchestration for Discord voice channels.
//!
//! - [`audio`] - playback sessions, the session registry and songbird adapters
//! - [`playlist`] - bounded accumulation over paginated list APIs
//! - [`sources`] - video resolution (yt-dlp) and playlist listing (YouTube API)
//! - [`storage`] - per-guild FIFO queues
//! - [`bot`] - slash-command front-end

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod playlist;
pub mod sources;
pub mod storage;

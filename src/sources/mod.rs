//! # Sources Module
//!
//! Turns queued item identifiers into something the voice driver can stream,
//! and lists the contents of remote playlists.
//!
//! - [`ytdlp`] - resolves a YouTube video id to a direct audio stream URL
//! - [`youtube_api_v3`] - pages through a playlist with the YouTube Data API
//!
//! Queue items are bare YouTube video ids. [`parse_video_id`] and
//! [`parse_playlist_id`] accept either ids or the usual URL forms and reject
//! anything else with [`JukeboxError::InvalidInput`].

pub mod youtube_api_v3;
pub mod ytdlp;

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

use crate::error::{JukeboxError, JukeboxResult};

pub use youtube_api_v3::YouTubePlaylistItems;
pub use ytdlp::YtDlpResolver;

static VIDEO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("regex válida"));

static PLAYLIST_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(PL|UU|LL|FL|RD|OL|UL)[A-Za-z0-9_-]{10,}$").expect("regex válida")
});

/// A resource ready to hand to the playback device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableResource {
    pub item_id: String,
    pub stream_url: String,
    pub title: Option<String>,
}

impl PlayableResource {
    pub fn new(item_id: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            stream_url: stream_url.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Title when known, otherwise the item id.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.item_id)
    }
}

/// Turns a queued item id into a playable resource.
///
/// Resolution may be slow and may fail; callers treat a failure as "skip this
/// item", never as "retry".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, item_id: &str) -> JukeboxResult<PlayableResource>;
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Extracts a video id from a bare id, a `watch?v=` URL, a `youtu.be` link or
/// a `/shorts/` URL.
pub fn parse_video_id(input: &str) -> JukeboxResult<String> {
    let input = input.trim();
    if VIDEO_ID.is_match(input) {
        return Ok(input.to_string());
    }

    let url = Url::parse(input)
        .map_err(|_| JukeboxError::InvalidInput(format!("video no reconocido: {}", input)))?;

    let candidate = match url.host_str() {
        Some("youtu.be") => url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .map(str::to_string),
        Some(host) if is_youtube_host(host) => {
            if let Some(rest) = url.path().strip_prefix("/shorts/") {
                Some(rest.trim_end_matches('/').to_string())
            } else {
                url.query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.into_owned())
            }
        }
        _ => None,
    };

    match candidate {
        Some(id) if VIDEO_ID.is_match(&id) => Ok(id),
        _ => Err(JukeboxError::InvalidInput(format!(
            "video no reconocido: {}",
            input
        ))),
    }
}

/// Extracts a playlist id from a bare id or any YouTube URL carrying `list=`.
pub fn parse_playlist_id(input: &str) -> JukeboxResult<String> {
    let input = input.trim();
    if PLAYLIST_ID.is_match(input) {
        return Ok(input.to_string());
    }

    let candidate = Url::parse(input).ok().and_then(|url| {
        let host_ok = url.host_str().is_some_and(is_youtube_host);
        host_ok
            .then(|| {
                url.query_pairs()
                    .find(|(key, _)| key == "list")
                    .map(|(_, value)| value.into_owned())
            })
            .flatten()
    });

    match candidate {
        Some(id) if PLAYLIST_ID.is_match(&id) => Ok(id),
        _ => Err(JukeboxError::InvalidInput(format!(
            "playlist no reconocida: {}",
            input
        ))),
    }
}

fn is_youtube_host(host: &str) -> bool {
    matches!(
        host,
        "youtube.com" | "www.youtube.com" | "m.youtube.com" | "music.youtube.com"
    )
}

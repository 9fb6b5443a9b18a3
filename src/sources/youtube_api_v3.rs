use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error};

use crate::error::{JukeboxError, JukeboxResult};
use crate::playlist::{Page, PageRequest, PagedList};

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// La API rechaza `maxResults` por encima de este valor.
pub const MAX_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    content_details: ContentDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentDetails {
    video_id: String,
}

/// Lista los videos de una playlist con YouTube Data API v3 (`playlistItems`)
pub struct YouTubePlaylistItems {
    client: reqwest::Client,
    api_key: String,
    playlist_id: String,
    base_url: String,
}

impl YouTubePlaylistItems {
    pub fn new(client: reqwest::Client, api_key: String, playlist_id: String) -> Self {
        Self {
            client,
            api_key,
            playlist_id,
            base_url: API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn query(&self, request: &PageRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("part", "contentDetails".to_string()),
            ("playlistId", self.playlist_id.clone()),
            (
                "maxResults",
                request.max_results.clamp(1, MAX_PAGE_SIZE).to_string(),
            ),
            ("key", self.api_key.clone()),
        ];
        if let Some(token) = &request.page_token {
            query.push(("pageToken", token.clone()));
        }
        query
    }

    fn into_page(response: PlaylistItemsResponse) -> Page<String> {
        Page {
            items: response
                .items
                .into_iter()
                .map(|item| item.content_details.video_id)
                .collect(),
            next_token: response.next_page_token,
        }
    }
}

#[async_trait]
impl PagedList for YouTubePlaylistItems {
    type Item = String;

    async fn list(&self, request: &PageRequest) -> JukeboxResult<Page<String>> {
        debug!(
            "📄 playlistItems {} (token {:?}, max {})",
            self.playlist_id, request.page_token, request.max_results
        );

        let response = self
            .client
            .get(format!("{}/playlistItems", self.base_url))
            .query(&self.query(request))
            .send()
            .await
            .map_err(|e| JukeboxError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("❌ YouTube API error: {} - {}", status, error_text);
            return Err(JukeboxError::Transport(format!(
                "YouTube API error: {} - {}",
                status, error_text
            )));
        }

        let body: PlaylistItemsResponse = response
            .json()
            .await
            .map_err(|e| JukeboxError::Transport(e.to_string()))?;

        Ok(Self::into_page(body))
    }
}

//! Spotify Web API playlist client.
//!
//! Uses a bearer token taken from the environment; obtaining and refreshing
//! that token is left to the user's own OAuth tooling.

use crate::config::SpotifySettings;
use crate::pipeline::{PlaylistService, SavedTrack};
use anyhow::{bail, Context, Result};
use log::{debug, trace};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct UrisBody<'a> {
    uris: &'a [String],
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrackItem {
    #[serde(default)]
    track: Option<TrackObject>,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    artists: Vec<ArtistObject>,
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    name: String,
}

#[derive(Debug, Clone)]
pub struct SpotifyClient {
    client: Client,
    api_base: String,
    token: String,
}

fn check_status(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("?")
            .to_string();
        bail!("Spotify rate-limited {action} (retry after {retry}s)");
    }
    let body = response.text().unwrap_or_default();
    bail!("Spotify {action} failed with status {status}: {body}")
}

impl SpotifyClient {
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(settings: &SpotifySettings, token: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build Spotify HTTP client")?;
        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn playlist_tracks_url(&self, playlist_id: &str) -> String {
        format!("{}/playlists/{playlist_id}/tracks", self.api_base)
    }

    fn get_page<T: for<'de> Deserialize<'de>>(&self, url: &str, action: &str) -> Result<Page<T>> {
        trace!("GET {url}");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .with_context(|| format!("Spotify {action} request failed"))?;
        check_status(response, action)?
            .json()
            .with_context(|| format!("Failed to decode Spotify {action} response"))
    }
}

impl PlaylistService for SpotifyClient {
    fn replace_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        debug!("Replacing playlist {playlist_id} with {} tracks", uris.len());
        let response = self
            .client
            .put(self.playlist_tracks_url(playlist_id))
            .bearer_auth(&self.token)
            .json(&UrisBody { uris })
            .send()
            .context("Spotify replace request failed")?;
        check_status(response, "playlist replace")?;
        Ok(())
    }

    fn append_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        debug!("Appending {} tracks to playlist {playlist_id}", uris.len());
        let response = self
            .client
            .post(self.playlist_tracks_url(playlist_id))
            .bearer_auth(&self.token)
            .json(&UrisBody { uris })
            .send()
            .context("Spotify append request failed")?;
        check_status(response, "playlist append")?;
        Ok(())
    }

    fn playlist_track_ids(&self, playlist_id: &str) -> Result<Vec<String>> {
        let mut url = format!(
            "{}?fields=items(track(id)),next&limit=100",
            self.playlist_tracks_url(playlist_id)
        );
        let mut ids = Vec::new();
        loop {
            let page: Page<TrackItem> = self.get_page(&url, "playlist read")?;
            ids.extend(page.items.into_iter().filter_map(|i| i.track.and_then(|t| t.id)));
            match page.next {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(ids)
    }

    fn recent_saved_tracks(&self, limit: usize) -> Result<Vec<SavedTrack>> {
        let url = format!("{}/me/tracks?limit={}", self.api_base, limit.clamp(1, 50));
        let page: Page<TrackItem> = self.get_page(&url, "saved tracks read")?;
        Ok(page
            .items
            .into_iter()
            .filter_map(|item| item.track)
            .filter_map(|track| {
                let artist = track
                    .artists
                    .iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                track.id.map(|track_id| SavedTrack { track_id, artist })
            })
            .collect())
    }
}

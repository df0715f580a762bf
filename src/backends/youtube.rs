//! YouTube Data API metadata service.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;

use crate::backends::{CandidateKind, CandidateResult, MetadataError, MetadataService, Thumbnails};
use crate::config::MetadataConfig;
use crate::genre;
use crate::track::Track;

const MUSIC_CATEGORY_ID: &str = "10";

struct CachedResponse {
    fetched_at: Instant,
    body: Value,
}

/// YouTube Data API v3 client backed by `ureq`, with a short-lived
/// in-process response cache keyed by request URL.
pub struct YouTubeMetadataService {
    http_client: ureq::Agent,
    api_key: String,
    base_url: String,
    search_suffix: String,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedResponse>>,
}

impl YouTubeMetadataService {
    pub fn new(config: &MetadataConfig) -> Self {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            http_client,
            api_key: config.api_key.trim().to_string(),
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            search_suffix: config.search_suffix.trim().to_string(),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Searches playlists matching `query`.
    pub fn search_playlists(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<CandidateResult>, MetadataError> {
        let body = self.request_json(
            "search",
            &[
                ("part", "snippet".to_string()),
                ("maxResults", max_results.to_string()),
                ("q", format!("{} playlist", query.trim())),
                ("type", "playlist".to_string()),
            ],
        )?;
        Ok(Self::items(&body)
            .filter_map(Self::parse_search_item)
            .collect())
    }

    /// Lists the tracks of a playlist as partially-known tracks.
    pub fn playlist_tracks(
        &self,
        playlist_id: &str,
        max_results: usize,
    ) -> Result<Vec<Track>, MetadataError> {
        let body = self.request_json(
            "playlistItems",
            &[
                ("part", "snippet".to_string()),
                ("maxResults", max_results.to_string()),
                ("playlistId", playlist_id.to_string()),
            ],
        )?;
        Ok(Self::items(&body)
            .filter_map(Self::parse_playlist_item)
            .collect())
    }

    fn api_url(&self, path: &str, params: &[(&str, String)]) -> String {
        let query_parts: Vec<String> = params
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .chain(std::iter::once(format!(
                "key={}",
                urlencoding::encode(&self.api_key)
            )))
            .collect();
        format!("{}/{}?{}", self.base_url, path, query_parts.join("&"))
    }

    fn cached(&self, url: &str) -> Option<Value> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(url) {
            Some(entry) if entry.fetched_at.elapsed() < self.cache_ttl => Some(entry.body.clone()),
            Some(_) => {
                cache.remove(url);
                None
            }
            None => None,
        }
    }

    fn store_cached(&self, url: String, body: &Value) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.retain(|_, entry| entry.fetched_at.elapsed() < self.cache_ttl);
            cache.insert(
                url,
                CachedResponse {
                    fetched_at: Instant::now(),
                    body: body.clone(),
                },
            );
        }
    }

    fn request_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, MetadataError> {
        if self.api_key.is_empty() {
            return Err(MetadataError::MissingApiKey);
        }
        let url = self.api_url(path, params);
        if let Some(body) = self.cached(&url) {
            debug!("YouTubeMetadataService: cache hit for /{}", path);
            return Ok(body);
        }

        let response = self.http_client.get(&url).call().map_err(|err| match err {
            ureq::Error::Status(code, response) => {
                let detail = response
                    .into_json::<Value>()
                    .ok()
                    .and_then(|body| Self::api_error_message(&body))
                    .unwrap_or_default();
                MetadataError::Request(format!("/{path} returned HTTP {code} {detail}").trim().to_string())
            }
            other => MetadataError::Request(format!("/{path}: {other}")),
        })?;
        let body: Value = response
            .into_json()
            .map_err(|err| MetadataError::Parse(format!("/{path}: {err}")))?;
        if let Some(message) = Self::api_error_message(&body) {
            return Err(MetadataError::Request(message));
        }
        self.store_cached(url, &body);
        Ok(body)
    }

    fn api_error_message(body: &Value) -> Option<String> {
        body.get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn items(body: &Value) -> impl Iterator<Item = &Value> {
        body.get("items")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
    }

    fn thumbnail_url(thumbnails: Option<&Value>, size: &str) -> Option<String> {
        thumbnails?
            .get(size)?
            .get("url")?
            .as_str()
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    }

    fn parse_thumbnails(snippet: &Value) -> Thumbnails {
        let thumbnails = snippet.get("thumbnails");
        Thumbnails {
            default: Self::thumbnail_url(thumbnails, "default"),
            medium: Self::thumbnail_url(thumbnails, "medium"),
            high: Self::thumbnail_url(thumbnails, "high"),
            standard: Self::thumbnail_url(thumbnails, "standard"),
            maxres: Self::thumbnail_url(thumbnails, "maxres"),
        }
    }

    fn snippet_text(snippet: &Value, field: &str) -> String {
        snippet
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn parse_search_item(item: &Value) -> Option<CandidateResult> {
        let id = item.get("id")?;
        let field = |name: &str| id.get(name).and_then(Value::as_str).map(str::to_string);
        let (kind, id) = if let Some(video_id) = field("videoId") {
            (CandidateKind::Track, video_id)
        } else if let Some(playlist_id) = field("playlistId") {
            (CandidateKind::Playlist, playlist_id)
        } else {
            (CandidateKind::Channel, field("channelId")?)
        };
        let snippet = item.get("snippet")?;
        Some(CandidateResult {
            kind,
            id,
            title: Self::snippet_text(snippet, "title"),
            author: Self::snippet_text(snippet, "channelTitle"),
            thumbnails: Self::parse_thumbnails(snippet),
        })
    }

    fn parse_playlist_item(item: &Value) -> Option<Track> {
        let snippet = item.get("snippet")?;
        let video_id = snippet
            .get("resourceId")
            .and_then(|resource| resource.get("videoId"))
            .and_then(Value::as_str)?;
        let artist = snippet
            .get("videoOwnerChannelTitle")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Self::snippet_text(snippet, "channelTitle"));
        Some(
            Track::new(video_id, Self::snippet_text(snippet, "title"), artist)
                .with_cover_url(Self::parse_thumbnails(snippet).best()),
        )
    }

    fn parse_video_details(item: &Value) -> Option<Track> {
        let id = item.get("id")?.as_str()?;
        let snippet = item.get("snippet")?;
        let duration = item
            .get("contentDetails")
            .and_then(|details| details.get("duration"))
            .and_then(Value::as_str)
            .map(parse_iso8601_duration)
            .unwrap_or(0);
        let mut track = Track::new(
            id,
            Self::snippet_text(snippet, "title"),
            Self::snippet_text(snippet, "channelTitle"),
        )
        .with_duration(duration)
        .with_cover_url(Self::parse_thumbnails(snippet).best());
        track.genre = Some(genre::classify(&track.title, &track.artist));
        Some(track)
    }
}

impl MetadataService for YouTubeMetadataService {
    fn resolve(&self, track_id: &str) -> Result<Track, MetadataError> {
        let body = self.request_json(
            "videos",
            &[
                ("part", "snippet,contentDetails".to_string()),
                ("id", track_id.to_string()),
            ],
        )?;
        let item = Self::items(&body)
            .next()
            .ok_or_else(|| MetadataError::NotFound(track_id.to_string()))?;
        Self::parse_video_details(item)
            .ok_or_else(|| MetadataError::Parse(format!("video {track_id} is missing fields")))
    }

    fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<CandidateResult>, MetadataError> {
        let query = if self.search_suffix.is_empty() {
            query.trim().to_string()
        } else {
            format!("{} {}", query.trim(), self.search_suffix)
        };
        let body = self.request_json(
            "search",
            &[
                ("part", "snippet".to_string()),
                ("maxResults", max_results.to_string()),
                ("q", query),
                ("type", "video".to_string()),
                ("videoCategoryId", MUSIC_CATEGORY_ID.to_string()),
            ],
        )?;
        let results: Vec<CandidateResult> = Self::items(&body)
            .filter_map(Self::parse_search_item)
            .collect();
        if results.is_empty() {
            warn!("YouTubeMetadataService: search returned no usable items");
        }
        Ok(results)
    }
}

/// Converts an ISO-8601 duration such as `PT1H2M3S` into whole seconds.
/// Unparseable input yields 0.
pub fn parse_iso8601_duration(duration: &str) -> u32 {
    let Some(time) = duration.trim().strip_prefix("PT") else {
        return 0;
    };
    let mut total = 0u32;
    let mut digits = String::new();
    for c in time.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let multiplier = match c {
            'H' => 3600,
            'M' => 60,
            'S' => 1,
            _ => return 0,
        };
        let value: u32 = digits.parse().unwrap_or(0);
        total = total.saturating_add(value.saturating_mul(multiplier));
        digits.clear();
    }
    total
}

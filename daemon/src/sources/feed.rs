use super::{ProduceFuture, ProduceRequest, Source, media_kind_for};
use crate::content::Content;
use crate::error::{PipelineError, Result};
use crate::loader::Loader;
use chrono::{DateTime, NaiveDate};
use common::MediaKind;
use rand::rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One entry of a remote listing.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FeedItem {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    /// "image" or "video"; guessed from the URL when missing
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
}

impl FeedItem {
    pub fn media(&self) -> MediaKind {
        match self.media_type.as_deref() {
            Some("video") => MediaKind::Video,
            Some("image") => MediaKind::Image,
            _ => media_kind_for(&self.url),
        }
    }

    fn into_content(self, producer: &str, volume: f32) -> Content {
        let media = self.media();
        let payload = serde_json::to_value(&self).ok();
        let mut content = Content::new(producer, media, self.url);
        if let Some(title) = self.title {
            content = content.with_title(title);
        }
        if let Some(description) = self.description {
            content = content.with_description(description);
        }
        if let Some(date) = self.date.as_deref().and_then(parse_date) {
            content = content.with_date(date);
        }
        if let Some(link) = self.link {
            content = content.with_link(link);
        }
        if media == MediaKind::Video {
            content = content.with_volume(volume);
        }
        content.set_payload(payload);
        content
    }
}

/// Listings come either as a bare array or wrapped in `{"items": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing {
    Items(Vec<FeedItem>),
    Wrapped { items: Vec<FeedItem> },
}

pub fn parse_listing(bytes: &[u8]) -> Result<Vec<FeedItem>> {
    let listing: Listing = serde_json::from_slice(bytes)
        .map_err(|e| PipelineError::Feed(format!("invalid listing: {}", e)))?;
    Ok(match listing {
        Listing::Items(items) | Listing::Wrapped { items } => items,
    })
}

/// Accepts `YYYY-MM-DD` and RFC 3339 timestamps
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|d| d.date_naive()))
}

/// Remote API returning a JSON listing of media items.
///
/// The listing is fetched lazily and refetched once every queued item has
/// been handed out.
pub struct FeedSource {
    url: String,
    client: reqwest::Client,
    shuffle: bool,
    volume: f32,
    loader: Arc<dyn Loader>,
    queue: Arc<Mutex<VecDeque<FeedItem>>>,
}

impl FeedSource {
    pub fn new(
        url: String,
        client: reqwest::Client,
        shuffle: bool,
        loader: Arc<dyn Loader>,
    ) -> Self {
        Self {
            url,
            client,
            shuffle,
            volume: 0.0,
            loader,
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    /// Queue items without fetching
    pub async fn preload(&self, items: Vec<FeedItem>) {
        self.queue.lock().await.extend(items);
    }
}

async fn fetch_listing(client: &reqwest::Client, url: &str) -> Result<Vec<FeedItem>> {
    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    let items = parse_listing(&bytes)?;
    log::debug!("Fetched {} item(s) from {}", items.len(), url);
    Ok(items)
}

impl Source for FeedSource {
    fn kind(&self) -> &'static str {
        "feed"
    }

    fn produce(&self, request: ProduceRequest) -> ProduceFuture {
        let queue = Arc::clone(&self.queue);
        let client = self.client.clone();
        let url = self.url.clone();
        let shuffle = self.shuffle;
        let volume = self.volume;

        Box::pin(async move {
            // Held across the fetch so concurrent productions share one request
            let mut queue = queue.lock().await;
            let mut fetched = false;

            loop {
                while let Some(item) = queue.pop_front() {
                    if request.filter.accepts(&item.url) {
                        return Ok(item.into_content(&request.producer, volume));
                    }
                }

                if fetched {
                    return Err(PipelineError::NoMatch(request.filter.to_string()));
                }

                let mut items = fetch_listing(&client, &url).await?;
                if items.is_empty() {
                    return Err(PipelineError::Exhausted(format!("empty listing at {}", url)));
                }
                if shuffle {
                    items.shuffle(&mut rng());
                }
                queue.extend(items);
                fetched = true;
            }
        })
    }

    fn loader(&self) -> Arc<dyn Loader> {
        Arc::clone(&self.loader)
    }
}

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::api_client::SERVICE_ORIGIN;
use crate::palette::Rgb;

const CANVAS_WS_URL: &str = "wss://gql-realtime-2.reddit.com/query";
const STREAM_TEAM_OWNER: &str = "AFD2022";

/// Edge length of one canvas tile; the full canvas is a 2x2 tiling.
const TILE_EDGE: u32 = 1000;
const TILE_COUNT: usize = 4;

const CONFIG_QUERY: &str = "subscription configuration($input: SubscribeInput!) {\n  subscribe(input: $input) {\n    id\n    ... on BasicMessage {\n      data {\n        __typename\n        ... on ConfigurationMessageData {\n          colorPalette {\n            colors {\n              hex\n              index\n              __typename\n            }\n            __typename\n          }\n          canvasConfigurations {\n            index\n            dx\n            dy\n            __typename\n          }\n          canvasWidth\n          canvasHeight\n          __typename\n        }\n      }\n      __typename\n    }\n    __typename\n  }\n}\n";

const CANVAS_QUERY: &str = "subscription replace($input: SubscribeInput!) {\n  subscribe(input: $input) {\n    id\n    ... on BasicMessage {\n      data {\n        __typename\n        ... on FullFrameMessageData {\n          __typename\n          name\n          timestamp\n        }\n        ... on DiffFrameMessageData {\n          __typename\n          name\n          currentTimestamp\n          previousTimestamp\n        }\n      }\n      __typename\n    }\n    __typename\n  }\n}\n";

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("canvas stream error - {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("tile download failed - {0}")]
    Http(#[from] reqwest::Error),
    #[error("tile decode failed - {0}")]
    Decode(#[from] image::ImageError),
    #[error("unexpected stream payload - {0}")]
    Protocol(String),
}

/// One full-resolution view of the remote canvas, stitched from four tiles.
/// Refreshes produce a brand-new snapshot; existing ones are never mutated.
#[derive(Debug, Clone)]
pub struct CanvasSnapshot {
    width: u32,
    height: u32,
    pixels: Vec<Rgb>,
}

impl CanvasSnapshot {
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<Rgb>) -> Self {
        assert_eq!(pixels.len(), (width * height) as usize);
        CanvasSnapshot {
            width,
            height,
            pixels,
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.pixels[(y * self.width + x) as usize])
    }

    /// Paste the four tile images into one canvas-sized grid. Tile i lands
    /// at ((i % 2) * edge, (i / 2) * edge), matching the service's 2x2
    /// layout. Unfilled area stays white.
    pub fn stitch(tiles: &[image::RgbImage]) -> CanvasSnapshot {
        stitch_tiles(tiles, TILE_EDGE)
    }
}

fn stitch_tiles(tiles: &[image::RgbImage], edge: u32) -> CanvasSnapshot {
    let width = edge * 2;
    let height = edge * 2;
    let mut pixels = vec![Rgb::new(255, 255, 255); (width * height) as usize];
    for (i, tile) in tiles.iter().enumerate() {
        let off_x = (i as u32 % 2) * edge;
        let off_y = (i as u32 / 2) * edge;
        for (x, y, pixel) in tile.enumerate_pixels() {
            let dest_x = off_x + x;
            let dest_y = off_y + y;
            if dest_x < width && dest_y < height {
                pixels[(dest_y * width + dest_x) as usize] =
                    Rgb::new(pixel[0], pixel[1], pixel[2]);
            }
        }
    }
    CanvasSnapshot::from_pixels(width, height, pixels)
}

/// Anything that can produce a fresh canvas snapshot. The queue refresh is
/// written against this so tests can feed it hand-built canvases.
pub trait SnapshotFetcher: Send + Sync + 'static {
    fn fetch(&self, token: &str) -> impl Future<Output = Result<CanvasSnapshot, BoardError>> + Send;
}

/// Live fetcher: subscribes to the canvas stream over websocket, waits for
/// the four full-frame tile references, downloads and stitches them.
#[derive(Debug, Clone)]
pub struct BoardClient {
    http: reqwest::Client,
    ws_url: String,
}

impl BoardClient {
    pub fn new(ws_url: Option<String>) -> Self {
        BoardClient {
            http: reqwest::Client::new(),
            ws_url: ws_url.unwrap_or_else(|| CANVAS_WS_URL.to_string()),
        }
    }

    async fn collect_tile_urls(&self, token: &str) -> Result<Vec<String>, BoardError> {
        let mut request = self.ws_url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_static(SERVICE_ORIGIN));
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;

        ws.send(Message::Text(connection_init(token).to_string()))
            .await?;
        ws.send(Message::Text(config_subscription().to_string()))
            .await?;
        for tag in 0..TILE_COUNT as u32 {
            ws.send(Message::Text(canvas_subscription(tag).to_string()))
                .await?;
        }

        let mut urls = Vec::new();
        while urls.len() < TILE_COUNT {
            let message = match ws.next().await {
                Some(message) => message?,
                None => {
                    return Err(BoardError::Protocol(
                        "canvas stream closed before all tiles arrived".to_string(),
                    ))
                }
            };
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            if value.get("type").and_then(Value::as_str) != Some("data") {
                continue;
            }
            let data = value.pointer("/payload/data/subscribe/data");
            if data.and_then(|d| d.get("__typename")).and_then(Value::as_str)
                == Some("FullFrameMessageData")
            {
                if let Some(name) = data.and_then(|d| d.get("name")).and_then(Value::as_str) {
                    urls.push(name.to_string());
                }
            }
        }
        ws.close(None).await.ok();

        // The tile digit is baked into the frame URL at a fixed offset; sort
        // so tile 0 comes first.
        for url in &urls {
            if tile_index_from_url(url).is_none() {
                return Err(BoardError::Protocol(format!(
                    "frame url without tile digit: {url}"
                )));
            }
        }
        urls.sort_by_key(|url| tile_index_from_url(url).unwrap_or(usize::MAX));
        Ok(urls)
    }
}

impl SnapshotFetcher for BoardClient {
    async fn fetch(&self, token: &str) -> Result<CanvasSnapshot, BoardError> {
        let urls = self.collect_tile_urls(token).await?;
        tracing::debug!(?urls, "received canvas tile frames");

        let mut tiles = Vec::with_capacity(urls.len());
        for url in &urls {
            let bytes = self.http.get(url).send().await?.bytes().await?;
            tiles.push(image::load_from_memory(&bytes)?.to_rgb8());
        }
        Ok(CanvasSnapshot::stitch(&tiles))
    }
}

fn connection_init(token: &str) -> Value {
    json!({
        "type": "connection_init",
        "payload": { "Authorization": format!("Bearer {token}") },
    })
}

fn config_subscription() -> Value {
    json!({
        "id": "1",
        "type": "start",
        "payload": {
            "variables": {
                "input": {
                    "channel": {
                        "teamOwner": STREAM_TEAM_OWNER,
                        "category": "CONFIG",
                    }
                }
            },
            "extensions": {},
            "operationName": "configuration",
            "query": CONFIG_QUERY,
        },
    })
}

fn canvas_subscription(tag: u32) -> Value {
    json!({
        "id": "2",
        "type": "start",
        "payload": {
            "variables": {
                "input": {
                    "channel": {
                        "teamOwner": STREAM_TEAM_OWNER,
                        "category": "CANVAS",
                        "tag": tag.to_string(),
                    }
                }
            },
            "extensions": {},
            "operationName": "replace",
            "query": CANVAS_QUERY,
        },
    })
}

/// Frame URLs carry the tile digit at byte offset 64.
fn tile_index_from_url(url: &str) -> Option<usize> {
    url.chars()
        .nth(64)
        .and_then(|c| c.to_digit(10))
        .map(|d| d as usize)
}

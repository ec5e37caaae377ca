use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use reqwest::header::{ORIGIN, REFERER, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::palette::PaletteColor;

// Endpoint defaults, overridable through the environment for self-hosted
// deployments of the service.
const AUTH_BASE_URL: &str = "https://ssl.reddit.com";
const GQL_BASE_URL: &str = "https://gql-realtime-2.reddit.com";
pub(crate) const SERVICE_ORIGIN: &str = "https://hot-potato.reddit.com";
const GQL_CLIENT_NAME: &str = "mona-lisa";

/// Safety margin added on top of every cooldown instant the service reports,
/// to absorb clock skew between us and the service.
const COOLDOWN_MARGIN_SECS: i64 = 10;

/// Each axis of the 2000x2000 addressable area is split into two 1000-pixel
/// tiles; coordinates past the boundary fold into tile indices 1-3.
const TILE_EDGE: u32 = 1000;

const SET_PIXEL_QUERY: &str = "mutation setPixel($input: ActInput!) {\n  act(input: $input) {\n    data {\n      ... on BasicMessage {\n        id\n        data {\n          ... on GetUserCooldownResponseMessageData {\n            nextAvailablePixelTimestamp\n            __typename\n          }\n          ... on SetPixelResponseMessageData {\n            timestamp\n            __typename\n          }\n          __typename\n        }\n        __typename\n      }\n      __typename\n    }\n    __typename\n  }\n}\n";

const GET_COOLDOWN_QUERY: &str = "mutation getUserCooldown($input: ActInput!) {\n  act(input: $input) {\n    data {\n      ... on BasicMessage {\n        id\n        data {\n          ... on GetUserCooldownResponseMessageData {\n            nextAvailablePixelTimestamp\n            __typename\n          }\n          __typename\n        }\n        __typename\n      }\n      __typename\n    }\n    __typename\n  }\n}\n";

#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Result of a successful credential exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    expires_in: i64, // seconds, usually 3600
}

/// Outcome of a pixel submission. A rate-limit rejection is a normal
/// outcome, not an error: it just carries the next eligibility instant
/// without having changed a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Placed { next_allowed: DateTime<Utc> },
    RateLimited { next_allowed: DateTime<Utc> },
}

impl SubmitOutcome {
    pub fn next_allowed(&self) -> DateTime<Utc> {
        match self {
            SubmitOutcome::Placed { next_allowed } => *next_allowed,
            SubmitOutcome::RateLimited { next_allowed } => *next_allowed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error - {0}")]
    Network(#[from] reqwest::Error),
    #[error("credential exchange rejected (status {status}) - {body}")]
    AuthRejected { status: StatusCode, body: String },
    #[error("malformed response - {0}")]
    Malformed(String),
}

/// The slice of the remote service the placement loop needs. Workers are
/// generic over this so the state machine can run against a scripted fake.
pub trait PlaceApi: Send + Sync + 'static {
    fn exchange_credentials(
        &self,
        credentials: &AccountCredentials,
    ) -> impl Future<Output = Result<TokenGrant, ApiError>> + Send;

    /// Current cooldown for the account; `None` means no pending cooldown
    /// and the account may place immediately.
    fn fetch_cooldown(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, ApiError>> + Send;

    fn submit_pixel(
        &self,
        token: &str,
        x: u32,
        y: u32,
        color: PaletteColor,
    ) -> impl Future<Output = Result<SubmitOutcome, ApiError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    auth_base_url: String,
    gql_base_url: String,
}

impl ApiClient {
    pub fn new(auth_base_url: Option<String>, gql_base_url: Option<String>) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            auth_base_url: auth_base_url.unwrap_or_else(|| AUTH_BASE_URL.to_string()),
            gql_base_url: gql_base_url.unwrap_or_else(|| GQL_BASE_URL.to_string()),
        }
    }

    async fn post_gql(&self, token: &str, payload: &Value) -> Result<Value, ApiError> {
        let url = format!("{}/query", self.gql_base_url);
        let response = self
            .http
            .post(&url)
            .header(ORIGIN, SERVICE_ORIGIN)
            .header(REFERER, format!("{SERVICE_ORIGIN}/"))
            .header("apollographql-client-name", GQL_CLIENT_NAME)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|err| {
            ApiError::Malformed(format!("gql response was not JSON (status {status}): {err}"))
        })
    }
}

impl PlaceApi for ApiClient {
    async fn exchange_credentials(
        &self,
        credentials: &AccountCredentials,
    ) -> Result<TokenGrant, ApiError> {
        let url = format!("{}/api/v1/access_token", self.auth_base_url);
        // Randomized suffix keeps concurrent workers from presenting one
        // shared agent string.
        let agent = format!("placebot{}", rand::thread_rng().gen_range(1..=100_000));
        let response = self
            .http
            .post(&url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .header(USER_AGENT, agent)
            .form(&[
                ("grant_type", "password"),
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::AuthRejected { status, body: text });
        }
        let grant: TokenResponse = serde_json::from_str(&text)
            .map_err(|err| ApiError::Malformed(format!("token payload: {err}")))?;
        Ok(TokenGrant {
            access_token: grant.access_token,
            expires_in: Duration::seconds(grant.expires_in),
        })
    }

    async fn fetch_cooldown(&self, token: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
        let payload = json!({
            "operationName": "getUserCooldown",
            "variables": {
                "input": {
                    "actionName": "r/replace:get_user_cooldown"
                }
            },
            "query": GET_COOLDOWN_QUERY,
        });
        let body = self.post_gql(token, &payload).await?;
        parse_cooldown(&body)
    }

    async fn submit_pixel(
        &self,
        token: &str,
        x: u32,
        y: u32,
        color: PaletteColor,
    ) -> Result<SubmitOutcome, ApiError> {
        let (tile_x, tile_y, tile_index) = fold_coordinate(x, y);
        let payload = json!({
            "operationName": "setPixel",
            "variables": {
                "input": {
                    "actionName": "r/replace:set_pixel",
                    "PixelMessageData": {
                        "coordinate": { "x": tile_x, "y": tile_y },
                        "colorIndex": color.index,
                        "canvasIndex": tile_index,
                    }
                }
            },
            "query": SET_PIXEL_QUERY,
        });
        let body = self.post_gql(token, &payload).await?;
        interpret_submit(&body)
    }
}

/// Translate an absolute canvas coordinate into the service's addressing
/// scheme: tile-local coordinate plus a tile index in the 2x2 tiling.
pub fn fold_coordinate(mut x: u32, mut y: u32) -> (u32, u32, u32) {
    let mut tile_index = 0;
    if x >= TILE_EDGE {
        x -= TILE_EDGE;
        tile_index += 1;
    }
    if y >= TILE_EDGE {
        y -= TILE_EDGE;
        tile_index += 2;
    }
    (x, y, tile_index)
}

/// The service distinguishes the two submission outcomes by which field is
/// populated: a null `data` means the edit was rejected for rate limiting
/// and the eligibility instant rides on the error extension instead.
fn interpret_submit(body: &Value) -> Result<SubmitOutcome, ApiError> {
    if body.get("data").map_or(true, Value::is_null) {
        let millis = body
            .pointer("/errors/0/extensions/nextAvailablePixelTs")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                ApiError::Malformed("rejection without nextAvailablePixelTs".to_string())
            })?;
        Ok(SubmitOutcome::RateLimited {
            next_allowed: next_allowed_from_millis(millis)?,
        })
    } else {
        let millis = body
            .pointer("/data/act/data/0/data/nextAvailablePixelTimestamp")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                ApiError::Malformed("success without nextAvailablePixelTimestamp".to_string())
            })?;
        Ok(SubmitOutcome::Placed {
            next_allowed: next_allowed_from_millis(millis)?,
        })
    }
}

fn parse_cooldown(body: &Value) -> Result<Option<DateTime<Utc>>, ApiError> {
    let field = body
        .pointer("/data/act/data/0/data/nextAvailablePixelTimestamp")
        .ok_or_else(|| {
            ApiError::Malformed("cooldown response without nextAvailablePixelTimestamp".to_string())
        })?;
    if field.is_null() {
        return Ok(None);
    }
    let millis = field.as_f64().ok_or_else(|| {
        ApiError::Malformed("nextAvailablePixelTimestamp is not a number".to_string())
    })?;
    Ok(Some(next_allowed_from_millis(millis)?))
}

/// Timestamps come back as epoch milliseconds; the stored instant gets the
/// fixed safety margin on top.
fn next_allowed_from_millis(millis: f64) -> Result<DateTime<Utc>, ApiError> {
    let instant = DateTime::<Utc>::from_timestamp_millis(millis.floor() as i64)
        .ok_or_else(|| ApiError::Malformed(format!("timestamp out of range: {millis}")))?;
    Ok(instant + Duration::seconds(COOLDOWN_MARGIN_SECS))
}

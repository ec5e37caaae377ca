use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::api_client::{AccountCredentials, PlaceApi, SubmitOutcome};
use crate::board::SnapshotFetcher;
use crate::clock::Clock;
use crate::config::AccountSetup;
use crate::queue::{PixelQueue, TakeResult};

/// Worker pacing knobs, shared by every account.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    /// Cooldown poll interval: how often a waiting worker wakes to re-check
    /// its cooldown and token freshness.
    pub poll_secs: u64,
    /// Random backoff range applied when the queue comes up empty, so
    /// workers don't re-poll in lockstep.
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
}

/// Live token state for one account. Only this worker ever touches it.
#[derive(Debug)]
struct AuthSession {
    token: String,
    expires_at: DateTime<Utc>,
}

/// One account's placement loop: refresh auth when expired, wait out the
/// cooldown, pull a mismatched pixel from the shared queue, submit it, and
/// fold the service's reply back into the cooldown state. Runs until a
/// freshly-refreshed queue confirms the canvas matches the target.
pub struct PlacementWorker<A, C> {
    index: usize,
    credentials: AccountCredentials,
    origin: (u32, u32),
    target_size: (u32, u32),
    cursor: (u32, u32),
    pacing: PacingConfig,
    api: A,
    clock: C,
}

impl<A: PlaceApi, C: Clock> PlacementWorker<A, C> {
    pub fn new(
        index: usize,
        setup: AccountSetup,
        origin: (u32, u32),
        target_size: (u32, u32),
        pacing: PacingConfig,
        api: A,
        clock: C,
    ) -> Self {
        PlacementWorker {
            index,
            credentials: setup.credentials,
            origin,
            target_size,
            cursor: setup.cursor,
            pacing,
            api,
            clock,
        }
    }

    /// Drive the state machine to completion. Returns the number of pixels
    /// this worker successfully placed.
    pub async fn run<F: SnapshotFetcher>(mut self, queue: Arc<PixelQueue>, fetcher: Arc<F>) -> u64 {
        let mut session: Option<AuthSession> = None;
        let mut next_allowed: Option<DateTime<Utc>> = None;
        let mut placed: u64 = 0;

        loop {
            self.clock
                .sleep(StdDuration::from_secs(self.pacing.poll_secs))
                .await;
            let now = self.clock.now();

            // Refresh the token when absent or expired. A long cooldown wait
            // passes through here on every wake, so expiry mid-wait triggers
            // re-authentication before the next placement attempt.
            if session.as_ref().map_or(true, |s| now >= s.expires_at) {
                tracing::info!(account = self.index, "refreshing access token");
                match self.api.exchange_credentials(&self.credentials).await {
                    Ok(grant) => {
                        tracing::info!(
                            account = self.index,
                            token = %token_preview(&grant.access_token),
                            "received new access token"
                        );
                        session = Some(AuthSession {
                            token: grant.access_token,
                            expires_at: now + grant.expires_in,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            account = self.index,
                            error = %err,
                            "credential exchange failed, retrying on next pass"
                        );
                        session = None;
                        continue;
                    }
                }
            }
            let Some(active) = session.as_ref() else {
                continue;
            };
            let token = active.token.clone();

            // First pass for this session: ask the service where we stand.
            if next_allowed.is_none() {
                match self.api.fetch_cooldown(&token).await {
                    Ok(Some(at)) => next_allowed = Some(at),
                    Ok(None) => next_allowed = Some(now),
                    Err(err) => {
                        tracing::warn!(
                            account = self.index,
                            error = %err,
                            "cooldown query failed, retrying on next pass"
                        );
                        continue;
                    }
                }
            }
            let Some(allowed_at) = next_allowed else {
                continue;
            };

            let wait = allowed_at - now;
            if wait > Duration::zero() {
                tracing::info!(
                    account = self.index,
                    "{}s until next pixel is drawn",
                    wait.num_seconds()
                );
                continue;
            }

            match queue.take_one(now, &token, fetcher.as_ref()).await {
                Err(err) => {
                    tracing::warn!(
                        account = self.index,
                        error = %err,
                        "canvas snapshot refresh failed, will retry"
                    );
                }
                Ok(TakeResult::Empty { just_refreshed: true }) => {
                    // A diff pass just confirmed zero mismatches: done.
                    tracing::info!(
                        account = self.index,
                        placed,
                        "canvas matches target, worker finished"
                    );
                    return placed;
                }
                Ok(TakeResult::Empty { just_refreshed: false }) => {
                    let backoff = rand::thread_rng()
                        .gen_range(self.pacing.backoff_min_secs..=self.pacing.backoff_max_secs);
                    tracing::info!(
                        account = self.index,
                        backoff_secs = backoff,
                        "no pixels to fix right now"
                    );
                    self.clock.sleep(StdDuration::from_secs(backoff)).await;
                }
                Ok(TakeResult::Item(item)) => {
                    let x = self.origin.0 + item.x;
                    let y = self.origin.1 + item.y;
                    tracing::info!(
                        account = self.index,
                        x,
                        y,
                        color = item.color.name,
                        "attempting to place pixel"
                    );
                    match self.api.submit_pixel(&token, x, y, item.color).await {
                        Ok(outcome @ SubmitOutcome::Placed { .. }) => {
                            placed += 1;
                            next_allowed = Some(outcome.next_allowed());
                            self.advance_cursor();
                            tracing::info!(account = self.index, "succeeded placing pixel");
                        }
                        Ok(outcome @ SubmitOutcome::RateLimited { .. }) => {
                            next_allowed = Some(outcome.next_allowed());
                            tracing::warn!(
                                account = self.index,
                                "failed placing pixel: rate limited"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(
                                account = self.index,
                                error = %err,
                                "pixel submission failed, retrying on next pass"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Row-major progress marker over the target. Placement order comes
    /// from the shuffled queue; the cursor only tracks how much of one
    /// full pass this worker has contributed.
    fn advance_cursor(&mut self) {
        self.cursor.0 += 1;
        if self.cursor.0 >= self.target_size.0 {
            self.cursor.0 = 0;
            self.cursor.1 += 1;
        }
        if self.cursor.1 >= self.target_size.1 {
            tracing::info!(account = self.index, "completed a full pass over the target");
            self.cursor = (0, 0);
        }
    }
}

fn token_preview(token: &str) -> String {
    let head: String = token.chars().take(5).collect();
    format!("{head}************")
}

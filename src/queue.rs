use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use crate::board::{BoardError, CanvasSnapshot, SnapshotFetcher};
use crate::palette::{Palette, PaletteColor};
use crate::target::TargetImage;

/// One pixel known to differ from the target: target-local coordinate plus
/// the quantized color it should become. Handed out exactly once per
/// refresh generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub x: u32,
    pub y: u32,
    pub color: PaletteColor,
}

/// What a worker gets back from the queue. `just_refreshed` tells an
/// empty-handed caller whether the emptiness was confirmed by a diff pass
/// this very call, which is the completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeResult {
    Item(WorkItem),
    Empty { just_refreshed: bool },
}

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<WorkItem>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// Work queue shared by every placement worker. One mutex guards both the
/// staleness-driven refresh and the pop, so a worker can never read a
/// queue that is halfway through being replaced, and no item is handed to
/// two workers.
pub struct PixelQueue {
    target: Arc<TargetImage>,
    palette: Arc<Palette>,
    origin: (u32, u32),
    staleness: Duration,
    state: Mutex<QueueState>,
}

impl PixelQueue {
    pub fn new(
        target: Arc<TargetImage>,
        palette: Arc<Palette>,
        origin: (u32, u32),
        staleness_secs: u64,
    ) -> Self {
        PixelQueue {
            target,
            palette,
            origin,
            staleness: Duration::seconds(staleness_secs as i64),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Refresh-if-stale and pop, combined under one lock so a worker never
    /// acts on an empty-but-stale queue. Whichever worker first observes
    /// staleness pays for the snapshot fetch; the rest wait on the lock.
    /// A failed fetch leaves items and timestamp untouched, so the next
    /// caller retries the refresh.
    pub async fn take_one<F: SnapshotFetcher>(
        &self,
        now: DateTime<Utc>,
        token: &str,
        fetcher: &F,
    ) -> Result<TakeResult, BoardError> {
        let mut state = self.state.lock().await;

        let stale = state
            .refreshed_at
            .map_or(true, |at| now - at > self.staleness);
        let mut just_refreshed = false;
        if stale {
            tracing::info!("refreshing pixel queue");
            let snapshot = fetcher.fetch(token).await?;
            let mut items = diff_snapshot(&self.target, &self.palette, self.origin, &snapshot);
            // Uniform shuffle spreads workers across the image instead of
            // letting them all converge on the same region.
            items.shuffle(&mut rand::thread_rng());
            tracing::info!(pending = items.len(), "identified pixels to fix");
            state.items = items;
            state.refreshed_at = Some(now);
            just_refreshed = true;
        }

        match state.items.pop() {
            Some(item) => Ok(TakeResult::Item(item)),
            None => Ok(TakeResult::Empty { just_refreshed }),
        }
    }

    #[cfg(test)]
    async fn pending(&self) -> usize {
        self.state.lock().await.items.len()
    }
}

/// One diff pass: every target pixel whose quantized color does not match
/// the canvas at the placement origin offset becomes a work item. Target
/// pixels that fall outside the canvas are ignored.
fn diff_snapshot(
    target: &TargetImage,
    palette: &Palette,
    origin: (u32, u32),
    snapshot: &CanvasSnapshot,
) -> Vec<WorkItem> {
    let mut items = Vec::new();
    for x in 0..target.width() {
        for y in 0..target.height() {
            let desired = match target.get(x, y) {
                Some(rgb) => palette.quantize(rgb),
                None => continue,
            };
            let current = snapshot.get(origin.0 + x, origin.1 + y);
            if let Some(current) = current {
                if current != desired.rgb {
                    items.push(WorkItem {
                        x,
                        y,
                        color: desired,
                    });
                }
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::Rgb;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fetcher returning a canned snapshot, or an error when poisoned.
    struct FakeFetcher {
        snapshot: std::sync::Mutex<CanvasSnapshot>,
        fail: std::sync::atomic::AtomicBool,
        fetches: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(snapshot: CanvasSnapshot) -> Self {
            FakeFetcher {
                snapshot: std::sync::Mutex::new(snapshot),
                fail: std::sync::atomic::AtomicBool::new(false),
                fetches: AtomicUsize::new(0),
            }
        }

        fn set_snapshot(&self, snapshot: CanvasSnapshot) {
            *self.snapshot.lock().unwrap() = snapshot;
        }

        fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    impl SnapshotFetcher for FakeFetcher {
        async fn fetch(&self, _token: &str) -> Result<CanvasSnapshot, BoardError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(BoardError::Protocol("injected failure".to_string()));
            }
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }

    fn white_canvas(width: u32, height: u32) -> CanvasSnapshot {
        CanvasSnapshot::from_pixels(
            width,
            height,
            vec![Rgb::new(255, 255, 255); (width * height) as usize],
        )
    }

    fn queue_for(target: TargetImage, origin: (u32, u32)) -> PixelQueue {
        PixelQueue::new(
            Arc::new(target),
            Arc::new(Palette::standard()),
            origin,
            5,
        )
    }

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn red_black_example_yields_one_item() {
        // Target 2x1: red then black; canvas shows white then black, so only
        // the first pixel needs fixing, with red quantized to the palette.
        let target = TargetImage::from_pixels(
            2,
            1,
            vec![Rgb::new(255, 0, 0), Rgb::new(0, 0, 0)],
        );
        let mut canvas = vec![Rgb::new(255, 255, 255); 4];
        canvas[1] = Rgb::new(0, 0, 0);
        let fetcher = FakeFetcher::new(CanvasSnapshot::from_pixels(2, 2, canvas));
        let queue = queue_for(target, (0, 0));

        let taken = queue.take_one(t0(), "tok", &fetcher).await.unwrap();
        let TakeResult::Item(item) = taken else {
            panic!("expected one work item, got {taken:?}");
        };
        assert_eq!((item.x, item.y), (0, 0));
        assert_eq!(item.color.name, "Bright Red");

        let rest = queue.take_one(t0(), "tok", &fetcher).await.unwrap();
        assert_eq!(
            rest,
            TakeResult::Empty {
                just_refreshed: false
            }
        );
    }

    #[tokio::test]
    async fn refresh_is_idempotent_on_unchanged_canvas() {
        let target =
            TargetImage::from_pixels(3, 3, vec![Rgb::new(0, 0, 0); 9]);
        let fetcher = FakeFetcher::new(white_canvas(3, 3));
        let queue = queue_for(target, (0, 0));

        queue.take_one(t0(), "tok", &fetcher).await.unwrap();
        let first_size = queue.pending().await + 1; // plus the popped one

        // Advance past staleness so the second call re-runs the diff.
        let later = t0() + Duration::seconds(6);
        queue.take_one(later, "tok", &fetcher).await.unwrap();
        let second_size = queue.pending().await + 1;

        assert_eq!(first_size, 9);
        assert_eq!(second_size, 9);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drained_queue_stays_empty_once_canvas_matches() {
        let target = TargetImage::from_pixels(2, 2, vec![Rgb::new(0, 0, 0); 4]);
        let fetcher = FakeFetcher::new(white_canvas(2, 2));
        let queue = queue_for(target, (0, 0));

        let mut seen = Vec::new();
        loop {
            match queue.take_one(t0(), "tok", &fetcher).await.unwrap() {
                TakeResult::Item(item) => seen.push(item),
                TakeResult::Empty { .. } => break,
            }
        }
        assert_eq!(seen.len(), 4);

        // Pretend every item was placed.
        fetcher.set_snapshot(CanvasSnapshot::from_pixels(
            2,
            2,
            vec![Rgb::new(0, 0, 0); 4],
        ));
        let later = t0() + Duration::seconds(6);
        let result = queue.take_one(later, "tok", &fetcher).await.unwrap();
        assert_eq!(
            result,
            TakeResult::Empty {
                just_refreshed: true
            }
        );
    }

    #[tokio::test]
    async fn no_item_is_returned_twice_within_a_generation() {
        let target = TargetImage::from_pixels(4, 4, vec![Rgb::new(0, 0, 0); 16]);
        let fetcher = FakeFetcher::new(white_canvas(4, 4));
        let queue = queue_for(target, (0, 0));

        let mut coords = HashSet::new();
        loop {
            match queue.take_one(t0(), "tok", &fetcher).await.unwrap() {
                TakeResult::Item(item) => {
                    assert!(coords.insert((item.x, item.y)), "duplicate item {item:?}");
                }
                TakeResult::Empty { .. } => break,
            }
        }
        assert_eq!(coords.len(), 16);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_queue_untouched_and_retries() {
        let target = TargetImage::from_pixels(2, 1, vec![Rgb::new(0, 0, 0); 2]);
        let fetcher = FakeFetcher::new(white_canvas(2, 1));
        let queue = queue_for(target, (0, 0));

        // Populate, pop one of two.
        let first = queue.take_one(t0(), "tok", &fetcher).await.unwrap();
        assert!(matches!(first, TakeResult::Item(_)));
        assert_eq!(queue.pending().await, 1);

        // Stale again, but the fetch now fails: error surfaces, the leftover
        // item and the old timestamp survive.
        fetcher.set_fail(true);
        let later = t0() + Duration::seconds(6);
        let err = queue.take_one(later, "tok", &fetcher).await;
        assert!(err.is_err());
        assert_eq!(queue.pending().await, 1);

        // Next caller retries the refresh and succeeds.
        fetcher.set_fail(false);
        let retried = queue.take_one(later, "tok", &fetcher).await.unwrap();
        assert!(matches!(retried, TakeResult::Item(_)));
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn origin_offsets_the_canvas_comparison() {
        // Canvas is white except a black pixel at (5, 7); with origin (5, 7)
        // a 1x1 black target is already satisfied.
        let mut pixels = vec![Rgb::new(255, 255, 255); 100];
        pixels[(7 * 10 + 5) as usize] = Rgb::new(0, 0, 0);
        let fetcher = FakeFetcher::new(CanvasSnapshot::from_pixels(10, 10, pixels));
        let target = TargetImage::from_pixels(1, 1, vec![Rgb::new(0, 0, 0)]);
        let queue = queue_for(target, (5, 7));

        let result = queue.take_one(t0(), "tok", &fetcher).await.unwrap();
        assert_eq!(
            result,
            TakeResult::Empty {
                just_refreshed: true
            }
        );
    }

    #[tokio::test]
    async fn concurrent_takers_split_the_queue_without_duplicates() {
        let target = TargetImage::from_pixels(10, 10, vec![Rgb::new(0, 0, 0); 100]);
        let fetcher = Arc::new(FakeFetcher::new(white_canvas(10, 10)));
        let queue = Arc::new(queue_for(target, (0, 0)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let fetcher = Arc::clone(&fetcher);
            handles.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                loop {
                    match queue.take_one(t0(), "tok", fetcher.as_ref()).await.unwrap() {
                        TakeResult::Item(item) => taken.push((item.x, item.y)),
                        TakeResult::Empty { .. } => break,
                    }
                }
                taken
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 100, "every mismatch handed out exactly once");
        assert_eq!(unique.len(), 100);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }
}

//! Bandwidth limiting for proxied bodies.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::time::{Instant, Sleep};

/// Sustained rate and burst allowance, both in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    // Bytes per second.
    rate: u64,
    // Largest number of bytes released without waiting.
    burst: u64,
}

impl Bandwidth {
    /// Returns `None` when `rate` is zero, which would never let a byte through.
    pub fn new(rate: u64, burst: u64) -> Option<Self> {
        (rate > 0).then_some(Bandwidth {
            rate,
            burst: burst.max(1),
        })
    }
}

/// A token bucket measured in bytes.
///
/// Tokens may go negative: a chunk is never split, so a large chunk borrows
/// against future refills and the debt is paid by waiting.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    updated: Instant,
}

impl TokenBucket {
    fn new(bandwidth: Bandwidth, now: Instant) -> Self {
        let capacity = bandwidth.burst as f64;
        TokenBucket {
            rate: bandwidth.rate as f64,
            capacity,
            tokens: capacity,
            updated: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.updated = now;
    }

    /// Take `bytes` tokens, returning how long to wait before the next take.
    fn consume(&mut self, bytes: usize, now: Instant) -> Option<Duration> {
        self.refill(now);
        self.tokens -= bytes as f64;

        (self.tokens < 0.0).then(|| Duration::from_secs_f64(-self.tokens / self.rate))
    }
}

/// A body stream which releases bytes no faster than a [`Bandwidth`] allows.
///
/// Waiting happens on a timer, not a thread. Dropping the stream cancels any
/// pending wait and drops the inner stream.
#[pin_project::pin_project]
#[derive(Debug)]
pub struct Throttled<S> {
    #[pin]
    inner: S,
    bucket: TokenBucket,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<S> Throttled<S> {
    /// Throttle `inner`, starting with a full burst allowance.
    pub fn new(inner: S, bandwidth: Bandwidth) -> Self {
        Throttled {
            inner,
            bucket: TokenBucket::new(bandwidth, Instant::now()),
            delay: None,
        }
    }
}

impl<S, E> Stream for Throttled<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            *this.delay = None;
        }

        let item = ready!(this.inner.poll_next(cx));
        if let Some(Ok(chunk)) = &item {
            if let Some(wait) = this.bucket.consume(chunk.len(), Instant::now()) {
                *this.delay = Some(Box::pin(tokio::time::sleep(wait)));
            }
        }

        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::StreamExt as _;

    use super::*;

    fn chunks(sizes: &[usize]) -> impl Stream<Item = Result<Bytes, Infallible>> + use<> {
        let chunks: Vec<_> = sizes
            .iter()
            .map(|size| Ok(Bytes::from(vec![0u8; *size])))
            .collect();
        futures::stream::iter(chunks)
    }

    #[test]
    fn zero_rate_is_unlimited() {
        assert_eq!(Bandwidth::new(0, 100), None);
        assert_eq!(
            Bandwidth::new(10, 0),
            Some(Bandwidth { rate: 10, burst: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_goes_into_debt() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(Bandwidth::new(100, 100).unwrap(), now);

        assert_eq!(bucket.consume(100, now), None);
        assert_eq!(bucket.consume(50, now), Some(Duration::from_millis(500)));
        assert_eq!(
            bucket.consume(0, now + Duration::from_millis(500)),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refill_is_capped_at_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(Bandwidth::new(100, 100).unwrap(), now);

        assert_eq!(bucket.consume(100, now), None);
        let later = now + Duration::from_secs(60);
        assert_eq!(bucket.consume(100, later), None);
        assert_eq!(bucket.consume(100, later), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_stream_paces_chunks() {
        let start = Instant::now();
        let stream = Throttled::new(chunks(&[100, 100, 100]), Bandwidth::new(100, 100).unwrap());
        tokio::pin!(stream);

        let mut arrivals = Vec::new();
        while let Some(chunk) = stream.next().await {
            assert_eq!(chunk.unwrap().len(), 100);
            arrivals.push(start.elapsed());
        }

        assert_eq!(arrivals[0], Duration::ZERO);
        assert_eq!(arrivals[1], Duration::ZERO);
        assert!(arrivals[2] >= Duration::from_secs(1), "{arrivals:?}");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_passes_without_waiting() {
        let start = Instant::now();
        let stream = Throttled::new(chunks(&[10, 10, 10]), Bandwidth::new(1, 1000).unwrap());
        let collected: Vec<_> = stream.collect().await;

        assert_eq!(collected.len(), 3);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_while_waiting_releases_inner_stream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let inner = chunks(&[100, 100, 100]).map(move |chunk| {
            let _flag = &flag;
            chunk
        });

        let start = Instant::now();
        let mut stream = Box::pin(Throttled::new(inner, Bandwidth::new(100, 100).unwrap()));
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 100);
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 100);

        // The second chunk put the bucket in debt.
        assert!(stream.delay.is_some());
        assert!(futures::poll!(stream.next()).is_pending());

        drop(stream);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}

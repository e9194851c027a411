//! # Throttle
//!
//! Latest-wins throttling for change-driven streams.
//!
//! ## Timing
//! ```text
//!   upstream:   a  b c          d                 e
//!               │  │ │          │                 │
//!   window T:   ├──────────T────┼──────────T──────┼──── ...
//!   output:     a          c               d          e
//!               ▲          ▲
//!               leading    newest value once the window has passed
//! ```
//!
//! A value fires when the consumer takes it, and the next window is
//! measured from that moment. A consumer slower than `T` therefore gets
//! the next value as soon as it asks instead of waiting another `T`.
//! Everything that arrived in between is conflated into the newest value.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::time::{sleep_until, Instant, Sleep};

/// Stream returned by [`throttled`].
pub struct Throttle<S: Stream> {
    upstream: Pin<Box<S>>,
    period: Duration,
    latest: Option<S::Item>,
    exhausted: bool,
    last_fire: Option<Instant>,
    window: Option<Pin<Box<Sleep>>>,
}

/// Emits at most one value of `upstream` per `period`, always the newest.
pub fn throttled<S: Stream>(upstream: S, period: Duration) -> Throttle<S> {
    Throttle {
        upstream: Box::pin(upstream),
        period,
        latest: None,
        exhausted: false,
        last_fire: None,
        window: None,
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
        let this = self.get_mut();

        while !this.exhausted {
            match this.upstream.as_mut().poll_next(cx) {
                Poll::Ready(Some(value)) => this.latest = Some(value),
                Poll::Ready(None) => this.exhausted = true,
                Poll::Pending => break,
            }
        }

        if this.latest.is_none() {
            return if this.exhausted {
                Poll::Ready(None)
            } else {
                Poll::Pending
            };
        }

        if let Some(fired) = this.last_fire {
            let deadline = fired + this.period;
            if Instant::now() < deadline {
                let window = this
                    .window
                    .get_or_insert_with(|| Box::pin(sleep_until(deadline)));
                if window.deadline() != deadline {
                    window.as_mut().reset(deadline);
                }
                if window.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
            }
        }

        this.last_fire = Some(Instant::now());
        Poll::Ready(this.latest.take())
    }
}

impl<S: Stream> Unpin for Throttle<S> {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn burst_yields_leading_and_latest() {
        let (tx, rx) = mpsc::channel(16);
        let start = Instant::now();
        tokio::spawn(async move {
            for i in 0..3 {
                tx.send(i).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let mut out = throttled(ReceiverStream::new(rx), Duration::from_millis(100));
        let mut seen = Vec::new();
        while let Some(value) = out.next().await {
            seen.push((value, start.elapsed()));
        }

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0);
        assert!(seen[0].1 < Duration::from_millis(10));
        assert_eq!(seen[1].0, 2);
        assert!(seen[1].1 >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_does_not_add_to_the_window() {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).await.unwrap();
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });

        let start = Instant::now();
        let mut out = throttled(ReceiverStream::new(rx), Duration::from_secs(5));
        let mut seen = Vec::new();
        while let Some(value) = out.next().await {
            seen.push((value, start.elapsed().as_secs()));
            tokio::time::sleep(Duration::from_secs(6)).await;
        }

        let values: Vec<i32> = seen.iter().map(|(v, _)| *v).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        // each value is delivered as soon as it arrives, not 5s after the consumer was done
        let times: Vec<u64> = seen.iter().map(|(_, t)| *t).collect();
        assert_eq!(times, vec![0, 10, 20, 30, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn intermediate_values_are_conflated() {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            tx.send(1).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(2).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(3).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(4).await.unwrap();
        });

        let mut out = throttled(ReceiverStream::new(rx), Duration::from_millis(100));
        let mut seen = Vec::new();
        while let Some(value) = out.next().await {
            seen.push(value);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        assert_eq!(seen, vec![1, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn ends_when_upstream_ends() {
        let out = throttled(futures_util::stream::iter(vec![1, 2, 3]), Duration::from_millis(50));
        let collected: Vec<i32> = out.collect().await;
        // all three are ready at once, so only the newest survives
        assert_eq!(collected, vec![3]);
    }
}

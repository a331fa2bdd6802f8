//! Utilities for gossip networking

use std::{pin::Pin, time::Instant};

use tokio::time::{Sleep, sleep_until};

use super::proto::util::TimerMap;

/// A [`TimerMap`] with an async method to wait for the next timer expiration.
#[derive(Debug)]
pub(crate) struct Timers<T> {
    next: Option<(Instant, Pin<Box<Sleep>>)>,
    map: TimerMap<T>,
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self {
            next: None,
            map: TimerMap::default(),
        }
    }
}

impl<T> Timers<T> {
    /// Insert a new entry at the specified instant
    pub fn insert(&mut self, instant: Instant, item: T) {
        self.map.insert(instant, item);
    }

    fn reset(&mut self) {
        self.next = self
            .map
            .first()
            .map(|instant| (*instant, Box::pin(sleep_until((*instant).into()))))
    }

    /// Wait for the next timer to expire and return all expired timers
    ///
    /// If the [`TimerMap`] is empty, this will return a future that is pending forever.
    /// After inserting a new entry, prior futures returned from this method will not become
    /// ready. They should be dropped after calling [`Self::insert`], and a new future as
    /// returned from this method should be awaited instead.
    pub async fn wait_and_drain(&mut self) -> Vec<(Instant, T)> {
        self.reset();
        match self.next.as_mut() {
            Some((instant, sleep)) => {
                sleep.await;
                self.map.drain_until(instant).collect()
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timers_fire_in_order() {
        let now = Instant::now();
        let mut timers = Timers::default();
        timers.insert(now + Duration::from_millis(30), "late");
        timers.insert(now + Duration::from_millis(10), "early");

        let fired = timers.wait_and_drain().await.into_iter().map(|(_, t)| t).collect::<Vec<_>>();
        assert_eq!(fired, vec!["early"]);
        let fired = timers.wait_and_drain().await.into_iter().map(|(_, t)| t).collect::<Vec<_>>();
        assert_eq!(fired, vec!["late"]);

        let pending = tokio::time::timeout(Duration::from_secs(60), timers.wait_and_drain()).await;
        assert!(pending.is_err());
    }
}

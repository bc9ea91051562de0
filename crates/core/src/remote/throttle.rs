//! Middleware applied to every remote call: a flood-wait waiter around a
//! rate limiter.

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::debug;

use super::{ChannelHandle, FileLocation, RemoteApi, RemoteFuture, RemoteMessage, UploadFile};
use crate::{Error, Result};

pub const RATE_LIMIT_PER_SEC: NonZeroU32 = NonZeroU32::MIN.saturating_add(9);
pub const RATE_LIMIT_BURST: NonZeroU32 = NonZeroU32::MIN.saturating_add(4);
pub const FLOOD_WAIT_CEILING: Duration = Duration::from_secs(5);
pub const FLOOD_WAIT_MAX_RETRIES: u32 = 10;

/// 10 calls per second with bursts of up to 5, shared by every call a
/// session makes.
pub fn default_rate_limiter() -> DefaultDirectRateLimiter {
    RateLimiter::direct(Quota::per_second(RATE_LIMIT_PER_SEC).allow_burst(RATE_LIMIT_BURST))
}

/// Sleeps through short flood waits and retries; longer ones fail fast.
#[derive(Debug, Clone, Copy)]
pub struct FloodWaitPolicy {
    pub ceiling: Duration,
    pub max_retries: u32,
}

impl Default for FloodWaitPolicy {
    fn default() -> Self {
        Self {
            ceiling: FLOOD_WAIT_CEILING,
            max_retries: FLOOD_WAIT_MAX_RETRIES,
        }
    }
}

impl FloodWaitPolicy {
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0u32;
        loop {
            match call().await {
                Err(Error::FloodWait { wait }) => {
                    if wait > self.ceiling {
                        return Err(Error::FloodWaitTooLong {
                            requested: wait,
                            ceiling: self.ceiling,
                        });
                    }
                    if retries >= self.max_retries {
                        return Err(Error::remote(format!(
                            "{op}: flood wait retries exhausted after {retries} attempts"
                        )));
                    }
                    retries += 1;
                    debug!(
                        event = "remote.flood_wait",
                        op,
                        wait_ms = wait.as_millis() as u64,
                        retry = retries,
                        "remote.flood_wait"
                    );
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }
        }
    }
}

/// Wraps a [`RemoteApi`] with the flood-wait waiter (outer) and the rate
/// limiter (inner), so every retry also pays for a token.
pub struct Throttled<R> {
    inner: R,
    limiter: DefaultDirectRateLimiter,
    flood: FloodWaitPolicy,
}

impl<R: RemoteApi> Throttled<R> {
    pub fn new(inner: R) -> Self {
        Self::with_policy(inner, default_rate_limiter(), FloodWaitPolicy::default())
    }

    pub fn with_policy(
        inner: R,
        limiter: DefaultDirectRateLimiter,
        flood: FloodWaitPolicy,
    ) -> Self {
        Self {
            inner,
            limiter,
            flood,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn call<'a, T, F>(&'a self, op: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> RemoteFuture<'a, T> + Send,
        T: Send,
    {
        let limiter = &self.limiter;
        self.flood
            .run(op, || {
                let fut = f();
                async move {
                    limiter.until_ready().await;
                    fut.await
                }
            })
            .await
    }
}

impl<R: RemoteApi> RemoteApi for Throttled<R> {
    fn account_id(&self) -> i64 {
        self.inner.account_id()
    }

    fn fetch_channel<'a>(&'a self, channel_id: i64) -> RemoteFuture<'a, ChannelHandle> {
        Box::pin(self.call("channels.getChannels", move || {
            self.inner.fetch_channel(channel_id)
        }))
    }

    fn fetch_messages<'a>(
        &'a self,
        channel: &'a ChannelHandle,
        ids: &'a [i32],
    ) -> RemoteFuture<'a, Vec<RemoteMessage>> {
        Box::pin(self.call("channels.getMessages", move || {
            self.inner.fetch_messages(channel, ids)
        }))
    }

    fn fetch_file_chunk<'a>(
        &'a self,
        location: &'a FileLocation,
        offset: i64,
        limit: i32,
    ) -> RemoteFuture<'a, UploadFile> {
        Box::pin(self.call("upload.getFile", move || {
            self.inner.fetch_file_chunk(location, offset, limit)
        }))
    }

    fn delete_messages<'a>(
        &'a self,
        channel: &'a ChannelHandle,
        ids: &'a [i32],
    ) -> RemoteFuture<'a, ()> {
        Box::pin(self.call("channels.deleteMessages", move || {
            self.inner.delete_messages(channel, ids)
        }))
    }

    fn disconnect<'a>(&'a self) -> RemoteFuture<'a, ()> {
        self.inner.disconnect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryRemote, ScriptedFailure};
    use tokio::time::Instant;

    #[test]
    fn limiter_allows_a_burst_of_five_then_paces() {
        let limiter = default_rate_limiter();
        for _ in 0..5 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }

    #[tokio::test]
    async fn until_ready_waits_for_replenishment() {
        let limiter = default_rate_limiter();
        let started = std::time::Instant::now();
        for _ in 0..7 {
            limiter.until_ready().await;
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn short_flood_wait_is_slept_through() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(7, "a.bin", "application/octet-stream", vec![9u8; 4096]);
        remote.push_failure(ScriptedFailure::FloodWait(Duration::from_secs(3)));
        let remote = Throttled::new(remote);

        let started = Instant::now();
        let chunk = remote
            .fetch_file_chunk(&doc.location(), 0, 4096)
            .await
            .unwrap();
        assert!(matches!(chunk, UploadFile::File { ref data, .. } if data.len() == 4096));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(remote.inner().file_chunk_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_at_ceiling_is_still_retried() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(7, "a.bin", "application/octet-stream", vec![1u8; 10]);
        remote.push_failure(ScriptedFailure::FloodWait(FLOOD_WAIT_CEILING));
        let remote = Throttled::new(remote);

        assert!(remote.fetch_file_chunk(&doc.location(), 0, 4096).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn long_flood_wait_fails_fast() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(7, "a.bin", "application/octet-stream", vec![1u8; 10]);
        remote.push_failure(ScriptedFailure::FloodWait(Duration::from_secs(30)));
        let remote = Throttled::new(remote);

        let started = Instant::now();
        let err = remote
            .fetch_file_chunk(&doc.location(), 0, 4096)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::FloodWaitTooLong { requested, .. } if requested == Duration::from_secs(30)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(remote.inner().file_chunk_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let remote = InMemoryRemote::new(1, 100);
        let doc = remote.add_document(7, "a.bin", "application/octet-stream", vec![1u8; 10]);
        for _ in 0..=FLOOD_WAIT_MAX_RETRIES {
            remote.push_failure(ScriptedFailure::FloodWait(Duration::from_secs(1)));
        }
        let remote = Throttled::new(remote);

        let err = remote
            .fetch_file_chunk(&doc.location(), 0, 4096)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));
        assert_eq!(
            remote.inner().file_chunk_calls(),
            FLOOD_WAIT_MAX_RETRIES as usize + 1
        );
    }
}

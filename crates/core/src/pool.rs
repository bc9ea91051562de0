use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::remote::{TelegramSession, TelegramSessionConfig, Throttled, default_helper_path};
use crate::worker::Worker;
use crate::{Error, Result};

pub const WORKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Round-robin over the workers that connected successfully.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    index: Mutex<usize>,
}

impl WorkerPool {
    pub fn from_workers(workers: Vec<Arc<Worker>>) -> Result<Self> {
        if workers.is_empty() {
            return Err(Error::InvalidConfig {
                message: "worker pool needs at least one worker".to_string(),
            });
        }
        Ok(Self {
            workers,
            index: Mutex::new(0),
        })
    }

    /// Connects one worker per token concurrently. Tokens that fail or time
    /// out are dropped; the build fails only when none succeed.
    pub async fn build<F, Fut>(tokens: &[String], connect: F) -> Result<Self>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Worker>> + Send + 'static,
    {
        Self::build_with_timeout(tokens, connect, WORKER_CONNECT_TIMEOUT).await
    }

    pub async fn build_with_timeout<F, Fut>(
        tokens: &[String],
        connect: F,
        timeout: Duration,
    ) -> Result<Self>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Worker>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for (slot, token) in tokens.iter().enumerate() {
            let fut = connect(token.clone());
            tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                };
                (slot, result)
            });
        }

        let mut connected = Vec::with_capacity(tokens.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, Ok(worker))) => connected.push((slot, Arc::new(worker))),
                Ok((slot, Err(e))) => warn!(
                    event = "pool.worker_failed",
                    slot,
                    error = %e,
                    "pool.worker_failed"
                ),
                Err(e) => warn!(
                    event = "pool.worker_panicked",
                    error = %e,
                    "pool.worker_panicked"
                ),
            }
        }

        if connected.is_empty() {
            return Err(Error::Auth {
                message: format!("none of {} worker tokens connected", tokens.len()),
            });
        }
        connected.sort_by_key(|(slot, _)| *slot);
        info!(
            event = "pool.ready",
            workers = connected.len(),
            tokens = tokens.len(),
            "pool.ready"
        );
        Self::from_workers(connected.into_iter().map(|(_, w)| w).collect())
    }

    /// Connects every configured bot token to the remote platform.
    pub async fn connect(config: &Config) -> Result<Self> {
        let config = Arc::new(config.clone());
        Self::build(&config.worker_tokens.clone(), move |token| {
            let config = Arc::clone(&config);
            async move { connect_worker(&config, &token).await }
        })
        .await
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Advances the shared index, then returns the worker it points at.
    pub fn next_worker(&self) -> Arc<Worker> {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        *index = (*index + 1) % self.workers.len();
        Arc::clone(&self.workers[*index])
    }

    pub async fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown().await;
        }
    }
}

pub async fn connect_worker(config: &Config, token: &str) -> Result<Worker> {
    tokio::fs::create_dir_all(&config.worker_cache_root).await?;
    let session = TelegramSession::new(
        TelegramSessionConfig {
            api_id: config.app_id,
            api_hash: config.app_hash.clone(),
            session_dir: config.session_dir.clone(),
            socks_proxy: config.socks_proxy.clone(),
            helper_path: config
                .mtproto_helper
                .clone()
                .unwrap_or_else(default_helper_path),
        },
        token,
    )?;
    session.connect().await?;
    Ok(Worker::new(
        Arc::new(Throttled::new(session)),
        config.channel_id,
        &config.worker_cache_root,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use std::path::PathBuf;

    fn memory_worker(account_id: i64, root: PathBuf) -> Worker {
        Worker::new(Arc::new(InMemoryRemote::new(account_id, 100)), 100, &root)
    }

    fn tokens(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{i}:token")).collect()
    }

    #[tokio::test]
    async fn round_robin_starts_after_the_first_worker() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        let pool = WorkerPool::build(&tokens(3), move |token| {
            let root = root.clone();
            async move {
                let id: i64 = token.split(':').next().unwrap().parse().unwrap();
                Ok(memory_worker(id, root))
            }
        })
        .await
        .unwrap();

        let order: Vec<i64> = (0..6).map(|_| pool.next_worker().account_id()).collect();
        assert_eq!(order, vec![2, 3, 1, 2, 3, 1]);
    }

    #[tokio::test]
    async fn failed_tokens_are_dropped() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        let pool = WorkerPool::build(&tokens(3), move |token| {
            let root = root.clone();
            async move {
                if token.starts_with("2:") {
                    return Err(Error::Auth {
                        message: "ACCESS_TOKEN_INVALID".to_string(),
                    });
                }
                let id: i64 = token.split(':').next().unwrap().parse().unwrap();
                Ok(memory_worker(id, root))
            }
        })
        .await
        .unwrap();

        assert_eq!(pool.len(), 2);
        let mut seen: Vec<i64> = (0..2).map(|_| pool.next_worker().account_id()).collect();
        seen.sort();
        assert_eq!(seen, vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tokens_time_out_and_all_failing_is_fatal() {
        let err = WorkerPool::build_with_timeout(
            &tokens(2),
            |_token| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err::<Worker, _>(Error::Timeout)
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(WorkerPool::from_workers(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn concurrent_callers_spread_evenly() {
        let temp = tempfile::tempdir().unwrap();
        let workers = (1..=4)
            .map(|id| Arc::new(memory_worker(id, temp.path().to_path_buf())))
            .collect();
        let pool = Arc::new(WorkerPool::from_workers(workers).unwrap());

        let mut tasks = JoinSet::new();
        for _ in 0..400 {
            let pool = Arc::clone(&pool);
            tasks.spawn(async move { pool.next_worker().account_id() });
        }
        let mut counts = [0usize; 5];
        while let Some(id) = tasks.join_next().await {
            counts[id.unwrap() as usize] += 1;
        }
        assert_eq!(&counts[1..], &[100, 100, 100, 100]);
    }
}

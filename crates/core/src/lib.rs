pub mod cache;
pub mod config;
mod error;
pub mod fuse;
pub mod http;
mod index;
pub mod logging;
pub mod media;
mod media_db;
mod pool;
pub mod reader;
pub mod remote;
mod worker;

use std::future::Future;
use std::pin::Pin;

pub const APP_NAME: &str = "teledrive";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub use config::{Config, LogFormat};
pub use error::{Error, Result};
pub use index::index_message;
pub use media::{InMemoryMediaRepository, MediaId, MediaMeta, MediaRecord, MediaRepository};
pub use media_db::{SqliteMediaRepository, open_media_db};
pub use pool::{WorkerPool, connect_worker};
pub use reader::{Block, ChunkedReader, adjust_limit};
pub use remote::{InMemoryRemote, RemoteApi};
pub use worker::Worker;

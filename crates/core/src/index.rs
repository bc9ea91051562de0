use tracing::info;

use crate::media::{MediaRecord, MediaRepository};
use crate::worker::Worker;
use crate::Result;

/// Records an archived message in the repository. Already-indexed messages
/// return their existing record.
pub async fn index_message(
    worker: &Worker,
    repo: &dyn MediaRepository,
    message_id: i32,
) -> Result<MediaRecord> {
    if let Some(existing) = repo.find_by_message(worker.channel_id(), message_id).await? {
        return Ok(existing);
    }

    let doc = worker.get_doc(message_id).await?;
    let record = MediaRecord::from_document(message_id, worker.channel_id(), &doc);
    repo.insert(&record).await?;
    info!(
        event = "index.inserted",
        media_id = %record.id,
        message_id,
        file_size = record.meta.file_size,
        "index.inserted"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::media::InMemoryMediaRepository;
    use crate::remote::InMemoryRemote;
    use std::sync::Arc;

    #[tokio::test]
    async fn indexing_copies_descriptor_meta_and_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new(1, 100));
        remote.add_document(8, "talk.webm", "video/webm", vec![0u8; 321]);
        let worker = Worker::new(remote.clone(), 100, temp.path());
        let repo = InMemoryMediaRepository::new();

        let record = index_message(&worker, &repo, 8).await.unwrap();
        assert_eq!(record.message_id, 8);
        assert_eq!(record.meta.file_size, 321);
        assert_eq!(record.meta.file_name, "talk.webm");
        assert_eq!(record.meta.mime_type, "video/webm");
        assert_eq!(record.meta.location, 100);

        let again = index_message(&worker, &repo, 8).await.unwrap();
        assert_eq!(again.id, record.id);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_message_is_not_indexed() {
        let temp = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemote::new(1, 100));
        let worker = Worker::new(remote, 100, temp.path());
        let repo = InMemoryMediaRepository::new();

        let err = index_message(&worker, &repo, 404).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(repo.count().await.unwrap(), 0);
    }
}

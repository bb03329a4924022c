use serde::{Deserialize, Serialize};

/// Durable queue the ingestion consumer reads from.
pub const QUEUE_NAME: &str = "upload.process.queue";
/// Queue for tasks that exhausted their retries or could not be decoded.
pub const DLQ_QUEUE_NAME: &str = "upload.process.dlq";

/// A deferred upload handed from the foreground path to the ingestion consumer.
///
/// The staged file at `file_path` belongs to the task: the consumer removes it once
/// the task is finished, whether it succeeded or was dead-lettered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionTask {
    pub user_identity: String,
    /// Parent folder id; 0 is the root.
    pub parent_id: i64,
    /// Local path of the staged upload.
    pub file_path: String,
    /// Extension including the leading dot, lowercased (".mp4"). Empty if none.
    pub ext: String,
    pub name: String,
    pub size: i64,
    /// Content was already in the pool when the task was created; only a link is needed.
    pub is_existed: bool,
    /// Content reference of the pool entry, pre-generated for new content.
    pub repository_identity: String,
    /// Hex content hash.
    pub hash: String,
}

impl IngestionTask {
    /// Message type recorded for dead-lettered tasks.
    pub const MESSAGE_TYPE: &'static str = "ingestion_task";
}

/// Extract the lowercased extension (with leading dot) from a file name.
pub fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

use std::path::PathBuf;

use async_trait::async_trait;
use bankid_core::{types::CompletionData, BankIdError, ResultStore};
use tracing::info;
use uuid::Uuid;

/// Writes every completed order as pretty JSON into a directory.
pub struct FileResultStore {
    dir: PathBuf,
}

impl FileResultStore {
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn persist(&self, data: &CompletionData) -> Result<(), BankIdError> {
        let json =
            serde_json::to_vec_pretty(data).map_err(|e| BankIdError::SerializationError {
                error: format!("Failed to serialize completion data: {e}"),
            })?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            BankIdError::InvalidInput {
                attribute: "results_dir".to_string(),
                reason: e.to_string(),
            }
        })?;

        let path = self
            .dir
            .join(format!("{}-{}.json", data.user.personal_number, Uuid::new_v4()));
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| BankIdError::InvalidInput {
                attribute: "results_dir".to_string(),
                reason: format!("failed to write {}: {e}", path.display()),
            })?;

        info!(path = %path.display(), "stored completion data");
        Ok(())
    }
}

//! Token file persistence.
use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::types::CredentialToken;

#[derive(Clone, Debug, Default)]
pub struct CredentialStore;

impl CredentialStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn load(&self, path: &Path) -> AppResult<CredentialToken> {
        debug!(path = %path.display(), "Reading token file");
        let raw = fs::read_to_string(path).await.map_err(|e| {
            AppError::NotFound(format!("token file {} unreadable: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::NotFound(format!("token file {} is not a valid token: {e}", path.display()))
        })
    }

    /// Writes `token` to `path`, replacing any previous file.
    pub async fn save(&self, path: &Path, token: &CredentialToken) -> AppResult<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            ensure_directory(dir).await?;
        }
        let serialized = serde_json::to_string_pretty(token)
            .map_err(|e| AppError::Unexpected(format!("serializing token: {e}")))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .await;
        }

        file.write_all(serialized.as_bytes()).await?;
        file.sync_all().await?;
        info!(path = %path.display(), "Token saved");
        Ok(())
    }
}

async fn ensure_directory(dir: &Path) -> AppResult<()> {
    if fs::metadata(dir).await.is_ok() {
        return Ok(());
    }
    debug!(dir = %dir.display(), "Token directory missing, creating it");
    fs::create_dir_all(dir).await?;
    Ok(())
}

//! Storage for image attachments. Uploading returns an opaque URL that the
//! message carries; files are served back read-only.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Store an image and return the URL it is reachable under.
    async fn store_image(
        &self,
        content_type: &str,
        file_name: Option<&str>,
        bytes: &[u8],
    ) -> AppResult<String>;

    /// Drop an image stored by `store_image` whose message was never sent.
    async fn discard(&self, url: &str);
}

/// Writes uploads into a local directory under random names.
pub struct DiskMediaStore {
    root: PathBuf,
    base_url: String,
}

impl DiskMediaStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// File extension for an accepted upload type. Only inert raster formats
/// map; SVG and everything else is refused.
fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence.to_ascii_lowercase().as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

#[async_trait]
impl MediaStore for DiskMediaStore {
    async fn store_image(
        &self,
        content_type: &str,
        file_name: Option<&str>,
        bytes: &[u8],
    ) -> AppResult<String> {
        let Some(extension) = extension_for(content_type) else {
            return Err(AppError::Validation(format!(
                "Only PNG, JPEG, GIF or WebP images can be attached, got {}",
                content_type
            )));
        };
        if bytes.is_empty() {
            return Err(AppError::Validation("Image file is empty".to_string()));
        }

        let name = format!("{}.{}", Uuid::new_v4(), extension);
        let path = self.root.join(&name);

        fs::create_dir_all(&self.root).await.map_err(|e| {
            error!("Failed to create media directory {:?}: {}", self.root, e);
            AppError::Internal("Failed to store image".to_string())
        })?;
        fs::write(&path, bytes).await.map_err(|e| {
            error!("Failed to write {:?}: {}", path, e);
            AppError::Internal("Failed to store image".to_string())
        })?;

        debug!("Stored {} bytes at {:?} ({:?})", bytes.len(), path, file_name);
        Ok(format!("{}/{}", self.base_url, name))
    }

    async fn discard(&self, url: &str) {
        let Some(name) = url
            .strip_prefix(&self.base_url)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty() && !name.contains(['/', '\\']) && name != &"..")
        else {
            warn!("Refusing to discard foreign media url {}", url);
            return;
        };

        let path = self.root.join(name);
        match fs::remove_file(&path).await {
            Ok(()) => debug!("Discarded {:?}", path),
            Err(e) => warn!("Failed to discard {:?}: {}", path, e),
        }
    }
}

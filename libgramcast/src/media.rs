//! Media reference resolution and temporary file cleanup
//!
//! The remote API only accepts publicly reachable URLs. Remote references
//! pass through unchanged. Local files are exposed under
//! `publishing.media_base_url` when one is configured; otherwise their
//! absolute path is sent as-is, which only works when the API can read it.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ApiErrorDetail, GramcastError, PublishError};
use crate::types::{JobSpec, MediaRef};

#[derive(Debug, Clone, Default)]
pub struct MediaResolver {
    media_base_url: Option<String>,
    temp_dir: Option<PathBuf>,
}

impl MediaResolver {
    pub fn new(media_base_url: Option<String>, temp_dir: Option<PathBuf>) -> Self {
        Self {
            media_base_url: media_base_url.map(|u| u.trim_end_matches('/').to_string()),
            temp_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.publishing.media_base_url.clone(), config.temp_dir())
    }

    /// Fail with `NotFound` if a local reference does not exist
    pub fn ensure_exists(media: &MediaRef) -> crate::Result<()> {
        match media.local_path() {
            Some(path) if !path.is_file() => Err(GramcastError::NotFound(format!(
                "media file {} does not exist",
                path.display()
            ))),
            _ => Ok(()),
        }
    }

    /// Whether the reference can still be sent: a URL, or an existing file
    pub fn is_resolvable(media: &MediaRef) -> bool {
        Self::ensure_exists(media).is_ok()
    }

    /// The URL the remote API should fetch this media from
    ///
    /// # Errors
    ///
    /// Returns a media error if a local file has disappeared since submission.
    pub fn public_url(&self, media: &MediaRef) -> Result<String, PublishError> {
        let Some(path) = media.local_path() else {
            return Ok(media.as_str().to_string());
        };

        let absolute = path.canonicalize().map_err(|e| {
            PublishError::Media(ApiErrorDetail::new(format!(
                "media file {} is not readable: {}",
                path.display(),
                e
            )))
        })?;

        match &self.media_base_url {
            Some(base) => {
                let file_name = absolute
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        PublishError::Media(ApiErrorDetail::new(format!(
                            "media path {} has no file name",
                            absolute.display()
                        )))
                    })?;
                Ok(format!("{}/{}", base, file_name))
            }
            None => Ok(absolute.to_string_lossy().to_string()),
        }
    }

    fn is_temp(&self, path: &Path) -> bool {
        match &self.temp_dir {
            Some(dir) => {
                let dir = dir.canonicalize().unwrap_or_else(|_| dir.clone());
                let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
                path.starts_with(dir)
            }
            None => false,
        }
    }

    /// Local files the job owns: everything when `owns_media` is set,
    /// otherwise whatever lives under the temp directory
    pub fn owned_files(&self, spec: &JobSpec) -> Vec<PathBuf> {
        let owns_all = spec.base().owns_media;
        spec.media_refs()
            .into_iter()
            .filter_map(MediaRef::local_path)
            .filter(|path| owns_all || self.is_temp(path))
            .collect()
    }

    /// Delete the job's owned files; returns how many were removed
    pub async fn cleanup(&self, spec: &JobSpec) -> usize {
        let mut removed = 0;
        for path in self.owned_files(spec) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed temporary media");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to remove temporary media: {}", e),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubmitOptions;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"jpeg").unwrap();
        path
    }

    #[test]
    fn test_ensure_exists() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), "a.jpg");

        assert!(MediaResolver::ensure_exists(&MediaRef::new(path.to_string_lossy())).is_ok());
        assert!(MediaResolver::ensure_exists(&MediaRef::new("https://cdn.example.com/a.jpg")).is_ok());

        let missing = MediaResolver::ensure_exists(&MediaRef::new("/definitely/missing.jpg"));
        assert!(matches!(missing, Err(GramcastError::NotFound(_))));
    }

    #[test]
    fn test_public_url_with_base() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), "photo.jpg");
        let resolver = MediaResolver::new(Some("https://media.example.com/up/".to_string()), None);

        let url = resolver.public_url(&MediaRef::new(path.to_string_lossy())).unwrap();
        assert_eq!(url, "https://media.example.com/up/photo.jpg");

        let remote = resolver
            .public_url(&MediaRef::new("https://cdn.example.com/x.jpg"))
            .unwrap();
        assert_eq!(remote, "https://cdn.example.com/x.jpg");
    }

    #[test]
    fn test_public_url_missing_file_is_media_error() {
        let resolver = MediaResolver::default();
        let err = resolver.public_url(&MediaRef::new("/gone/photo.jpg")).unwrap_err();
        assert!(matches!(err, PublishError::Media(_)));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_temp_files() {
        let temp = TempDir::new().unwrap();
        let keep = TempDir::new().unwrap();
        let owned = write(temp.path(), "a.jpg");
        let user = write(keep.path(), "b.jpg");

        let resolver = MediaResolver::new(None, Some(temp.path().to_path_buf()));
        let spec = JobSpec::build(
            vec![
                MediaRef::new(owned.to_string_lossy()),
                MediaRef::new(user.to_string_lossy()),
            ],
            String::new(),
            &SubmitOptions::default(),
        )
        .unwrap();

        assert_eq!(resolver.cleanup(&spec).await, 1);
        assert!(!owned.exists());
        assert!(user.exists());
    }

    #[tokio::test]
    async fn test_cleanup_owns_media_flag() {
        let dir = TempDir::new().unwrap();
        let file = write(dir.path(), "c.jpg");

        let spec = JobSpec::build(
            vec![MediaRef::new(file.to_string_lossy())],
            String::new(),
            &SubmitOptions {
                owns_media: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(MediaResolver::default().cleanup(&spec).await, 1);
        assert!(!file.exists());
    }
}

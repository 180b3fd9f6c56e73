//! DockerImage / UploadedImage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DockerImageId, UploadedImageId};

/// Tag used when an uploaded filename carries none.
pub const DEFAULT_TAG: &str = "latest";

/// (name, tag) identity of an image. At most one DockerImage per identity is active.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageIdentity {
    pub name: String,
    pub tag: String,
}

impl ImageIdentity {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Derive the identity from an uploaded filename.
    ///
    /// `dir/web.tar` -> (web, latest), `web:1.2.tar` -> (web, 1.2).
    pub fn from_filename(filename: &str) -> Self {
        let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
        let stem = base.strip_suffix(".tar").unwrap_or(base);
        match stem.rsplit_once(':') {
            Some((name, tag)) if !name.is_empty() && !tag.is_empty() => Self::new(name, tag),
            _ => Self::new(stem, DEFAULT_TAG),
        }
    }
}

impl std::fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// One materialization of an image inside the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerImage {
    pub id: DockerImageId,
    pub uploaded_image_id: Option<UploadedImageId>,
    pub name: String,
    pub tag: String,
    pub runtime_image_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl DockerImage {
    pub fn identity(&self) -> ImageIdentity {
        ImageIdentity::new(self.name.clone(), self.tag.clone())
    }

    pub fn has_identity(&self, identity: &ImageIdentity) -> bool {
        self.name == identity.name && self.tag == identity.tag
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
}

/// An image tarball handed over by the upload collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedImage {
    pub id: UploadedImageId,
    pub filename: String,
    pub path: String,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
}

impl UploadedImage {
    pub fn identity(&self) -> ImageIdentity {
        ImageIdentity::from_filename(&self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("web.tar", "web", "latest")]
    #[case::tagged("web:1.2.tar", "web", "1.2")]
    #[case::no_extension("web", "web", "latest")]
    #[case::with_directory("uploads/web.tar", "web", "latest")]
    #[case::dangling_colon("web:.tar", "web:", "latest")]
    fn identity_from_filename(#[case] filename: &str, #[case] name: &str, #[case] tag: &str) {
        let identity = ImageIdentity::from_filename(filename);
        assert_eq!(identity, ImageIdentity::new(name, tag));
    }

    #[test]
    fn identity_displays_as_reference() {
        assert_eq!(ImageIdentity::new("web", "1.2").to_string(), "web:1.2");
    }
}

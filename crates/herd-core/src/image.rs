//! Images — named target file-system trees.

use serde::{Deserialize, Serialize};

use crate::filesystem::FileSystem;
use crate::filter::Filter;
use crate::triggers::Triggers;

/// A target tree for a sub. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub filesystem: FileSystem,
    /// Paths the herd leaves alone on the sub. `None` marks a sparse image:
    /// paths missing from the image are never deleted.
    #[serde(default)]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub triggers: Triggers,
}

impl Image {
    pub fn new(filesystem: FileSystem) -> Self {
        Self {
            filesystem,
            filter: Some(Filter::default()),
            triggers: Triggers::default(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.filter.is_none()
    }

    /// Whether `path` is managed by this image (not excluded by its filter).
    pub fn manages(&self, path: &str) -> bool {
        match &self.filter {
            Some(filter) => !filter.is_match(path),
            None => self.filesystem.paths.contains_key(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_image_manages_only_its_paths() {
        let mut image = Image::new(FileSystem::new());
        image.filter = None;
        assert!(image.is_sparse());
        assert!(image.manages("/"));
        assert!(!image.manages("/etc"));
    }

    #[test]
    fn filtered_paths_are_not_managed() {
        let mut image = Image::new(FileSystem::new());
        image.filter = Some(Filter::new(["/var/log/.*"]).unwrap());
        assert!(!image.manages("/var/log/x"));
        assert!(image.manages("/etc"));
    }
}

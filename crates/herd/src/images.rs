//! Image and object sources backed by local storage.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use herd_core::{Hash, Image};
use herd_node::{BoxFuture, ImageSource, ObjectGetter};
use herd_state::StateStore;
use tracing::{debug, warn};

use crate::error::HerdResult;

/// Images from the state store, loaded once and then shared.
///
/// Images are immutable, so every node sees the same `Arc` for a name and
/// a controller can tell an image change by pointer.
pub struct StoreImages {
    store: StateStore,
    cache: RwLock<BTreeMap<String, Arc<Image>>>,
}

impl StoreImages {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Store a new image. An existing name is an error.
    pub fn add(&self, name: &str, image: Image) -> HerdResult<()> {
        self.store.add_image(name, &image)?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(image));
        debug!(image = %name, "image added");
        Ok(())
    }

    pub fn names(&self) -> HerdResult<Vec<String>> {
        Ok(self.store.list_image_names()?)
    }
}

impl ImageSource for StoreImages {
    fn get(&self, name: &str) -> Option<Arc<Image>> {
        if let Some(image) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Some(Arc::clone(image));
        }
        match self.store.get_image(name) {
            Ok(Some(image)) => {
                let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
                let image = cache
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(image));
                Some(Arc::clone(image))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(image = %name, error = %e, "failed to load image");
                None
            }
        }
    }
}

/// Objects stored under a directory, fanned out by hash.
#[derive(Debug, Clone)]
pub struct DirObjects {
    dir: PathBuf,
}

impl DirObjects {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, hash: &Hash) -> PathBuf {
        self.dir.join(hash.object_filename())
    }

    /// Store `data` and return its hash.
    pub async fn put(&self, data: &[u8]) -> std::io::Result<Hash> {
        let hash = Hash::of(data);
        let path = self.path(&hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(hash)
    }
}

impl ObjectGetter for DirObjects {
    fn get_object(&self, hash: Hash) -> BoxFuture<'_, Result<Vec<u8>, String>> {
        Box::pin(async move {
            let path = self.path(&hash);
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| format!("{}: {e}", path.display()))?;
            if Hash::of(&data) != hash {
                return Err(format!("{}: content does not match hash", path.display()));
            }
            Ok(data)
        })
    }
}

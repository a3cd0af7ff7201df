use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::page::TerrainPage;

/// Identifies one terrain asset: map id plus the (mirrored) file tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TerrainKey {
    pub map_id: u32,
    pub tile_x: u32,
    pub tile_y: u32,
}

impl TerrainKey {
    pub fn new(map_id: u32, tile_x: u32, tile_y: u32) -> Self {
        Self {
            map_id,
            tile_x,
            tile_y,
        }
    }
}

impl std::fmt::Display for TerrainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}{:02}{:02}", self.map_id, self.tile_x, self.tile_y)
    }
}

/// Locates and validates terrain asset files.
#[derive(Debug, Clone)]
pub struct TerrainLoader {
    data_path: PathBuf,
    accepted_builds: Vec<u32>,
}

impl TerrainLoader {
    /// `accepted_builds` empty accepts any client build token.
    pub fn new(data_path: impl Into<PathBuf>, accepted_builds: Vec<u32>) -> Self {
        Self {
            data_path: data_path.into(),
            accepted_builds,
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn vmaps_dir(&self) -> PathBuf {
        self.data_path.join("vmaps")
    }

    pub fn accepted_builds(&self) -> &[u32] {
        &self.accepted_builds
    }

    /// `<data_path>/maps/MMMXXYY.map`
    pub fn map_file_path(&self, key: TerrainKey) -> PathBuf {
        self.data_path.join("maps").join(format!("{key}.map"))
    }

    /// Whether a compatible asset exists for `key`. Logs why when it does not.
    pub fn exists(&self, key: TerrainKey) -> bool {
        let path = self.map_file_path(key);
        match TerrainPage::probe(&path, &self.accepted_builds) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "terrain file missing or incompatible");
                false
            }
        }
    }

    /// Load the page for `key`. Errors are logged and yield an empty page.
    pub fn load_page(&self, key: TerrainKey) -> TerrainPage {
        let path = self.map_file_path(key);
        tracing::debug!(path = %path.display(), "loading terrain page");
        let mut page = TerrainPage::new();
        if let Err(e) = page.load_data(&path, &self.accepted_builds) {
            tracing::error!(path = %path.display(), error = %e, "failed to load terrain page");
        }
        page
    }
}

/// A page handed out by [`TerrainStore`]. `created` is set only for the
/// call that put the page into the registry, decided under the registry lock.
#[derive(Debug, Clone)]
pub struct PageLoad {
    pub page: Arc<TerrainPage>,
    pub created: bool,
}

impl PageLoad {
    fn existing(page: &Arc<TerrainPage>) -> Self {
        Self {
            page: Arc::clone(page),
            created: false,
        }
    }
}

#[derive(Debug)]
struct StoreEntry {
    page: Arc<TerrainPage>,
    base_held: bool,
    instance_refs: u32,
}

/// Registry of loaded terrain pages shared between a base map and its instances.
///
/// The base map (instance id 0) owns a page through [`TerrainStore::load`] and
/// [`TerrainStore::unload`]. Instances borrow it through
/// [`TerrainStore::acquire_shared`] / [`TerrainStore::release_shared`]; the
/// page is dropped once neither holds it.
#[derive(Debug)]
pub struct TerrainStore {
    loader: TerrainLoader,
    pages: Mutex<HashMap<TerrainKey, StoreEntry>>,
}

impl TerrainStore {
    pub fn new(loader: TerrainLoader) -> Self {
        Self {
            loader,
            pages: Mutex::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &TerrainLoader {
        &self.loader
    }

    /// Base-map load. Returns the existing page unless `reload` is set.
    pub fn load(&self, key: TerrainKey, reload: bool) -> PageLoad {
        let mut pages = self.pages.lock();
        if let Some(entry) = pages.get_mut(&key) {
            entry.base_held = true;
            if !reload {
                return PageLoad::existing(&entry.page);
            }
            tracing::info!(%key, "reloading terrain page");
            entry.page = Arc::new(self.loader.load_page(key));
            return PageLoad::existing(&entry.page);
        }
        let page = Arc::new(self.loader.load_page(key));
        pages.insert(
            key,
            StoreEntry {
                page: Arc::clone(&page),
                base_held: true,
                instance_refs: 0,
            },
        );
        PageLoad { page, created: true }
    }

    /// Base-map release. The page stays resident while instances still reference it.
    /// Returns whether this call dropped the page.
    pub fn unload(&self, key: TerrainKey) -> bool {
        let mut pages = self.pages.lock();
        let Some(entry) = pages.get_mut(&key) else {
            return false;
        };
        entry.base_held = false;
        if entry.instance_refs != 0 {
            return false;
        }
        pages.remove(&key);
        tracing::debug!(%key, "terrain page unloaded");
        true
    }

    /// Instance load: take a reference to the base map's page, loading it if needed.
    pub fn acquire_shared(&self, key: TerrainKey) -> PageLoad {
        let mut pages = self.pages.lock();
        if let Some(entry) = pages.get_mut(&key) {
            entry.instance_refs += 1;
            return PageLoad::existing(&entry.page);
        }
        let page = Arc::new(self.loader.load_page(key));
        pages.insert(
            key,
            StoreEntry {
                page: Arc::clone(&page),
                base_held: false,
                instance_refs: 1,
            },
        );
        PageLoad { page, created: true }
    }

    /// Returns whether this call dropped the page.
    pub fn release_shared(&self, key: TerrainKey) -> bool {
        let mut pages = self.pages.lock();
        let Some(entry) = pages.get_mut(&key) else {
            tracing::error!(%key, "releasing a terrain page that is not loaded");
            return false;
        };
        if entry.instance_refs == 0 {
            tracing::error!(%key, "terrain page reference count underflow");
            return false;
        }
        entry.instance_refs -= 1;
        if entry.instance_refs != 0 || entry.base_held {
            return false;
        }
        pages.remove(&key);
        true
    }

    /// Number of instance maps currently sharing the page.
    pub fn instance_refs(&self, key: TerrainKey) -> u32 {
        self.pages.lock().get(&key).map_or(0, |e| e.instance_refs)
    }

    pub fn get(&self, key: TerrainKey) -> Option<Arc<TerrainPage>> {
        self.pages.lock().get(&key).map(|e| Arc::clone(&e.page))
    }

    pub fn is_loaded(&self, key: TerrainKey) -> bool {
        self.pages.lock().contains_key(&key)
    }

    pub fn loaded_count(&self) -> usize {
        self.pages.lock().len()
    }
}

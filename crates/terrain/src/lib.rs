//! Terrain pages: the per-grid height, area and liquid samples read from
//! `.map` assets, plus the shared registry that lets instance maps borrow
//! their base map's pages.
//!
//! # Invariants
//! - A page is read from disk at most once per load cycle of its asset.
//! - Pages are immutable once published through the store.
//! - Missing or incompatible assets degrade to empty pages, never panics.

pub mod format;

mod collision;
mod page;
mod store;

pub use collision::{CollisionManager, FlatCollision, NullCollision, VmapLoadResult};
pub use page::{
    INVALID_HEIGHT, LiquidData, LiquidStatus, MAP_ALL_LIQUIDS, MAP_LIQUID_TYPE_MAGMA,
    MAP_LIQUID_TYPE_NO_WATER, MAP_LIQUID_TYPE_OCEAN, MAP_LIQUID_TYPE_SLIME, MAP_LIQUID_TYPE_WATER,
    MAX_HEIGHT, TerrainPage, VMAP_INVALID_HEIGHT_VALUE,
};
pub use store::{PageLoad, TerrainKey, TerrainLoader, TerrainStore};

/// Errors from reading terrain assets.
#[derive(Debug, thiserror::Error)]
pub enum TerrainError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("incompatible map file (magic {magic:#x}, version {version:#x})")]
    IncompatibleVersion { magic: u32, version: u32 },
    #[error("map file built for unaccepted client build {0}")]
    UnacceptableBuild(u32),
    #[error("map file truncated in {section} section")]
    Truncated { section: &'static str },
    #[error("bad {section} section magic")]
    BadSectionMagic { section: &'static str },
}

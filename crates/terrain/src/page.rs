use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use worldgrid_stream::{MAP_RESOLUTION, SIZE_OF_GRIDS};

use crate::TerrainError;
use crate::format::{
    AreaHeader, FileHeader, HeightHeader, LeHeader, LiquidHeader, MAP_AREA_MAGIC, MAP_AREA_NO_AREA,
    MAP_HEIGHT_AS_INT8, MAP_HEIGHT_AS_INT16, MAP_HEIGHT_MAGIC, MAP_HEIGHT_NO_HEIGHT,
    MAP_LIQUID_MAGIC, MAP_LIQUID_NO_HEIGHT, MAP_LIQUID_NO_TYPE, MAP_MAGIC, MAP_VERSION_MAGIC,
    SUBCELLS, V8_SIZE, V9_SIZE,
};

/// Height reported where no terrain data exists.
pub const INVALID_HEIGHT: f32 = -100_000.0;
/// Height reported by the collision layer when it finds nothing.
pub const VMAP_INVALID_HEIGHT_VALUE: f32 = -200_000.0;
/// Probe height meaning "search from the top of the world".
pub const MAX_HEIGHT: f32 = 100_000.0;

pub const MAP_LIQUID_TYPE_NO_WATER: u8 = 0x00;
pub const MAP_LIQUID_TYPE_WATER: u8 = 0x01;
pub const MAP_LIQUID_TYPE_OCEAN: u8 = 0x02;
pub const MAP_LIQUID_TYPE_MAGMA: u8 = 0x04;
pub const MAP_LIQUID_TYPE_SLIME: u8 = 0x08;
pub const MAP_ALL_LIQUIDS: u8 =
    MAP_LIQUID_TYPE_WATER | MAP_LIQUID_TYPE_OCEAN | MAP_LIQUID_TYPE_MAGMA | MAP_LIQUID_TYPE_SLIME;

/// Where a point stands relative to liquid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiquidStatus {
    NoWater = 0x00,
    AboveWater = 0x01,
    WaterWalk = 0x02,
    InWater = 0x04,
    UnderWater = 0x08,
}

impl LiquidStatus {
    pub fn is_in_water(self) -> bool {
        matches!(self, LiquidStatus::InWater | LiquidStatus::UnderWater)
    }

    pub fn is_under_water(self) -> bool {
        self == LiquidStatus::UnderWater
    }
}

/// Liquid found at a sampled point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidData {
    pub liquid_type: u8,
    pub level: f32,
    pub depth_level: f32,
}

#[derive(Debug, Clone, Default)]
enum HeightSamples {
    #[default]
    Flat,
    Float {
        v9: Box<[f32]>,
        v8: Box<[f32]>,
    },
    Int16 {
        v9: Box<[u16]>,
        v8: Box<[u16]>,
        multiplier: f32,
    },
    Int8 {
        v9: Box<[u8]>,
        v8: Box<[u8]>,
        multiplier: f32,
    },
}

#[derive(Debug, Clone)]
struct LiquidLayer {
    liquid_type: u16,
    offset_x: u8,
    offset_y: u8,
    width: u8,
    height: u8,
    level: f32,
    types: Option<Box<[u8]>>,
    levels: Option<Box<[f32]>>,
}

impl Default for LiquidLayer {
    fn default() -> Self {
        Self {
            liquid_type: 0,
            offset_x: 0,
            offset_y: 0,
            width: 0,
            height: 0,
            level: INVALID_HEIGHT,
            types: None,
            levels: None,
        }
    }
}

/// Read-only height, area and liquid samples for one grid.
///
/// An unloaded page answers every query with its defaults: flat
/// [`INVALID_HEIGHT`], area 0, no liquid.
#[derive(Debug, Clone)]
pub struct TerrainPage {
    grid_area: u16,
    area_map: Option<Box<[u16]>>,
    grid_height: f32,
    heights: HeightSamples,
    liquid: LiquidLayer,
    loaded_from_file: bool,
}

impl Default for TerrainPage {
    fn default() -> Self {
        Self {
            grid_area: 0,
            area_map: None,
            grid_height: INVALID_HEIGHT,
            heights: HeightSamples::Flat,
            liquid: LiquidLayer::default(),
            loaded_from_file: false,
        }
    }
}

fn slice_at<'a>(bytes: &'a [u8], offset: usize, len: usize, section: &'static str) -> Result<&'a [u8], TerrainError> {
    offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(TerrainError::Truncated { section })
}

fn read_u16s(bytes: &[u8], offset: usize, count: usize, section: &'static str) -> Result<Box<[u16]>, TerrainError> {
    let raw = slice_at(bytes, offset, count * 2, section)?;
    let mut out = vec![0u16; count];
    LittleEndian::read_u16_into(raw, &mut out);
    Ok(out.into_boxed_slice())
}

fn read_f32s(bytes: &[u8], offset: usize, count: usize, section: &'static str) -> Result<Box<[f32]>, TerrainError> {
    let raw = slice_at(bytes, offset, count * 4, section)?;
    let mut out = vec![0f32; count];
    LittleEndian::read_f32_into(raw, &mut out);
    Ok(out.into_boxed_slice())
}

fn read_u8s(bytes: &[u8], offset: usize, count: usize, section: &'static str) -> Result<Box<[u8]>, TerrainError> {
    Ok(slice_at(bytes, offset, count, section)?.into())
}

/// Position inside the page on the 128×128 height lattice.
fn lattice(x: f32, y: f32) -> (f32, f32) {
    let res = MAP_RESOLUTION as f32;
    (res * (32.0 - x / SIZE_OF_GRIDS), res * (32.0 - y / SIZE_OF_GRIDS))
}

/// Position on the 16×16 area/type lattice.
fn sub_lattice(x: f32, y: f32) -> (usize, usize) {
    let lx = (SUBCELLS as f32 * (32.0 - x / SIZE_OF_GRIDS)) as i32 & (SUBCELLS as i32 - 1);
    let ly = (SUBCELLS as f32 * (32.0 - y / SIZE_OF_GRIDS)) as i32 & (SUBCELLS as i32 - 1);
    (lx as usize, ly as usize)
}

const RES_MASK: i32 = MAP_RESOLUTION as i32 - 1;

trait HeightSample: Copy {
    type Acc: Copy
        + std::ops::Add<Output = Self::Acc>
        + std::ops::Sub<Output = Self::Acc>
        + std::ops::Mul<Output = Self::Acc>;
    const TWO: Self::Acc;
    fn widen(self) -> Self::Acc;
}

impl HeightSample for f32 {
    type Acc = f32;
    const TWO: f32 = 2.0;
    fn widen(self) -> f32 {
        self
    }
}

impl HeightSample for u16 {
    type Acc = i32;
    const TWO: i32 = 2;
    fn widen(self) -> i32 {
        i32::from(self)
    }
}

impl HeightSample for u8 {
    type Acc = i32;
    const TWO: i32 = 2;
    fn widen(self) -> i32 {
        i32::from(self)
    }
}

/// Plane coefficients `(a, b, c)` of the triangle under `(fx, fy)`.
///
/// Each lattice square is split into four triangles around its center
/// sample h5 (from V8). h1..h4 are the corners from V9:
/// h1 (0,0), h2 (1,0), h3 (0,1), h4 (1,1).
fn plane<S: HeightSample>(v9: &[S], v8: &[S], xi: usize, yi: usize, fx: f32, fy: f32) -> [S::Acc; 3] {
    let corner = |i: usize| v9[i].widen();
    let base = xi * V9_SIZE + yi;
    let h5 = S::TWO * v8[xi * V8_SIZE + yi].widen();
    if fx + fy < 1.0 {
        if fx > fy {
            let (h1, h2) = (corner(base), corner(base + V9_SIZE));
            [h2 - h1, h5 - h1 - h2, h1]
        } else {
            let (h1, h3) = (corner(base), corner(base + 1));
            [h5 - h1 - h3, h3 - h1, h1]
        }
    } else if fx > fy {
        let (h2, h4) = (corner(base + V9_SIZE), corner(base + V9_SIZE + 1));
        [h2 + h4 - h5, h4 - h2, h5 - h4]
    } else {
        let (h3, h4) = (corner(base + 1), corner(base + V9_SIZE + 1));
        [h4 - h3, h3 + h4 - h5, h5 - h4]
    }
}

impl TerrainPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `path` holds a compatible page without loading it.
    pub fn probe(path: &Path, accepted_builds: &[u32]) -> Result<(), TerrainError> {
        let bytes = std::fs::read(path)?;
        Self::check_header(&bytes, accepted_builds).map(|_| ())
    }

    fn check_header(bytes: &[u8], accepted_builds: &[u32]) -> Result<FileHeader, TerrainError> {
        let header = FileHeader::read(bytes, 0).ok_or(TerrainError::Truncated { section: "file header" })?;
        if header.map_magic != MAP_MAGIC || header.version_magic != MAP_VERSION_MAGIC {
            return Err(TerrainError::IncompatibleVersion {
                magic: header.map_magic,
                version: header.version_magic,
            });
        }
        if !accepted_builds.is_empty() && !accepted_builds.contains(&header.build_magic) {
            return Err(TerrainError::UnacceptableBuild(header.build_magic));
        }
        Ok(header)
    }

    /// Replace this page's samples with the contents of `path`.
    ///
    /// A missing file is not an error: the page simply holds no data.
    pub fn load_data(&mut self, path: &Path, accepted_builds: &[u32]) -> Result<(), TerrainError> {
        self.unload_data();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.load_bytes(&bytes, accepted_builds)
    }

    /// Parse an in-memory page file. On error the page is left unloaded.
    pub fn load_bytes(&mut self, bytes: &[u8], accepted_builds: &[u32]) -> Result<(), TerrainError> {
        self.unload_data();
        let header = Self::check_header(bytes, accepted_builds)?;
        let result = self.load_sections(bytes, &header);
        match result {
            Ok(()) => self.loaded_from_file = true,
            Err(_) => self.unload_data(),
        }
        result
    }

    fn load_sections(&mut self, bytes: &[u8], header: &FileHeader) -> Result<(), TerrainError> {
        if header.area_map_offset != 0 {
            self.load_area(bytes, header.area_map_offset as usize)?;
        }
        if header.height_map_offset != 0 {
            self.load_height(bytes, header.height_map_offset as usize)?;
        }
        if header.liquid_map_offset != 0 {
            self.load_liquid(bytes, header.liquid_map_offset as usize)?;
        }
        Ok(())
    }

    fn load_area(&mut self, bytes: &[u8], offset: usize) -> Result<(), TerrainError> {
        let header = AreaHeader::read(bytes, offset).ok_or(TerrainError::Truncated { section: "area" })?;
        if header.fourcc != MAP_AREA_MAGIC {
            return Err(TerrainError::BadSectionMagic { section: "area" });
        }
        self.grid_area = header.grid_area;
        if header.flags & MAP_AREA_NO_AREA == 0 {
            let data = offset + std::mem::size_of::<AreaHeader>();
            self.area_map = Some(read_u16s(bytes, data, SUBCELLS * SUBCELLS, "area")?);
        }
        Ok(())
    }

    fn load_height(&mut self, bytes: &[u8], offset: usize) -> Result<(), TerrainError> {
        let header = HeightHeader::read(bytes, offset).ok_or(TerrainError::Truncated { section: "height" })?;
        if header.fourcc != MAP_HEIGHT_MAGIC {
            return Err(TerrainError::BadSectionMagic { section: "height" });
        }
        self.grid_height = header.grid_height;
        if header.flags & MAP_HEIGHT_NO_HEIGHT != 0 {
            self.heights = HeightSamples::Flat;
            return Ok(());
        }

        let v9_count = V9_SIZE * V9_SIZE;
        let v8_count = V8_SIZE * V8_SIZE;
        let data = offset + std::mem::size_of::<HeightHeader>();
        let span = header.grid_max_height - header.grid_height;
        self.heights = if header.flags & MAP_HEIGHT_AS_INT16 != 0 {
            HeightSamples::Int16 {
                v9: read_u16s(bytes, data, v9_count, "height")?,
                v8: read_u16s(bytes, data + v9_count * 2, v8_count, "height")?,
                multiplier: span / 65535.0,
            }
        } else if header.flags & MAP_HEIGHT_AS_INT8 != 0 {
            HeightSamples::Int8 {
                v9: read_u8s(bytes, data, v9_count, "height")?,
                v8: read_u8s(bytes, data + v9_count, v8_count, "height")?,
                multiplier: span / 255.0,
            }
        } else {
            HeightSamples::Float {
                v9: read_f32s(bytes, data, v9_count, "height")?,
                v8: read_f32s(bytes, data + v9_count * 4, v8_count, "height")?,
            }
        };
        Ok(())
    }

    fn load_liquid(&mut self, bytes: &[u8], offset: usize) -> Result<(), TerrainError> {
        let header = LiquidHeader::read(bytes, offset).ok_or(TerrainError::Truncated { section: "liquid" })?;
        if header.fourcc != MAP_LIQUID_MAGIC {
            return Err(TerrainError::BadSectionMagic { section: "liquid" });
        }
        let mut layer = LiquidLayer {
            liquid_type: header.liquid_type,
            offset_x: header.offset_x,
            offset_y: header.offset_y,
            width: header.width,
            height: header.height,
            level: header.liquid_level,
            types: None,
            levels: None,
        };
        let mut cursor = offset + std::mem::size_of::<LiquidHeader>();
        if header.flags & MAP_LIQUID_NO_TYPE == 0 {
            layer.types = Some(read_u8s(bytes, cursor, SUBCELLS * SUBCELLS, "liquid")?);
            cursor += SUBCELLS * SUBCELLS;
        }
        if header.flags & MAP_LIQUID_NO_HEIGHT == 0 {
            let count = header.width as usize * header.height as usize;
            layer.levels = Some(read_f32s(bytes, cursor, count, "liquid")?);
        }
        self.liquid = layer;
        Ok(())
    }

    /// Drop all samples, returning the page to its defaults.
    pub fn unload_data(&mut self) {
        *self = Self::default();
    }

    /// Whether the last load read an actual file.
    pub fn has_data(&self) -> bool {
        self.loaded_from_file
    }

    pub fn area(&self, x: f32, y: f32) -> u16 {
        match &self.area_map {
            Some(map) => {
                let (lx, ly) = sub_lattice(x, y);
                map[lx * SUBCELLS + ly]
            }
            None => self.grid_area,
        }
    }

    /// Terrain height at `(x, y)`, interpolated from the triangle under the point.
    pub fn height(&self, x: f32, y: f32) -> f32 {
        let (sx, sy) = lattice(x, y);
        let (x_int, y_int) = (sx as i32, sy as i32);
        let fx = sx - x_int as f32;
        let fy = sy - y_int as f32;
        let xi = (x_int & RES_MASK) as usize;
        let yi = (y_int & RES_MASK) as usize;

        match &self.heights {
            HeightSamples::Flat => self.grid_height,
            HeightSamples::Float { v9, v8 } => {
                let [a, b, c] = plane(v9, v8, xi, yi, fx, fy);
                a * fx + b * fy + c
            }
            HeightSamples::Int16 { v9, v8, multiplier } => {
                let [a, b, c] = plane(v9, v8, xi, yi, fx, fy);
                ((a as f32 * fx) + (b as f32 * fy) + c as f32) * multiplier + self.grid_height
            }
            HeightSamples::Int8 { v9, v8, multiplier } => {
                let [a, b, c] = plane(v9, v8, xi, yi, fx, fy);
                ((a as f32 * fx) + (b as f32 * fy) + c as f32) * multiplier + self.grid_height
            }
        }
    }

    /// Liquid surface level, or [`INVALID_HEIGHT`] outside the liquid rectangle.
    pub fn liquid_level(&self, x: f32, y: f32) -> f32 {
        let Some(levels) = &self.liquid.levels else {
            return self.liquid.level;
        };
        match self.liquid_index(x, y) {
            Some(idx) => levels[idx],
            None => INVALID_HEIGHT,
        }
    }

    fn liquid_index(&self, x: f32, y: f32) -> Option<usize> {
        let (sx, sy) = lattice(x, y);
        let cx = ((sx as i32) & RES_MASK) - i32::from(self.liquid.offset_y);
        let cy = ((sy as i32) & RES_MASK) - i32::from(self.liquid.offset_x);
        if cx < 0 || cx >= i32::from(self.liquid.height) {
            return None;
        }
        if cy < 0 || cy >= i32::from(self.liquid.width) {
            return None;
        }
        Some(cx as usize * self.liquid.width as usize + cy as usize)
    }

    /// Liquid type flags at `(x, y)`.
    pub fn terrain_type(&self, x: f32, y: f32) -> u8 {
        match &self.liquid.types {
            Some(types) => {
                let (lx, ly) = sub_lattice(x, y);
                types[lx * SUBCELLS + ly]
            }
            None => self.liquid.liquid_type as u8,
        }
    }

    /// Classify `z` against the liquid at `(x, y)`.
    ///
    /// `required_type` is a mask of `MAP_LIQUID_TYPE_*` flags; 0 accepts any
    /// liquid. Points below the ground by more than 2 units count as dry.
    pub fn liquid_status(&self, x: f32, y: f32, z: f32, required_type: u8) -> (LiquidStatus, Option<LiquidData>) {
        if self.liquid.types.is_none() && self.liquid.liquid_type == 0 {
            return (LiquidStatus::NoWater, None);
        }

        let (sx, sy) = lattice(x, y);
        let x_int = (sx as i32) & RES_MASK;
        let y_int = (sy as i32) & RES_MASK;

        let liquid_type = match &self.liquid.types {
            Some(types) => types[(x_int >> 3) as usize * SUBCELLS + (y_int >> 3) as usize],
            None => self.liquid.liquid_type as u8,
        };
        if liquid_type == MAP_LIQUID_TYPE_NO_WATER {
            return (LiquidStatus::NoWater, None);
        }
        if required_type != 0 && required_type & liquid_type == 0 {
            return (LiquidStatus::NoWater, None);
        }

        let Some(idx) = self.liquid_index(x, y) else {
            return (LiquidStatus::NoWater, None);
        };
        let liquid_level = match &self.liquid.levels {
            Some(levels) => levels[idx],
            None => self.liquid.level,
        };
        let ground_level = self.height(x, y);
        if liquid_level < ground_level || z < ground_level - 2.0 {
            return (LiquidStatus::NoWater, None);
        }

        let data = LiquidData {
            liquid_type,
            level: liquid_level,
            depth_level: ground_level,
        };
        let delta = ((liquid_level - z) * 10.0) as i32;
        let status = if delta > 20 {
            LiquidStatus::UnderWater
        } else if delta > 0 {
            LiquidStatus::InWater
        } else if delta > -1 {
            LiquidStatus::WaterWalk
        } else {
            LiquidStatus::AboveWater
        };
        (status, Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{HeightEncoding, LiquidSection, MapFileBuilder};

    const BUILD: u32 = 12340;

    /// World coordinate of lattice position `s` (0..128) inside the page at
    /// grid 32 (x in [0, SIZE_OF_GRIDS)).
    fn world_of(s: f32) -> f32 {
        (32.0 - s / MAP_RESOLUTION as f32) * SIZE_OF_GRIDS
    }

    fn ramp_v9() -> Vec<f32> {
        (0..V9_SIZE * V9_SIZE)
            .map(|i| ((i / V9_SIZE) as f32) * 2.0 + (i % V9_SIZE) as f32)
            .collect()
    }

    fn ramp_v8() -> Vec<f32> {
        // value of the same plane at each square's center
        (0..V8_SIZE * V8_SIZE)
            .map(|i| ((i / V8_SIZE) as f32 + 0.5) * 2.0 + (i % V8_SIZE) as f32 + 0.5)
            .collect()
    }

    fn page_from(builder: &MapFileBuilder) -> TerrainPage {
        let mut page = TerrainPage::new();
        page.load_bytes(&builder.to_bytes().unwrap(), &[]).unwrap();
        page
    }

    #[test]
    fn empty_page_answers_defaults() {
        let page = TerrainPage::new();
        assert_eq!(page.height(10.0, 10.0), INVALID_HEIGHT);
        assert_eq!(page.area(10.0, 10.0), 0);
        assert_eq!(page.liquid_level(10.0, 10.0), INVALID_HEIGHT);
        assert_eq!(page.liquid_status(10.0, 10.0, 0.0, 0).0, LiquidStatus::NoWater);
        assert!(!page.has_data());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut page = TerrainPage::new();
        page.load_data(&dir.path().join("nope.map"), &[]).unwrap();
        assert!(!page.has_data());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = MapFileBuilder::flat(BUILD, 1.0).to_bytes().unwrap();
        bytes[0] = b'X';
        let mut page = TerrainPage::new();
        let err = page.load_bytes(&bytes, &[]).unwrap_err();
        assert!(matches!(err, TerrainError::IncompatibleVersion { .. }));
        assert!(!page.has_data());
    }

    #[test]
    fn unaccepted_build_is_rejected() {
        let bytes = MapFileBuilder::flat(BUILD, 1.0).to_bytes().unwrap();
        let mut page = TerrainPage::new();
        let err = page.load_bytes(&bytes, &[9999]).unwrap_err();
        assert!(matches!(err, TerrainError::UnacceptableBuild(BUILD)));
        page.load_bytes(&bytes, &[9999, BUILD]).unwrap();
        assert!(page.has_data());
    }

    #[test]
    fn truncated_section_leaves_page_unloaded() {
        let mut bytes = MapFileBuilder::flat(BUILD, 1.0).to_bytes().unwrap();
        bytes.truncate(bytes.len() - 100);
        let mut page = TerrainPage::new();
        assert!(matches!(
            page.load_bytes(&bytes, &[]),
            Err(TerrainError::Truncated { section: "height" })
        ));
        assert_eq!(page.height(1.0, 1.0), INVALID_HEIGHT);
    }

    #[test]
    fn flat_float_page_is_flat() {
        let page = page_from(&MapFileBuilder::flat(BUILD, 42.5));
        for s in [0.1f32, 17.3, 64.9, 127.6] {
            assert_eq!(page.height(world_of(s), world_of(128.0 - s)), 42.5);
        }
    }

    #[test]
    fn no_height_flag_uses_grid_height() {
        let builder = MapFileBuilder {
            grid_height: 7.0,
            ..MapFileBuilder::new(BUILD)
        };
        let page = page_from(&builder);
        assert_eq!(page.height(100.0, 100.0), 7.0);
    }

    #[test]
    fn float_heights_follow_the_plane() {
        let builder = MapFileBuilder {
            heights: HeightEncoding::Float {
                v9: ramp_v9(),
                v8: ramp_v8(),
            },
            ..MapFileBuilder::new(BUILD)
        };
        let page = page_from(&builder);
        // every triangle lies on h = 2*sx + sy, so all four agree
        for (sx, sy) in [(10.25, 10.5), (10.75, 10.5), (10.5, 10.25), (10.5, 10.75), (3.9, 100.05)] {
            let h = page.height(world_of(sx), world_of(sy));
            assert!((h - (2.0 * sx + sy)).abs() < 0.05, "({sx}, {sy}) -> {h}");
        }
    }

    #[test]
    fn triangle_selection_matches_corner_layout() {
        // Only h2 (x+1, y) is raised; triangles touching h2 see it.
        let mut v9 = vec![0.0f32; V9_SIZE * V9_SIZE];
        v9[(10 + 1) * V9_SIZE + 10] = 8.0;
        let builder = MapFileBuilder {
            heights: HeightEncoding::Float {
                v9,
                v8: vec![0.0; V8_SIZE * V8_SIZE],
            },
            ..MapFileBuilder::new(BUILD)
        };
        let page = page_from(&builder);
        // fx > fy, fx + fy < 1 -> triangle 1 (h1, h2, h5): a = 8, b = -8
        let h = page.height(world_of(10.5), world_of(10.25));
        assert!((h - (8.0 * 0.5 - 8.0 * 0.25)).abs() < 0.01, "{h}");
        // fx < fy, fx + fy < 1 -> triangle 2 (h1, h3, h5): h2 unused
        assert_eq!(page.height(world_of(10.1), world_of(10.4)), 0.0);
        // fx < fy, fx + fy >= 1 -> triangle 4 (h3, h4, h5): h2 unused
        assert_eq!(page.height(world_of(10.45), world_of(10.9)), 0.0);
    }

    #[test]
    fn int16_heights_scale_into_range() {
        let builder = MapFileBuilder {
            grid_height: 100.0,
            heights: HeightEncoding::Int16 {
                v9: vec![32767; V9_SIZE * V9_SIZE],
                v8: vec![32767; V8_SIZE * V8_SIZE],
                max_height: 200.0,
            },
            ..MapFileBuilder::new(BUILD)
        };
        let page = page_from(&builder);
        let h = page.height(world_of(40.3), world_of(40.1));
        let expected = 100.0 + 32767.0 * (100.0 / 65535.0);
        assert!((h - expected).abs() < 0.01, "{h}");
    }

    #[test]
    fn int8_heights_scale_into_range() {
        let builder = MapFileBuilder {
            grid_height: -10.0,
            heights: HeightEncoding::Int8 {
                v9: vec![0; V9_SIZE * V9_SIZE],
                v8: vec![0; V8_SIZE * V8_SIZE],
                max_height: 245.0,
            },
            ..MapFileBuilder::new(BUILD)
        };
        let page = page_from(&builder);
        assert_eq!(page.height(world_of(1.5), world_of(2.5)), -10.0);
    }

    #[test]
    fn area_map_lookup() {
        let mut areas = vec![1u16; SUBCELLS * SUBCELLS];
        areas[2 * SUBCELLS + 3] = 77;
        let builder = MapFileBuilder {
            grid_area: 5,
            area_map: Some(areas),
            ..MapFileBuilder::flat(BUILD, 0.0)
        };
        let page = page_from(&builder);
        // lattice position 2.5 / 3.5 on the 16-wide area grid is 20 / 28 on the 128 lattice
        assert_eq!(page.area(world_of(20.0), world_of(28.0)), 77);
        assert_eq!(page.area(world_of(100.0), world_of(28.0)), 1);

        let plain = page_from(&MapFileBuilder {
            grid_area: 5,
            ..MapFileBuilder::flat(BUILD, 0.0)
        });
        assert_eq!(plain.area(world_of(20.0), world_of(28.0)), 5);
    }

    fn lake(level: f32) -> MapFileBuilder {
        MapFileBuilder {
            liquid: Some(LiquidSection {
                liquid_type: u16::from(MAP_LIQUID_TYPE_WATER),
                offset_x: 0,
                offset_y: 0,
                width: 128,
                height: 128,
                level,
                types: None,
                levels: None,
            }),
            ..MapFileBuilder::flat(BUILD, 0.0)
        }
    }

    #[test]
    fn liquid_status_bands() {
        let page = page_from(&lake(10.0));
        let (x, y) = (world_of(50.5), world_of(50.5));
        assert_eq!(page.liquid_status(x, y, 5.0, 0).0, LiquidStatus::UnderWater);
        assert_eq!(page.liquid_status(x, y, 9.5, 0).0, LiquidStatus::InWater);
        assert_eq!(page.liquid_status(x, y, 10.0, 0).0, LiquidStatus::WaterWalk);
        assert_eq!(page.liquid_status(x, y, 12.0, 0).0, LiquidStatus::AboveWater);
        assert_eq!(page.liquid_status(x, y, -5.0, 0).0, LiquidStatus::NoWater);

        let (status, data) = page.liquid_status(x, y, 9.5, 0);
        assert!(status.is_in_water());
        let data = data.unwrap();
        assert_eq!(data.level, 10.0);
        assert_eq!(data.depth_level, 0.0);
    }

    #[test]
    fn liquid_type_mask_filters() {
        let page = page_from(&lake(10.0));
        let (x, y) = (world_of(50.5), world_of(50.5));
        assert_eq!(page.liquid_status(x, y, 5.0, MAP_LIQUID_TYPE_MAGMA).0, LiquidStatus::NoWater);
        assert_eq!(
            page.liquid_status(x, y, 5.0, MAP_ALL_LIQUIDS).0,
            LiquidStatus::UnderWater
        );
    }

    #[test]
    fn liquid_below_ground_is_dry() {
        let page = page_from(&MapFileBuilder {
            liquid: lake(-5.0).liquid,
            ..MapFileBuilder::flat(BUILD, 0.0)
        });
        assert_eq!(page.liquid_status(world_of(3.5), world_of(3.5), 0.0, 0).0, LiquidStatus::NoWater);
    }

    #[test]
    fn liquid_level_map_respects_offsets() {
        let builder = MapFileBuilder {
            liquid: Some(LiquidSection {
                liquid_type: u16::from(MAP_LIQUID_TYPE_OCEAN),
                offset_x: 4,
                offset_y: 8,
                width: 2,
                height: 3,
                level: 0.0,
                types: None,
                levels: Some(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            }),
            ..MapFileBuilder::flat(BUILD, 0.0)
        };
        let page = page_from(&builder);
        // row = x lattice - offset_y, column = y lattice - offset_x
        assert_eq!(page.liquid_level(world_of(9.5), world_of(5.5)), 4.0);
        assert_eq!(page.liquid_level(world_of(7.5), world_of(5.5)), INVALID_HEIGHT);
        assert_eq!(page.liquid_level(world_of(9.5), world_of(6.5)), INVALID_HEIGHT);
        assert_eq!(page.terrain_type(world_of(9.5), world_of(5.5)), MAP_LIQUID_TYPE_OCEAN);
    }

    #[test]
    fn load_unload_load_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0003232.map");
        let builder = MapFileBuilder {
            heights: HeightEncoding::Float {
                v9: ramp_v9(),
                v8: ramp_v8(),
            },
            ..lake(30.0)
        };
        builder.write_to(&path).unwrap();

        let probes = [(12.3f32, 45.6f32), (100.1, 3.3), (64.0, 64.0)];
        let mut page = TerrainPage::new();
        page.load_data(&path, &[]).unwrap();
        let first: Vec<_> = probes
            .iter()
            .map(|(sx, sy)| {
                let (x, y) = (world_of(*sx), world_of(*sy));
                (page.height(x, y), page.liquid_level(x, y), page.area(x, y))
            })
            .collect();

        page.unload_data();
        assert_eq!(page.height(world_of(12.3), world_of(45.6)), INVALID_HEIGHT);

        page.load_data(&path, &[]).unwrap();
        let second: Vec<_> = probes
            .iter()
            .map(|(sx, sy)| {
                let (x, y) = (world_of(*sx), world_of(*sy));
                (page.height(x, y), page.liquid_level(x, y), page.area(x, y))
            })
            .collect();
        assert_eq!(first, second);
    }
}

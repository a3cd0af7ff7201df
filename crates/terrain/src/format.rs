//! On-disk layout of a terrain page (`.map`) file.
//!
//! All values are little-endian. The file starts with [`FileHeader`]; each
//! optional section (area, height, liquid) is located by an absolute offset
//! and starts with its own fourcc-tagged header.

use std::io::{self, Write};

use bytemuck::{Pod, Zeroable};
use byteorder::{LittleEndian, WriteBytesExt};

pub const MAP_MAGIC: u32 = u32::from_le_bytes(*b"MAPS");
pub const MAP_VERSION_MAGIC: u32 = u32::from_le_bytes(*b"v1.1");
pub const MAP_AREA_MAGIC: u32 = u32::from_le_bytes(*b"AREA");
pub const MAP_HEIGHT_MAGIC: u32 = u32::from_le_bytes(*b"MHGT");
pub const MAP_LIQUID_MAGIC: u32 = u32::from_le_bytes(*b"MLIQ");

pub const MAP_AREA_NO_AREA: u16 = 0x0001;

pub const MAP_HEIGHT_NO_HEIGHT: u32 = 0x0001;
pub const MAP_HEIGHT_AS_INT16: u32 = 0x0002;
pub const MAP_HEIGHT_AS_INT8: u32 = 0x0004;

pub const MAP_LIQUID_NO_TYPE: u16 = 0x0001;
pub const MAP_LIQUID_NO_HEIGHT: u16 = 0x0002;

/// Samples per side of the fine (corner) height grid.
pub const V9_SIZE: usize = 129;
/// Samples per side of the coarse (center) height grid.
pub const V8_SIZE: usize = 128;
/// Area and liquid-type maps are 16×16 per page.
pub const SUBCELLS: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FileHeader {
    pub map_magic: u32,
    pub version_magic: u32,
    pub build_magic: u32,
    pub area_map_offset: u32,
    pub area_map_size: u32,
    pub height_map_offset: u32,
    pub height_map_size: u32,
    pub liquid_map_offset: u32,
    pub liquid_map_size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct AreaHeader {
    pub fourcc: u32,
    pub flags: u16,
    pub grid_area: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct HeightHeader {
    pub fourcc: u32,
    pub flags: u32,
    pub grid_height: f32,
    pub grid_max_height: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LiquidHeader {
    pub fourcc: u32,
    pub flags: u16,
    pub liquid_type: u16,
    pub offset_x: u8,
    pub offset_y: u8,
    pub width: u8,
    pub height: u8,
    pub liquid_level: f32,
}

fn le_f32(v: f32) -> f32 {
    f32::from_bits(u32::from_le(v.to_bits()))
}

/// Header types that can be read straight out of a little-endian byte slice.
pub trait LeHeader: Pod {
    /// Convert every field from little-endian to host order.
    fn from_le(self) -> Self;

    fn read(bytes: &[u8], offset: usize) -> Option<Self> {
        let end = offset.checked_add(std::mem::size_of::<Self>())?;
        let raw = bytes.get(offset..end)?;
        Some(bytemuck::pod_read_unaligned::<Self>(raw).from_le())
    }
}

impl LeHeader for FileHeader {
    fn from_le(self) -> Self {
        Self {
            map_magic: u32::from_le(self.map_magic),
            version_magic: u32::from_le(self.version_magic),
            build_magic: u32::from_le(self.build_magic),
            area_map_offset: u32::from_le(self.area_map_offset),
            area_map_size: u32::from_le(self.area_map_size),
            height_map_offset: u32::from_le(self.height_map_offset),
            height_map_size: u32::from_le(self.height_map_size),
            liquid_map_offset: u32::from_le(self.liquid_map_offset),
            liquid_map_size: u32::from_le(self.liquid_map_size),
        }
    }
}

impl LeHeader for AreaHeader {
    fn from_le(self) -> Self {
        Self {
            fourcc: u32::from_le(self.fourcc),
            flags: u16::from_le(self.flags),
            grid_area: u16::from_le(self.grid_area),
        }
    }
}

impl LeHeader for HeightHeader {
    fn from_le(self) -> Self {
        Self {
            fourcc: u32::from_le(self.fourcc),
            flags: u32::from_le(self.flags),
            grid_height: le_f32(self.grid_height),
            grid_max_height: le_f32(self.grid_max_height),
        }
    }
}

impl LeHeader for LiquidHeader {
    fn from_le(self) -> Self {
        Self {
            fourcc: u32::from_le(self.fourcc),
            flags: u16::from_le(self.flags),
            liquid_type: u16::from_le(self.liquid_type),
            liquid_level: le_f32(self.liquid_level),
            ..self
        }
    }
}

/// Height samples to encode into a page file.
#[derive(Debug, Clone)]
pub enum HeightEncoding {
    None,
    Float { v9: Vec<f32>, v8: Vec<f32> },
    Int16 { v9: Vec<u16>, v8: Vec<u16>, max_height: f32 },
    Int8 { v9: Vec<u8>, v8: Vec<u8>, max_height: f32 },
}

/// Liquid section contents to encode into a page file.
#[derive(Debug, Clone, Default)]
pub struct LiquidSection {
    pub liquid_type: u16,
    pub offset_x: u8,
    pub offset_y: u8,
    pub width: u8,
    pub height: u8,
    pub level: f32,
    pub types: Option<Vec<u8>>,
    pub levels: Option<Vec<f32>>,
}

/// Writes `.map` files. Used by tooling and fixtures; the server only reads.
#[derive(Debug, Clone)]
pub struct MapFileBuilder {
    pub build: u32,
    pub grid_area: u16,
    pub area_map: Option<Vec<u16>>,
    pub include_area: bool,
    pub grid_height: f32,
    pub heights: HeightEncoding,
    pub include_height: bool,
    pub liquid: Option<LiquidSection>,
}

impl MapFileBuilder {
    pub fn new(build: u32) -> Self {
        Self {
            build,
            grid_area: 0,
            area_map: None,
            include_area: true,
            grid_height: 0.0,
            heights: HeightEncoding::None,
            include_height: true,
            liquid: None,
        }
    }

    /// A page whose every sample sits at `height`, stored as floats.
    pub fn flat(build: u32, height: f32) -> Self {
        Self {
            grid_height: height,
            heights: HeightEncoding::Float {
                v9: vec![height; V9_SIZE * V9_SIZE],
                v8: vec![height; V8_SIZE * V8_SIZE],
            },
            ..Self::new(build)
        }
    }

    fn area_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(MAP_AREA_MAGIC)?;
        let flags = if self.area_map.is_some() { 0 } else { MAP_AREA_NO_AREA };
        out.write_u16::<LittleEndian>(flags)?;
        out.write_u16::<LittleEndian>(self.grid_area)?;
        if let Some(map) = &self.area_map {
            for v in map {
                out.write_u16::<LittleEndian>(*v)?;
            }
        }
        Ok(out)
    }

    fn height_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(MAP_HEIGHT_MAGIC)?;
        let (flags, max_height) = match &self.heights {
            HeightEncoding::None => (MAP_HEIGHT_NO_HEIGHT, self.grid_height),
            HeightEncoding::Float { .. } => (0, self.grid_height),
            HeightEncoding::Int16 { max_height, .. } => (MAP_HEIGHT_AS_INT16, *max_height),
            HeightEncoding::Int8 { max_height, .. } => (MAP_HEIGHT_AS_INT8, *max_height),
        };
        out.write_u32::<LittleEndian>(flags)?;
        out.write_f32::<LittleEndian>(self.grid_height)?;
        out.write_f32::<LittleEndian>(max_height)?;
        match &self.heights {
            HeightEncoding::None => {}
            HeightEncoding::Float { v9, v8 } => {
                for v in v9.iter().chain(v8) {
                    out.write_f32::<LittleEndian>(*v)?;
                }
            }
            HeightEncoding::Int16 { v9, v8, .. } => {
                for v in v9.iter().chain(v8) {
                    out.write_u16::<LittleEndian>(*v)?;
                }
            }
            HeightEncoding::Int8 { v9, v8, .. } => {
                out.write_all(v9)?;
                out.write_all(v8)?;
            }
        }
        Ok(out)
    }

    fn liquid_bytes(liquid: &LiquidSection) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(MAP_LIQUID_MAGIC)?;
        let mut flags = 0;
        if liquid.types.is_none() {
            flags |= MAP_LIQUID_NO_TYPE;
        }
        if liquid.levels.is_none() {
            flags |= MAP_LIQUID_NO_HEIGHT;
        }
        out.write_u16::<LittleEndian>(flags)?;
        out.write_u16::<LittleEndian>(liquid.liquid_type)?;
        out.write_u8(liquid.offset_x)?;
        out.write_u8(liquid.offset_y)?;
        out.write_u8(liquid.width)?;
        out.write_u8(liquid.height)?;
        out.write_f32::<LittleEndian>(liquid.level)?;
        if let Some(types) = &liquid.types {
            out.write_all(types)?;
        }
        if let Some(levels) = &liquid.levels {
            for v in levels {
                out.write_f32::<LittleEndian>(*v)?;
            }
        }
        Ok(out)
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let header_len = std::mem::size_of::<FileHeader>();
        let area = if self.include_area { self.area_bytes()? } else { Vec::new() };
        let height = if self.include_height { self.height_bytes()? } else { Vec::new() };
        let liquid = match &self.liquid {
            Some(l) => Self::liquid_bytes(l)?,
            None => Vec::new(),
        };

        let offset_of = |start: usize, section: &[u8]| if section.is_empty() { 0 } else { start as u32 };
        let area_offset = header_len;
        let height_offset = area_offset + area.len();
        let liquid_offset = height_offset + height.len();

        let mut out = Vec::with_capacity(liquid_offset + liquid.len());
        out.write_u32::<LittleEndian>(MAP_MAGIC)?;
        out.write_u32::<LittleEndian>(MAP_VERSION_MAGIC)?;
        out.write_u32::<LittleEndian>(self.build)?;
        out.write_u32::<LittleEndian>(offset_of(area_offset, &area))?;
        out.write_u32::<LittleEndian>(area.len() as u32)?;
        out.write_u32::<LittleEndian>(offset_of(height_offset, &height))?;
        out.write_u32::<LittleEndian>(height.len() as u32)?;
        out.write_u32::<LittleEndian>(offset_of(liquid_offset, &liquid))?;
        out.write_u32::<LittleEndian>(liquid.len() as u32)?;
        out.extend_from_slice(&area);
        out.extend_from_slice(&height);
        out.extend_from_slice(&liquid);
        Ok(out)
    }

    pub fn write_to(&self, path: impl AsRef<std::path::Path>) -> io::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_match_file_layout() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 36);
        assert_eq!(std::mem::size_of::<AreaHeader>(), 8);
        assert_eq!(std::mem::size_of::<HeightHeader>(), 16);
        assert_eq!(std::mem::size_of::<LiquidHeader>(), 16);
    }

    #[test]
    fn builder_header_points_at_sections() {
        let bytes = MapFileBuilder::flat(12340, 5.0).to_bytes().unwrap();
        let header = FileHeader::read(&bytes, 0).unwrap();
        assert_eq!(header.map_magic, MAP_MAGIC);
        assert_eq!(header.version_magic, MAP_VERSION_MAGIC);
        assert_eq!(header.build_magic, 12340);
        assert_eq!(header.area_map_offset, 36);
        assert_eq!(header.liquid_map_offset, 0);

        let height = HeightHeader::read(&bytes, header.height_map_offset as usize).unwrap();
        assert_eq!(height.fourcc, MAP_HEIGHT_MAGIC);
        assert_eq!(height.grid_height, 5.0);
    }

    #[test]
    fn reading_past_the_end_is_none() {
        let bytes = [0u8; 10];
        assert!(FileHeader::read(&bytes, 0).is_none());
        assert!(AreaHeader::read(&bytes, 4).is_none());
        assert!(AreaHeader::read(&bytes, usize::MAX).is_none());
    }
}

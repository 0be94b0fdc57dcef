//! Raster map data for the terrain and foliage fading layers.
//!
//! A map is a PNG image covering one or more Web-Mercator tiles. The
//! terrain image uses terrain-RGB encoding; the foliage image marks
//! vegetation with dark opaque pixels. Layers query the maps through the
//! `TerrainProvider`/`FoliageProvider` traits so tests can supply synthetic
//! profiles.

use anyhow::Context;
use image::{Rgba, RgbaImage};

use super::geometry::{pixel_line, web_mercator_pixel};
use crate::common::config::MapConfig;
use crate::common::types::Location;

/// Source of terrain heights between two points.
pub trait TerrainProvider: Send {
    /// Terrain heights in metres, evenly spaced from `a` to `b`. Empty when
    /// the path lies outside the loaded data.
    fn altitude_profile(&self, a: &Location, b: &Location) -> Vec<f64>;
}

/// Source of foliage coverage between two points.
pub trait FoliageProvider: Send {
    /// One flag per sample from `a` to `b`, true where vegetation blocks the path.
    fn foliage_profile(&self, a: &Location, b: &Location) -> Vec<bool>;
}

/// A georeferenced raster whose top-left corner is tile `(x, y)` at `level`.
pub struct MapTile {
    x: u32,
    y: u32,
    level: u32,
    tile_size: u32,
    image: RgbaImage,
}

impl MapTile {
    pub fn from_image(image: RgbaImage, x: u32, y: u32, level: u32, tile_size: u32) -> Self {
        MapTile {
            x,
            y,
            level,
            tile_size,
            image,
        }
    }

    /// Load a PNG from `path` using the tile placement of `config`.
    pub fn load(path: &str, config: &MapConfig) -> anyhow::Result<Self> {
        let image = image::open(path).with_context(|| format!("Failed to load map tile: {}", path))?.to_rgba8();
        log::info!("Loaded map tile {} ({}x{} px)", path, image.width(), image.height());
        Ok(Self::from_image(image, config.x, config.y, config.level, config.tile_size))
    }

    /// Pixel position of `location` relative to the image's top-left corner.
    pub fn location_to_pixel(&self, location: &Location) -> (f64, f64) {
        let (gx, gy) = web_mercator_pixel(location, self.level, self.tile_size);
        (gx - (self.x * self.tile_size) as f64, gy - (self.y * self.tile_size) as f64)
    }

    fn contains(&self, (px, py): (f64, f64)) -> bool {
        let (width, height) = self.image.dimensions();
        px >= 0.0 && py >= 0.0 && px < width as f64 && py < height as f64
    }

    /// Pixels along the straight line from `a` to `b`.
    ///
    /// Empty unless both endpoints lie on the image, so a profile always
    /// spans the whole path and has at most one sample per pixel of the
    /// image's longer side.
    pub fn sample_line(&self, a: &Location, b: &Location) -> Vec<Rgba<u8>> {
        let (start, end) = (self.location_to_pixel(a), self.location_to_pixel(b));
        if !self.contains(start) || !self.contains(end) {
            return Vec::new();
        }
        pixel_line(start, end)
            .into_iter()
            .filter_map(|(px, py)| self.image.get_pixel_checked(px.floor() as u32, py.floor() as u32).copied())
            .collect()
    }
}

/// Decode a terrain-RGB pixel into metres.
pub fn decode_terrain_rgb(pixel: &Rgba<u8>) -> f64 {
    let [r, g, b, _] = pixel.0;
    -10_000.0 + (r as f64 * 65_536.0 + g as f64 * 256.0 + b as f64) * 0.1
}

/// Whether a foliage-mask pixel marks vegetation.
pub fn is_foliage(pixel: &Rgba<u8>) -> bool {
    let [r, g, b, a] = pixel.0;
    a > 0 && r.max(g).max(b) < 128
}

/// Terrain heights backed by a terrain-RGB map.
pub struct TerrainMap {
    tile: MapTile,
}

impl TerrainMap {
    pub fn new(tile: MapTile) -> Self {
        TerrainMap { tile }
    }
}

impl TerrainProvider for TerrainMap {
    fn altitude_profile(&self, a: &Location, b: &Location) -> Vec<f64> {
        self.tile.sample_line(a, b).iter().map(decode_terrain_rgb).collect()
    }
}

/// Foliage coverage backed by a mask image.
pub struct FoliageMap {
    tile: MapTile,
}

impl FoliageMap {
    pub fn new(tile: MapTile) -> Self {
        FoliageMap { tile }
    }
}

impl FoliageProvider for FoliageMap {
    fn foliage_profile(&self, a: &Location, b: &Location) -> Vec<bool> {
        self.tile.sample_line(a, b).iter().map(is_foliage).collect()
    }
}

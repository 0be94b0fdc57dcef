//! Fading layers and the layer manager.
//!
//! Each layer models one independent propagation effect and returns its
//! attenuation in dB for a pair of locations on a band. The manager sums the
//! bound layers into a total. Deterministic layers are cached per band and
//! node pair; the random layer is evaluated on every call.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use super::cache::{CacheKey, FadingCache};
use super::geometry::{great_circle_distance, line_of_sight_distance};
use super::map_tiles::{FoliageProvider, TerrainProvider};
use super::signal_calculations::{
    bullington_figure_12, free_space_attenuation_db, fresnel_kirchhoff_parameter, knife_edge_loss_db, smooth_n, wavelength,
    weissberger_foliage_loss_db,
};
use crate::common::config::Band;
use crate::common::types::{AttenuationMap, Location};

/// Antenna height above the terrain when a node has no altitude set (m).
pub const TERRAIN_CLEARANCE: f64 = 1.0;

/// Errors raised while evaluating fading.
#[derive(Debug, Clone, PartialEq)]
pub enum FadingError {
    /// The terrain profile between the endpoints is empty.
    NoTerrain,
    /// The foliage profile between the endpoints is empty.
    NoFoliage,
    /// A layer with the same name is already bound.
    DuplicateLayer(&'static str),
    /// Model parameters could not be evaluated.
    Model(String),
}

impl std::fmt::Display for FadingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FadingError::NoTerrain => write!(f, "no terrain between the endpoints"),
            FadingError::NoFoliage => write!(f, "no foliage data between the endpoints"),
            FadingError::DuplicateLayer(name) => write!(f, "layer '{}' is already bound", name),
            FadingError::Model(msg) => write!(f, "fading model error: {}", msg),
        }
    }
}

impl std::error::Error for FadingError {}

/// One independent contribution to link attenuation.
pub trait FadingLayer: Send {
    /// Name used in attenuation breakdowns.
    fn name(&self) -> &'static str;

    /// Whether results only depend on the inputs and may be cached.
    fn is_cacheable(&self) -> bool {
        true
    }

    /// Attenuation in dB between `a` and `b` on `band`.
    fn calculate_fading(&mut self, band: &Band, a: &Location, b: &Location) -> Result<f64, FadingError>;
}

/// Free-space path loss over the line-of-sight distance.
pub struct FreeSpaceLayer;

impl FadingLayer for FreeSpaceLayer {
    fn name(&self) -> &'static str {
        "free-space"
    }

    fn calculate_fading(&mut self, band: &Band, a: &Location, b: &Location) -> Result<f64, FadingError> {
        Ok(free_space_attenuation_db(band.frequency.0, line_of_sight_distance(a, b)))
    }
}

/// Diffraction loss over terrain using Bullington's equivalent knife edge.
pub struct TerrainLayer {
    provider: Box<dyn TerrainProvider>,
}

impl TerrainLayer {
    pub fn new(provider: Box<dyn TerrainProvider>) -> Self {
        TerrainLayer { provider }
    }
}

impl FadingLayer for TerrainLayer {
    fn name(&self) -> &'static str {
        "terrain"
    }

    fn calculate_fading(&mut self, band: &Band, a: &Location, b: &Location) -> Result<f64, FadingError> {
        let profile = self.provider.altitude_profile(a, b);
        let (Some(&first), Some(&last)) = (profile.first(), profile.last()) else {
            return Err(FadingError::NoTerrain);
        };
        let smoothed = smooth_n(&profile, 1);

        let h1 = a.alt.unwrap_or(first + TERRAIN_CLEARANCE);
        let h2 = b.alt.unwrap_or(last + TERRAIN_CLEARANCE);
        let distance = great_circle_distance(a, b);

        match bullington_figure_12(&smoothed, h1, h2, distance) {
            Some((d1, d2, h)) => {
                let v = fresnel_kirchhoff_parameter(h, d1, d2, wavelength(band.frequency.0));
                Ok(knife_edge_loss_db(v))
            }
            None => Ok(0.0),
        }
    }
}

/// Vegetation loss from the occluded share of the path.
pub struct FoliageLayer {
    provider: Box<dyn FoliageProvider>,
}

impl FoliageLayer {
    pub fn new(provider: Box<dyn FoliageProvider>) -> Self {
        FoliageLayer { provider }
    }
}

impl FadingLayer for FoliageLayer {
    fn name(&self) -> &'static str {
        "foliage"
    }

    fn calculate_fading(&mut self, band: &Band, a: &Location, b: &Location) -> Result<f64, FadingError> {
        let profile = self.provider.foliage_profile(a, b);
        if profile.is_empty() {
            return Err(FadingError::NoFoliage);
        }
        let occluded = profile.iter().filter(|blocked| **blocked).count();
        let depth = line_of_sight_distance(a, b) * occluded as f64 / profile.len() as f64;
        Ok(weissberger_foliage_loss_db(band.frequency.0, depth))
    }
}

/// Zero-mean Gaussian fading with the band's standard deviation.
pub struct RandomLayer {
    rng: StdRng,
}

impl RandomLayer {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        RandomLayer { rng }
    }
}

impl FadingLayer for RandomLayer {
    fn name(&self) -> &'static str {
        "random"
    }

    fn is_cacheable(&self) -> bool {
        false
    }

    fn calculate_fading(&mut self, band: &Band, _a: &Location, _b: &Location) -> Result<f64, FadingError> {
        let sigma = band.fading.0;
        if sigma <= 0.0 {
            return Ok(0.0);
        }
        let normal = Normal::new(0.0, sigma).map_err(|e| FadingError::Model(e.to_string()))?;
        Ok(normal.sample(&mut self.rng))
    }
}

/// Total attenuation of a link and its per-layer breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct TotalFading {
    pub total: f64,
    pub breakdown: AttenuationMap,
}

/// A node endpoint as seen by the layer manager.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint<'a> {
    pub address: &'a str,
    pub location: &'a Location,
}

/// Sums the bound layers and caches the deterministic part.
pub struct LayerManager {
    layers: Vec<Box<dyn FadingLayer>>,
    cache: FadingCache,
}

impl Default for LayerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerManager {
    pub fn new() -> Self {
        LayerManager {
            layers: Vec::new(),
            cache: FadingCache::new(),
        }
    }

    /// Add a layer. Layer names must be unique.
    pub fn bind_layer(&mut self, layer: Box<dyn FadingLayer>) -> Result<(), FadingError> {
        if self.layers.iter().any(|l| l.name() == layer.name()) {
            return Err(FadingError::DuplicateLayer(layer.name()));
        }
        log::debug!("Bound fading layer {}", layer.name());
        self.layers.push(layer);
        Ok(())
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    /// Total fading between two endpoints on a band.
    ///
    /// Endpoints are ordered by address before evaluation so the result does
    /// not depend on direction. Any layer error makes the link unknown and is
    /// returned without touching the cache.
    pub fn total_fading(&mut self, band_name: &str, band: &Band, a: Endpoint, b: Endpoint) -> Result<TotalFading, FadingError> {
        let (a, b) = if a.address <= b.address { (a, b) } else { (b, a) };
        let key = CacheKey::new(band_name, a.address, b.address);

        let mut fading = match self.cache.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let mut deterministic = TotalFading {
                    total: 0.0,
                    breakdown: AttenuationMap::new(),
                };
                for layer in self.layers.iter_mut().filter(|l| l.is_cacheable()) {
                    let value = layer.calculate_fading(band, a.location, b.location)?;
                    deterministic.total += value;
                    deterministic.breakdown.insert(layer.name().to_string(), value);
                }
                self.cache.insert(key, deterministic.clone());
                deterministic
            }
        };

        for layer in self.layers.iter_mut().filter(|l| !l.is_cacheable()) {
            let value = layer.calculate_fading(band, a.location, b.location)?;
            fading.total += value;
            fading.breakdown.insert(layer.name().to_string(), value);
        }

        Ok(fading)
    }

    /// Forget cached results involving `address`, e.g. after it moved.
    pub fn invalidate(&mut self, address: &str) -> usize {
        self.cache.invalidate(address)
    }

    pub fn cache(&self) -> &FadingCache {
        &self.cache
    }
}

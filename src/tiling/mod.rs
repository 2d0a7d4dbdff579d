//! Convolution tiling optimizer.
//!
//! Pipeline:
//! ```text
//!   TilingRequest ─► ConvProblem::new      (validate, group mode, cube constants)
//!                 ─► CoreSplitSearch       (mode pre-check, factor ranges, cost search)
//!                 ─► SingleCoreShape       (per-core slice)
//!                 ─► MemoryTilingPlanner   (L0/L1/UB tiles, full-load, double buffer)
//!                 ─► TilingRecord          (split + plan + key + workspace)
//! ```
//!
//! Each run is a pure function of its request and platform. `TilingEngine`
//! adds a memo cache and tiles independent requests in parallel.

pub mod cache;
pub mod cost;
pub mod factors;
pub mod math;
pub mod memory;
pub mod numblocks;
pub mod params;
pub mod record;

pub use cache::TilingCache;
pub use cost::{CostModel, SplitCandidate, TilingMode};
pub use memory::{
    DoubleBuffer, FullLoadMode, IterOrder, L0Tiling, L1PlanResult, L1Tiling, MemoryTilingPlanner,
    SingleCoreShape, SpatialTile, VecTiling,
};
pub use numblocks::{CoreSplitSearch, NumBlocksResult, SplitRanges};
pub use params::{ConstParams, ConvProblem, CubeTile, GroupMode};
pub use record::{TilingKey, TilingKeyFields, TilingRecord};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::TilingResult;
use crate::platform::{platform_info, PlatformInfo};
use crate::types::{AttrInfo, ConvDesc, ShapeInfo};

/// One convolution instance to tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilingRequest {
    pub shape: ShapeInfo,
    pub attr: AttrInfo,
    pub desc: ConvDesc,
}

impl TilingRequest {
    pub fn new(shape: ShapeInfo, attr: AttrInfo, desc: ConvDesc) -> Self {
        TilingRequest { shape, attr, desc }
    }

    /// 2-D request from NCHW input dims and `[co, kh, kw]` kernel dims.
    pub fn conv2d(input: [u64; 4], kernel: [u64; 3], attr: AttrInfo, desc: ConvDesc) -> TilingResult<Self> {
        Ok(Self::new(ShapeInfo::infer_2d(input, kernel, &attr)?, attr, desc))
    }

    /// 3-D request from NCDHW input dims and `[co, kd, kh, kw]` kernel dims.
    pub fn conv3d(input: [u64; 5], kernel: [u64; 4], attr: AttrInfo, desc: ConvDesc) -> TilingResult<Self> {
        Ok(Self::new(ShapeInfo::infer(input, kernel, &attr)?, attr, desc))
    }
}

/// Run the full tiling pipeline for one request.
pub fn tile_conv(req: &TilingRequest, platform: &PlatformInfo) -> TilingResult<TilingRecord> {
    platform.validate()?;
    let problem = ConvProblem::new(req.shape, req.attr, req.desc)?;
    let num_blocks = CoreSplitSearch::new(&problem, platform).decide()?;
    let single = SingleCoreShape::new(&problem, &num_blocks);
    let plan = MemoryTilingPlanner::new(&problem, platform, single).plan()?;
    Ok(TilingRecord::assemble(&problem, num_blocks, single, plan))
}

/// Tiling front end bound to one device, with a memo cache.
pub struct TilingEngine {
    platform: PlatformInfo,
    cache: TilingCache,
}

impl TilingEngine {
    /// Engine for the process-global platform with a memory-only cache.
    pub fn new() -> Self {
        TilingEngine { platform: platform_info().clone(), cache: TilingCache::new() }
    }

    pub fn with_platform(platform: PlatformInfo) -> TilingResult<Self> {
        platform.validate()?;
        Ok(TilingEngine { platform, cache: TilingCache::new() })
    }

    pub fn with_cache(mut self, cache: TilingCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    pub fn cache(&self) -> &TilingCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TilingCache {
        &mut self.cache
    }

    /// Tile one request, reusing a cached record when present.
    pub fn tile(&mut self, req: &TilingRequest) -> TilingResult<TilingRecord> {
        let fp = self.platform.fingerprint();
        if let Some(rec) = self.cache.get(&fp, req) {
            log::debug!("tiling cache hit for {}", req.shape);
            return Ok(rec.clone());
        }
        let rec = tile_conv(req, &self.platform)?;
        self.cache.put(&fp, req, rec.clone())?;
        Ok(rec)
    }

    /// Tile independent requests in parallel. Results keep input order;
    /// new records are added to the cache.
    pub fn tile_many(&mut self, reqs: &[TilingRequest]) -> Vec<TilingResult<TilingRecord>> {
        let fp = self.platform.fingerprint();
        let platform = &self.platform;
        let cache = &self.cache;
        let results: Vec<(bool, TilingResult<TilingRecord>)> = reqs
            .par_iter()
            .map(|req| match cache.get(&fp, req) {
                Some(rec) => (true, Ok(rec.clone())),
                None => (false, tile_conv(req, platform)),
            })
            .collect();

        let mut out = Vec::with_capacity(results.len());
        for (req, (hit, res)) in reqs.iter().zip(results) {
            if let (false, Ok(rec)) = (hit, &res) {
                if let Err(e) = self.cache.put(&fp, req, rec.clone()) {
                    log::warn!("Failed to cache tiling for {}: {}", req.shape, e);
                }
            }
            out.push(res);
        }
        out
    }
}

impl Default for TilingEngine {
    fn default() -> Self {
        Self::new()
    }
}

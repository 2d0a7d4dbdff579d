//! On-chip memory tiling for the per-core slice chosen by the split search.
//!
//! ```text
//!   init double buffer ─► L0 tiles (greedy m/n) ─► full-load decision
//!          │                                            │
//!          └─ L1CapacityExceeded if even M0×N0 fails    ▼
//!                         K / spatial / N binary search on L1
//!                                      │
//!       kL0 + L0 ping-pong ─► iteration order ─► weight bypass ─► K tails
//!                                                      │
//!                                 UB tiling ◄── bias residence
//! ```
//!
//! Every byte count is rounded up to `ALIGN_BYTES`. The chosen plan always
//! satisfies `l1_bytes <= PlatformInfo::l1_size` with double-buffered
//! buffers counted twice.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TilingError, TilingResult};
use crate::platform::PlatformInfo;
use crate::tiling::cost::TilingMode;
use crate::tiling::factors::{factors, factors_with_pow2};
use crate::tiling::math::{align_bytes, align_up, ceil_div, gcd};
use crate::tiling::numblocks::NumBlocksResult;
use crate::tiling::params::{ConvProblem, C04_CIN, DOUBLE_BUFFER, KL0_LIMIT};

/// Which tensors stay resident in L1 for the whole per-core computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FullLoadMode {
    AllFullLoad,
    FullLoadInput,
    FullLoadWeight,
    NoneFullLoad,
}

impl FullLoadMode {
    pub const fn key_bits(self) -> u32 {
        match self {
            Self::AllFullLoad => 0,
            Self::FullLoadInput => 1,
            Self::FullLoadWeight => 2,
            Self::NoneFullLoad => 3,
        }
    }
}

/// Loop nest order over L1 tiles: the named axis is iterated innermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IterOrder {
    MFirst,
    NFirst,
}

/// Spatial extent of a tile: flattened rows in M-split mode, height×width
/// in HW-split mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpatialTile {
    M(u64),
    Hw { ho: u64, wo: u64 },
}

impl SpatialTile {
    /// Output points covered by the tile.
    pub fn m(&self) -> u64 {
        match *self {
            SpatialTile::M(m) => m,
            SpatialTile::Hw { ho, wo } => ho * wo,
        }
    }

    /// Tiles of this size needed to cover `full`.
    pub fn loops(&self, full: &SpatialTile) -> u64 {
        match (*self, *full) {
            (SpatialTile::Hw { ho, wo }, SpatialTile::Hw { ho: fh, wo: fw }) => {
                ceil_div(fh, ho) * ceil_div(fw, wo)
            }
            (tile, full) => ceil_div(full.m(), tile.m()),
        }
    }
}

impl fmt::Display for SpatialTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpatialTile::M(m) => write!(f, "m{m}"),
            SpatialTile::Hw { ho, wo } => write!(f, "ho{ho}xwo{wo}"),
        }
    }
}

/// Per-buffer double-buffer eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DoubleBuffer {
    pub al1: bool,
    pub bl1: bool,
    pub al0: bool,
    pub bl0: bool,
    pub cl0: bool,
}

/// Buffer copies implied by a double-buffer flag.
#[inline]
pub fn copies(enabled: bool) -> u64 {
    if enabled {
        DOUBLE_BUFFER
    } else {
        1
    }
}

impl DoubleBuffer {
    /// Two-bit L1 ping-pong state for the tiling key.
    pub const fn l1_key_bits(&self) -> u32 {
        (self.al1 as u32) | ((self.bl1 as u32) << 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct L0Tiling {
    pub spatial: SpatialTile,
    pub k: u64,
    pub n: u64,
}

/// L1 tiles. `k_bl1` and `n_bl1` are zero when the weight bypasses L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct L1Tiling {
    pub k_al1: u64,
    pub k_bl1: u64,
    pub spatial: SpatialTile,
    pub n_bl1: u64,
    /// Size of the last K step over the per-core reduction axis.
    pub k_al1_tail: u64,
    pub k_bl1_tail: u64,
}

impl L1Tiling {
    pub fn new(k_al1: u64, k_bl1: u64, spatial: SpatialTile, n_bl1: u64) -> Self {
        L1Tiling { k_al1, k_bl1, spatial, n_bl1, k_al1_tail: k_al1, k_bl1_tail: k_bl1 }
    }

    /// Recompute the K tails for a reduction of `k_total`.
    pub fn with_tails(self, k_total: u64) -> Self {
        let tail = |k: u64| match k {
            0 => 0,
            k if k_total % k == 0 => k,
            k => k_total % k,
        };
        L1Tiling { k_al1_tail: tail(self.k_al1), k_bl1_tail: tail(self.k_bl1), ..self }
    }
}

/// Split of one L0C tile for vector post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VecTiling {
    pub m_ub: u64,
    pub n_ub: u64,
}

/// Per-core slice handed over by the split search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SingleCoreShape {
    pub batch: u64,
    pub group: u64,
    pub dout: u64,
    /// Output channels in N0 tiles.
    pub co1: u64,
    /// Full spatial extent of the slice.
    pub spatial: SpatialTile,
}

impl SingleCoreShape {
    pub fn new(problem: &ConvProblem, nb: &NumBlocksResult) -> Self {
        let s = &problem.shape;
        let split = &nb.split;
        let spatial = match nb.mode {
            TilingMode::MSplit => {
                let m0 = problem.params.m0;
                let m1 = ceil_div(s.out_hw(), m0);
                SpatialTile::M((ceil_div(m1, split.m) * m0).min(s.out_hw()))
            }
            TilingMode::HwSplit => SpatialTile::Hw {
                ho: ceil_div(s.ho, split.ho),
                wo: ceil_div(s.wo, split.wo),
            },
        };
        SingleCoreShape {
            batch: ceil_div(s.batch, split.batch),
            group: ceil_div(problem.group.groups(), split.group),
            dout: ceil_div(s.dout, split.dout),
            co1: ceil_div(problem.params.co1, split.n),
            spatial,
        }
    }
}

/// Output of the memory planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct L1PlanResult {
    pub full_load: FullLoadMode,
    pub l0: L0Tiling,
    pub l1: L1Tiling,
    pub db: DoubleBuffer,
    pub bias_full_load: bool,
    pub iter_order: IterOrder,
    /// Weight goes from global memory straight to L0B.
    pub weight_bypass: bool,
    /// Present when the output is requantized on the vector unit.
    pub vec: Option<VecTiling>,
    /// L1 bytes used, double-buffered buffers counted twice.
    pub l1_bytes: u64,
}

impl fmt::Display for L1PlanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}{} L1[k_a={} k_b={} {} n={}] L0[{} k={} n={}] db(a1={} b1={} a0={} b0={} c0={}) {:?} L1={}B",
            self.full_load,
            if self.weight_bypass { " bypass" } else { "" },
            self.l1.k_al1,
            self.l1.k_bl1,
            self.l1.spatial,
            self.l1.n_bl1,
            self.l0.spatial,
            self.l0.k,
            self.l0.n,
            self.db.al1,
            self.db.bl1,
            self.db.al0,
            self.db.bl0,
            self.db.cl0,
            self.iter_order,
            self.l1_bytes
        )
    }
}

/// Largest `v` in `lo..=hi` with `fits(v)`, for `fits` true at `lo` and
/// monotone (true then false).
pub fn largest_fitting(lo: u64, hi: u64, fits: impl Fn(u64) -> bool) -> u64 {
    let (mut lo, mut hi) = (lo, hi.max(lo));
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

/// Memory planner bound to one problem, device and split.
pub struct MemoryTilingPlanner<'a> {
    problem: &'a ConvProblem,
    platform: &'a PlatformInfo,
    single: SingleCoreShape,
    /// Sorted K tile candidates shared by AL1 and BL1.
    k_candidates: Vec<u64>,
}

impl<'a> MemoryTilingPlanner<'a> {
    pub fn new(problem: &'a ConvProblem, platform: &'a PlatformInfo, single: SingleCoreShape) -> Self {
        let k_candidates = k_candidates(problem);
        MemoryTilingPlanner { problem, platform, single, k_candidates }
    }

    pub fn single_core(&self) -> &SingleCoreShape {
        &self.single
    }

    pub fn plan(&self) -> TilingResult<L1PlanResult> {
        let mut db = self.init_double_buffer()?;
        let (spatial_l0, n_l0) = self.l0_tiling(&db)?;

        let full_load = self.full_load_mode(&db, spatial_l0, n_l0);
        let mut l1 = self.l1_tiling(full_load, &mut db, spatial_l0, n_l0);
        let (k_l0, al0, bl0) = self.k_l0(&l1, spatial_l0, n_l0);
        db.al0 = al0;
        db.bl0 = bl0;
        db.cl0 = spatial_l0.m() * n_l0 * self.mad_size() * DOUBLE_BUFFER <= self.platform.l0c_size;

        let iter_order = self.iter_order(full_load, &l1);
        let weight_bypass = self.weight_bypass(&mut l1, &mut db, spatial_l0, k_l0, n_l0);
        let l1 = l1.with_tails(self.k_full());
        let bias_full_load = self.bias_full_load(&l1, &db, n_l0);
        let vec = if self.problem.desc.quant { Some(self.vec_tiling(spatial_l0.m(), n_l0)?) } else { None };

        let l1_bytes = self.l1_usage(&l1, &db, n_l0, bias_full_load);
        if l1_bytes > self.platform.l1_size {
            return Err(TilingError::L1CapacityExceeded { required: l1_bytes, capacity: self.platform.l1_size });
        }
        let plan = L1PlanResult {
            full_load,
            l0: L0Tiling { spatial: spatial_l0, k: k_l0, n: n_l0 },
            l1,
            db,
            bias_full_load,
            iter_order,
            weight_bypass,
            vec,
            l1_bytes,
        };
        log::debug!("memory plan: {}", plan);
        Ok(plan)
    }

    // ── Byte accounting ─────────────────────────────────────────────

    fn mad_size(&self) -> u64 {
        self.problem.desc.fmap_dtype.mad_size_bytes()
    }

    /// Smallest K tile: one channel block of the kernel window.
    fn k_min(&self) -> u64 {
        self.k_candidates[0]
    }

    fn k_full(&self) -> u64 {
        self.k_candidates[self.k_candidates.len() - 1]
    }

    /// Input channels (times depth slices) covered by a K tile.
    fn fmap_channels(&self, k: u64) -> u64 {
        let s = &self.problem.shape;
        if self.problem.desc.enable_c04 {
            (k / self.k_min()) * C04_CIN
        } else {
            k / (s.kh * s.kw)
        }
    }

    pub fn fmap_l1_bytes(&self, k_al1: u64, spatial: SpatialTile) -> u64 {
        let p = self.problem;
        let (hi, wi) = match spatial {
            SpatialTile::M(m) => (p.infer_hi(m / p.shape.wo + 2), p.shape.wi),
            SpatialTile::Hw { ho, wo } => (p.infer_hi(ho), p.infer_wi(wo)),
        };
        align_bytes(self.fmap_channels(k_al1) * hi * wi * p.fmap_size())
    }

    pub fn weight_l1_bytes(&self, k_bl1: u64, n_bl1: u64) -> u64 {
        align_bytes(k_bl1 * n_bl1 * self.problem.weight_size())
    }

    /// Bias and per-channel scale slices staged in L1.
    fn aux_l1_bytes(&self, n_l0: u64, bias_full: bool) -> u64 {
        let p = self.problem;
        let mut bytes = 0;
        if p.stages_bias() {
            let n = if bias_full { self.single.co1 * p.params.n0 } else { n_l0 };
            bytes += align_bytes(n * p.bias_size());
        }
        if p.stages_scale() {
            bytes += align_bytes(n_l0 * p.desc.channel_wise_coeff * 2);
        }
        bytes
    }

    /// Total L1 footprint of a tiling.
    pub fn l1_usage(&self, t: &L1Tiling, db: &DoubleBuffer, n_l0: u64, bias_full: bool) -> u64 {
        self.fmap_l1_bytes(t.k_al1, t.spatial) * copies(db.al1)
            + self.weight_l1_bytes(t.k_bl1, t.n_bl1) * copies(db.bl1)
            + self.aux_l1_bytes(n_l0, bias_full)
    }

    fn fits_l1(&self, t: &L1Tiling, db: &DoubleBuffer, n_l0: u64) -> bool {
        self.l1_usage(t, db, n_l0, false) <= self.platform.l1_size
    }

    fn min_tiling(&self, spatial: SpatialTile, n: u64) -> L1Tiling {
        L1Tiling::new(self.k_min(), self.k_min(), spatial, n)
    }

    fn min_spatial(&self) -> SpatialTile {
        let m0 = self.problem.params.m0;
        match self.single.spatial {
            SpatialTile::M(_) => SpatialTile::M(m0),
            SpatialTile::Hw { .. } => SpatialTile::Hw { ho: 1, wo: m0 },
        }
    }

    // ── Double buffering ────────────────────────────────────────────

    /// Double-buffer both L1 operands if the minimal tile allows it, else
    /// only the input, else neither.
    fn init_double_buffer(&self) -> TilingResult<DoubleBuffer> {
        let t = self.min_tiling(self.min_spatial(), self.problem.params.n0);
        let n0 = self.problem.params.n0;
        for (al1, bl1) in [(true, true), (true, false), (false, false)] {
            let db = DoubleBuffer { al1, bl1, ..Default::default() };
            if self.fits_l1(&t, &db, n0) {
                return Ok(db);
            }
        }
        let required = self.l1_usage(&t, &DoubleBuffer::default(), n0, false);
        log::warn!(
            "minimal tile for {} needs {} bytes of L1, have {}",
            self.problem.shape, required, self.platform.l1_size
        );
        Err(TilingError::L1CapacityExceeded { required, capacity: self.platform.l1_size })
    }

    // ── L0 tiling ───────────────────────────────────────────────────

    fn fits_l0(&self, m: u64, k: u64, n: u64) -> bool {
        let p = self.problem;
        let plat = self.platform;
        m * k * DOUBLE_BUFFER * p.fmap_size() <= plat.l0a_size
            && k * n * DOUBLE_BUFFER * p.weight_size() <= plat.l0b_size
            && m * n * self.mad_size() <= plat.l0c_size
    }

    fn fits_bias_table(&self, n: u64) -> bool {
        !self.problem.desc.has_bias || n * self.mad_size() <= self.platform.bt_size
    }

    fn spatial_l0_candidates(&self) -> Vec<SpatialTile> {
        let p = self.problem;
        let (m0, k0, n0) = (p.params.m0, p.params.k0, p.params.n0);
        let m_max = (self.platform.l0a_size / (k0 * DOUBLE_BUFFER * p.fmap_size()))
            .min(self.platform.l0c_size / (n0 * self.mad_size()));
        match self.single.spatial {
            SpatialTile::M(m) => factors_with_pow2(ceil_div(m, m0), m_max / m0)
                .into_iter()
                .map(|v| SpatialTile::M(v * m0))
                .collect(),
            SpatialTile::Hw { ho, wo } => {
                let wo_range: Vec<u64> = factors_with_pow2(ceil_div(wo, m0), m_max / m0)
                    .into_iter()
                    .map(|v| v * m0)
                    .collect();
                let mut out: Vec<SpatialTile> =
                    wo_range.iter().map(|&w| SpatialTile::Hw { ho: 1, wo: w }).collect();
                let wo_last = wo_range[wo_range.len() - 1];
                if wo_last >= wo {
                    out.extend(
                        factors_with_pow2(ho, m_max / wo_last)
                            .into_iter()
                            .filter(|&h| h > 1)
                            .map(|h| SpatialTile::Hw { ho: h, wo: wo_last }),
                    );
                }
                out
            }
        }
    }

    fn n_l0_candidates(&self) -> Vec<u64> {
        let p = self.problem;
        let (m0, k0, n0) = (p.params.m0, p.params.k0, p.params.n0);
        let n_max = (self.platform.l0b_size / (k0 * DOUBLE_BUFFER * p.weight_size()))
            .min(self.platform.l0c_size / (m0 * self.mad_size()));
        factors_with_pow2(self.single.co1, n_max / n0).into_iter().map(|v| v * n0).collect()
    }

    /// Grow the M and N L0 tiles alternately, smaller side first, while the
    /// L0 buffers, the bias table and the minimal L1 footprint still fit.
    fn l0_tiling(&self, db: &DoubleBuffer) -> TilingResult<(SpatialTile, u64)> {
        let ms = self.spatial_l0_candidates();
        let ns = self.n_l0_candidates();
        let k0 = self.problem.params.k0;
        let fits = |s: SpatialTile, n: u64| {
            self.fits_l0(s.m(), k0, n)
                && self.fits_bias_table(n)
                && self.fits_l1(&self.min_tiling(s, n), db, n)
        };
        if !self.fits_l0(ms[0].m(), k0, ns[0]) {
            return Err(TilingError::Platform(format!(
                "L0 buffers cannot hold one {}x{}x{} cube tile",
                ms[0].m(),
                k0,
                ns[0]
            )));
        }
        if !fits(ms[0], ns[0]) {
            let required = self.l1_usage(&self.min_tiling(ms[0], ns[0]), db, ns[0], false);
            return Err(TilingError::L1CapacityExceeded { required, capacity: self.platform.l1_size });
        }
        let (mut mi, mut ni) = (0usize, 0usize);
        loop {
            let can_m = mi + 1 < ms.len();
            let can_n = ni + 1 < ns.len();
            let grow_m = match (can_m, can_n) {
                (false, false) => break,
                (true, false) => true,
                (false, true) => false,
                (true, true) => ms[mi].m() <= ns[ni],
            };
            let (nmi, nni) = if grow_m { (mi + 1, ni) } else { (mi, ni + 1) };
            if !fits(ms[nmi], ns[nni]) {
                break;
            }
            mi = nmi;
            ni = nni;
        }
        log::debug!("L0 tile: {} n={}", ms[mi], ns[ni]);
        Ok((ms[mi], ns[ni]))
    }

    /// K L0 tile dividing both L1 K tiles, with the L0A/L0B double-buffer
    /// flags. Returns `(k_l0, al0, bl0)`.
    fn k_l0(&self, l1: &L1Tiling, spatial_l0: SpatialTile, n_l0: u64) -> (u64, bool, bool) {
        let k0 = self.problem.params.k0;
        let g = gcd(l1.k_al1 / k0, l1.k_bl1 / k0);
        let ks: Vec<u64> = factors(g, KL0_LIMIT / k0).into_iter().map(|v| v * k0).collect();
        if ks.is_empty() {
            return (k0, true, true);
        }
        if let Some(fixed) = self.single_buffered_l0(ks[ks.len() - 1], spatial_l0, n_l0) {
            return fixed;
        }
        let idx = largest_fitting(0, ks.len() as u64 - 1, |i| {
            self.fits_l0(spatial_l0.m(), ks[i as usize], n_l0)
        });
        (ks[idx as usize], true, true)
    }

    /// When the whole per-core K fits one L0 tile and M or N is also whole,
    /// the matching L0 operand is loaded once: drop its double buffer and
    /// take the full K.
    fn single_buffered_l0(&self, k_max: u64, spatial_l0: SpatialTile, n_l0: u64) -> Option<(u64, bool, bool)> {
        let p = self.problem;
        let plat = self.platform;
        let a_bytes = k_max * spatial_l0.m() * p.fmap_size();
        let b_bytes = k_max * n_l0 * p.weight_size();
        if k_max != self.k_full() || k_max >= KL0_LIMIT || a_bytes > plat.l0a_size || b_bytes > plat.l0b_size {
            return None;
        }
        let m_full = spatial_l0.loops(&self.single.spatial) == 1;
        let n_full = n_l0 >= self.single.co1 * p.params.n0;
        let flags = if m_full && n_full {
            (false, false)
        } else if m_full && b_bytes * DOUBLE_BUFFER <= plat.l0b_size {
            (false, true)
        } else if n_full && a_bytes * DOUBLE_BUFFER <= plat.l0a_size {
            (true, false)
        } else {
            return None;
        };
        log::debug!("full K in L0: k={} al0_db={} bl0_db={}", k_max, flags.0, flags.1);
        Some((k_max, flags.0, flags.1))
    }

    // ── Weight bypass ───────────────────────────────────────────────

    /// When the BL1 tile equals the L0 tile the weight skips L1. The freed
    /// space goes to a larger K tile for the input (a multiple of `k_l0`),
    /// then to the spatial tile once K is whole.
    fn weight_bypass(
        &self,
        l1: &mut L1Tiling,
        db: &mut DoubleBuffer,
        spatial_l0: SpatialTile,
        k_l0: u64,
        n_l0: u64,
    ) -> bool {
        if l1.k_bl1 != k_l0 || l1.n_bl1 != n_l0 {
            return false;
        }
        l1.k_bl1 = 0;
        l1.n_bl1 = 0;
        db.bl1 = false;
        let db: &DoubleBuffer = db;

        let ks = &self.k_candidates;
        let grown = ks
            .iter()
            .rev()
            .take_while(|&&k| k >= l1.k_al1)
            .find(|&&k| k % k_l0 == 0 && self.fits_l1(&L1Tiling { k_al1: k, ..*l1 }, db, n_l0));
        if let Some(&k) = grown {
            l1.k_al1 = k;
        }
        if l1.k_al1 == self.k_full() {
            let spatial = self.search_spatial(&L1Tiling { spatial: spatial_l0, ..*l1 }, db, n_l0);
            if spatial.m() > l1.spatial.m() {
                l1.spatial = spatial;
            }
        }
        log::debug!("weight bypasses L1: k_al1={} spatial={}", l1.k_al1, l1.spatial);
        true
    }

    // ── Full-load decision ──────────────────────────────────────────

    fn full_tiling(&self) -> L1Tiling {
        L1Tiling::new(
            self.k_full(),
            self.k_full(),
            self.single.spatial,
            self.single.co1 * self.problem.params.n0,
        )
    }

    fn full_load_mode(&self, db: &DoubleBuffer, spatial_l0: SpatialTile, n_l0: u64) -> FullLoadMode {
        let full = self.full_tiling();
        let fmap_full = self.fmap_l1_bytes(full.k_al1, full.spatial);
        let weight_full = self.weight_l1_bytes(full.k_bl1, full.n_bl1);
        let fmap_min = self.fmap_l1_bytes(self.k_min(), spatial_l0) * copies(db.al1);
        let weight_min = self.weight_l1_bytes(self.k_min(), n_l0) * copies(db.bl1);
        let aux = self.aux_l1_bytes(n_l0, false);
        let cap = self.platform.l1_size;

        if fmap_full + weight_full + aux <= cap {
            return FullLoadMode::AllFullLoad;
        }
        let input_fits = fmap_full + weight_min + aux <= cap;
        let weight_fits = weight_full + fmap_min + aux <= cap;
        let mode = if fmap_full > weight_full {
            if input_fits {
                FullLoadMode::FullLoadInput
            } else if weight_fits {
                FullLoadMode::FullLoadWeight
            } else {
                FullLoadMode::NoneFullLoad
            }
        } else if weight_fits {
            FullLoadMode::FullLoadWeight
        } else if input_fits {
            FullLoadMode::FullLoadInput
        } else {
            FullLoadMode::NoneFullLoad
        };
        log::debug!(
            "full-load decision: fmap_full={} weight_full={} fmap_min={} weight_min={} -> {:?}",
            fmap_full, weight_full, fmap_min, weight_min, mode
        );
        mode
    }

    // ── L1 tile search ──────────────────────────────────────────────

    fn l1_tiling(
        &self,
        mode: FullLoadMode,
        db: &mut DoubleBuffer,
        spatial_l0: SpatialTile,
        n_l0: u64,
    ) -> L1Tiling {
        let full = self.full_tiling();
        let mut t = self.min_tiling(spatial_l0, n_l0);
        match mode {
            FullLoadMode::AllFullLoad => {
                t = full;
                let both = DoubleBuffer { al1: true, bl1: true, ..*db };
                let fits_both = self.fits_l1(&t, &both, n_l0);
                db.al1 = fits_both;
                db.bl1 = fits_both;
            }
            FullLoadMode::FullLoadInput => {
                t.k_al1 = full.k_al1;
                t.spatial = full.spatial;
                db.al1 = self.fits_l1(&t, &DoubleBuffer { al1: true, ..*db }, n_l0);
                t.k_bl1 = self.search_k(&t, db, n_l0, false, true);
                t.n_bl1 = self.search_n(&t, db, n_l0);
            }
            FullLoadMode::FullLoadWeight => {
                t.k_bl1 = full.k_bl1;
                t.n_bl1 = full.n_bl1;
                db.bl1 = self.fits_l1(&t, &DoubleBuffer { bl1: true, ..*db }, n_l0);
                t.k_al1 = self.search_k(&t, db, n_l0, true, false);
                t.spatial = self.search_spatial(&t, db, n_l0);
            }
            FullLoadMode::NoneFullLoad => {
                let k = self.search_k(&t, db, n_l0, true, true);
                t.k_al1 = k;
                t.k_bl1 = k;
                t.spatial = self.search_spatial(&t, db, n_l0);
                t.n_bl1 = self.search_n(&t, db, n_l0);
            }
        }
        t
    }

    /// Largest K candidate for the selected operands.
    fn search_k(&self, base: &L1Tiling, db: &DoubleBuffer, n_l0: u64, a: bool, b: bool) -> u64 {
        let ks = &self.k_candidates;
        let with_k = |k: u64| L1Tiling {
            k_al1: if a { k } else { base.k_al1 },
            k_bl1: if b { k } else { base.k_bl1 },
            ..*base
        };
        let idx = largest_fitting(0, ks.len() as u64 - 1, |i| {
            self.fits_l1(&with_k(ks[i as usize]), db, n_l0)
        });
        ks[idx as usize]
    }

    /// Grow the spatial L1 tile in multiples of the L0 tile. In HW-split mode
    /// width grows first; height only once a row is complete.
    fn search_spatial(&self, base: &L1Tiling, db: &DoubleBuffer, n_l0: u64) -> SpatialTile {
        let fits = |s: SpatialTile| self.fits_l1(&L1Tiling { spatial: s, ..*base }, db, n_l0);
        match (base.spatial, self.single.spatial) {
            (SpatialTile::M(m_l0), SpatialTile::M(full)) => {
                let full = align_up(full, self.problem.params.m0);
                let t = largest_fitting(1, ceil_div(full, m_l0), |t| fits(SpatialTile::M((t * m_l0).min(full))));
                SpatialTile::M((t * m_l0).min(full))
            }
            (SpatialTile::Hw { ho: ho_l0, wo: wo_l0 }, SpatialTile::Hw { ho: full_ho, wo: full_wo }) => {
                let max_w = ceil_div(full_wo, wo_l0);
                let tw = largest_fitting(1, max_w, |t| fits(SpatialTile::Hw { ho: ho_l0, wo: t * wo_l0 }));
                let wo = tw * wo_l0;
                if tw < max_w {
                    return SpatialTile::Hw { ho: ho_l0, wo };
                }
                let th = largest_fitting(1, ceil_div(full_ho, ho_l0), |t| {
                    fits(SpatialTile::Hw { ho: t * ho_l0, wo })
                });
                SpatialTile::Hw { ho: th * ho_l0, wo }
            }
            (s, _) => s,
        }
    }

    /// Grow the N L1 tile in multiples of the L0 tile.
    fn search_n(&self, base: &L1Tiling, db: &DoubleBuffer, n_l0: u64) -> u64 {
        let full_n = self.single.co1 * self.problem.params.n0;
        let t = largest_fitting(1, ceil_div(full_n, n_l0), |t| {
            self.fits_l1(&L1Tiling { n_bl1: t * n_l0, ..*base }, db, n_l0)
        });
        t * n_l0
    }

    /// Keep the whole per-core bias slice resident when it still fits.
    fn bias_full_load(&self, l1: &L1Tiling, db: &DoubleBuffer, n_l0: u64) -> bool {
        self.problem.stages_bias() && self.l1_usage(l1, db, n_l0, true) <= self.platform.l1_size
    }

    /// Pick the loop order with less L1 reload traffic.
    fn iter_order(&self, mode: FullLoadMode, l1: &L1Tiling) -> IterOrder {
        match mode {
            FullLoadMode::AllFullLoad | FullLoadMode::FullLoadWeight => IterOrder::MFirst,
            FullLoadMode::FullLoadInput => IterOrder::NFirst,
            FullLoadMode::NoneFullLoad => {
                let full = self.full_tiling();
                let fmap_full = self.fmap_l1_bytes(full.k_al1, full.spatial);
                let weight_full = self.weight_l1_bytes(full.k_bl1, full.n_bl1);
                let m_loops = l1.spatial.loops(&self.single.spatial);
                let n_loops = ceil_div(full.n_bl1, l1.n_bl1);
                let m_first = fmap_full.saturating_mul(n_loops).saturating_add(weight_full);
                let n_first = weight_full.saturating_mul(m_loops).saturating_add(fmap_full);
                if m_first <= n_first {
                    IterOrder::MFirst
                } else {
                    IterOrder::NFirst
                }
            }
        }
    }

    // ── Vector tiling ───────────────────────────────────────────────

    /// Largest `(m_ub, n_ub)` slice of the L0C tile whose accumulator input,
    /// requantized output and per-channel params fit the vector buffer.
    fn vec_tiling(&self, m_l0: u64, n_l0: u64) -> TilingResult<VecTiling> {
        let p = self.problem;
        let n0 = p.params.n0;
        let per_channel = p.desc.channel_wise_coeff * 4 + if p.desc.has_bias { p.bias_size() } else { 0 };
        let usage = |m: u64, n: u64| {
            align_bytes(m * n * self.mad_size())
                + align_bytes(m * n * p.desc.out_dtype.size_bytes())
                + align_bytes(n * per_channel)
        };
        let n1 = ceil_div(n_l0, n0);
        for m_split in 1..=m_l0 {
            let m_ub = ceil_div(m_l0, m_split);
            if m_split > 1 && m_ub == ceil_div(m_l0, m_split - 1) {
                continue;
            }
            for n_split in 1..=n1 {
                let n_ub = ceil_div(n1, n_split) * n0;
                if usage(m_ub, n_ub) <= self.platform.ub_size {
                    return Ok(VecTiling { m_ub, n_ub });
                }
            }
        }
        let required = usage(1, n0);
        Err(TilingError::VectorCapacityExceeded { required, capacity: self.platform.ub_size })
    }
}

/// Sorted K tile candidates: channel-block multiples of one kernel window,
/// then whole-depth multiples. On the C04 path only depth multiples exist.
fn k_candidates(p: &ConvProblem) -> Vec<u64> {
    let s = &p.shape;
    let k0 = p.params.k0;
    let mut ks: Vec<u64> = if p.desc.enable_c04 {
        let unit = align_up(C04_CIN * s.kh * s.kw, k0);
        (1..=s.kd).map(|d| d * unit).collect()
    } else {
        let unit = s.kh * s.kw * k0;
        let ci1 = p.params.ci1;
        factors(ci1, ci1)
            .into_iter()
            .map(|c| c * unit)
            .chain((2..=s.kd).map(|d| d * ci1 * unit))
            .collect()
    };
    ks.sort_unstable();
    ks.dedup();
    ks
}

//! Split cost model.
//!
//! Estimates, for the per-core slice implied by a split, the data traffic
//! (feature map, weight, output) divided by an effective bandwidth plus the
//! cube work in tile units. Every split uses ceiling division: a tail core
//! still pays for a full tile.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tiling::math::{align_up, ceil_div, prod};
use crate::tiling::params::{
    ConvProblem, BW_COEFF, BW_COEFF_C04, BW_COEFF_PACKED, C04_CI1, C04_CIN, MIN_L2_BANDWIDTH,
};
use crate::types::FmapFormat;

/// Spatial split strategy, fixed before the search starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TilingMode {
    /// Output height×width flattened into one M axis.
    MSplit,
    /// Output height and width split independently.
    HwSplit,
}

/// Number of cores assigned to each axis.
///
/// In `MSplit` mode `ho`/`wo` stay 1; in `HwSplit` mode `m` stays 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplitCandidate {
    pub batch: u64,
    pub m: u64,
    pub ho: u64,
    pub wo: u64,
    pub n: u64,
    pub dout: u64,
    pub group: u64,
}

impl SplitCandidate {
    /// The "no split" candidate.
    pub const fn ones() -> Self {
        SplitCandidate { batch: 1, m: 1, ho: 1, wo: 1, n: 1, dout: 1, group: 1 }
    }

    /// Total cores used.
    pub fn cores(&self) -> u64 {
        prod(&[self.batch, self.m, self.ho, self.wo, self.n, self.dout, self.group])
    }
}

impl Default for SplitCandidate {
    fn default() -> Self {
        Self::ones()
    }
}

impl fmt::Display for SplitCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch={} m={} ho={} wo={} n={} do={} group={}",
            self.batch, self.m, self.ho, self.wo, self.n, self.dout, self.group
        )
    }
}

/// Pure cost evaluator bound to one problem.
pub struct CostModel<'a> {
    pub problem: &'a ConvProblem,
    bw_coeff: u64,
}

impl<'a> CostModel<'a> {
    pub fn new(problem: &'a ConvProblem) -> Self {
        CostModel { problem, bw_coeff: weight_bandwidth_coeff(problem) }
    }

    /// Weight traffic derating applied by this model.
    pub fn bw_coeff(&self) -> u64 {
        self.bw_coeff
    }

    pub fn cost(&self, c: &SplitCandidate, mode: TilingMode) -> u64 {
        match mode {
            TilingMode::MSplit => self.cost_m_split(c),
            TilingMode::HwSplit => self.cost_hw_split(c),
        }
    }

    fn cost_m_split(&self, c: &SplitCandidate) -> u64 {
        let p = self.problem;
        let s = &p.shape;
        let ConstParamsView { m0, k0, n0, ci1, co1, groups } = self.view();

        let b = ceil_div(s.batch, c.batch);
        let g = ceil_div(groups, c.group);
        let d = ceil_div(s.dout, c.dout);
        let co = ceil_div(co1 * n0, c.n);

        let load_fmap = prod(&[b, g, d, ceil_div(align_up(s.hi * s.wi, m0), c.m), s.kd, ci1, k0]);
        let mut load_weight = prod(&[g, s.kd, ci1, s.kh, s.kw, k0, b]);
        if !p.group.is_optimized() {
            load_weight = load_weight.saturating_mul(co);
        }
        let load_out = prod(&[b, g, co, d, ceil_div(align_up(s.out_hw(), m0), c.m)]);
        let cube = prod(&[
            b,
            g,
            ceil_div(co1, c.n),
            d,
            s.kd,
            ci1,
            s.kh,
            s.kw,
            ceil_div(ceil_div(s.out_hw(), m0), c.m),
        ]);
        self.combine(load_fmap, load_weight, load_out, cube)
    }

    fn cost_hw_split(&self, c: &SplitCandidate) -> u64 {
        let p = self.problem;
        let s = &p.shape;
        let ConstParamsView { m0, k0, n0, ci1, co1, groups } = self.view();
        let (ci1, ci0) = if p.desc.enable_c04 { (C04_CI1, C04_CIN) } else { (ci1, k0) };

        let b = ceil_div(s.batch, c.batch);
        let g = ceil_div(groups, c.group);
        let d = ceil_div(s.dout, c.dout);
        let co = ceil_div(co1 * n0, c.n);
        let ho = ceil_div(s.ho, c.ho);
        let wo = ceil_div(s.wo, c.wo);

        let load_fmap = prod(&[b, g, d, s.kd, ci1, ceil_div(s.hi, c.ho), ceil_div(s.wi, c.wo), ci0]);
        let weight_k = if p.desc.enable_c04 {
            align_up(C04_CI1 * s.kh * s.kw, k0)
        } else {
            ci1 * s.kh * s.kw * k0
        };
        let mut load_weight = prod(&[b, g, s.kd, weight_k]);
        if !p.group.is_optimized() {
            load_weight = load_weight.saturating_mul(co);
        }
        let load_out = prod(&[b, g, d, co, ho, wo]);
        let cube = prod(&[
            b,
            g,
            ceil_div(co1, c.n),
            d,
            s.kd,
            ci1,
            s.kh,
            s.kw,
            ceil_div(ho * wo, m0),
        ]);
        self.combine(load_fmap, load_weight, load_out, cube)
    }

    fn combine(&self, fmap: u64, weight: u64, out: u64, cube: u64) -> u64 {
        let traffic = fmap
            .saturating_add(weight.saturating_mul(self.bw_coeff))
            .saturating_add(out);
        (traffic / MIN_L2_BANDWIDTH).saturating_add(cube)
    }

    fn view(&self) -> ConstParamsView {
        let p = self.problem;
        ConstParamsView {
            m0: p.params.m0,
            k0: p.params.k0,
            n0: p.params.n0,
            ci1: p.params.ci1,
            co1: p.params.co1,
            groups: p.group.groups(),
        }
    }
}

struct ConstParamsView {
    m0: u64,
    k0: u64,
    n0: u64,
    ci1: u64,
    co1: u64,
    groups: u64,
}

/// Weight bandwidth derating, keyed on layout, weight packing, group mode
/// and the C04 path.
pub fn weight_bandwidth_coeff(p: &ConvProblem) -> u64 {
    let fmt = p.desc.fmap_format;
    if matches!(fmt, FmapFormat::Nchw | FmapFormat::Ncdhw) {
        if p.desc.weight_format.is_packed() {
            return BW_COEFF_PACKED;
        }
        if !p.group.is_optimized() {
            return BW_COEFF;
        }
    } else if p.desc.enable_c04 && fmt == FmapFormat::Nhwc {
        return BW_COEFF_C04;
    }
    BW_COEFF_PACKED
}

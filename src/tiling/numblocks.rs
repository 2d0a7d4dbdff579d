//! Core-split search.
//!
//! ```text
//!   select_mode ──► build_ranges ──► odometer over axes ──► spare-ho pass
//!   (M / HW pre-check)  (factor mix)    (cost + tie-break)     (HW only)
//! ```
//!
//! Picks how many cores work on each of batch, spatial, output-channel,
//! depth and group so that the product stays within the core budget and the
//! estimated cost is minimal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TilingError, TilingResult};
use crate::platform::PlatformInfo;
use crate::tiling::cost::{CostModel, SplitCandidate, TilingMode};
use crate::tiling::factors::{factors, mix_factors};
use crate::tiling::math::{align_bytes, align_up, ceil_div};
use crate::tiling::params::{
    ConvProblem, BATCH_CORE_COEFF, C04_CIN, LOAD3D_WIN_LIMIT, MAX_32_BIT, MAX_40_BIT,
    MIN_L2_BANDWIDTH,
};
use crate::types::FmapFormat;

/// Chosen split and its cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumBlocksResult {
    pub mode: TilingMode,
    pub split: SplitCandidate,
    pub min_cost: u64,
}

impl NumBlocksResult {
    pub fn cores(&self) -> u64 {
        self.split.cores()
    }
}

impl fmt::Display for NumBlocksResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} [{}] cost={}", self.mode, self.split, self.min_cost)
    }
}

/// Candidate split values per axis. Every range is sorted and contains 1.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SplitRanges {
    pub batch: Vec<u64>,
    pub m: Vec<u64>,
    pub ho: Vec<u64>,
    pub wo: Vec<u64>,
    pub n: Vec<u64>,
    pub dout: Vec<u64>,
    pub group: Vec<u64>,
    /// Height splits too fine for the minimum burst; only used to fill idle cores.
    pub spare_ho: Vec<u64>,
}

impl SplitRanges {
    /// Number of leaves in the Cartesian product.
    pub fn combinations(&self) -> usize {
        self.axes().iter().map(|r| r.len()).product()
    }

    fn axes(&self) -> [&[u64]; AXES] {
        [&self.batch, &self.m, &self.ho, &self.wo, &self.n, &self.dout, &self.group]
    }
}

const AXES: usize = 7;

fn candidate_at(axes: &[&[u64]; AXES], idx: &[usize; AXES]) -> SplitCandidate {
    SplitCandidate {
        batch: axes[0][idx[0]],
        m: axes[1][idx[1]],
        ho: axes[2][idx[2]],
        wo: axes[3][idx[3]],
        n: axes[4][idx[4]],
        dout: axes[5][idx[5]],
        group: axes[6][idx[6]],
    }
}

/// Running best of the search.
#[derive(Debug, Clone, Copy)]
struct Best {
    split: SplitCandidate,
    cost: u64,
}

impl Best {
    /// Lower cost wins; equal cost goes to higher core utilization, then to
    /// the larger `(batch, dout)` pair.
    fn offer(&mut self, cand: SplitCandidate, cost: u64, core_num: u64) {
        let wins = match cost.cmp(&self.cost) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => {
                let cur = cand.cores() / core_num;
                let prev = self.split.cores() / core_num;
                if cur != prev {
                    cur > prev
                } else {
                    (cand.batch, cand.dout) > (self.split.batch, self.split.dout)
                }
            }
        };
        if wins {
            self.split = cand;
            self.cost = cost;
        }
    }
}

/// Split search bound to one problem and device.
pub struct CoreSplitSearch<'a> {
    problem: &'a ConvProblem,
    platform: &'a PlatformInfo,
    cost: CostModel<'a>,
}

impl<'a> CoreSplitSearch<'a> {
    pub fn new(problem: &'a ConvProblem, platform: &'a PlatformInfo) -> Self {
        CoreSplitSearch { problem, platform, cost: CostModel::new(problem) }
    }

    /// Run mode selection, range construction, search and the utilization pass.
    pub fn decide(&self) -> TilingResult<NumBlocksResult> {
        let mode = self.select_mode()?;
        let ranges = self.build_ranges(mode);
        log::debug!(
            "split ranges ({:?}): batch={:?} m={:?} ho={:?} wo={:?} n={:?} do={:?} group={:?} spare_ho={:?}",
            mode, ranges.batch, ranges.m, ranges.ho, ranges.wo, ranges.n, ranges.dout, ranges.group,
            ranges.spare_ho
        );
        let mut res = self.search(mode, &ranges);
        if mode == TilingMode::HwSplit {
            self.fill_spare_ho(&mut res, &ranges);
        }
        log::debug!("split decision for {}: {}", self.problem.shape, res);
        Ok(res)
    }

    // ── Mode selection ──────────────────────────────────────────────

    /// M-split if its pre-check passes, else HW-split, else fail.
    pub fn select_mode(&self) -> TilingResult<TilingMode> {
        let m_err = match self.check_m_split() {
            Ok(()) => return Ok(TilingMode::MSplit),
            Err(e) => e,
        };
        let hw_err = match self.check_hw_split() {
            Ok(()) => {
                log::debug!("m-split rejected ({m_err}), using hw-split");
                return Ok(TilingMode::HwSplit);
            }
            Err(e) => e,
        };
        log::warn!("no feasible tiling mode for {}: m-split: {m_err}; hw-split: {hw_err}", self.problem.shape);
        Err(TilingError::NoFeasibleMode { m_split: m_err, hw_split: hw_err })
    }

    fn check_m_split(&self) -> Result<(), String> {
        let s = &self.problem.shape;
        let need = self.min_l1_bytes(TilingMode::MSplit);
        if need > self.platform.l1_size {
            return Err(format!("minimal L1 {need} > {}", self.platform.l1_size));
        }
        if s.wi > LOAD3D_WIN_LIMIT {
            return Err(format!("input width {} > load window limit {LOAD3D_WIN_LIMIT}", s.wi));
        }
        if self.problem.desc.fmap_format == FmapFormat::Ndhwc {
            let stride = s.ci.saturating_mul(s.hi).saturating_mul(s.wi).saturating_mul(self.problem.attr.dilation_d);
            if stride >= MAX_40_BIT {
                return Err(format!("depth stride {stride} exceeds 40-bit addressing"));
            }
        }
        Ok(())
    }

    fn check_hw_split(&self) -> Result<(), String> {
        let s = &self.problem.shape;
        let need = self.min_l1_bytes(TilingMode::HwSplit);
        if need > self.platform.l1_size {
            return Err(format!("minimal L1 {need} > {}", self.platform.l1_size));
        }
        let row_stride = s.wo.saturating_mul(s.co);
        if self.problem.desc.fmap_format == FmapFormat::Ndhwc && row_stride >= MAX_32_BIT {
            return Err(format!("output row stride {row_stride} exceeds 32-bit"));
        }
        Ok(())
    }

    /// L1 bytes needed by the smallest tile the mode can issue (one M0 tile,
    /// one N0 tile, one channel block of the kernel window).
    pub fn min_l1_bytes(&self, mode: TilingMode) -> u64 {
        let p = self.problem;
        let s = &p.shape;
        let (m0, k0, n0) = (p.params.m0, p.params.k0, p.params.n0);

        let bias = if p.stages_bias() { align_bytes(n0 * p.bias_size()) } else { 0 };
        let scale = if p.stages_scale() { align_bytes(n0 * p.desc.channel_wise_coeff * 2) } else { 0 };
        let (k_al1, k_bl1) = if p.desc.enable_c04 {
            (C04_CIN, align_up(C04_CIN * s.kh * s.kw, k0))
        } else {
            (k0, s.kh * s.kw * k0)
        };
        let weight = align_bytes(k_bl1 * n0 * p.weight_size());

        let fmap = match mode {
            TilingMode::MSplit => {
                let ho = (m0 / s.wo + 2).min(s.ho);
                align_bytes(p.infer_hi(ho) * s.wi * k_al1 * p.fmap_size())
            }
            TilingMode::HwSplit => {
                let ho = if s.wo < m0 { ceil_div(m0, s.wo) } else { 1 }.min(s.ho);
                align_bytes(p.infer_hi(ho) * p.infer_wi(m0) * k_al1 * p.fmap_size())
            }
        };
        fmap + weight + bias + scale
    }

    // ── Range construction ──────────────────────────────────────────

    pub fn build_ranges(&self, mode: TilingMode) -> SplitRanges {
        let p = self.problem;
        let s = &p.shape;
        let core = self.platform.core_num;
        let aic = factors(core, core);
        let mixed = |dim: u64| mix_factors(dim, &factors(dim, core), &aic);

        let batch = if s.batch >= BATCH_CORE_COEFF * core { aic.clone() } else { mixed(s.batch) };
        let co1 = p.params.co1;
        let n = if p.desc.enable_c04 { factors(co1, core) } else { mixed(co1) };
        let dout = if p.desc.fmap_format.has_depth() { mixed(s.dout) } else { vec![1] };
        let group = mixed(p.group.groups());

        let mut ranges = SplitRanges { batch, n, dout, group, ..Default::default() };
        match mode {
            TilingMode::MSplit => {
                ranges.m = mixed(ceil_div(s.out_hw(), p.params.m0));
                ranges.ho = vec![1];
                ranges.wo = vec![1];
            }
            TilingMode::HwSplit => {
                ranges.m = vec![1];
                ranges.ho = mixed(s.ho);
                if p.desc.conv1d {
                    ranges.wo = mixed(s.wo);
                } else {
                    ranges.wo = vec![1];
                    let min_burst = MIN_L2_BANDWIDTH / p.fmap_size();
                    if s.wo < min_burst {
                        let (valid, spare) = separate_ho(s.ho, &ranges.ho, min_burst / s.wo);
                        ranges.ho = valid;
                        ranges.spare_ho = spare;
                    }
                }
            }
        }
        ranges
    }

    // ── Search ──────────────────────────────────────────────────────

    /// Exhaustive odometer over the per-axis ranges.
    pub fn search(&self, mode: TilingMode, ranges: &SplitRanges) -> NumBlocksResult {
        let core_num = self.platform.core_num;
        let ones = SplitCandidate::ones();
        let mut best = Best { split: ones, cost: self.cost.cost(&ones, mode) };

        let axes = ranges.axes();
        if axes.iter().any(|r| r.is_empty()) {
            return NumBlocksResult { mode, split: best.split, min_cost: best.cost };
        }
        let mut idx = [0usize; AXES];
        'outer: loop {
            let cand = candidate_at(&axes, &idx);
            if cand.cores() <= core_num {
                best.offer(cand, self.cost.cost(&cand, mode), core_num);
            } else {
                // Innermost range is ascending: later values only grow the product.
                idx[AXES - 1] = axes[AXES - 1].len() - 1;
            }
            let mut axis = AXES;
            loop {
                if axis == 0 {
                    break 'outer;
                }
                axis -= 1;
                idx[axis] += 1;
                if idx[axis] < axes[axis].len() {
                    break;
                }
                idx[axis] = 0;
            }
        }
        NumBlocksResult { mode, split: best.split, min_cost: best.cost }
    }

    /// Raise the height split into the spare range while cores stay idle.
    fn fill_spare_ho(&self, res: &mut NumBlocksResult, ranges: &SplitRanges) {
        let core_num = self.platform.core_num;
        if res.cores() == core_num {
            return;
        }
        for &ho in &ranges.spare_ho {
            let trial = SplitCandidate { ho, ..res.split };
            if trial.cores() <= core_num && ho > res.split.ho {
                res.split.ho = ho;
            }
        }
    }
}

/// Split an ascending height range into splits whose per-core row count
/// reaches `min_rows` and the finer remainder.
fn separate_ho(ho: u64, range: &[u64], min_rows: u64) -> (Vec<u64>, Vec<u64>) {
    let (mut valid, mut spare): (Vec<u64>, Vec<u64>) =
        range.iter().partition(|&&v| ceil_div(ho, v) >= min_rows);
    if valid.is_empty() {
        valid.push(1);
        spare.retain(|&v| v != 1);
    }
    (valid, spare)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttrInfo, ConvDesc, ShapeInfo};

    fn problem_2d(batch: u64, ci: u64, co: u64, h: u64, w: u64, k: u64) -> ConvProblem {
        let attr = AttrInfo::conv2d(1, k / 2, 1);
        let shape = ShapeInfo::infer_2d([batch, ci, h, w], [co, k, k], &attr).unwrap();
        ConvProblem::new(shape, attr, ConvDesc::default()).unwrap()
    }

    #[test]
    fn test_m_split_selected_for_regular_shape() {
        let p = problem_2d(1, 64, 64, 56, 56, 3);
        let plat = PlatformInfo::default();
        let search = CoreSplitSearch::new(&p, &plat);
        assert_eq!(search.select_mode().unwrap(), TilingMode::MSplit);
    }

    #[test]
    fn test_wide_input_falls_back_to_hw_split() {
        let p = problem_2d(1, 16, 16, 2, 40000, 1);
        let plat = PlatformInfo::default();
        let search = CoreSplitSearch::new(&p, &plat);
        assert_eq!(search.select_mode().unwrap(), TilingMode::HwSplit);
    }

    #[test]
    fn test_no_feasible_mode_on_tiny_l1() {
        let p = problem_2d(1, 64, 64, 56, 56, 3);
        let plat = PlatformInfo { l1_size: 1024, ..Default::default() };
        let err = CoreSplitSearch::new(&p, &plat).decide().unwrap_err();
        assert!(matches!(err, TilingError::NoFeasibleMode { .. }), "{err}");
    }

    #[test]
    fn test_ranges_contain_one_and_respect_extent() {
        let p = problem_2d(3, 64, 48, 14, 14, 3);
        let plat = PlatformInfo::default();
        let search = CoreSplitSearch::new(&p, &plat);
        let r = search.build_ranges(TilingMode::MSplit);
        for range in r.axes() {
            assert_eq!(range.first(), Some(&1));
        }
        // batch 3 mixed with core factors <= 3
        assert_eq!(r.batch, vec![1, 2, 3]);
        // co1 = 3 mixed with core factors <= 3
        assert_eq!(r.n, vec![1, 2, 3]);
        assert_eq!(r.dout, vec![1]);
    }

    #[test]
    fn test_large_batch_reuses_core_factors() {
        let p = problem_2d(128, 16, 16, 8, 8, 1);
        let plat = PlatformInfo::default();
        let r = CoreSplitSearch::new(&p, &plat).build_ranges(TilingMode::MSplit);
        assert_eq!(r.batch, vec![1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_search_respects_core_budget() {
        let p = problem_2d(4, 64, 256, 28, 28, 3);
        let plat = PlatformInfo::default();
        let res = CoreSplitSearch::new(&p, &plat).decide().unwrap();
        eprintln!("{res}");
        assert!(res.cores() <= plat.core_num);
        let base = CostModel::new(&p).cost(&SplitCandidate::ones(), res.mode);
        assert!(res.min_cost <= base);
    }

    #[test]
    fn test_tie_break_prefers_utilization_then_batch() {
        let mut best = Best { split: SplitCandidate::ones(), cost: 10 };
        let full = SplitCandidate { m: 8, ..SplitCandidate::ones() };
        best.offer(full, 10, 8);
        assert_eq!(best.split, full);

        let batch_full = SplitCandidate { batch: 8, ..SplitCandidate::ones() };
        best.offer(batch_full, 10, 8);
        assert_eq!(best.split, batch_full);

        // higher cost never wins
        best.offer(SplitCandidate { batch: 8, dout: 1, n: 1, ..SplitCandidate::ones() }, 11, 8);
        assert_eq!(best.cost, 10);
    }

    #[test]
    fn test_separate_ho() {
        let range = [1, 2, 4, 8, 16];
        // 16 rows, need at least 4 rows per core
        let (valid, spare) = separate_ho(16, &range, 4);
        assert_eq!(valid, vec![1, 2, 4]);
        assert_eq!(spare, vec![8, 16]);

        let (valid, spare) = separate_ho(2, &[1, 2], 4);
        assert_eq!(valid, vec![1]);
        assert_eq!(spare, vec![2]);
    }

    #[test]
    fn test_spare_ho_fills_idle_cores() {
        let p = problem_2d(1, 16, 16, 40000, 4, 1);
        let plat = PlatformInfo { core_num: 8, ..Default::default() };
        let search = CoreSplitSearch::new(&p, &plat);
        let ranges = SplitRanges {
            batch: vec![1],
            m: vec![1],
            ho: vec![1, 2],
            wo: vec![1],
            n: vec![1],
            dout: vec![1],
            group: vec![1],
            spare_ho: vec![4, 8, 16],
        };
        let mut res = NumBlocksResult {
            mode: TilingMode::HwSplit,
            split: SplitCandidate { ho: 2, ..SplitCandidate::ones() },
            min_cost: 0,
        };
        search.fill_spare_ho(&mut res, &ranges);
        assert_eq!(res.split.ho, 8);
    }
}

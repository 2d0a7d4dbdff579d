//! Derived per-run constants: cube tile sizes, channel tiles, group mode.

use serde::{Deserialize, Serialize};

use crate::error::{TilingError, TilingResult};
use crate::tiling::math::ceil_div;
use crate::types::{AttrInfo, ConvDesc, DType, OptGroupInfo, ShapeInfo};

// ── Tuning constants ────────────────────────────────────────────────

/// Effective bytes moved per cost unit; divides the data-movement terms.
pub const MIN_L2_BANDWIDTH: u64 = 128;
/// Weight bandwidth derating: strided channels-first weight.
pub const BW_COEFF: u64 = 4;
/// Weight bandwidth derating: packed/contiguous weight.
pub const BW_COEFF_PACKED: u64 = 1;
/// Weight bandwidth derating: channels-last 4-channel packed path.
pub const BW_COEFF_C04: u64 = 2;
/// Batch at least this many times the core count reuses the core factors.
pub const BATCH_CORE_COEFF: u64 = 2;
/// Widest input row the M-split image-to-column load accepts.
pub const LOAD3D_WIN_LIMIT: u64 = 32767;
pub const MAX_40_BIT: u64 = 1 << 40;
pub const MAX_32_BIT: u64 = 1 << 32;
/// Input channels per packed block on the C04 path.
pub const C04_CIN: u64 = 4;
pub const C04_CI1: u64 = 1;
/// Largest K tile the compute buffers address in one pass.
pub const KL0_LIMIT: u64 = 4096;
pub const DOUBLE_BUFFER: u64 = 2;

/// Minimum atomic tile of the cube unit for one input dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CubeTile {
    pub m0: u64,
    pub k0: u64,
    pub n0: u64,
}

impl CubeTile {
    pub const fn for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::F16 | DType::BF16 => CubeTile { m0: 16, k0: 16, n0: 16 },
            DType::F32 => CubeTile { m0: 16, k0: 8, n0: 16 },
            DType::Int8 => CubeTile { m0: 16, k0: 32, n0: 16 },
        }
    }
}

/// How groups are mapped onto the cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupMode {
    /// Single group.
    Normal,
    /// Each original group is a separate matmul.
    Original { groups: u64, ci_per_group: u64, co_per_group: u64 },
    /// Groups folded into `group_opt` wider groups with a block-diagonal weight.
    Optimized(OptGroupInfo),
}

impl GroupMode {
    /// Resolve the effective group mode. `groups == 1` is always `Normal`,
    /// whichever path the caller used to express it.
    pub fn resolve(shape: &ShapeInfo, attr: &AttrInfo) -> Self {
        if attr.groups <= 1 {
            return GroupMode::Normal;
        }
        match attr.opt_group {
            Some(opt) => GroupMode::Optimized(opt),
            None => GroupMode::Original {
                groups: attr.groups,
                ci_per_group: shape.ci / attr.groups,
                co_per_group: shape.co / attr.groups,
            },
        }
    }

    /// Number of independent groups the search may split.
    pub fn groups(&self) -> u64 {
        match self {
            GroupMode::Normal => 1,
            GroupMode::Original { groups, .. } => *groups,
            GroupMode::Optimized(opt) => opt.group_opt,
        }
    }

    /// Input channels seen by one group's matmul.
    pub fn ci(&self, shape: &ShapeInfo) -> u64 {
        match self {
            GroupMode::Normal => shape.ci,
            GroupMode::Original { ci_per_group, .. } => *ci_per_group,
            GroupMode::Optimized(opt) => opt.cin_opt,
        }
    }

    /// Output channels produced by one group's matmul.
    pub fn co(&self, shape: &ShapeInfo) -> u64 {
        match self {
            GroupMode::Normal => shape.co,
            GroupMode::Original { co_per_group, .. } => *co_per_group,
            GroupMode::Optimized(opt) => opt.cout_opt,
        }
    }

    pub fn is_optimized(&self) -> bool {
        matches!(self, GroupMode::Optimized(_))
    }

    /// Two-bit class used in the tiling key.
    pub const fn key_bits(&self) -> u32 {
        match self {
            GroupMode::Normal => 0,
            GroupMode::Original { .. } => 1,
            GroupMode::Optimized(_) => 2,
        }
    }
}

/// Values derived once per run from shape, attributes and the cube table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstParams {
    pub m0: u64,
    pub k0: u64,
    pub n0: u64,
    /// Per-group input channels in K0 tiles.
    pub ci1: u64,
    /// Per-group output channels in N0 tiles.
    pub co1: u64,
}

impl ConstParams {
    pub fn new(shape: &ShapeInfo, group_mode: &GroupMode, desc: &ConvDesc) -> Self {
        let tile = CubeTile::for_dtype(desc.fmap_dtype);
        ConstParams {
            m0: tile.m0,
            k0: tile.k0,
            n0: tile.n0,
            ci1: ceil_div(group_mode.ci(shape), tile.k0),
            co1: ceil_div(group_mode.co(shape), tile.n0),
        }
    }
}

/// One validated convolution with its derived constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvProblem {
    pub shape: ShapeInfo,
    pub attr: AttrInfo,
    pub desc: ConvDesc,
    pub group: GroupMode,
    pub params: ConstParams,
}

impl ConvProblem {
    /// Validate inputs and derive group mode and cube constants.
    pub fn new(shape: ShapeInfo, attr: AttrInfo, desc: ConvDesc) -> TilingResult<Self> {
        shape.validate(&attr)?;
        let group = GroupMode::resolve(&shape, &attr);
        if desc.enable_c04 && group.ci(&shape) > C04_CIN {
            return Err(TilingError::InvalidShape(format!(
                "C04 path needs at most {C04_CIN} input channels per group, got {}",
                group.ci(&shape)
            )));
        }
        let params = ConstParams::new(&shape, &group, &desc);
        Ok(ConvProblem { shape, attr, desc, group, params })
    }

    /// Per-group input channels.
    pub fn cur_ci(&self) -> u64 {
        self.group.ci(&self.shape)
    }

    /// Per-group output channels.
    pub fn cur_co(&self) -> u64 {
        self.group.co(&self.shape)
    }

    /// Input rows needed for `ho` output rows.
    pub fn infer_hi(&self, ho: u64) -> u64 {
        crate::tiling::math::infer_in_extent(
            ho,
            self.attr.stride_h,
            self.shape.kh,
            self.attr.dilation_h,
            self.shape.hi,
        )
    }

    /// Input columns needed for `wo` output columns.
    pub fn infer_wi(&self, wo: u64) -> u64 {
        crate::tiling::math::infer_in_extent(
            wo,
            self.attr.stride_w,
            self.shape.kw,
            self.attr.dilation_w,
            self.shape.wi,
        )
    }

    pub fn fmap_size(&self) -> u64 {
        self.desc.fmap_dtype.size_bytes()
    }

    pub fn weight_size(&self) -> u64 {
        self.desc.weight_dtype.size_bytes()
    }

    pub fn bias_size(&self) -> u64 {
        self.desc.bias_dtype.size_bytes()
    }

    /// Whether bias is staged through L1.
    pub fn stages_bias(&self) -> bool {
        self.desc.has_bias && !self.desc.skips_l1_scale_bias()
    }

    /// Whether per-channel scale coefficients are staged through L1.
    pub fn stages_scale(&self) -> bool {
        self.desc.channel_wise_coeff > 0 && !self.desc.skips_l1_scale_bias()
    }
}

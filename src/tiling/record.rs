//! Final tiling record and the kernel-variant discriminant.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tiling::cost::TilingMode;
use crate::tiling::math::align_up;
use crate::tiling::memory::{FullLoadMode, IterOrder, L1PlanResult, SingleCoreShape};
use crate::tiling::numblocks::NumBlocksResult;
use crate::tiling::params::{ConvProblem, GroupMode, C04_CIN};
use crate::types::{DType, WeightFormat};

/// Scratch memory reserved for the runtime on every launch.
pub const SYSTEM_WORKSPACE_BYTES: u64 = 16 * 1024 * 1024;

// Key layout, low bit first:
//   [0:2)  dtype class     [2:4) full-load mode   [4:6) group mode
//   [6]    tiling mode     [7]   iteration order  [8:10) L1 ping-pong
//   [10]   C04             [11]  L0C ping-pong
const DTYPE_SHIFT: u32 = 0;
const FULL_LOAD_SHIFT: u32 = 2;
const GROUP_SHIFT: u32 = 4;
const MODE_SHIFT: u32 = 6;
const ITER_SHIFT: u32 = 7;
const L1_PB_SHIFT: u32 = 8;
const C04_SHIFT: u32 = 10;
const L0C_PB_SHIFT: u32 = 11;

/// Integer used by kernel dispatch to pick a compiled variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilingKey(pub u32);

/// Unpacked view of a `TilingKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingKeyFields {
    pub dtype_class: u32,
    pub full_load: FullLoadMode,
    pub group: u32,
    pub mode: TilingMode,
    pub iter_order: IterOrder,
    pub l1_ping_pong: u32,
    pub c04: bool,
    pub l0c_ping_pong: bool,
}

pub const fn dtype_class(dtype: DType) -> u32 {
    match dtype {
        DType::F16 | DType::BF16 => 0,
        DType::F32 => 1,
        DType::Int8 => 2,
    }
}

impl TilingKey {
    pub fn encode(f: &TilingKeyFields) -> Self {
        let mode = match f.mode {
            TilingMode::MSplit => 0,
            TilingMode::HwSplit => 1,
        };
        let iter = match f.iter_order {
            IterOrder::MFirst => 0,
            IterOrder::NFirst => 1,
        };
        TilingKey(
            (f.dtype_class & 0b11) << DTYPE_SHIFT
                | f.full_load.key_bits() << FULL_LOAD_SHIFT
                | (f.group & 0b11) << GROUP_SHIFT
                | mode << MODE_SHIFT
                | iter << ITER_SHIFT
                | (f.l1_ping_pong & 0b11) << L1_PB_SHIFT
                | (f.c04 as u32) << C04_SHIFT
                | (f.l0c_ping_pong as u32) << L0C_PB_SHIFT,
        )
    }

    pub fn decode(self) -> TilingKeyFields {
        let bits = |shift: u32, width: u32| (self.0 >> shift) & ((1 << width) - 1);
        TilingKeyFields {
            dtype_class: bits(DTYPE_SHIFT, 2),
            full_load: match bits(FULL_LOAD_SHIFT, 2) {
                0 => FullLoadMode::AllFullLoad,
                1 => FullLoadMode::FullLoadInput,
                2 => FullLoadMode::FullLoadWeight,
                _ => FullLoadMode::NoneFullLoad,
            },
            group: bits(GROUP_SHIFT, 2),
            mode: if bits(MODE_SHIFT, 1) == 0 { TilingMode::MSplit } else { TilingMode::HwSplit },
            iter_order: if bits(ITER_SHIFT, 1) == 0 { IterOrder::MFirst } else { IterOrder::NFirst },
            l1_ping_pong: bits(L1_PB_SHIFT, 2),
            c04: bits(C04_SHIFT, 1) == 1,
            l0c_ping_pong: bits(L0C_PB_SHIFT, 1) == 1,
        }
    }
}

impl fmt::Display for TilingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Everything kernel launch needs from the optimizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingRecord {
    pub group: GroupMode,
    pub num_blocks: NumBlocksResult,
    pub single_core: SingleCoreShape,
    pub plan: L1PlanResult,
    pub key: TilingKey,
    pub workspace_bytes: u64,
}

impl TilingRecord {
    /// Package the split and the memory plan.
    pub fn assemble(
        problem: &ConvProblem,
        num_blocks: NumBlocksResult,
        single_core: SingleCoreShape,
        plan: L1PlanResult,
    ) -> Self {
        let key = TilingKey::encode(&TilingKeyFields {
            dtype_class: dtype_class(problem.desc.fmap_dtype),
            full_load: plan.full_load,
            group: problem.group.key_bits(),
            mode: num_blocks.mode,
            iter_order: plan.iter_order,
            l1_ping_pong: plan.db.l1_key_bits(),
            c04: problem.desc.enable_c04,
            l0c_ping_pong: plan.db.cl0,
        });
        TilingRecord {
            group: problem.group,
            num_blocks,
            single_core,
            plan,
            key,
            workspace_bytes: workspace_bytes(problem),
        }
    }

    /// Cores the kernel is launched on.
    pub fn used_cores(&self) -> u64 {
        self.num_blocks.cores()
    }
}

impl fmt::Display for TilingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "key={} cores={} workspace={}B", self.key, self.used_cores(), self.workspace_bytes)?;
        writeln!(f, "  split: {}", self.num_blocks)?;
        write!(f, "  plan:  {}", self.plan)
    }
}

/// Runtime reserve plus weight re-layout scratch for the folded-group and
/// C04 paths.
pub fn workspace_bytes(p: &ConvProblem) -> u64 {
    let s = &p.shape;
    let (k0, n0) = (p.params.k0, p.params.n0);
    let wsize = p.weight_size();
    let relayout = match p.group {
        GroupMode::Optimized(opt) => {
            opt.group_opt * s.kd * s.kh * s.kw * align_up(opt.cin_opt, k0) * align_up(opt.cout_opt, n0) * wsize
        }
        _ if p.desc.enable_c04 && p.desc.weight_format != WeightFormat::FractalZC04 => {
            p.group.groups() * s.kd * align_up(C04_CIN * s.kh * s.kw, k0) * align_up(p.cur_co(), n0) * wsize
        }
        _ => 0,
    };
    SYSTEM_WORKSPACE_BYTES + relayout
}

//! conv-tiling: compile-time tiling optimizer for convolution on many-core
//! accelerators.
//!
//! Given a convolution's shape/attributes and a device's core count and
//! on-chip buffer capacities, decides:
//! - **Core split**: how many cores work on batch, spatial, output-channel,
//!   depth and group slices (cost-model driven exhaustive search)
//! - **Memory tiling**: which tensors stay resident in L1, the L1/L0 tile
//!   sizes, double buffering and vector post-processing splits
//! - **Dispatch key**: a small integer selecting the compiled kernel variant
//!
//! # Quick Start
//!
//! ```ignore
//! use conv_tiling::{tile_conv, AttrInfo, ConvDesc, PlatformInfo, TilingRequest};
//!
//! let req = TilingRequest::conv2d([8, 64, 56, 56], [64, 3, 3], AttrInfo::conv2d(1, 1, 1), ConvDesc::default())?;
//! let record = tile_conv(&req, &PlatformInfo::default())?;
//! println!("{record}");
//! ```

pub mod error;
pub mod platform;
pub mod tiling;
pub mod types;

pub use error::{TilingError, TilingResult};
pub use platform::{platform_info, PlatformInfo};
pub use tiling::{
    tile_conv, CoreSplitSearch, CostModel, FullLoadMode, L1PlanResult, MemoryTilingPlanner,
    NumBlocksResult, SplitCandidate, TilingCache, TilingEngine, TilingKey, TilingMode, TilingRecord,
    TilingRequest,
};
pub use types::{AttrInfo, ConvDesc, DType, FmapFormat, OptGroupInfo, ShapeInfo, WeightFormat};

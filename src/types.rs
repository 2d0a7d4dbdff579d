//! Operator descriptors consumed by the tiling optimizer.
//!
//! `ShapeInfo` and `AttrInfo` describe one convolution instance; `ConvDesc`
//! carries the dtype/layout flags that steer the cost model and the memory
//! planner. All three are immutable for the duration of a tiling run.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TilingError, TilingResult};

/// Data type for tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    Int8,
}

impl DType {
    /// Size in bytes per element.
    pub const fn size_bytes(self) -> u64 {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::Int8 => 1,
        }
    }

    /// Size of the cube accumulator element for this input dtype.
    ///
    /// Float inputs accumulate in fp32, int8 in int32.
    pub const fn mad_size_bytes(self) -> u64 {
        4
    }
}

/// Feature-map memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FmapFormat {
    Nchw,
    Nhwc,
    Ncdhw,
    Ndhwc,
}

impl FmapFormat {
    /// Whether the layout carries a depth axis.
    pub const fn has_depth(self) -> bool {
        matches!(self, Self::Ncdhw | Self::Ndhwc)
    }

    /// Whether channels are the innermost axis.
    pub const fn channels_last(self) -> bool {
        matches!(self, Self::Nhwc | Self::Ndhwc)
    }
}

/// Weight memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightFormat {
    /// Plain `[co, ci, (kd,) kh, kw]` or its channels-last variant.
    Plain,
    /// Cube-native fractal layout, already packed for the B operand.
    FractalZ,
    /// Fractal layout with 4-channel input packing.
    FractalZC04,
}

impl WeightFormat {
    pub const fn is_packed(self) -> bool {
        matches!(self, Self::FractalZ | Self::FractalZC04)
    }
}

/// Folded-group parameters: `group_opt` groups of `cin_opt`/`cout_opt`
/// channels each, produced by merging several original groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OptGroupInfo {
    pub group_opt: u64,
    pub cin_opt: u64,
    pub cout_opt: u64,
}

/// Convolution attributes. Padding is `[head, tail, top, bottom, left, right]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttrInfo {
    pub stride_d: u64,
    pub stride_h: u64,
    pub stride_w: u64,
    pub dilation_d: u64,
    pub dilation_h: u64,
    pub dilation_w: u64,
    pub pads: [u64; 6],
    pub groups: u64,
    /// Present when the caller folded groups for the optimized group path.
    pub opt_group: Option<OptGroupInfo>,
}

impl Default for AttrInfo {
    fn default() -> Self {
        AttrInfo {
            stride_d: 1,
            stride_h: 1,
            stride_w: 1,
            dilation_d: 1,
            dilation_h: 1,
            dilation_w: 1,
            pads: [0; 6],
            groups: 1,
            opt_group: None,
        }
    }
}

impl AttrInfo {
    /// 2-D attributes with symmetric padding.
    pub fn conv2d(stride: u64, pad: u64, dilation: u64) -> Self {
        AttrInfo {
            stride_h: stride,
            stride_w: stride,
            dilation_h: dilation,
            dilation_w: dilation,
            pads: [0, 0, pad, pad, pad, pad],
            ..Default::default()
        }
    }

    fn check_positive(&self) -> TilingResult<()> {
        let checks: [(u64, &'static str); 6] = [
            (self.stride_d, "stride_d"),
            (self.stride_h, "stride_h"),
            (self.stride_w, "stride_w"),
            (self.dilation_d, "dilation_d"),
            (self.dilation_h, "dilation_h"),
            (self.dilation_w, "dilation_w"),
        ];
        for (v, name) in checks {
            if v == 0 {
                return Err(TilingError::ArithmeticDegenerate(name));
            }
        }
        if self.groups == 0 {
            return Err(TilingError::ArithmeticDegenerate("groups"));
        }
        Ok(())
    }
}

/// Output extent of one spatial axis.
///
/// `(input + pad_a + pad_b - dilation * (k - 1) - 1) / stride + 1`
pub fn conv_out_dim(
    input: u64,
    pad_a: u64,
    pad_b: u64,
    kernel: u64,
    stride: u64,
    dilation: u64,
    axis: &'static str,
) -> TilingResult<u64> {
    if stride == 0 {
        return Err(TilingError::ArithmeticDegenerate("stride"));
    }
    if input == 0 || kernel == 0 {
        return Err(TilingError::InvalidShape(format!("{axis}: zero input or kernel extent")));
    }
    let overflow = || TilingError::InvalidShape(format!("{axis}: extent overflows u64"));
    let padded = input.checked_add(pad_a).and_then(|v| v.checked_add(pad_b)).ok_or_else(overflow)?;
    let window = dilation
        .checked_mul(kernel - 1)
        .and_then(|v| v.checked_add(1))
        .ok_or_else(overflow)?;
    if padded < window {
        return Err(TilingError::InvalidShape(format!(
            "{axis}: dilated kernel {window} exceeds padded input {padded}"
        )));
    }
    Ok((padded - window) / stride + 1)
}

/// Convolution problem extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeInfo {
    pub batch: u64,
    /// Input channels (all groups).
    pub ci: u64,
    /// Output channels (all groups).
    pub co: u64,
    pub di: u64,
    pub hi: u64,
    pub wi: u64,
    pub dout: u64,
    pub ho: u64,
    pub wo: u64,
    pub kd: u64,
    pub kh: u64,
    pub kw: u64,
}

impl ShapeInfo {
    /// Build a shape from NCDHW input dims and `[co, kd, kh, kw]` kernel dims,
    /// inferring output extents from `attr`.
    pub fn infer(input: [u64; 5], kernel: [u64; 4], attr: &AttrInfo) -> TilingResult<Self> {
        attr.check_positive()?;
        let [batch, ci, di, hi, wi] = input;
        let [co, kd, kh, kw] = kernel;
        let p = attr.pads;
        let dout = conv_out_dim(di, p[0], p[1], kd, attr.stride_d, attr.dilation_d, "depth")?;
        let ho = conv_out_dim(hi, p[2], p[3], kh, attr.stride_h, attr.dilation_h, "height")?;
        let wo = conv_out_dim(wi, p[4], p[5], kw, attr.stride_w, attr.dilation_w, "width")?;
        let shape = ShapeInfo { batch, ci, co, di, hi, wi, dout, ho, wo, kd, kh, kw };
        shape.validate(attr)?;
        Ok(shape)
    }

    /// 2-D convenience: NCHW input, `[co, kh, kw]` kernel.
    pub fn infer_2d(input: [u64; 4], kernel: [u64; 3], attr: &AttrInfo) -> TilingResult<Self> {
        let [n, c, h, w] = input;
        let [co, kh, kw] = kernel;
        Self::infer([n, c, 1, h, w], [co, 1, kh, kw], attr)
    }

    /// Fail fast on zero or inconsistent extents.
    pub fn validate(&self, attr: &AttrInfo) -> TilingResult<()> {
        attr.check_positive()?;
        let dims = [
            (self.batch, "batch"),
            (self.ci, "ci"),
            (self.co, "co"),
            (self.di, "di"),
            (self.hi, "hi"),
            (self.wi, "wi"),
            (self.dout, "dout"),
            (self.ho, "ho"),
            (self.wo, "wo"),
            (self.kd, "kd"),
            (self.kh, "kh"),
            (self.kw, "kw"),
        ];
        if let Some((_, name)) = dims.iter().find(|(v, _)| *v == 0) {
            return Err(TilingError::InvalidShape(format!("{name} is zero")));
        }
        let volume = [self.batch, self.dout, self.ho, self.wo, self.co]
            .iter()
            .try_fold(1u64, |acc, &v| acc.checked_mul(v));
        if volume.is_none() {
            return Err(TilingError::InvalidShape(format!("output volume of {self} overflows u64")));
        }
        if self.ci % attr.groups != 0 || self.co % attr.groups != 0 {
            return Err(TilingError::InvalidShape(format!(
                "channels ci={} co={} not divisible by groups={}",
                self.ci, self.co, attr.groups
            )));
        }
        if let Some(opt) = attr.opt_group {
            if opt.group_opt == 0 || opt.cin_opt == 0 || opt.cout_opt == 0 {
                return Err(TilingError::InvalidShape("optimized group params must be positive".into()));
            }
            if opt.group_opt > attr.groups {
                return Err(TilingError::InvalidShape(format!(
                    "group_opt={} exceeds groups={}",
                    opt.group_opt, attr.groups
                )));
            }
        }
        Ok(())
    }

    /// Output spatial size per depth slice.
    pub fn out_hw(&self) -> u64 {
        self.ho * self.wo
    }
}

impl fmt::Display for ShapeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n{}_ci{}_co{}_i{}x{}x{}_o{}x{}x{}_k{}x{}x{}",
            self.batch, self.ci, self.co, self.di, self.hi, self.wi, self.dout, self.ho, self.wo,
            self.kd, self.kh, self.kw
        )
    }
}

/// Dtype, layout and feature flags of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvDesc {
    pub fmap_dtype: DType,
    pub weight_dtype: DType,
    pub bias_dtype: DType,
    pub out_dtype: DType,
    pub fmap_format: FmapFormat,
    pub weight_format: WeightFormat,
    pub has_bias: bool,
    /// Output is requantized on the vector unit.
    pub quant: bool,
    /// Per-channel coefficients staged in L1 for the fixpipe (scale, offset...).
    pub channel_wise_coeff: u64,
    /// 4-channel packed input fast path.
    pub enable_c04: bool,
    /// 1-D convolution: width may be split across cores.
    pub conv1d: bool,
}

impl Default for ConvDesc {
    fn default() -> Self {
        ConvDesc {
            fmap_dtype: DType::F16,
            weight_dtype: DType::F16,
            bias_dtype: DType::F32,
            out_dtype: DType::F16,
            fmap_format: FmapFormat::Nchw,
            weight_format: WeightFormat::Plain,
            has_bias: false,
            quant: false,
            channel_wise_coeff: 0,
            enable_c04: false,
            conv1d: false,
        }
    }
}

impl ConvDesc {
    /// int8 input/weight with requantized int8 output.
    pub fn int8_quant() -> Self {
        ConvDesc {
            fmap_dtype: DType::Int8,
            weight_dtype: DType::Int8,
            bias_dtype: DType::F32,
            out_dtype: DType::Int8,
            quant: true,
            channel_wise_coeff: 1,
            ..Default::default()
        }
    }

    /// Bias/scale staging in L1 is skipped for channels-first int8 without requant.
    pub fn skips_l1_scale_bias(&self) -> bool {
        !self.fmap_format.channels_last() && self.fmap_dtype == DType::Int8 && !self.quant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_dim_basic() {
        assert_eq!(conv_out_dim(224, 3, 3, 7, 2, 1, "h").unwrap(), 112);
        assert_eq!(conv_out_dim(56, 1, 1, 3, 1, 1, "h").unwrap(), 56);
        assert_eq!(conv_out_dim(56, 0, 0, 3, 1, 2, "h").unwrap(), 52);
    }

    #[test]
    fn test_zero_stride_is_degenerate() {
        let r = conv_out_dim(8, 0, 0, 3, 0, 1, "h");
        assert!(matches!(r, Err(TilingError::ArithmeticDegenerate(_))));

        let attr = AttrInfo { stride_h: 0, ..Default::default() };
        let r = ShapeInfo::infer_2d([1, 16, 8, 8], [16, 3, 3], &attr);
        assert!(matches!(r, Err(TilingError::ArithmeticDegenerate("stride_h"))));
    }

    #[test]
    fn test_kernel_larger_than_input() {
        let r = ShapeInfo::infer_2d([1, 16, 2, 2], [16, 5, 5], &AttrInfo::default());
        assert!(matches!(r, Err(TilingError::InvalidShape(_))));
    }

    #[test]
    fn test_huge_extents_fail_cleanly() {
        let r = conv_out_dim(u64::MAX, 1, 0, 3, 1, 1, "w");
        assert!(matches!(r, Err(TilingError::InvalidShape(_))), "{r:?}");
        let r = conv_out_dim(8, 0, 0, 3, 1, u64::MAX, "w");
        assert!(matches!(r, Err(TilingError::InvalidShape(_))), "{r:?}");

        let r = ShapeInfo::infer_2d([1, 16, u64::MAX / 2, u64::MAX / 2], [16, 1, 1], &AttrInfo::default());
        assert!(matches!(r, Err(TilingError::InvalidShape(_))), "{r:?}");
    }

    #[test]
    fn test_groups_must_divide_channels() {
        let attr = AttrInfo { groups: 3, ..Default::default() };
        let r = ShapeInfo::infer_2d([1, 16, 8, 8], [16, 3, 3], &attr);
        assert!(matches!(r, Err(TilingError::InvalidShape(_))));
    }

    #[test]
    fn test_infer_3d() {
        let attr = AttrInfo { pads: [1, 1, 1, 1, 1, 1], ..Default::default() };
        let s = ShapeInfo::infer([2, 32, 8, 16, 16], [64, 3, 3, 3], &attr).unwrap();
        assert_eq!((s.dout, s.ho, s.wo), (8, 16, 16));
        assert_eq!(format!("{s}"), "n2_ci32_co64_i8x16x16_o8x16x16_k3x3x3");
    }

    #[test]
    fn test_skip_scale_bias() {
        assert!(!ConvDesc::default().skips_l1_scale_bias());
        let d = ConvDesc { quant: false, ..ConvDesc::int8_quant() };
        assert!(d.skips_l1_scale_bias());
        assert!(!ConvDesc::int8_quant().skips_l1_scale_bias());
    }
}

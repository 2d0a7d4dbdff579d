//! Integer helpers shared by the search and the memory planner.

/// Buffer alignment unit in bytes.
pub const ALIGN_BYTES: u64 = 32;

/// `⌈a / b⌉`.
///
/// Divisors reaching this point come from validated shapes, factor sets or
/// the cube tile table and are never zero.
#[inline]
pub fn ceil_div(a: u64, b: u64) -> u64 {
    debug_assert!(b != 0, "ceil_div by zero");
    a.div_ceil(b)
}

/// Round `a` up to a multiple of `b`.
#[inline]
pub fn align_up(a: u64, b: u64) -> u64 {
    ceil_div(a, b) * b
}

/// Round a byte count up to `ALIGN_BYTES`.
#[inline]
pub fn align_bytes(bytes: u64) -> u64 {
    align_up(bytes, ALIGN_BYTES)
}

/// Saturating product; cost terms may multiply many large extents.
#[inline]
pub fn prod(xs: &[u64]) -> u64 {
    xs.iter().fold(1u64, |acc, &x| acc.saturating_mul(x))
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Input extent needed to produce `out` output rows/cols, clamped to the
/// original input extent.
#[inline]
pub fn infer_in_extent(out: u64, stride: u64, kernel: u64, dilation: u64, org_in: u64) -> u64 {
    let needed = out.saturating_sub(1) * stride + (kernel - 1) * dilation + 1;
    needed.min(org_in)
}

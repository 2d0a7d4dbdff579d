//! Candidate split values for one dimension.
//!
//! `factors` enumerates divisors, `mix_factors` widens a dimension's own
//! divisors with factors of the core count so the search can also try
//! uneven splits whose tail core does less work.

/// Sorted divisors of `n` that are `<= max`. Empty for `n == 0`.
pub fn factors(n: u64, max: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut i = 1u64;
    while i <= n / i {
        if n % i == 0 {
            if i <= max {
                out.push(i);
            }
            let pair = n / i;
            if pair != i && pair <= max {
                out.push(pair);
            }
        }
        i += 1;
    }
    out.sort_unstable();
    out
}

/// `own ∪ {v ∈ reference : v <= org_dim}`, sorted and deduplicated.
pub fn mix_factors(org_dim: u64, own: &[u64], reference: &[u64]) -> Vec<u64> {
    let mut out: Vec<u64> = own
        .iter()
        .copied()
        .chain(reference.iter().copied().filter(|&v| v <= org_dim))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Divisors of `n` plus powers of two, all `<= min(n, max)`.
///
/// Used for L0 tile ranges where power-of-two tiles map well onto the cube
/// even when they leave a tail. Falls back to `[1]` so callers always get a
/// non-empty range.
pub fn factors_with_pow2(n: u64, max: u64) -> Vec<u64> {
    let bound = n.min(max);
    let mut out = factors(n, bound);
    let mut p = 1u64;
    while p <= bound {
        out.push(p);
        p *= 2;
    }
    out.sort_unstable();
    out.dedup();
    if out.is_empty() {
        out.push(1);
    }
    out
}

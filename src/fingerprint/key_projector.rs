// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Key Projector (KP) — projects a fixed-width window of segment sizes into
//! a lower-dimensional key by equal-partition summation.
//!
//! Grounded in `original_source/db.py::_create_kd_key`, which reshapes the
//! window into `(k, w/k)` and sums along the trailing axis; the "Weird
//! enough but there was a bug here!" comment in that function is exactly the
//! off-by-one the `DimensionError` check below exists to prevent up front.

use crate::error::{IdError, Result};

/// Project `window` (width `w = window.len()`) into a `k`-vector by summing
/// the `k` consecutive chunks of length `w/k`. If `w == k` the projection is
/// the identity.
pub fn project(window: &[u32], k: usize) -> Result<Vec<u32>> {
    let w = window.len();
    check_dims(w, k)?;
    let mut out = vec![0u32; k];
    project_into(window, &mut out)?;
    Ok(out)
}

/// Zero-allocation variant for the identifier's hot path: writes into a
/// caller-supplied buffer of length `k`.
pub fn project_into(window: &[u32], out: &mut [u32]) -> Result<()> {
    let w = window.len();
    let k = out.len();
    check_dims(w, k)?;

    if w == k {
        out.copy_from_slice(window);
        return Ok(());
    }

    let chunk = w / k;
    for (j, slot) in out.iter_mut().enumerate() {
        let start = j * chunk;
        *slot = window[start..start + chunk].iter().sum();
    }
    Ok(())
}

fn check_dims(w: usize, k: usize) -> Result<()> {
    if k > w || w % k != 0 {
        return Err(IdError::Dimension { w, k });
    }
    Ok(())
}

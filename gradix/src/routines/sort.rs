//! Host sorting routines: stable sort and argsort along one axis.

use std::cmp::Ordering;

use gradix_ir::{DType, Scalar};

use crate::backend::{read_scalar, write_scalar};
use crate::error::{Error, Result};

/// Total order used by both sort routines: ascending, NaN after numbers.
fn total_cmp(a: Scalar, b: Scalar) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.to_f64().partial_cmp(&b.to_f64()).unwrap_or(Ordering::Equal),
    }
}

struct AxisLanes {
    n: usize,
    inner: usize,
    lanes: usize,
}

fn lanes(shape: &[usize], axis: usize) -> Result<AxisLanes> {
    if shape.is_empty() {
        return Err(Error::ScalarRank { op: "sort" });
    }
    if axis >= shape.len() {
        return Err(Error::AxisOutOfBounds {
            axis: axis as i64,
            rank: shape.len(),
        });
    }
    let n = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let outer: usize = shape[..axis].iter().product();
    Ok(AxisLanes {
        n,
        inner,
        lanes: outer * inner,
    })
}

fn lane_offsets(l: &AxisLanes, lane: usize) -> impl Iterator<Item = usize> + '_ {
    let outer = lane / l.inner;
    let rem = lane % l.inner;
    let base = outer * l.n * l.inner + rem;
    (0..l.n).map(move |i| base + i * l.inner)
}

/// Ascending stable sort along `axis`.
pub fn sort_host(bytes: &[u8], shape: &[usize], dtype: DType, axis: usize) -> Result<Vec<u8>> {
    let l = lanes(shape, axis)?;
    let mut out = bytes.to_vec();
    let mut lane_vals: Vec<Scalar> = Vec::with_capacity(l.n);
    for lane in 0..l.lanes {
        lane_vals.clear();
        for off in lane_offsets(&l, lane) {
            lane_vals.push(read_scalar(bytes, off, dtype));
        }
        lane_vals.sort_by(|&a, &b| total_cmp(a, b));
        for (i, off) in lane_offsets(&l, lane).enumerate() {
            write_scalar(&mut out, off, lane_vals[i]);
        }
    }
    Ok(out)
}

/// Stable argsort along `axis`; the output holds i32 indices.
pub fn argsort_host(bytes: &[u8], shape: &[usize], dtype: DType, axis: usize) -> Result<Vec<u8>> {
    let l = lanes(shape, axis)?;
    let count: usize = shape.iter().product();
    let mut out = vec![0u8; count * DType::I32.size_of()];
    let mut order: Vec<usize> = Vec::with_capacity(l.n);
    for lane in 0..l.lanes {
        let vals: Vec<Scalar> = lane_offsets(&l, lane)
            .map(|off| read_scalar(bytes, off, dtype))
            .collect();
        order.clear();
        order.extend(0..l.n);
        order.sort_by(|&a, &b| total_cmp(vals[a], vals[b]));
        for (i, off) in lane_offsets(&l, lane).enumerate() {
            write_scalar(&mut out, off, Scalar::I32(order[i] as i32));
        }
    }
    Ok(out)
}

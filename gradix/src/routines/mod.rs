//! Routines: named operations that resist fusion (sorting, triangular
//! factorizations and solves, the Threefry PRNG).
//!
//! A routine is opaque to the kernel fuser and always reads contiguous
//! inputs; the scheduler realizes arguments before invoking one. Semantics
//! are pinned by the host implementations in this module, which the cpu and
//! bytecode backends call directly and the gpu backend calls after
//! synchronising, so every backend produces identical bytes.

mod linalg;
mod sort;

pub use linalg::{cholesky_host, solve_triangular_host};
pub use sort::{argsort_host, sort_host};

use gradix_ir::DType;

use crate::error::{Error, Result};

/// Identity of a routine plus its static parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutineKind {
    /// Ascending stable sort along `axis`; NaN orders after every number.
    Sort { axis: usize },
    /// Stable argsort along `axis`, i32 indices.
    Argsort { axis: usize },
    /// Cholesky factorization (lower triangular), Banachiewicz order.
    Cholesky,
    /// Triangular solve by substitution.
    TriangularSolve { lower: bool, unit_diagonal: bool },
    /// Threefry-2x32 counter PRNG: (k0, k1, c0, c1) -> (x0, x1) per lane.
    Threefry,
}

impl RoutineKind {
    pub fn name(&self) -> &'static str {
        match self {
            RoutineKind::Sort { .. } => "sort",
            RoutineKind::Argsort { .. } => "argsort",
            RoutineKind::Cholesky => "cholesky",
            RoutineKind::TriangularSolve { .. } => "solve_triangular",
            RoutineKind::Threefry => "threefry2x32",
        }
    }
}

/// A routine invocation with its full I/O typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routine {
    pub kind: RoutineKind,
    pub in_shapes: Vec<Vec<usize>>,
    pub in_dtypes: Vec<DType>,
    pub out_shapes: Vec<Vec<usize>>,
    pub out_dtypes: Vec<DType>,
}

/// Dispatch a routine over raw little-endian buffers.
pub fn run_routine_host(routine: &Routine, inputs: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
    if inputs.len() != routine.in_shapes.len() {
        return Err(Error::Internal(format!(
            "routine {} expected {} inputs, got {}",
            routine.kind.name(),
            routine.in_shapes.len(),
            inputs.len()
        )));
    }
    match &routine.kind {
        RoutineKind::Sort { axis } => Ok(vec![sort_host(
            &inputs[0],
            &routine.in_shapes[0],
            routine.in_dtypes[0],
            *axis,
        )?]),
        RoutineKind::Argsort { axis } => Ok(vec![argsort_host(
            &inputs[0],
            &routine.in_shapes[0],
            routine.in_dtypes[0],
            *axis,
        )?]),
        RoutineKind::Cholesky => Ok(vec![cholesky_host(
            &inputs[0],
            &routine.in_shapes[0],
            routine.in_dtypes[0],
        )?]),
        RoutineKind::TriangularSolve {
            lower,
            unit_diagonal,
        } => Ok(vec![solve_triangular_host(
            &inputs[0],
            &routine.in_shapes[0],
            &inputs[1],
            &routine.in_shapes[1],
            routine.in_dtypes[0],
            *lower,
            *unit_diagonal,
        )?]),
        RoutineKind::Threefry => {
            let n = routine.in_shapes[0].iter().product::<usize>();
            let words = |bytes: &[u8]| -> Vec<u32> {
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            };
            let (k0, k1) = (words(&inputs[0]), words(&inputs[1]));
            let (c0, c1) = (words(&inputs[2]), words(&inputs[3]));
            let mut out0 = Vec::with_capacity(n * 4);
            let mut out1 = Vec::with_capacity(n * 4);
            for i in 0..n {
                let (x0, x1) = threefry2x32((k0[i], k1[i]), (c0[i], c1[i]));
                out0.extend_from_slice(&x0.to_le_bytes());
                out1.extend_from_slice(&x1.to_le_bytes());
            }
            Ok(vec![out0, out1])
        }
    }
}

const THREEFRY_PARITY: u32 = 0x1BD1_1BDA;
const THREEFRY_ROT: [u32; 8] = [13, 15, 26, 6, 17, 29, 16, 24];

/// Threefry-2x32, 20 rounds (five four-round groups with the standard key
/// schedule). `threefry2x32((0,0),(0,0))` is `(0x6b200159, 0x99ba4efe)`.
pub fn threefry2x32(key: (u32, u32), ctr: (u32, u32)) -> (u32, u32) {
    let ks = [key.0, key.1, key.0 ^ key.1 ^ THREEFRY_PARITY];
    let mut x0 = ctr.0.wrapping_add(ks[0]);
    let mut x1 = ctr.1.wrapping_add(ks[1]);
    for group in 0..5u32 {
        let rots = if group % 2 == 0 {
            &THREEFRY_ROT[0..4]
        } else {
            &THREEFRY_ROT[4..8]
        };
        for &r in rots {
            x0 = x0.wrapping_add(x1);
            x1 = x1.rotate_left(r);
            x1 ^= x0;
        }
        let i = (group as usize + 1) % 3;
        let j = (group as usize + 2) % 3;
        x0 = x0.wrapping_add(ks[i]);
        x1 = x1.wrapping_add(ks[j]).wrapping_add(group + 1);
    }
    (x0, x1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threefry_known_answer() {
        assert_eq!(threefry2x32((0, 0), (0, 0)), (1797259609, 2579123966));
    }

    #[test]
    fn test_threefry_distinct_counters() {
        let a = threefry2x32((1, 2), (0, 0));
        let b = threefry2x32((1, 2), (1, 0));
        assert_ne!(a, b);
    }

    #[test]
    fn test_threefry_routine_dispatch() {
        let routine = Routine {
            kind: RoutineKind::Threefry,
            in_shapes: vec![vec![1]; 4],
            in_dtypes: vec![DType::U32; 4],
            out_shapes: vec![vec![1]; 2],
            out_dtypes: vec![DType::U32; 2],
        };
        let zero = 0u32.to_le_bytes().to_vec();
        let outs =
            run_routine_host(&routine, &[zero.clone(), zero.clone(), zero.clone(), zero]).unwrap();
        assert_eq!(outs[0], 1797259609u32.to_le_bytes().to_vec());
        assert_eq!(outs[1], 2579123966u32.to_le_bytes().to_vec());
    }
}

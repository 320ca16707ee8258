//! Linear algebra over movement + elementwise + reduce: matmul as a
//! broadcast-multiply-sum (one reduction kernel after fusion), dot, vecdot
//! and a two-operand einsum.

use std::collections::BTreeSet;

use gradix_ir::AluOp;

use super::Tensor;
use crate::error::{Error, Result};

impl Tensor {
    /// Matrix product with stacked leading batch dimensions. 1-D operands
    /// are promoted to rows/columns and squeezed back, following the usual
    /// matmul conventions.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let (a, squeeze_a) = if self.rank() == 1 {
            (self.expand_dims(0)?, true)
        } else {
            (self.clone(), false)
        };
        let (b, squeeze_b) = if other.rank() == 1 {
            (other.expand_dims(1)?, true)
        } else {
            (other.clone(), false)
        };
        if a.rank() < 2 || b.rank() < 2 {
            return Err(Error::ScalarRank { op: "matmul" });
        }
        let (m, ka) = (a.shape()[a.rank() - 2], a.shape()[a.rank() - 1]);
        let (kb, n) = (b.shape()[b.rank() - 2], b.shape()[b.rank() - 1]);
        if ka != kb {
            return Err(Error::ShapeMismatch {
                expected: a.shape().to_vec(),
                got: b.shape().to_vec(),
            });
        }
        // Align batch dimensions by right-padding the shorter rank.
        let batch_a = &a.shape()[..a.rank() - 2];
        let batch_b = &b.shape()[..b.rank() - 2];
        let batch: Vec<usize> = if batch_a.len() >= batch_b.len() {
            batch_a.to_vec()
        } else {
            batch_b.to_vec()
        };
        if !(batch_a.is_empty() || batch_b.is_empty() || batch_a == batch_b) {
            return Err(Error::ShapeMismatch {
                expected: batch_a.to_vec(),
                got: batch_b.to_vec(),
            });
        }

        // a: [B.., m, k] -> [B.., m, 1, k] -> [B.., m, n, k]
        let mut full = batch.clone();
        full.extend([m, n, ka]);
        let a_big = {
            let lifted = a.expand_dims((a.rank() - 1) as i64)?;
            lifted.broadcast_to(&full)?
        };
        // b: [B.., k, n] -> [B.., n, k] -> [B.., 1, n, k] -> [B.., m, n, k]
        let b_big = {
            let mut axes: Vec<usize> = (0..b.rank()).collect();
            axes.swap(b.rank() - 2, b.rank() - 1);
            let t = b.transpose(Some(&axes))?;
            let lifted = t.expand_dims((b.rank() - 2) as i64)?;
            lifted.broadcast_to(&full)?
        };
        let prod = a_big.binary(AluOp::Mul, &b_big)?;
        let mut out = prod.sum(Some(&[-1]), false)?;
        if squeeze_b {
            let mut shape: Vec<i64> = out.shape().iter().map(|&d| d as i64).collect();
            shape.pop();
            out = out.reshape(&shape)?;
        }
        if squeeze_a {
            let mut shape: Vec<i64> = out.shape().iter().map(|&d| d as i64).collect();
            let at = shape.len() - if squeeze_b { 1 } else { 2 };
            shape.remove(at);
            out = out.reshape(&shape)?;
        }
        Ok(out)
    }

    /// Inner product for vectors, matrix product otherwise.
    pub fn dot(&self, other: &Tensor) -> Result<Tensor> {
        if self.rank() == 1 && other.rank() == 1 {
            self.vecdot(other)
        } else {
            self.matmul(other)
        }
    }

    /// Sum of products over the trailing axis.
    pub fn vecdot(&self, other: &Tensor) -> Result<Tensor> {
        let prod = self.binary(AluOp::Mul, other)?;
        prod.sum(Some(&[-1]), false)
    }
}

/// Two-operand (or single-operand) einsum without repeated indices inside
/// one operand. Supports implicit output (alphabetical, contraction over
/// shared letters) and explicit `->` output.
pub fn einsum(spec: &str, operands: &[&Tensor]) -> Result<Tensor> {
    let (lhs, explicit_out) = match spec.split_once("->") {
        Some((l, r)) => (l, Some(r.trim().to_string())),
        None => (spec, None),
    };
    let in_specs: Vec<Vec<char>> = lhs
        .split(',')
        .map(|s| s.trim().chars().collect())
        .collect();
    if in_specs.len() != operands.len() || operands.is_empty() || operands.len() > 2 {
        return Err(Error::InvalidOperand {
            op: "einsum",
            message: format!(
                "spec `{}` names {} operands, got {}",
                spec,
                in_specs.len(),
                operands.len()
            ),
        });
    }
    let mut sizes: std::collections::HashMap<char, usize> = std::collections::HashMap::new();
    for (letters, t) in in_specs.iter().zip(operands) {
        if letters.len() != t.rank() {
            return Err(Error::InvalidOperand {
                op: "einsum",
                message: format!("spec `{}` does not match shape {:?}", spec, t.shape()),
            });
        }
        let mut seen = BTreeSet::new();
        for (&l, &d) in letters.iter().zip(t.shape()) {
            if !seen.insert(l) {
                return Err(Error::InvalidOperand {
                    op: "einsum",
                    message: format!("repeated index `{}` within one operand", l),
                });
            }
            if *sizes.entry(l).or_insert(d) != d {
                return Err(Error::InvalidOperand {
                    op: "einsum",
                    message: format!("index `{}` has conflicting sizes", l),
                });
            }
        }
    }
    let out_letters: Vec<char> = match explicit_out {
        Some(out) => out.chars().collect(),
        None => {
            // implicit: letters appearing exactly once, alphabetical
            let all: Vec<char> = in_specs.iter().flatten().copied().collect();
            let mut once: Vec<char> = sizes
                .keys()
                .filter(|&&l| all.iter().filter(|&&c| c == l).count() == 1)
                .copied()
                .collect();
            once.sort_unstable();
            once
        }
    };
    let contracted: Vec<char> = {
        let out_set: BTreeSet<char> = out_letters.iter().copied().collect();
        let mut c: Vec<char> = sizes
            .keys()
            .filter(|l| !out_set.contains(l))
            .copied()
            .collect();
        c.sort_unstable();
        c
    };
    // Target layout: output letters then contracted letters.
    let target: Vec<char> = out_letters.iter().chain(contracted.iter()).copied().collect();
    let full_shape: Vec<usize> = target.iter().map(|l| sizes[l]).collect();

    let align = |letters: &[char], t: &Tensor| -> Result<Tensor> {
        // Permute the operand's letters into target order, then insert
        // size-1 dims for the letters it lacks.
        let mut present: Vec<(usize, usize)> = letters
            .iter()
            .map(|l| target.iter().position(|c| c == l).unwrap_or(usize::MAX))
            .zip(0..letters.len())
            .collect();
        present.sort_unstable();
        let perm: Vec<usize> = present.iter().map(|&(_, src)| src).collect();
        let permuted = t.transpose(Some(&perm))?;
        let mut shape: Vec<i64> = Vec::with_capacity(target.len());
        let mut it = present.iter().peekable();
        for (pos, &l) in target.iter().enumerate() {
            if it.peek().is_some_and(|&&(p, _)| p == pos) {
                it.next();
                shape.push(sizes[&l] as i64);
            } else {
                shape.push(1);
            }
        }
        permuted.reshape(&shape)?.broadcast_to(&full_shape)
    };

    let mut acc = align(&in_specs[0], operands[0])?;
    if operands.len() == 2 {
        let rhs = align(&in_specs[1], operands[1])?;
        acc = acc.binary(AluOp::Mul, &rhs)?;
    }
    if contracted.is_empty() {
        return Ok(acc);
    }
    let axes: Vec<i64> = (out_letters.len()..target.len()).map(|a| a as i64).collect();
    acc.sum(Some(&axes), false)
}

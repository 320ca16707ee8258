//! Primitives: the operation vocabulary of traced programs.
//!
//! Each primitive supplies an abstract evaluation (shape/dtype propagation)
//! and a concrete lowering onto lazy tensors here; its jvp, transpose and
//! vmap rules live with the corresponding transformation.

use gradix_ir::{AluOp, DType, ReduceOp};

use super::Aval;
use crate::array::Tensor;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    // elementwise binary
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Min,
    Max,
    // elementwise unary
    Neg,
    Recip,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Atan,
    Asin,
    Sqrt,
    Abs,
    Erf,
    Erfc,
    // comparisons
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // selection / conversion
    Where,
    Cast,
    // movement
    Reshape,
    Transpose,
    Broadcast,
    Slice,
    Flip,
    Pad,
    Concat,
    // reductions
    Reduce(ReduceOp),
    // linear algebra
    MatMul,
    // routines
    Threefry,
    Sort,
    Argsort,
    Cholesky,
    TriangularSolve,
}

impl Primitive {
    pub fn is_elementwise_binary(self) -> bool {
        matches!(
            self,
            Primitive::Add
                | Primitive::Sub
                | Primitive::Mul
                | Primitive::Div
                | Primitive::Pow
                | Primitive::Min
                | Primitive::Max
        )
    }

    pub fn is_elementwise_unary(self) -> bool {
        matches!(
            self,
            Primitive::Neg
                | Primitive::Recip
                | Primitive::Exp
                | Primitive::Log
                | Primitive::Sin
                | Primitive::Cos
                | Primitive::Tan
                | Primitive::Atan
                | Primitive::Asin
                | Primitive::Sqrt
                | Primitive::Abs
                | Primitive::Erf
                | Primitive::Erfc
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Primitive::Eq
                | Primitive::Ne
                | Primitive::Lt
                | Primitive::Le
                | Primitive::Gt
                | Primitive::Ge
        )
    }

    pub(crate) fn alu_op(self) -> AluOp {
        match self {
            Primitive::Add => AluOp::Add,
            Primitive::Sub => AluOp::Sub,
            Primitive::Mul => AluOp::Mul,
            Primitive::Div => AluOp::Div,
            Primitive::Pow => AluOp::Pow,
            Primitive::Min => AluOp::Min,
            Primitive::Max => AluOp::Max,
            Primitive::Neg => AluOp::Neg,
            Primitive::Recip => AluOp::Recip,
            Primitive::Exp => AluOp::Exp,
            Primitive::Log => AluOp::Log,
            Primitive::Sin => AluOp::Sin,
            Primitive::Cos => AluOp::Cos,
            Primitive::Tan => AluOp::Tan,
            Primitive::Atan => AluOp::Atan,
            Primitive::Asin => AluOp::Asin,
            Primitive::Sqrt => AluOp::Sqrt,
            Primitive::Abs => AluOp::Abs,
            Primitive::Erf => AluOp::Erf,
            Primitive::Erfc => AluOp::Erfc,
            Primitive::Eq => AluOp::Eq,
            Primitive::Ne => AluOp::Ne,
            Primitive::Lt => AluOp::Lt,
            Primitive::Le => AluOp::Le,
            Primitive::Gt => AluOp::Gt,
            Primitive::Ge => AluOp::Ge,
            other => panic!("{:?} is not an ALU-mapped primitive", other),
        }
    }
}

/// Static parameters of a primitive application.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    pub axes: Option<Vec<usize>>,
    pub shape: Option<Vec<usize>>,
    pub starts: Option<Vec<i64>>,
    pub stops: Option<Vec<i64>>,
    pub steps: Option<Vec<i64>>,
    pub pads: Option<Vec<(usize, usize)>>,
    pub flips: Option<Vec<bool>>,
    pub axis: Option<usize>,
    pub dtype: Option<DType>,
    pub keepdims: Option<bool>,
    pub lower: Option<bool>,
    pub unit_diagonal: Option<bool>,
}

impl Params {
    pub fn none() -> Params {
        Params::default()
    }

    fn req_axes(&self) -> Result<&[usize]> {
        self.axes.as_deref().ok_or(Error::Internal("missing axes param".into()))
    }

    fn req_shape(&self) -> Result<&[usize]> {
        self.shape.as_deref().ok_or(Error::Internal("missing shape param".into()))
    }
}

fn elementwise_aval(ins: &[&Aval]) -> Result<Aval> {
    let first = ins[0];
    for a in &ins[1..] {
        if a.shape != first.shape {
            return Err(Error::ShapeMismatch {
                expected: first.shape.clone(),
                got: a.shape.clone(),
            });
        }
        if a.dtype != first.dtype {
            return Err(Error::DTypeMismatch {
                expected: first.dtype,
                got: a.dtype,
            });
        }
    }
    Ok(first.clone())
}

fn reduce_aval(input: &Aval, axes: &[usize], keepdims: bool, dtype: DType) -> Aval {
    let shape: Vec<usize> = input
        .shape
        .iter()
        .enumerate()
        .filter_map(|(d, &s)| {
            if axes.contains(&d) {
                if keepdims {
                    Some(1)
                } else {
                    None
                }
            } else {
                Some(s)
            }
        })
        .collect();
    Aval::new(shape, dtype)
}

/// Shape/dtype propagation. The same rule runs identically under every
/// transformation order.
pub fn abstract_eval(prim: &Primitive, params: &Params, ins: &[&Aval]) -> Result<Vec<Aval>> {
    let out = match prim {
        p if p.is_elementwise_binary() => vec![elementwise_aval(&ins[..2])?],
        p if p.is_elementwise_unary() => vec![ins[0].clone()],
        p if p.is_comparison() => {
            let a = elementwise_aval(&ins[..2])?;
            vec![Aval::new(a.shape, DType::Bool)]
        }
        Primitive::Where => {
            if ins[0].dtype != DType::Bool {
                return Err(Error::DTypeMismatch {
                    expected: DType::Bool,
                    got: ins[0].dtype,
                });
            }
            let branches = elementwise_aval(&ins[1..3])?;
            if ins[0].shape != branches.shape {
                return Err(Error::ShapeMismatch {
                    expected: branches.shape.clone(),
                    got: ins[0].shape.clone(),
                });
            }
            vec![branches]
        }
        Primitive::Cast => {
            let dtype = params.dtype.ok_or(Error::Internal("missing dtype param".into()))?;
            vec![Aval::new(ins[0].shape.clone(), dtype)]
        }
        Primitive::Reshape => {
            let shape = params.req_shape()?;
            if shape.iter().product::<usize>() != ins[0].size() {
                return Err(Error::Ir(gradix_ir::IrError::InvalidReshape {
                    from: ins[0].shape.clone(),
                    from_size: ins[0].size(),
                    to: shape.iter().map(|&d| d as i64).collect(),
                }));
            }
            vec![Aval::new(shape.to_vec(), ins[0].dtype)]
        }
        Primitive::Transpose => {
            let axes = params.req_axes()?;
            let rank = ins[0].rank();
            let mut seen = vec![false; rank];
            if axes.len() != rank
                || axes.iter().any(|&a| a >= rank || std::mem::replace(&mut seen[a], true))
            {
                return Err(Error::Ir(gradix_ir::IrError::InvalidPermutation {
                    axes: axes.to_vec(),
                    rank,
                }));
            }
            let shape = axes.iter().map(|&a| ins[0].shape[a]).collect();
            vec![Aval::new(shape, ins[0].dtype)]
        }
        Primitive::Broadcast => {
            let target = params.req_shape()?;
            let from = &ins[0].shape;
            if from.len() > target.len() {
                return Err(Error::NotBroadcastable {
                    from: from.clone(),
                    to: target.to_vec(),
                });
            }
            let offset = target.len() - from.len();
            for (d, &s) in from.iter().enumerate() {
                if s != 1 && s != target[offset + d] {
                    return Err(Error::NotBroadcastable {
                        from: from.clone(),
                        to: target.to_vec(),
                    });
                }
            }
            vec![Aval::new(target.to_vec(), ins[0].dtype)]
        }
        Primitive::Slice => {
            let starts = params.starts.as_deref().ok_or(Error::Internal("missing starts".into()))?;
            let stops = params.stops.as_deref().ok_or(Error::Internal("missing stops".into()))?;
            let steps = params.steps.clone().unwrap_or_else(|| vec![1; starts.len()]);
            let shape: Vec<usize> = starts
                .iter()
                .zip(stops)
                .zip(&steps)
                .map(|((&a, &b), &s)| ((b - a).max(0) as usize).div_ceil(s.max(1) as usize))
                .collect();
            vec![Aval::new(shape, ins[0].dtype)]
        }
        Primitive::Flip => vec![ins[0].clone()],
        Primitive::Pad => {
            let pads = params.pads.as_deref().ok_or(Error::Internal("missing pads".into()))?;
            let shape: Vec<usize> = ins[0]
                .shape
                .iter()
                .zip(pads)
                .map(|(&s, &(b, a))| s + b + a)
                .collect();
            vec![Aval::new(shape, ins[0].dtype)]
        }
        Primitive::Concat => {
            let axis = params.axis.ok_or(Error::Internal("missing axis".into()))?;
            let mut shape = ins[0].shape.clone();
            shape[axis] = ins.iter().map(|a| a.shape[axis]).sum();
            vec![Aval::new(shape, ins[0].dtype)]
        }
        Primitive::Reduce(_) => {
            let axes = params.req_axes()?;
            let keepdims = params.keepdims.unwrap_or(false);
            vec![reduce_aval(ins[0], axes, keepdims, ins[0].dtype)]
        }
        Primitive::MatMul => {
            let (a, b) = (ins[0], ins[1]);
            if a.rank() < 2 || b.rank() < 2 {
                return Err(Error::ScalarRank { op: "matmul" });
            }
            let (m, ka) = (a.shape[a.rank() - 2], a.shape[a.rank() - 1]);
            let (kb, n) = (b.shape[b.rank() - 2], b.shape[b.rank() - 1]);
            if ka != kb || a.dtype != b.dtype {
                return Err(Error::ShapeMismatch {
                    expected: a.shape.clone(),
                    got: b.shape.clone(),
                });
            }
            let batch = if a.rank() >= b.rank() {
                &a.shape[..a.rank() - 2]
            } else {
                &b.shape[..b.rank() - 2]
            };
            let mut shape = batch.to_vec();
            shape.extend([m, n]);
            vec![Aval::new(shape, a.dtype)]
        }
        Primitive::Threefry => {
            let a = elementwise_aval(ins)?;
            if a.dtype != DType::U32 {
                return Err(Error::DTypeMismatch {
                    expected: DType::U32,
                    got: a.dtype,
                });
            }
            vec![a.clone(), a]
        }
        Primitive::Sort => vec![ins[0].clone()],
        Primitive::Argsort => vec![Aval::new(ins[0].shape.clone(), DType::I32)],
        Primitive::Cholesky => vec![ins[0].clone()],
        Primitive::TriangularSolve => vec![ins[1].clone()],
        _ => unreachable!(),
    };
    Ok(out)
}

/// Concrete lowering onto lazy tensors.
pub fn eval_concrete(prim: &Primitive, params: &Params, ins: &[&Tensor]) -> Result<Vec<Tensor>> {
    let out = match prim {
        p if p.is_elementwise_binary() || p.is_comparison() => {
            vec![ins[0].binary(p.alu_op(), ins[1])?]
        }
        p if p.is_elementwise_unary() => vec![ins[0].unary(p.alu_op())?],
        Primitive::Where => vec![ins[0].select(ins[1], ins[2])?],
        Primitive::Cast => {
            let dtype = params.dtype.ok_or(Error::Internal("missing dtype param".into()))?;
            vec![ins[0].cast(dtype)]
        }
        Primitive::Reshape => {
            let shape: Vec<i64> = params.req_shape()?.iter().map(|&d| d as i64).collect();
            vec![ins[0].reshape(&shape)?]
        }
        Primitive::Transpose => vec![ins[0].transpose(Some(params.req_axes()?))?],
        Primitive::Broadcast => vec![ins[0].broadcast_to(params.req_shape()?)?],
        Primitive::Slice => {
            let starts = params.starts.as_deref().ok_or(Error::Internal("missing starts".into()))?;
            let stops = params.stops.as_deref().ok_or(Error::Internal("missing stops".into()))?;
            vec![ins[0].slice(starts, stops, params.steps.as_deref())?]
        }
        Primitive::Flip => {
            let flips = params.flips.as_deref().ok_or(Error::Internal("missing flips".into()))?;
            vec![ins[0].flip_axes(flips)?]
        }
        Primitive::Pad => {
            let pads = params.pads.as_deref().ok_or(Error::Internal("missing pads".into()))?;
            vec![ins[0].pad(pads)?]
        }
        Primitive::Concat => {
            let axis = params.axis.ok_or(Error::Internal("missing axis".into()))?;
            vec![Tensor::concat(ins, axis as i64)?]
        }
        Primitive::Reduce(op) => {
            let axes: Vec<i64> = params.req_axes()?.iter().map(|&a| a as i64).collect();
            let keepdims = params.keepdims.unwrap_or(false);
            vec![ins[0].reduce(*op, Some(&axes), keepdims, None, None)?]
        }
        Primitive::MatMul => vec![ins[0].matmul(ins[1])?],
        Primitive::Threefry => {
            let (a, b) = Tensor::threefry(ins[0], ins[1], ins[2], ins[3])?;
            vec![a, b]
        }
        Primitive::Sort => {
            let axis = params.axis.ok_or(Error::Internal("missing axis".into()))?;
            vec![ins[0].sort(axis as i64)?]
        }
        Primitive::Argsort => {
            let axis = params.axis.ok_or(Error::Internal("missing axis".into()))?;
            vec![ins[0].argsort(axis as i64)?]
        }
        Primitive::Cholesky => vec![ins[0].cholesky()?],
        Primitive::TriangularSolve => vec![ins[0].solve_triangular(
            ins[1],
            params.lower.unwrap_or(true),
            params.unit_diagonal.unwrap_or(false),
        )?],
        _ => unreachable!(),
    };
    Ok(out)
}

//! Lazy array handles and the pending-executable scheduler.
//!
//! A `Tensor` is (shape, dtype, device, source, tracker, pending set). The
//! source is either a fused ALU expression over input buffers or a realized
//! buffer; movement ops rewrite the tracker at zero cost, elementwise ops
//! fuse expressions, and reductions materialize kernels. Nothing executes
//! until a read: pending executables are prepared and dispatched in
//! recorded order at the first synchronisation point.

mod construct;
mod linalg;
mod movement;
mod reduce;
mod routine_call;

pub use linalg::einsum;
pub use reduce::ArgExtremum;

pub(crate) use movement::normalize_axis;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use gradix_ir::view::unflatten_alu;
use gradix_ir::{AluArg, AluExp, AluOp, DType, Kernel, ReduceOp, Reduction, Scalar, ShapeTracker};
use half::f16;

use crate::backend::{with_backend, BufferId, Device};
use crate::debug::log_sched;
use crate::error::{Error, Result};
use crate::routines::Routine;

/// Owned reference to one backend buffer refcount.
pub(crate) struct BufferHandle {
    device: Device,
    id: BufferId,
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf{}@{}", self.id, self.device)
    }
}

impl BufferHandle {
    pub(crate) fn alloc(device: Device, bytes: usize, init: Option<&[u8]>) -> Result<Rc<BufferHandle>> {
        let id = with_backend(device, |b| b.malloc(bytes, init))?;
        Ok(Rc::new(BufferHandle { device, id }))
    }

    pub(crate) fn id(&self) -> BufferId {
        self.id
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        // The registry may already be shut down; a dangling decrement is
        // then meaningless rather than an error.
        let _ = with_backend(self.device, |b| b.dec_ref(self.id));
    }
}

/// Work queued behind a handle.
#[derive(Debug)]
pub(crate) enum Work {
    Kernel(Kernel),
    Routine(Routine),
}

/// A not-yet-submitted unit of device work. Holds strong references to its
/// inputs until submission and to its outputs for its whole lifetime.
pub(crate) struct PendingExec {
    work: Work,
    inputs: RefCell<Vec<Rc<BufferHandle>>>,
    outputs: Vec<Rc<BufferHandle>>,
    device: Device,
    submitted: Cell<bool>,
    seq: u64,
}

impl std::fmt::Debug for PendingExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingExec")
            .field("seq", &self.seq)
            .field("submitted", &self.submitted.get())
            .finish()
    }
}

thread_local! {
    static NEXT_SEQ: Cell<u64> = const { Cell::new(0) };
}

fn next_seq() -> u64 {
    NEXT_SEQ.with(|c| {
        let v = c.get();
        c.set(v + 1);
        v
    })
}

impl PendingExec {
    fn submit(&self) -> Result<()> {
        if self.submitted.get() {
            return Ok(());
        }
        let inputs: Vec<BufferId> = self.inputs.borrow().iter().map(|b| b.id()).collect();
        let outputs: Vec<BufferId> = self.outputs.iter().map(|b| b.id()).collect();
        with_backend(self.device, |backend| match &self.work {
            Work::Kernel(kernel) => {
                let exec = backend.prepare(kernel)?;
                backend.dispatch(exec, &inputs, &outputs)
            }
            Work::Routine(routine) => backend.run_routine(routine, &inputs, &outputs),
        })?;
        log_sched(&format!("submitted pending #{}", self.seq));
        self.submitted.set(true);
        // Input references are released at submission.
        self.inputs.borrow_mut().clear();
        Ok(())
    }
}

/// Prepare and dispatch every pending executable in recorded order.
pub(crate) fn drain(pendings: &[Rc<PendingExec>]) -> Result<()> {
    let mut sorted: Vec<&Rc<PendingExec>> = pendings.iter().collect();
    sorted.sort_by_key(|p| p.seq);
    sorted.dedup_by_key(|p| p.seq);
    for p in sorted {
        p.submit()?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub(crate) enum Source {
    /// A fused expression over `inputs`, a function of the flat `gidx`
    /// special over the tracker's base domain.
    Expr {
        exp: AluExp,
        inputs: Vec<Rc<BufferHandle>>,
    },
    Buffer(Rc<BufferHandle>),
}

/// Host-typed readback of a realized tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl HostData {
    fn from_bytes(dtype: DType, bytes: &[u8]) -> HostData {
        match dtype {
            DType::Bool => HostData::Bool(bytes.iter().map(|&b| b != 0).collect()),
            DType::I32 => HostData::I32(bytemuck::cast_slice(bytes).to_vec()),
            DType::U32 => HostData::U32(bytemuck::cast_slice(bytes).to_vec()),
            DType::F32 => HostData::F32(bytemuck::cast_slice(bytes).to_vec()),
            DType::F64 => HostData::F64(bytemuck::cast_slice(bytes).to_vec()),
            DType::F16 => HostData::F16(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
        }
    }

    /// Values widened to f64, for tests and display.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            HostData::Bool(v) => v.iter().map(|&b| b as i32 as f64).collect(),
            HostData::I32(v) => v.iter().map(|&x| x as f64).collect(),
            HostData::U32(v) => v.iter().map(|&x| x as f64).collect(),
            HostData::F16(v) => v.iter().map(|x| x.to_f64()).collect(),
            HostData::F32(v) => v.iter().map(|&x| x as f64).collect(),
            HostData::F64(v) => v.clone(),
        }
    }
}

/// A lazy array handle.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    source: Source,
    tracker: ShapeTracker,
    pending: Vec<Rc<PendingExec>>,
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub(crate) fn from_expr(
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
        exp: AluExp,
        inputs: Vec<Rc<BufferHandle>>,
        pending: Vec<Rc<PendingExec>>,
    ) -> Tensor {
        let tracker = ShapeTracker::from_shape(&shape);
        Tensor {
            shape,
            dtype,
            device,
            source: Source::Expr { exp, inputs },
            tracker,
            pending,
        }
    }

    pub(crate) fn from_buffer(
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
        buffer: Rc<BufferHandle>,
        pending: Vec<Rc<PendingExec>>,
    ) -> Tensor {
        let tracker = ShapeTracker::from_shape(&shape);
        Tensor {
            shape,
            dtype,
            device,
            source: Source::Buffer(buffer),
            tracker,
            pending,
        }
    }

    /// Same source, new logical view.
    pub(crate) fn with_tracker(&self, tracker: ShapeTracker) -> Tensor {
        Tensor {
            shape: tracker.shape().to_vec(),
            dtype: self.dtype,
            device: self.device,
            source: self.source.clone(),
            tracker,
            pending: self.pending.clone(),
        }
    }

    pub(crate) fn tracker(&self) -> &ShapeTracker {
        &self.tracker
    }

    /// Express this tensor's element at flat logical index `flat` as an ALU
    /// expression over its input buffers (gids local to the returned list).
    pub(crate) fn resolve_at(&self, flat: &AluExp) -> (AluExp, Vec<Rc<BufferHandle>>) {
        let idxs = unflatten_alu(flat, &self.shape);
        match &self.source {
            Source::Buffer(buf) => (
                AluExp::global_view(self.dtype, 0, self.tracker.clone(), idxs),
                vec![buf.clone()],
            ),
            Source::Expr { exp, inputs } => {
                if self.tracker.is_contiguous() {
                    let plain_gidx = AluExp::gidx(self.size());
                    if *flat == plain_gidx {
                        return (exp.clone(), inputs.clone());
                    }
                    let mut map = HashMap::new();
                    map.insert(gradix_ir::SpecialKind::Gidx, flat.clone());
                    return (exp.substitute(&map), inputs.clone());
                }
                let (off, valid) = self.tracker.to_alu(&idxs);
                let mut map = HashMap::new();
                map.insert(gradix_ir::SpecialKind::Gidx, off);
                let moved = exp.substitute(&map);
                let masked = match valid.as_const() {
                    Some(s) if s.to_bool() => moved,
                    _ => AluExp::select(&valid, &moved, &AluExp::const_of(self.dtype, 0.0)),
                };
                (masked, inputs.clone())
            }
        }
    }

    fn resolve(&self) -> (AluExp, Vec<Rc<BufferHandle>>) {
        self.resolve_at(&AluExp::gidx(self.size()))
    }

    fn check_binary(&self, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        if self.dtype != other.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: other.dtype,
            });
        }
        if self.device != other.device {
            return Err(Error::InvalidOperand {
                op: "binary op",
                message: format!(
                    "operands live on different devices ({} vs {})",
                    self.device, other.device
                ),
            });
        }
        Ok(())
    }

    /// Fuse a binary elementwise operation. Shapes and dtypes must already
    /// agree; the public wrappers insert broadcasts and casts.
    pub(crate) fn binary(&self, op: AluOp, other: &Tensor) -> Result<Tensor> {
        self.check_binary(other)?;
        let (ea, mut inputs) = self.resolve();
        let (eb, ib) = other.resolve();
        let eb = remap_gids(&eb, &mut inputs, &ib);
        let out_dtype = if op.is_comparison() {
            DType::Bool
        } else {
            self.dtype
        };
        let exp = AluExp::new(op, out_dtype, vec![ea, eb], AluArg::None);
        let pending = merge_pending(&self.pending, &other.pending);
        Ok(Tensor::from_expr(
            self.shape.clone(),
            out_dtype,
            self.device,
            exp,
            inputs,
            pending,
        ))
    }

    pub(crate) fn unary(&self, op: AluOp) -> Result<Tensor> {
        if op != AluOp::Neg && op != AluOp::Abs && !self.dtype.is_float() {
            return Err(Error::InvalidOperand {
                op: "unary op",
                message: format!("{:?} requires a float dtype, got {}", op, self.dtype),
            });
        }
        let (exp, inputs) = self.resolve();
        let exp = AluExp::new(op, self.dtype, vec![exp], AluArg::None);
        Ok(Tensor::from_expr(
            self.shape.clone(),
            self.dtype,
            self.device,
            exp,
            inputs,
            self.pending.clone(),
        ))
    }

    /// `where(self, x, y)` with a bool receiver.
    pub fn select(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        if self.dtype != DType::Bool {
            return Err(Error::DTypeMismatch {
                expected: DType::Bool,
                got: self.dtype,
            });
        }
        x.check_binary(y)?;
        if x.shape != self.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: x.shape.clone(),
            });
        }
        let (ec, mut inputs) = self.resolve();
        let (ex, ix) = x.resolve();
        let ex = remap_gids(&ex, &mut inputs, &ix);
        let (ey, iy) = y.resolve();
        let ey = remap_gids(&ey, &mut inputs, &iy);
        let exp = AluExp::select(&ec, &ex, &ey);
        let pending = merge_pending(&merge_pending(&self.pending, &x.pending), &y.pending);
        Ok(Tensor::from_expr(
            self.shape.clone(),
            x.dtype,
            self.device,
            exp,
            inputs,
            pending,
        ))
    }

    pub fn cast(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype {
            return self.clone();
        }
        let (exp, inputs) = self.resolve();
        Tensor::from_expr(
            self.shape.clone(),
            dtype,
            self.device,
            exp.cast(dtype),
            inputs,
            self.pending.clone(),
        )
    }

    /// Materialize a reduction kernel over the trailing `r` elements of the
    /// flattened `[out, r]` logical layout of `permuted`.
    pub(crate) fn materialize_reduce(
        permuted: &Tensor,
        out_shape: Vec<usize>,
        r: usize,
        op: ReduceOp,
        fusion: Option<AluExp>,
        out_dtype: DType,
    ) -> Result<Tensor> {
        let out_size: usize = out_shape.iter().product();
        let flat = AluExp::gidx(out_size)
            .mul(&AluExp::const_i32(r as i32))
            .add(&AluExp::ridx(r));
        let (exp, inputs) = permuted.resolve_at(&flat);
        let kernel = Kernel {
            num_inputs: inputs.len(),
            size: out_size,
            exp: exp.simplify(),
            reduction: Some(Reduction {
                op,
                size: r,
                fusion,
            }),
        };
        Tensor::materialize_kernel(kernel, out_shape, out_dtype, permuted.device, inputs, &permuted.pending)
    }

    pub(crate) fn materialize_kernel(
        kernel: Kernel,
        out_shape: Vec<usize>,
        out_dtype: DType,
        device: Device,
        inputs: Vec<Rc<BufferHandle>>,
        pending: &[Rc<PendingExec>],
    ) -> Result<Tensor> {
        let bytes = kernel.size * out_dtype.size_of();
        let out = BufferHandle::alloc(device, bytes, None)?;
        let exec = Rc::new(PendingExec {
            work: Work::Kernel(kernel),
            inputs: RefCell::new(inputs),
            outputs: vec![out.clone()],
            device,
            submitted: Cell::new(false),
            seq: next_seq(),
        });
        let mut pending = pending.to_vec();
        pending.push(exec);
        Ok(Tensor::from_buffer(out_shape, out_dtype, device, out, pending))
    }

    /// Force this handle to be backed by a contiguous buffer. Idempotent.
    pub fn realize(&mut self) -> Result<()> {
        if matches!(self.source, Source::Buffer(_)) && self.tracker.is_contiguous() {
            return Ok(());
        }
        let (exp, inputs) = self.resolve();
        let kernel = Kernel::elementwise(inputs.len(), self.size(), exp.simplify());
        let realized = Tensor::materialize_kernel(
            kernel,
            self.shape.clone(),
            self.dtype,
            self.device,
            inputs,
            &self.pending,
        )?;
        *self = realized;
        Ok(())
    }

    /// A realized copy of this tensor, leaving `self` untouched.
    pub fn realized(&self) -> Result<Tensor> {
        let mut t = self.clone();
        t.realize()?;
        Ok(t)
    }

    fn prune_pending(&mut self) {
        self.pending.retain(|p| !p.submitted.get());
    }

    /// Realize, drain pending work in recorded order, then read back.
    pub fn to_vec(&self) -> Result<HostData> {
        let mut t = self.clone();
        t.realize()?;
        drain(&t.pending)?;
        t.prune_pending();
        let buf = match &t.source {
            Source::Buffer(b) => b.clone(),
            Source::Expr { .. } => unreachable!("realize() always yields a buffer source"),
        };
        let bytes = with_backend(t.device, |b| b.read(buf.id(), 0, None))?;
        Ok(HostData::from_bytes(t.dtype, &bytes))
    }

    /// Asynchronous readback. The frontend is single-threaded cooperative;
    /// preparation runs through the backends' async surface, which today
    /// resolves eagerly for the host backends.
    pub async fn to_vec_async(&self) -> Result<HostData> {
        self.to_vec()
    }

    /// Flat f64 view of the data, for tests and quick inspection.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self.to_vec()?.to_f64_vec())
    }

    /// Read a single element of a scalar (size-1) tensor.
    pub fn item(&self) -> Result<Scalar> {
        if self.size() != 1 {
            return Err(Error::InvalidOperand {
                op: "item",
                message: format!("expected one element, shape is {:?}", self.shape),
            });
        }
        Ok(match self.to_vec()? {
            HostData::Bool(v) => Scalar::Bool(v[0]),
            HostData::I32(v) => Scalar::I32(v[0]),
            HostData::U32(v) => Scalar::U32(v[0]),
            HostData::F16(v) => Scalar::F16(v[0]),
            HostData::F32(v) => Scalar::F32(v[0]),
            HostData::F64(v) => Scalar::F64(v[0]),
        })
    }

    pub(crate) fn pending(&self) -> &[Rc<PendingExec>] {
        &self.pending
    }
}

/// Renumber `exp`'s global ids into the merged input list, deduplicating
/// buffers shared between operands.
pub(crate) fn remap_gids(
    exp: &AluExp,
    inputs: &mut Vec<Rc<BufferHandle>>,
    incoming: &[Rc<BufferHandle>],
) -> AluExp {
    let map: Vec<usize> = incoming
        .iter()
        .map(|buf| {
            match inputs.iter().position(|b| Rc::ptr_eq(b, buf)) {
                Some(at) => at,
                None => {
                    inputs.push(buf.clone());
                    inputs.len() - 1
                }
            }
        })
        .collect();
    exp.rewrite(&mut |e| match e.arg() {
        AluArg::Global { gid } if e.op() == AluOp::GlobalIndex => Some(AluExp::new(
            e.op(),
            e.dtype(),
            e.src().to_vec(),
            AluArg::Global { gid: map[*gid] },
        )),
        AluArg::View { gid, tracker } if e.op() == AluOp::GlobalView => Some(AluExp::new(
            e.op(),
            e.dtype(),
            e.src().to_vec(),
            AluArg::View {
                gid: map[*gid],
                tracker: tracker.clone(),
            },
        )),
        _ => None,
    })
}

pub(crate) fn merge_pending(
    a: &[Rc<PendingExec>],
    b: &[Rc<PendingExec>],
) -> Vec<Rc<PendingExec>> {
    let mut out = a.to_vec();
    for p in b {
        if !out.iter().any(|q| Rc::ptr_eq(q, p)) {
            out.push(p.clone());
        }
    }
    out
}

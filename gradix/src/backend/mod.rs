//! Backend abstraction: refcounted opaque buffers, kernel preparation and
//! FIFO dispatch, plus the thread-local registry of initialised backends.

pub mod bytecode;
pub mod gpu;
pub mod reference;

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use gradix_ir::{DType, Kernel, Scalar};

use crate::error::{Error, Result};
use crate::routines::Routine;

pub type BufferId = u64;
pub type ExecId = u64;

/// A future resolved on the caller's thread (the frontend is single-threaded
/// cooperative; suspension points are `read` and async `prepare`).
pub type LocalFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Identifies one of the three execution targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    /// Tree-walking reference interpreter.
    Cpu,
    /// Stack-machine bytecode interpreter.
    Bytecode,
    /// wgpu compute shaders.
    Gpu,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::Cpu, Device::Bytecode, Device::Gpu];

    pub fn name(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Bytecode => "bytecode",
            Device::Gpu => "gpu",
        }
    }

    pub fn from_name(name: &str) -> Option<Device> {
        Device::ALL.into_iter().find(|d| d.name() == name)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Uniform backend contract. Dispatches are observed in FIFO order by any
/// subsequent read of an output buffer.
pub trait Backend {
    fn device(&self) -> Device;

    /// Allocate a buffer with refcount 1. Zero-size allocations are legal.
    fn malloc(&mut self, size: usize, init: Option<&[u8]>) -> Result<BufferId>;

    fn inc_ref(&mut self, buf: BufferId) -> Result<()>;

    /// Drop one reference; the buffer is reclaimed at zero. Releasing a
    /// freed handle fails with [`Error::InvalidHandle`].
    fn dec_ref(&mut self, buf: BufferId) -> Result<()>;

    /// Blocking read; drains all pending writes to this handle first.
    fn read(&mut self, buf: BufferId, start: usize, len: Option<usize>) -> Result<Vec<u8>>;

    /// Compile (and cache) an executable for the kernel. Pure w.r.t. handles.
    fn prepare(&mut self, kernel: &Kernel) -> Result<ExecId>;

    /// Asynchronous preparation; backends with real compile latency overlap
    /// it with other work. The default wraps the synchronous path.
    fn prepare_async<'a>(&'a mut self, kernel: &'a Kernel) -> LocalFuture<'a, Result<ExecId>> {
        let ready = self.prepare(kernel);
        Box::pin(std::future::ready(ready))
    }

    /// Enqueue one kernel execution over the given handles.
    fn dispatch(&mut self, exec: ExecId, inputs: &[BufferId], outputs: &[BufferId]) -> Result<()>;

    /// Execute a non-fusible routine. Inputs are contiguous by contract.
    fn run_routine(&mut self, routine: &Routine, inputs: &[BufferId], outputs: &[BufferId])
        -> Result<()>;

    /// Live buffer count, for the refcount-law tests.
    fn allocated_buffers(&self) -> usize;

    /// Total dispatches issued, for fusion tests.
    fn dispatch_count(&self) -> u64;
}

// ---- host buffer table (shared by the cpu and bytecode backends) ----

#[derive(Debug)]
struct HostBuffer {
    data: Vec<u8>,
    refcount: usize,
}

/// Refcounted table of host byte buffers.
#[derive(Debug, Default)]
pub(crate) struct HostBuffers {
    bufs: HashMap<BufferId, HostBuffer>,
    next: BufferId,
}

impl HostBuffers {
    pub fn malloc(&mut self, size: usize, init: Option<&[u8]>) -> Result<BufferId> {
        let mut data = vec![0u8; size];
        if let Some(init) = init {
            let n = init.len().min(size);
            data[..n].copy_from_slice(&init[..n]);
        }
        let id = self.next;
        self.next += 1;
        self.bufs.insert(id, HostBuffer { data, refcount: 1 });
        Ok(id)
    }

    pub fn inc_ref(&mut self, id: BufferId) -> Result<()> {
        let buf = self.bufs.get_mut(&id).ok_or(Error::InvalidHandle(id))?;
        buf.refcount += 1;
        Ok(())
    }

    pub fn dec_ref(&mut self, id: BufferId) -> Result<()> {
        let buf = self.bufs.get_mut(&id).ok_or(Error::InvalidHandle(id))?;
        buf.refcount -= 1;
        if buf.refcount == 0 {
            self.bufs.remove(&id);
        }
        Ok(())
    }

    pub fn data(&self, id: BufferId) -> Result<&[u8]> {
        self.bufs
            .get(&id)
            .map(|b| b.data.as_slice())
            .ok_or(Error::InvalidHandle(id))
    }

    pub fn data_mut(&mut self, id: BufferId) -> Result<&mut Vec<u8>> {
        self.bufs
            .get_mut(&id)
            .map(|b| &mut b.data)
            .ok_or(Error::InvalidHandle(id))
    }

    /// Move a buffer's bytes out for exclusive mutation; pair with `put`.
    pub fn take(&mut self, id: BufferId) -> Result<Vec<u8>> {
        self.bufs
            .get_mut(&id)
            .map(|b| std::mem::take(&mut b.data))
            .ok_or(Error::InvalidHandle(id))
    }

    pub fn put(&mut self, id: BufferId, data: Vec<u8>) {
        if let Some(buf) = self.bufs.get_mut(&id) {
            buf.data = data;
        }
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }
}

// ---- element access helpers ----

/// Read element `idx` of dtype `dtype` from little-endian bytes.
pub(crate) fn read_scalar(bytes: &[u8], idx: usize, dtype: DType) -> Scalar {
    let w = dtype.size_of();
    let at = idx * w;
    let b = &bytes[at..at + w];
    match dtype {
        DType::Bool => Scalar::Bool(b[0] != 0),
        DType::I32 => Scalar::I32(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        DType::U32 => Scalar::U32(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        DType::F16 => Scalar::F16(half::f16::from_le_bytes([b[0], b[1]])),
        DType::F32 => Scalar::F32(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        DType::F64 => Scalar::F64(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])),
    }
}

/// Write element `idx` as little-endian bytes.
pub(crate) fn write_scalar(bytes: &mut [u8], idx: usize, s: Scalar) {
    let w = s.dtype().size_of();
    let at = idx * w;
    match s {
        Scalar::Bool(v) => bytes[at] = v as u8,
        Scalar::I32(v) => bytes[at..at + 4].copy_from_slice(&v.to_le_bytes()),
        Scalar::U32(v) => bytes[at..at + 4].copy_from_slice(&v.to_le_bytes()),
        Scalar::F16(v) => bytes[at..at + 2].copy_from_slice(&v.to_le_bytes()),
        Scalar::F32(v) => bytes[at..at + 4].copy_from_slice(&v.to_le_bytes()),
        Scalar::F64(v) => bytes[at..at + 8].copy_from_slice(&v.to_le_bytes()),
    }
}

// ---- registry ----

struct Registry {
    backends: HashMap<Device, Rc<RefCell<dyn Backend>>>,
    default: Option<Device>,
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry {
        backends: HashMap::new(),
        default: None,
    });
}

fn make_backend(device: Device) -> Result<Rc<RefCell<dyn Backend>>> {
    Ok(match device {
        Device::Cpu => Rc::new(RefCell::new(reference::CpuBackend::new())),
        Device::Bytecode => Rc::new(RefCell::new(bytecode::BytecodeBackend::new())),
        Device::Gpu => Rc::new(RefCell::new(gpu::GpuBackend::new()?)),
    })
}

/// Initialise the requested backends (all of them when `devices` is empty)
/// and return those that succeeded. Idempotent: an already-initialised
/// backend is kept as is.
pub fn init(devices: &[Device]) -> Vec<Device> {
    let wanted: Vec<Device> = if devices.is_empty() {
        Device::ALL.to_vec()
    } else {
        devices.to_vec()
    };
    REGISTRY.with(|reg| {
        let mut reg = reg.borrow_mut();
        let mut available = Vec::new();
        for device in wanted {
            if reg.backends.contains_key(&device) {
                available.push(device);
                continue;
            }
            match make_backend(device) {
                Ok(b) => {
                    reg.backends.insert(device, b);
                    available.push(device);
                }
                Err(e) => crate::debug::log_sched(&format!("init {} failed: {}", device, e)),
            }
        }
        if reg.default.is_none() {
            reg.default = available.first().copied().or_else(|| reg.backends.keys().min().copied());
        }
        available
    })
}

/// Select the default device; it must be initialised.
pub fn default_device(device: Device) -> Result<()> {
    REGISTRY.with(|reg| {
        let mut reg = reg.borrow_mut();
        if !reg.backends.contains_key(&device) {
            return Err(Error::UninitializedBackend(device));
        }
        reg.default = Some(device);
        Ok(())
    })
}

/// The current default device, initialising the reference backend on first
/// use so that examples and tests need no explicit setup.
pub fn get_default() -> Device {
    let current = REGISTRY.with(|reg| reg.borrow().default);
    match current {
        Some(d) => d,
        None => {
            init(&[Device::Cpu]);
            Device::Cpu
        }
    }
}

/// Run `f` against the named backend.
pub fn with_backend<R>(device: Device, f: impl FnOnce(&mut dyn Backend) -> Result<R>) -> Result<R> {
    let backend = REGISTRY.with(|reg| {
        reg.borrow()
            .backends
            .get(&device)
            .cloned()
            .ok_or(Error::UninitializedBackend(device))
    })?;
    let mut backend = backend.borrow_mut();
    f(&mut *backend)
}

/// Drop every backend and reset the default. Buffers still referenced by
/// live handles become invalid; intended for test isolation.
pub fn shutdown() {
    REGISTRY.with(|reg| {
        let mut reg = reg.borrow_mut();
        reg.backends.clear();
        reg.default = None;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_buffer_refcounting() {
        let mut bufs = HostBuffers::default();
        let id = bufs.malloc(16, None).unwrap();
        assert_eq!(bufs.len(), 1);
        bufs.inc_ref(id).unwrap();
        bufs.dec_ref(id).unwrap();
        assert_eq!(bufs.len(), 1);
        bufs.dec_ref(id).unwrap();
        assert_eq!(bufs.len(), 0);
        assert_eq!(bufs.dec_ref(id), Err(Error::InvalidHandle(id)));
    }

    #[test]
    fn test_zero_size_malloc() {
        let mut bufs = HostBuffers::default();
        let id = bufs.malloc(0, None).unwrap();
        assert!(bufs.data(id).unwrap().is_empty());
    }

    #[test]
    fn test_scalar_round_trip_through_bytes() {
        let mut bytes = vec![0u8; 32];
        write_scalar(&mut bytes, 1, Scalar::F32(3.5));
        assert_eq!(read_scalar(&bytes, 1, DType::F32), Scalar::F32(3.5));
        write_scalar(&mut bytes, 2, Scalar::I32(-7));
        assert_eq!(read_scalar(&bytes, 2, DType::I32), Scalar::I32(-7));
        let mut bools = vec![0u8; 4];
        write_scalar(&mut bools, 3, Scalar::Bool(true));
        assert_eq!(read_scalar(&bools, 3, DType::Bool), Scalar::Bool(true));
    }
}

//! Reference backend: buffers are host byte arrays and kernels run by
//! tree-walking the ALU expression. The slow path, and the semantic oracle
//! for every other backend.

use std::collections::HashMap;

use gradix_ir::{DType, EvalCtx, GlobalRead, Kernel, Scalar, SpecialKind};

use super::{read_scalar, write_scalar, Backend, BufferId, Device, ExecId, HostBuffers};
use crate::error::{Error, Result};
use crate::routines::{run_routine_host, Routine};

struct InputView<'a> {
    bufs: Vec<&'a [u8]>,
}

impl GlobalRead for InputView<'_> {
    fn load(&self, gid: usize, index: i64, dtype: DType) -> Scalar {
        read_scalar(self.bufs[gid], index as usize, dtype)
    }
}

/// The tree-walking backend.
pub struct CpuBackend {
    bufs: HostBuffers,
    execs: HashMap<ExecId, Kernel>,
    cache: HashMap<u64, ExecId>,
    next_exec: ExecId,
    dispatches: u64,
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend")
            .field("buffers", &self.bufs.len())
            .field("executables", &self.execs.len())
            .finish()
    }
}

impl CpuBackend {
    pub fn new() -> CpuBackend {
        CpuBackend {
            bufs: HostBuffers::default(),
            execs: HashMap::new(),
            cache: HashMap::new(),
            next_exec: 0,
            dispatches: 0,
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn malloc(&mut self, size: usize, init: Option<&[u8]>) -> Result<BufferId> {
        self.bufs.malloc(size, init)
    }

    fn inc_ref(&mut self, buf: BufferId) -> Result<()> {
        self.bufs.inc_ref(buf)
    }

    fn dec_ref(&mut self, buf: BufferId) -> Result<()> {
        self.bufs.dec_ref(buf)
    }

    fn read(&mut self, buf: BufferId, start: usize, len: Option<usize>) -> Result<Vec<u8>> {
        // Dispatch is synchronous here, so the queue is always drained.
        let data = self.bufs.data(buf)?;
        let end = len.map_or(data.len(), |l| start + l);
        Ok(data[start..end].to_vec())
    }

    fn prepare(&mut self, kernel: &Kernel) -> Result<ExecId> {
        let key = kernel.cache_key();
        if let Some(&id) = self.cache.get(&key) {
            return Ok(id);
        }
        let id = self.next_exec;
        self.next_exec += 1;
        self.execs.insert(id, kernel.clone());
        self.cache.insert(key, id);
        Ok(id)
    }

    fn dispatch(&mut self, exec: ExecId, inputs: &[BufferId], outputs: &[BufferId]) -> Result<()> {
        let kernel = self
            .execs
            .get(&exec)
            .cloned()
            .ok_or(Error::InvalidHandle(exec))?;
        self.dispatches += 1;
        let out_id = *outputs.first().ok_or(Error::EmptyOperandList)?;
        let mut out = self.bufs.take(out_id)?;
        let run = (|| -> Result<()> {
            let views: Vec<&[u8]> = inputs
                .iter()
                .map(|&id| self.bufs.data(id))
                .collect::<Result<_>>()?;
            let globals = InputView { bufs: views };
            let out_dtype = kernel.dtype();
            for gidx in 0..kernel.size as i64 {
                let mut ctx = EvalCtx::new(&globals);
                ctx.set_index(SpecialKind::Gidx, gidx);
                let value = match &kernel.reduction {
                    None => kernel.exp.evaluate(&ctx),
                    Some(red) => {
                        let mut acc = red.op.identity(kernel.exp.dtype());
                        for ridx in 0..red.size as i64 {
                            ctx.set_index(SpecialKind::Ridx, ridx);
                            let v = kernel.exp.evaluate(&ctx);
                            acc = red.op.combine(acc, v);
                        }
                        match &red.fusion {
                            None => acc,
                            Some(epilogue) => {
                                ctx.set(SpecialKind::Acc, acc);
                                epilogue.evaluate(&ctx)
                            }
                        }
                    }
                };
                write_scalar(&mut out, gidx as usize, value.cast(out_dtype));
            }
            Ok(())
        })();
        self.bufs.put(out_id, out);
        run
    }

    fn run_routine(
        &mut self,
        routine: &Routine,
        inputs: &[BufferId],
        outputs: &[BufferId],
    ) -> Result<()> {
        let in_bytes: Vec<Vec<u8>> = inputs
            .iter()
            .map(|&id| self.bufs.data(id).map(<[u8]>::to_vec))
            .collect::<Result<_>>()?;
        let out_bytes = run_routine_host(routine, &in_bytes)?;
        for (&id, bytes) in outputs.iter().zip(out_bytes) {
            *self.bufs.data_mut(id)? = bytes;
        }
        Ok(())
    }

    fn allocated_buffers(&self) -> usize {
        self.bufs.len()
    }

    fn dispatch_count(&self) -> u64 {
        self.dispatches
    }
}

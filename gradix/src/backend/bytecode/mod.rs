//! Bytecode backend: kernels are assembled into programs for a small typed
//! stack machine and interpreted over host memory buffers.

pub mod asm;
pub mod exec;
pub mod instr;
pub mod softfloat;

use std::collections::HashMap;

use gradix_ir::Kernel;

use super::{Backend, BufferId, Device, ExecId, HostBuffers};
use crate::error::{Error, Result};
use crate::routines::{run_routine_host, Routine};
use crate::tuner::tune_null;

pub struct BytecodeBackend {
    bufs: HostBuffers,
    execs: HashMap<ExecId, exec::Exec>,
    cache: HashMap<u64, ExecId>,
    next_exec: ExecId,
    dispatches: u64,
}

impl std::fmt::Debug for BytecodeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytecodeBackend")
            .field("buffers", &self.bufs.len())
            .field("executables", &self.execs.len())
            .finish()
    }
}

impl BytecodeBackend {
    pub fn new() -> BytecodeBackend {
        BytecodeBackend {
            bufs: HostBuffers::default(),
            execs: HashMap::new(),
            cache: HashMap::new(),
            next_exec: 0,
            dispatches: 0,
        }
    }
}

impl Default for BytecodeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for BytecodeBackend {
    fn device(&self) -> Device {
        Device::Bytecode
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
        let data = self.bufs.data(buf)?;
        let end = len.map_or(data.len(), |l| start + l);
        Ok(data[start..end].to_vec())
    }

    fn prepare(&mut self, kernel: &Kernel) -> Result<ExecId> {
        let key = kernel.cache_key();
        if let Some(&id) = self.cache.get(&key) {
            return Ok(id);
        }
        let tuned = tune_null(kernel);
        let body = asm::assemble(&tuned.exp)?;
        let epilogue = tuned.epilogue.as_ref().map(asm::assemble).transpose()?;
        let compiled = exec::Exec {
            body,
            epilogue,
            reduce: tuned.reduce_op.map(|op| (op, tuned.dims.reduce)),
            size: tuned.out_count,
            acc_dtype: tuned.acc_dtype,
            out_dtype: tuned.out_dtype,
        };
        let id = self.next_exec;
        self.next_exec += 1;
        self.execs.insert(id, compiled);
        self.cache.insert(key, id);
        Ok(id)
    }

    fn dispatch(&mut self, exec: ExecId, inputs: &[BufferId], outputs: &[BufferId]) -> Result<()> {
        let compiled = self
            .execs
            .get(&exec)
            .cloned()
            .ok_or(Error::InvalidHandle(exec))?;
        self.dispatches += 1;
        let out_id = *outputs.first().ok_or(Error::EmptyOperandList)?;
        let mut out = self.bufs.take(out_id)?;
        let run = (|| {
            let views: Vec<&[u8]> = inputs
                .iter()
                .map(|&id| self.bufs.data(id))
                .collect::<Result<_>>()?;
            exec::run_kernel(&compiled, &views, &mut out)
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

#[cfg(test)]
mod tests {
    use super::*;
    use gradix_ir::{AluExp, DType, ReduceOp, Reduction};

    #[test]
    fn test_elementwise_kernel_matches_reference() {
        let mut backend = BytecodeBackend::new();
        // out[i] = (2i) * (i - 1) over f32
        let x = AluExp::gidx(8).cast(DType::F32);
        let exp = x
            .add(&x)
            .mul(&x.sub(&AluExp::const_of(DType::F32, 1.0)));
        let kernel = Kernel::elementwise(0, 8, exp);
        let exec = backend.prepare(&kernel).unwrap();
        let out = backend.malloc(32, None).unwrap();
        backend.dispatch(exec, &[], &[out]).unwrap();
        let bytes = backend.read(out, 0, None).unwrap();
        let vals: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(vals, vec![-0.0, 0.0, 4.0, 12.0, 24.0, 40.0, 60.0, 84.0]);
    }

    #[test]
    fn test_reduction_kernel() {
        let mut backend = BytecodeBackend::new();
        // out = max over i32 inputs
        let input: Vec<u8> = [3i32, 1, 4, 1, 5].iter().flat_map(|v| v.to_le_bytes()).collect();
        let in_id = backend.malloc(input.len(), Some(&input)).unwrap();
        let exp = AluExp::global_index(DType::I32, 0, AluExp::ridx(5));
        let kernel = Kernel {
            num_inputs: 1,
            size: 1,
            exp,
            reduction: Some(Reduction {
                op: ReduceOp::Max,
                size: 5,
                fusion: None,
            }),
        };
        let exec = backend.prepare(&kernel).unwrap();
        let out = backend.malloc(4, None).unwrap();
        backend.dispatch(exec, &[in_id], &[out]).unwrap();
        let bytes = backend.read(out, 0, None).unwrap();
        assert_eq!(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 5);
    }
}

//! GPU backend on wgpu: storage buffers, generated WGSL compute shaders,
//! 2-D grid tiling around the per-dimension workgroup limit, and blocking
//! readback through `map_async` + a oneshot channel.
//!
//! Routines run on the host after synchronisation (read back, compute,
//! upload) so that every backend produces bit-identical routine results.

pub mod wgsl;

use std::collections::HashMap;

use gradix_ir::Kernel;
use once_cell::sync::OnceCell;

use self::wgsl::GRID_WRAP;
use super::{Backend, BufferId, Device, ExecId};
use crate::error::{Error, Result};
use crate::routines::{run_routine_host, Routine};
use crate::tuner::tune_gpu;

/// Process-wide device context; requesting an adapter is expensive and the
/// device is freely cloneable.
#[derive(Debug, Clone)]
struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    max_workgroups_per_dim: u32,
}

static GPU_CONTEXT: OnceCell<Option<GpuContext>> = OnceCell::new();

fn acquire_context() -> Result<GpuContext> {
    let ctx = GPU_CONTEXT.get_or_init(|| {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = match pollster::block_on(
            instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            }),
        ) {
            Ok(adapter) => adapter,
            Err(_) => return None,
        };
        let limits = adapter.limits();
        // Take shader-f16 when the adapter offers it; kernels that need it
        // on a device without it surface a compile error instead.
        let features = adapter.features() & wgpu::Features::SHADER_F16;
        let (device, queue) = match pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gradix"),
                required_features: features,
                required_limits: limits.clone(),
                ..Default::default()
            },
        )) {
            Ok(pair) => pair,
            Err(_) => return None,
        };
        Some(GpuContext {
            device,
            queue,
            max_workgroups_per_dim: limits.max_compute_workgroups_per_dimension,
        })
    });
    ctx.clone().ok_or(Error::NoAdapter)
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: usize,
    refcount: usize,
}

struct GpuExec {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    workgroups: usize,
    num_inputs: usize,
}

pub struct GpuBackend {
    ctx: GpuContext,
    bufs: HashMap<BufferId, GpuBuffer>,
    next_buf: BufferId,
    execs: HashMap<ExecId, GpuExec>,
    cache: HashMap<u64, ExecId>,
    next_exec: ExecId,
    dispatches: u64,
}

impl std::fmt::Debug for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBackend")
            .field("buffers", &self.bufs.len())
            .field("executables", &self.execs.len())
            .finish()
    }
}

impl GpuBackend {
    pub fn new() -> Result<GpuBackend> {
        Ok(GpuBackend {
            ctx: acquire_context()?,
            bufs: HashMap::new(),
            next_buf: 0,
            execs: HashMap::new(),
            cache: HashMap::new(),
            next_exec: 0,
            dispatches: 0,
        })
    }

    fn buffer(&self, id: BufferId) -> Result<&GpuBuffer> {
        self.bufs.get(&id).ok_or(Error::InvalidHandle(id))
    }

    fn read_bytes(&self, id: BufferId) -> Result<Vec<u8>> {
        let buf = self.buffer(id)?;
        if buf.size == 0 {
            return Ok(Vec::new());
        }
        // Copy sizes must be 4-byte aligned; round up and trim after.
        let copy_size = buf.size.div_ceil(4) as u64 * 4;
        let staging = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: copy_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(&buf.buffer, 0, &staging, 0, copy_size);
        self.ctx.queue.submit([encoder.finish()]);
        let (tx, rx) = futures_channel::oneshot::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        let _ = self.ctx.device.poll(wgpu::PollType::Wait);
        pollster::block_on(rx)
            .map_err(|_| Error::Internal("readback channel dropped".into()))?
            .map_err(|e| Error::Internal(format!("buffer map failed: {:?}", e)))?;
        let data = staging.slice(..).get_mapped_range().to_vec();
        staging.unmap();
        let mut data = data;
        data.truncate(buf.size);
        Ok(data)
    }
}

impl Backend for GpuBackend {
    fn device(&self) -> Device {
        Device::Gpu
    }

    fn malloc(&mut self, size: usize, init: Option<&[u8]>) -> Result<BufferId> {
        // wgpu requires non-zero, 4-byte aligned buffer sizes.
        let alloc = size.max(4).div_ceil(4) * 4;
        let buffer = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: alloc as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(init) = init {
            let n = init.len().min(size);
            if n > 0 {
                // write_buffer sizes must be 4-byte aligned; the allocation
                // above is already rounded up.
                let mut padded = init[..n].to_vec();
                padded.resize(padded.len().div_ceil(4) * 4, 0);
                self.ctx.queue.write_buffer(&buffer, 0, &padded);
            }
        }
        let id = self.next_buf;
        self.next_buf += 1;
        self.bufs.insert(
            id,
            GpuBuffer {
                buffer,
                size,
                refcount: 1,
            },
        );
        Ok(id)
    }

    fn inc_ref(&mut self, buf: BufferId) -> Result<()> {
        self.bufs
            .get_mut(&buf)
            .ok_or(Error::InvalidHandle(buf))?
            .refcount += 1;
        Ok(())
    }

    fn dec_ref(&mut self, buf: BufferId) -> Result<()> {
        let entry = self.bufs.get_mut(&buf).ok_or(Error::InvalidHandle(buf))?;
        entry.refcount -= 1;
        if entry.refcount == 0 {
            if let Some(b) = self.bufs.remove(&buf) {
                b.buffer.destroy();
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: BufferId, start: usize, len: Option<usize>) -> Result<Vec<u8>> {
        let data = self.read_bytes(buf)?;
        let end = len.map_or(data.len(), |l| start + l);
        Ok(data[start..end].to_vec())
    }

    fn prepare(&mut self, kernel: &Kernel) -> Result<ExecId> {
        let key = kernel.cache_key();
        if let Some(&id) = self.cache.get(&key) {
            return Ok(id);
        }
        let tuned = tune_gpu(kernel);
        let shader = wgsl::render(&tuned)?;
        if shader.workgroups > GRID_WRAP * self.ctx.max_workgroups_per_dim as usize {
            return Err(Error::WorkgroupLimit {
                requested: shader.workgroups,
                limit: GRID_WRAP * self.ctx.max_workgroups_per_dim as usize,
            });
        }

        self.ctx
            .device
            .push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("gradix-kernel"),
                source: wgpu::ShaderSource::Wgsl(shader.source.clone().into()),
            });

        // Explicit layout: every input binding is present even when the
        // simplifier eliminated its last read.
        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = (0..shader.num_inputs)
            .map(|i| wgpu::BindGroupLayoutEntry {
                binding: i as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: shader.num_inputs as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
        let layout = self
            .ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: None,
                entries: &entries,
            });
        let pipeline_layout =
            self.ctx
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: None,
                    bind_group_layouts: &[&layout],
                    push_constant_ranges: &[],
                });
        let pipeline =
            self.ctx
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some("gradix-kernel"),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some("main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                });
        if let Some(err) = pollster::block_on(self.ctx.device.pop_error_scope()) {
            return Err(Error::Compile {
                device: Device::Gpu,
                message: err.to_string(),
                source: shader.source,
            });
        }

        let id = self.next_exec;
        self.next_exec += 1;
        self.execs.insert(
            id,
            GpuExec {
                pipeline,
                layout,
                workgroups: shader.workgroups,
                num_inputs: shader.num_inputs,
            },
        );
        self.cache.insert(key, id);
        Ok(id)
    }

    fn dispatch(&mut self, exec: ExecId, inputs: &[BufferId], outputs: &[BufferId]) -> Result<()> {
        let ex = self.execs.get(&exec).ok_or(Error::InvalidHandle(exec))?;
        if inputs.len() != ex.num_inputs {
            return Err(Error::Internal(format!(
                "kernel expects {} inputs, got {}",
                ex.num_inputs,
                inputs.len()
            )));
        }
        self.dispatches += 1;
        if ex.workgroups == 0 {
            return Ok(());
        }
        let out_id = *outputs.first().ok_or(Error::EmptyOperandList)?;
        let mut entries = Vec::with_capacity(inputs.len() + 1);
        for (i, &id) in inputs.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource: self.buffer(id)?.buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: inputs.len() as u32,
            resource: self.buffer(out_id)?.buffer.as_entire_binding(),
        });
        let bind_group = self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &ex.layout,
            entries: &entries,
        });
        // Tile the grid: wrap at GRID_WRAP along x, grow along y.
        let (x, y) = if ex.workgroups > GRID_WRAP {
            (GRID_WRAP as u32, ex.workgroups.div_ceil(GRID_WRAP) as u32)
        } else {
            (ex.workgroups as u32, 1)
        };
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("gradix-dispatch"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&ex.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.ctx.queue.submit([encoder.finish()]);
        Ok(())
    }

    fn run_routine(
        &mut self,
        routine: &Routine,
        inputs: &[BufferId],
        outputs: &[BufferId],
    ) -> Result<()> {
        let in_bytes: Vec<Vec<u8>> = inputs
            .iter()
            .map(|&id| self.read_bytes(id))
            .collect::<Result<_>>()?;
        let out_bytes = run_routine_host(routine, &in_bytes)?;
        for (&id, mut bytes) in outputs.iter().zip(out_bytes) {
            let buf = self.buffer(id)?;
            if !bytes.is_empty() {
                bytes.resize(bytes.len().div_ceil(4) * 4, 0);
                self.ctx.queue.write_buffer(&buf.buffer, 0, &bytes);
            }
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

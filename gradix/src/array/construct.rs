//! Tensor constructors. Everything except `from_*` builds a constant or
//! index expression and stays lazy: no buffer is allocated until a read.

use gradix_ir::{AluExp, DType, Scalar};
use half::f16;

use super::{BufferHandle, Tensor};
use crate::backend::{get_default, Device};
use crate::error::{Error, Result};

fn check_shape(shape: &[usize]) -> Result<()> {
    // usize rules out negative sizes; nothing else to validate.
    let _ = shape;
    Ok(())
}

impl Tensor {
    /// Constant-filled tensor.
    pub fn full(shape: &[usize], value: Scalar, device: Option<Device>) -> Result<Tensor> {
        check_shape(shape)?;
        let device = device.unwrap_or_else(get_default);
        Ok(Tensor::from_expr(
            shape.to_vec(),
            value.dtype(),
            device,
            AluExp::constant(value),
            vec![],
            vec![],
        ))
    }

    pub fn zeros(shape: &[usize], dtype: DType, device: Option<Device>) -> Result<Tensor> {
        Tensor::full(shape, Scalar::zero(dtype), device)
    }

    pub fn ones(shape: &[usize], dtype: DType, device: Option<Device>) -> Result<Tensor> {
        Tensor::full(shape, Scalar::one(dtype), device)
    }

    /// Rank-0 constant.
    pub fn scalar(value: Scalar, device: Option<Device>) -> Result<Tensor> {
        Tensor::full(&[], value, device)
    }

    /// A constant with this tensor's shape, dtype and device.
    pub fn full_like(&self, value: f64) -> Result<Tensor> {
        Tensor::full(
            &self.shape,
            Scalar::from_f64(self.dtype, value),
            Some(self.device),
        )
    }

    /// `[start, stop)` with the given step.
    pub fn arange(start: f64, stop: f64, step: f64, dtype: DType, device: Option<Device>) -> Result<Tensor> {
        if step == 0.0 {
            return Err(Error::InvalidOperand {
                op: "arange",
                message: "step must be non-zero".into(),
            });
        }
        let n = ((stop - start) / step).ceil().max(0.0) as usize;
        let device = device.unwrap_or_else(get_default);
        // Arithmetic happens in the element dtype so every backend can
        // lower the expression.
        let i = AluExp::gidx(n).cast(dtype);
        let exp = i
            .mul(&AluExp::const_of(dtype, step))
            .add(&AluExp::const_of(dtype, start));
        Ok(Tensor::from_expr(vec![n], dtype, device, exp.simplify(), vec![], vec![]))
    }

    /// `num` evenly spaced values over `[start, stop]`.
    pub fn linspace(start: f64, stop: f64, num: usize, dtype: DType, device: Option<Device>) -> Result<Tensor> {
        let device = device.unwrap_or_else(get_default);
        let step = if num > 1 {
            (stop - start) / (num - 1) as f64
        } else {
            0.0
        };
        let i = AluExp::gidx(num).cast(dtype);
        let exp = i
            .mul(&AluExp::const_of(dtype, step))
            .add(&AluExp::const_of(dtype, start));
        Ok(Tensor::from_expr(vec![num], dtype, device, exp.simplify(), vec![], vec![]))
    }

    /// Identity-like matrix with the unit diagonal offset by `k`.
    pub fn eye(n: usize, m: Option<usize>, k: i64, dtype: DType, device: Option<Device>) -> Result<Tensor> {
        let m = m.unwrap_or(n);
        let device = device.unwrap_or_else(get_default);
        let g = AluExp::gidx(n * m);
        let row = g.idiv(&AluExp::const_i32(m as i32));
        let col = g.rem(&AluExp::const_i32(m as i32));
        let cond = col.eq_(&row.add(&AluExp::const_i32(k as i32)));
        let exp = AluExp::select(
            &cond,
            &AluExp::constant(Scalar::one(dtype)),
            &AluExp::constant(Scalar::zero(dtype)),
        );
        Ok(Tensor::from_expr(vec![n, m], dtype, device, exp, vec![], vec![]))
    }

    /// The index along `axis` at every position, as i32.
    pub fn iota(shape: &[usize], axis: usize, device: Option<Device>) -> Result<Tensor> {
        if axis >= shape.len() {
            return Err(Error::AxisOutOfBounds {
                axis: axis as i64,
                rank: shape.len(),
            });
        }
        let device = device.unwrap_or_else(get_default);
        let size: usize = shape.iter().product();
        let inner: usize = shape[axis + 1..].iter().product();
        let exp = AluExp::gidx(size)
            .idiv(&AluExp::const_i32(inner as i32))
            .rem(&AluExp::const_i32(shape[axis] as i32));
        Ok(Tensor::from_expr(
            shape.to_vec(),
            DType::I32,
            device,
            exp.simplify(),
            vec![],
            vec![],
        ))
    }

    // ---- realized constructors ----

    fn from_bytes(shape: &[usize], dtype: DType, device: Option<Device>, bytes: &[u8]) -> Result<Tensor> {
        let device = device.unwrap_or_else(get_default);
        let count: usize = shape.iter().product();
        if bytes.len() != count * dtype.size_of() {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![bytes.len() / dtype.size_of().max(1)],
            });
        }
        let buf = BufferHandle::alloc(device, bytes.len(), Some(bytes))?;
        Ok(Tensor::from_buffer(shape.to_vec(), dtype, device, buf, vec![]))
    }

    pub fn from_f32(shape: &[usize], data: &[f32], device: Option<Device>) -> Result<Tensor> {
        Tensor::from_bytes(shape, DType::F32, device, bytemuck::cast_slice(data))
    }

    pub fn from_f64(shape: &[usize], data: &[f64], device: Option<Device>) -> Result<Tensor> {
        Tensor::from_bytes(shape, DType::F64, device, bytemuck::cast_slice(data))
    }

    pub fn from_i32(shape: &[usize], data: &[i32], device: Option<Device>) -> Result<Tensor> {
        Tensor::from_bytes(shape, DType::I32, device, bytemuck::cast_slice(data))
    }

    pub fn from_u32(shape: &[usize], data: &[u32], device: Option<Device>) -> Result<Tensor> {
        Tensor::from_bytes(shape, DType::U32, device, bytemuck::cast_slice(data))
    }

    pub fn from_f16(shape: &[usize], data: &[f16], device: Option<Device>) -> Result<Tensor> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Tensor::from_bytes(shape, DType::F16, device, &bytes)
    }

    pub fn from_bool(shape: &[usize], data: &[bool], device: Option<Device>) -> Result<Tensor> {
        let bytes: Vec<u8> = data.iter().map(|&b| b as u8).collect();
        Tensor::from_bytes(shape, DType::Bool, device, &bytes)
    }

    /// Raw little-endian bytes, used by the safetensors loader.
    pub fn from_raw_bytes(
        shape: &[usize],
        dtype: DType,
        bytes: &[u8],
        device: Option<Device>,
    ) -> Result<Tensor> {
        Tensor::from_bytes(shape, dtype, device, bytes)
    }
}

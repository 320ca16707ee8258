//! Safetensors loading and saving.
//!
//! Binary layout: an 8-byte little-endian header length, a JSON header
//! mapping tensor names to `{dtype, shape, data_offsets}` (plus an optional
//! `__metadata__` string map), then the packed tensor bytes. Offsets are
//! relative to the end of the header.

use std::path::Path;

use gradix_ir::DType;
use serde::Deserialize;

use crate::array::Tensor;
use crate::backend::Device;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct TensorMeta {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

fn dtype_from_tag(tag: &str) -> Result<DType> {
    Ok(match tag {
        "BOOL" => DType::Bool,
        "I32" => DType::I32,
        "U32" => DType::U32,
        "F16" => DType::F16,
        "F32" => DType::F32,
        "F64" => DType::F64,
        other => {
            return Err(Error::Header(format!("unsupported dtype tag `{}`", other)))
        }
    })
}

fn dtype_tag(dtype: DType) -> &'static str {
    match dtype {
        DType::Bool => "BOOL",
        DType::I32 => "I32",
        DType::U32 => "U32",
        DType::F16 => "F16",
        DType::F32 => "F32",
        DType::F64 => "F64",
    }
}

/// Parse a safetensors image into named tensors on `device`.
pub fn load_bytes(bytes: &[u8], device: Option<Device>) -> Result<Vec<(String, Tensor)>> {
    if bytes.len() < 8 {
        return Err(Error::Header("file shorter than the length prefix".into()));
    }
    let header_len = u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]) as usize;
    let body_at = 8 + header_len;
    if bytes.len() < body_at {
        return Err(Error::Header(format!(
            "header claims {} bytes but only {} remain",
            header_len,
            bytes.len() - 8
        )));
    }
    let header: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&bytes[8..body_at])?;
    let data = &bytes[body_at..];
    let mut out = Vec::new();
    for (name, value) in header {
        if name == "__metadata__" {
            continue;
        }
        let meta: TensorMeta = serde_json::from_value(value)?;
        let dtype = dtype_from_tag(&meta.dtype)?;
        let (start, end) = meta.data_offsets;
        let expected = meta.shape.iter().product::<usize>() * dtype.size_of();
        if end < start || end > data.len() || end - start != expected {
            return Err(Error::Header(format!(
                "tensor `{}` has offsets {}..{} but {} bytes of data",
                name, start, end, expected
            )));
        }
        let tensor = Tensor::from_raw_bytes(&meta.shape, dtype, &data[start..end], device)?;
        out.push((name, tensor));
    }
    Ok(out)
}

pub fn load(path: &Path, device: Option<Device>) -> Result<Vec<(String, Tensor)>> {
    let bytes = std::fs::read(path)?;
    load_bytes(&bytes, device)
}

/// Serialize tensors into the safetensors layout.
pub fn save_bytes(tensors: &[(String, Tensor)]) -> Result<Vec<u8>> {
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();
    for (name, tensor) in tensors {
        let mut t = tensor.clone();
        t.realize()?;
        let bytes = raw_bytes(&t)?;
        let start = data.len();
        data.extend_from_slice(&bytes);
        header.insert(
            name.clone(),
            serde_json::json!({
                "dtype": dtype_tag(tensor.dtype()),
                "shape": tensor.shape(),
                "data_offsets": [start, data.len()],
            }),
        );
    }
    let header_bytes = serde_json::to_vec(&serde_json::Value::Object(header))?;
    let mut out = Vec::with_capacity(8 + header_bytes.len() + data.len());
    out.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&data);
    Ok(out)
}

pub fn save(path: &Path, tensors: &[(String, Tensor)]) -> Result<()> {
    std::fs::write(path, save_bytes(tensors)?)?;
    Ok(())
}

fn raw_bytes(t: &Tensor) -> Result<Vec<u8>> {
    use crate::array::HostData;
    Ok(match t.to_vec()? {
        HostData::Bool(v) => v.into_iter().map(|b| b as u8).collect(),
        HostData::I32(v) => bytemuck::cast_slice(&v).to_vec(),
        HostData::U32(v) => bytemuck::cast_slice(&v).to_vec(),
        HostData::F32(v) => bytemuck::cast_slice(&v).to_vec(),
        HostData::F64(v) => bytemuck::cast_slice(&v).to_vec(),
        HostData::F16(v) => v.into_iter().flat_map(|x| x.to_le_bytes()).collect(),
    })
}

//! WGSL text generation for tuned kernels.
//!
//! Bindings: storage buffers 0..N-1 are read-only inputs, binding N is the
//! output. Sizes and strides are baked into the shader as constants, so no
//! uniform buffer is required. The 2-D grid is linearized in-shader as
//! `batch = wg.x + wg.y * 16384`. Upcast and unroll lanes are expanded at
//! codegen time by substituting their specials with constants; `group`
//! lowers to a workgroup-shared array with barriers.

use std::collections::HashMap;
use std::fmt::Write;

use gradix_ir::{AluArg, AluExp, AluOp, DType, ReduceOp, Scalar, SpecialKind};

use crate::backend::Device;
use crate::error::{Error, Result};
use crate::tuner::TunedKernel;

/// Workgroup size for non-grouped kernels.
pub const WORKGROUP_SIZE: usize = 256;
/// Grid wrap width along x, in workgroups.
pub const GRID_WRAP: usize = 16384;

/// A rendered shader plus everything the driver needs to launch it.
#[derive(Debug, Clone)]
pub struct Shader {
    pub source: String,
    pub workgroup_size: usize,
    /// Total workgroup count before grid tiling.
    pub workgroups: usize,
    pub num_inputs: usize,
}

fn wgsl_ty(dtype: DType, device: Device) -> Result<&'static str> {
    match dtype {
        DType::F32 => Ok("f32"),
        DType::I32 => Ok("i32"),
        DType::U32 => Ok("u32"),
        DType::F16 => Ok("f16"),
        DType::Bool | DType::F64 => Err(Error::UnsupportedDType { device, dtype }),
    }
}

fn literal(s: Scalar) -> Result<String> {
    Ok(match s {
        Scalar::Bool(b) => format!("{}", b),
        Scalar::I32(v) => format!("i32({})", v),
        Scalar::U32(v) => format!("{}u", v),
        Scalar::F16(v) => {
            let f = v.to_f32();
            if f.is_nan() || f.is_infinite() {
                // reinterpret the canonical bit pattern, then narrow
                format!("f16(bitcast<f32>(0x{:08x}u))", canonical_f32_bits(f))
            } else {
                format!("f16({:?})", f)
            }
        }
        Scalar::F32(v) => {
            if v.is_nan() || v.is_infinite() {
                format!("bitcast<f32>(0x{:08x}u)", canonical_f32_bits(v))
            } else {
                format!("f32({:?})", v)
            }
        }
        Scalar::F64(_) => {
            return Err(Error::UnsupportedDType {
                device: Device::Gpu,
                dtype: DType::F64,
            })
        }
    })
}

fn canonical_f32_bits(v: f32) -> u32 {
    if v.is_nan() {
        0x7fc0_0000
    } else if v == f32::INFINITY {
        0x7f80_0000
    } else {
        0xff80_0000
    }
}

/// Expression writer for one lexical scope. Shared DAG nodes become one
/// `let` binding; separate scopes use separate writers so bindings never
/// escape the block they were emitted in.
struct ExprWriter {
    lines: Vec<String>,
    names: HashMap<u64, String>,
    counter: usize,
    uses_erf: bool,
}

impl ExprWriter {
    fn new(counter_base: usize) -> ExprWriter {
        ExprWriter {
            lines: Vec::new(),
            names: HashMap::new(),
            counter: counter_base,
            uses_erf: false,
        }
    }

    fn bind(&mut self, e: &AluExp, ty: &str, text: String) -> String {
        let name = format!("t{}", self.counter);
        self.counter += 1;
        self.lines.push(format!("let {}: {} = {};", name, ty, text));
        self.names.insert(e.hash64(), name.clone());
        name
    }

    fn emit(&mut self, e: &AluExp) -> Result<String> {
        if let Some(name) = self.names.get(&e.hash64()) {
            return Ok(name.clone());
        }
        let dtype = e.dtype();
        let ty: &str = if dtype == DType::Bool {
            "bool"
        } else {
            wgsl_ty(dtype, Device::Gpu)?
        };
        let text = match e.op() {
            AluOp::Const => {
                let s = e
                    .as_const()
                    .ok_or_else(|| Error::Internal("const without payload".into()))?;
                return literal(s);
            }
            AluOp::Special => {
                let (kind, _) = e
                    .as_special()
                    .ok_or_else(|| Error::Internal("special without kind".into()))?;
                return Ok(match kind {
                    SpecialKind::Gidx => "gi".to_string(),
                    SpecialKind::Ridx => "r".to_string(),
                    SpecialKind::Group => "grp".to_string(),
                    SpecialKind::Acc => "acc".to_string(),
                    other => {
                        return Err(Error::Internal(format!(
                            "special `{}` must be expanded before rendering",
                            other.name()
                        )))
                    }
                });
            }
            AluOp::GlobalIndex => {
                let idx = self.emit(&e.src()[0])?;
                let gid = match e.arg() {
                    AluArg::Global { gid } => *gid,
                    _ => return Err(Error::Internal("global index without gid".into())),
                };
                format!(
                    "in{g}[min(u32({i}), arrayLength(&in{g}) - 1u)]",
                    g = gid,
                    i = idx
                )
            }
            AluOp::GlobalView => {
                return Err(Error::Internal("unresolved global view in shader".into()))
            }
            AluOp::Where => {
                let c = self.emit(&e.src()[0])?;
                let t = self.emit(&e.src()[1])?;
                let f = self.emit(&e.src()[2])?;
                format!("select({}, {}, {})", f, t, c)
            }
            AluOp::Cast => {
                let x = self.emit(&e.src()[0])?;
                let from = e.src()[0].dtype();
                if dtype == DType::Bool {
                    format!("({} != {}(0))", x, wgsl_ty(from, Device::Gpu)?)
                } else if from == DType::Bool {
                    format!("{}({})", ty, x)
                } else {
                    format!("{}({})", ty, x)
                }
            }
            op if op.is_comparison() => {
                let a = self.emit(&e.src()[0])?;
                let b = self.emit(&e.src()[1])?;
                let sym = match op {
                    AluOp::Eq => "==",
                    AluOp::Ne => "!=",
                    AluOp::Lt => "<",
                    AluOp::Le => "<=",
                    AluOp::Gt => ">",
                    _ => ">=",
                };
                format!("({} {} {})", a, sym, b)
            }
            op if op.is_binary() => {
                let a = self.emit(&e.src()[0])?;
                let b = self.emit(&e.src()[1])?;
                match op {
                    AluOp::Add => format!("({} + {})", a, b),
                    AluOp::Sub => format!("({} - {})", a, b),
                    AluOp::Mul => format!("({} * {})", a, b),
                    AluOp::Div => format!("({} / {})", a, b),
                    AluOp::IDiv => {
                        if dtype.is_float() {
                            format!("floor({} / {})", a, b)
                        } else {
                            format!("({} / {})", a, b)
                        }
                    }
                    AluOp::Mod => format!("({} % {})", a, b),
                    AluOp::Min => format!("min({}, {})", a, b),
                    AluOp::Max => format!("max({}, {})", a, b),
                    AluOp::Pow => {
                        if !dtype.is_float() {
                            return Err(Error::Unsupported {
                                device: Device::Gpu,
                                what: "integer pow".to_string(),
                            });
                        }
                        format!("pow({}, {})", a, b)
                    }
                    _ => unreachable!(),
                }
            }
            op if op.is_unary() => {
                let x = self.emit(&e.src()[0])?;
                match op {
                    AluOp::Neg => format!("(-{})", x),
                    AluOp::Recip => format!("({}(1) / {})", ty, x),
                    AluOp::Exp => format!("exp({})", x),
                    AluOp::Log => format!("log({})", x),
                    AluOp::Sin => format!("sin({})", x),
                    AluOp::Cos => format!("cos({})", x),
                    AluOp::Tan => format!("tan({})", x),
                    AluOp::Atan => format!("atan({})", x),
                    AluOp::Asin => format!("asin({})", x),
                    AluOp::Sqrt => format!("sqrt({})", x),
                    AluOp::Abs => format!("abs({})", x),
                    AluOp::Erf | AluOp::Erfc => {
                        self.uses_erf = true;
                        let call = if dtype == DType::F32 {
                            format!("erf_approx({})", x)
                        } else {
                            format!("{}(erf_approx(f32({})))", ty, x)
                        };
                        if op == AluOp::Erf {
                            call
                        } else {
                            format!("({}(1) - {})", ty, call)
                        }
                    }
                    _ => unreachable!(),
                }
            }
            op => return Err(Error::Internal(format!("op {:?} in shader", op))),
        };
        Ok(self.bind(e, ty, text))
    }
}

fn combine_text(op: ReduceOp, acc: &str, v: &str) -> String {
    match op {
        ReduceOp::Sum => format!("{} + {}", acc, v),
        ReduceOp::Prod => format!("{} * {}", acc, v),
        ReduceOp::Min => format!("min({}, {})", acc, v),
        ReduceOp::Max => format!("max({}, {})", acc, v),
    }
}

fn identity_text(op: ReduceOp, dtype: DType) -> Result<String> {
    literal(op.identity(dtype))
}

/// Dtype each input is read at, from the `GlobalIndex` nodes in the body.
fn input_dtypes(t: &TunedKernel) -> Vec<DType> {
    let mut dtypes = vec![DType::F32; t.num_inputs];
    for e in t.exp.collect(&|e| e.op() == AluOp::GlobalIndex) {
        if let AluArg::Global { gid } = e.arg() {
            dtypes[*gid] = e.dtype();
        }
    }
    dtypes
}

/// Substitute upcast/unroll lane constants into the body.
fn lane_exp(exp: &AluExp, upcast: usize, unroll: usize) -> AluExp {
    let mut map = HashMap::new();
    map.insert(SpecialKind::Upcast, AluExp::const_i32(upcast as i32));
    map.insert(SpecialKind::Unroll, AluExp::const_i32(unroll as i32));
    exp.substitute(&map).simplify()
}

/// Render a tuned kernel to WGSL.
pub fn render(t: &TunedKernel) -> Result<Shader> {
    let device = Device::Gpu;
    let out_ty = wgsl_ty(t.out_dtype, device)?;
    let acc_ty = wgsl_ty(t.acc_dtype, device)?;
    let in_dtypes = input_dtypes(t);
    let dims = t.dims;
    let grouped = dims.groups > 1;
    let workgroup_size = if grouped { dims.groups } else { WORKGROUP_SIZE };

    let mut src = String::new();
    let uses_f16 = t.out_dtype == DType::F16
        || t.acc_dtype == DType::F16
        || in_dtypes.contains(&DType::F16)
        || !t.exp.collect(&|e| e.dtype() == DType::F16).is_empty();
    if uses_f16 {
        src.push_str("enable f16;\n\n");
    }
    for (i, &dtype) in in_dtypes.iter().enumerate() {
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<storage, read> in{}: array<{}>;",
            i,
            i,
            wgsl_ty(dtype, device)?
        );
    }
    let _ = writeln!(
        src,
        "@group(0) @binding({}) var<storage, read_write> out0: array<{}>;",
        t.num_inputs, out_ty
    );
    if grouped {
        let _ = writeln!(
            src,
            "var<workgroup> partials: array<{}, {}>;",
            acc_ty,
            dims.groups * dims.upcast
        );
    }

    // Render all scoped regions first so we know whether erf is needed.
    let mut body = String::new();
    if grouped {
        let _ = writeln!(body, "    let batch = wg_id.x + wg_id.y * {}u;", GRID_WRAP);
        let _ = writeln!(body, "    if (batch >= {}u) {{ return; }}", t.threads / dims.groups);
        body.push_str("    let gi = i32(batch);\n");
        body.push_str("    let grp = i32(lid.x);\n");
    } else {
        let _ = writeln!(body, "    let batch = wg_id.x + wg_id.y * {}u;", GRID_WRAP);
        let _ = writeln!(body, "    let tid = batch * {}u + lid.x;", workgroup_size);
        let _ = writeln!(body, "    if (tid >= {}u) {{ return; }}", t.threads);
        body.push_str("    let gi = i32(tid);\n");
    }

    let mut uses_erf = false;
    match t.reduce_op {
        None => {
            // Pure elementwise: one value per upcast lane.
            let mut w = ExprWriter::new(0);
            let mut stores = Vec::new();
            for u in 0..dims.upcast {
                let val = w.emit(&lane_exp(&t.exp, u, 0))?;
                let mut ow = ExprWriter::new(10_000 + u * 100);
                let at = ow.emit(&lane_exp(&t.out_index, u, 0))?;
                for line in ow.lines {
                    stores.push(format!("    {}", line));
                }
                stores.push(format!("    out0[u32({})] = {}({});", at, out_ty, val));
            }
            for line in w.lines {
                let _ = writeln!(body, "    {}", line);
            }
            uses_erf |= w.uses_erf;
            for line in stores {
                let _ = writeln!(body, "{}", line);
            }
        }
        Some(op) => {
            let ident = identity_text(op, t.acc_dtype)?;
            for u in 0..dims.upcast {
                let _ = writeln!(body, "    var acc{}: {} = {};", u, acc_ty, ident);
            }
            let _ = writeln!(
                body,
                "    for (var rr: i32 = 0; rr < {}; rr = rr + 1) {{",
                dims.reduce
            );
            body.push_str("        let r = rr;\n");
            let mut w = ExprWriter::new(0);
            let mut accs = Vec::new();
            for l in 0..dims.unroll {
                for u in 0..dims.upcast {
                    let val = w.emit(&lane_exp(&t.exp, u, l))?;
                    let acc_name = format!("acc{}", u);
                    accs.push(format!(
                        "        {} = {};",
                        acc_name,
                        combine_text(op, &acc_name, &val)
                    ));
                }
            }
            for line in w.lines {
                let _ = writeln!(body, "        {}", line);
            }
            uses_erf |= w.uses_erf;
            for line in accs {
                let _ = writeln!(body, "{}", line);
            }
            body.push_str("    }\n");

            if grouped {
                for u in 0..dims.upcast {
                    let _ = writeln!(
                        body,
                        "    partials[lid.x * {}u + {}u] = acc{};",
                        dims.upcast, u, u
                    );
                }
                body.push_str("    workgroupBarrier();\n");
                let _ = writeln!(body, "    var stride: u32 = {}u;", dims.groups / 2);
                body.push_str("    while (stride > 0u) {\n");
                body.push_str("        if (lid.x < stride) {\n");
                for u in 0..dims.upcast {
                    let a = format!("partials[lid.x * {}u + {}u]", dims.upcast, u);
                    let b = format!("partials[(lid.x + stride) * {}u + {}u]", dims.upcast, u);
                    let _ = writeln!(body, "            {} = {};", a, combine_text(op, &a, &b));
                }
                body.push_str("        }\n");
                body.push_str("        workgroupBarrier();\n");
                body.push_str("        stride = stride / 2u;\n");
                body.push_str("    }\n");
                body.push_str("    if (lid.x != 0u) { return; }\n");
                for u in 0..dims.upcast {
                    let _ = writeln!(body, "    let final{u} = partials[{u}u];", u = u);
                }
            } else {
                for u in 0..dims.upcast {
                    let _ = writeln!(body, "    let final{u} = acc{u};", u = u);
                }
            }

            for u in 0..dims.upcast {
                let mut sw = ExprWriter::new(20_000 + u * 100);
                let value = match &t.epilogue {
                    None => format!("final{}", u),
                    Some(ep) => {
                        let _ = writeln!(body, "    {{");
                        let _ = writeln!(body, "    let acc = final{};", u);
                        let v = sw.emit(&lane_exp(ep, u, 0))?;
                        v
                    }
                };
                let at = sw.emit(&lane_exp(&t.out_index, u, 0))?;
                uses_erf |= sw.uses_erf;
                for line in &sw.lines {
                    let _ = writeln!(body, "    {}", line);
                }
                let _ = writeln!(body, "    out0[u32({})] = {}({});", at, out_ty, value);
                if t.epilogue.is_some() {
                    let _ = writeln!(body, "    }}");
                }
            }
        }
    }

    if uses_erf {
        src.push_str(
            "\nfn erf_approx(x: f32) -> f32 {\n    let s = sign(x);\n    let a = abs(x);\n    let t = 1.0 / (1.0 + 0.3275911 * a);\n    let y = 1.0 - ((((1.061405429 * t - 1.453152027) * t + 1.421413741) * t - 0.284496736) * t + 0.254829592) * t * exp(-a * a);\n    return s * y;\n}\n",
        );
    }

    let _ = writeln!(src, "\n@compute @workgroup_size({})", workgroup_size);
    src.push_str(
        "fn main(@builtin(local_invocation_id) lid: vec3<u32>, @builtin(workgroup_id) wg_id: vec3<u32>) {\n",
    );
    src.push_str(&body);
    src.push_str("}\n");

    let workgroups = if grouped {
        t.threads / dims.groups
    } else {
        t.threads.div_ceil(workgroup_size)
    };
    Ok(Shader {
        source: src,
        workgroup_size,
        workgroups,
        num_inputs: t.num_inputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::{tune_gpu, tune_null};
    use gradix_ir::{Kernel, Reduction, ShapeTracker};

    #[test]
    fn test_elementwise_shader_text() {
        // out[i] = f32(i) * 2
        let exp = AluExp::gidx(8)
            .cast(DType::F32)
            .mul(&AluExp::const_of(DType::F32, 2.0));
        let kernel = Kernel::elementwise(0, 8, exp);
        let shader = render(&tune_null(&kernel)).unwrap();
        assert!(shader.source.contains("@group(0) @binding(0) var<storage, read_write> out0: array<f32>;"));
        assert!(shader.source.contains("@workgroup_size(256)"));
        assert!(shader.source.contains("wg_id.y * 16384u"));
        assert_eq!(shader.workgroups, 1);
    }

    #[test]
    fn test_reduction_shader_has_loop_and_shared_memory() {
        let tracker = ShapeTracker::from_shape(&[8, 512]);
        let full = AluExp::gidx(8)
            .mul(&AluExp::const_i32(512))
            .add(&AluExp::ridx(512));
        let idxs = gradix_ir::view::unflatten_alu(&full, &[8, 512]);
        let exp = AluExp::global_view(DType::F32, 0, tracker, idxs);
        let kernel = Kernel {
            num_inputs: 1,
            size: 8,
            exp,
            reduction: Some(Reduction {
                op: ReduceOp::Sum,
                size: 512,
                fusion: None,
            }),
        };
        let tuned = tune_gpu(&kernel);
        assert!(tuned.dims.groups > 1);
        let shader = render(&tuned).unwrap();
        assert!(shader.source.contains("var<workgroup> partials"));
        assert!(shader.source.contains("workgroupBarrier();"));
        assert!(shader.source.contains("for (var rr: i32 = 0;"));
    }

    #[test]
    fn test_nan_constant_is_bitcast() {
        let exp = AluExp::gidx(4)
            .cast(DType::F32)
            .add(&AluExp::const_of(DType::F32, f64::NAN));
        let kernel = Kernel::elementwise(0, 4, exp);
        let shader = render(&tune_null(&kernel)).unwrap();
        assert!(shader.source.contains("bitcast<f32>(0x7fc00000u)"));
    }

    #[test]
    fn test_f64_rejected() {
        let exp = AluExp::gidx(4).cast(DType::F64);
        let kernel = Kernel::elementwise(0, 4, exp);
        assert!(matches!(
            render(&tune_null(&kernel)),
            Err(Error::UnsupportedDType { .. })
        ));
    }
}

//! Shared helpers for integration tests.
// This helper module is consumed selectively by many integration test
// files; keep the utilities available without forcing every helper to be
// referenced in each individual test target.
#![allow(dead_code)]

use gradix::{init, ops, Device, Tensor, Val};

/// Initialise the host backends once per process.
pub fn setup() {
    init(&[Device::Cpu, Device::Bytecode]);
}

pub fn f32s(shape: &[usize], data: &[f32]) -> Tensor {
    Tensor::from_f32(shape, data, None).expect("from_f32")
}

pub fn f32s_on(device: Device, shape: &[usize], data: &[f32]) -> Tensor {
    Tensor::from_f32(shape, data, Some(device)).expect("from_f32")
}

pub fn i32s(shape: &[usize], data: &[i32]) -> Tensor {
    Tensor::from_i32(shape, data, None).expect("from_i32")
}

/// Read back a value as f64s.
pub fn read(v: &Val) -> Vec<f64> {
    v.tensor().expect("concrete value").to_f64_vec().expect("readback")
}

pub fn read_t(t: &Tensor) -> Vec<f64> {
    t.to_f64_vec().expect("readback")
}

/// Elementwise comparison within an absolute tolerance.
pub fn assert_close(got: &[f64], want: &[f64], tol: f64) {
    assert_eq!(got.len(), want.len(), "length mismatch: {:?} vs {:?}", got, want);
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= tol,
            "element {}: got {}, want {} (tol {})",
            i,
            g,
            w,
            tol
        );
    }
}

/// Wrap tensors as traceable values.
pub fn vals(ts: &[Tensor]) -> Vec<Val> {
    ts.iter().cloned().map(Val::from).collect()
}

/// Sum all elements of a value to a scalar.
pub fn total(v: &Val) -> Val {
    ops::sum(v, None, false).expect("sum")
}

//! Elementwise fusion and movement: the lazy graph must collapse an
//! elementwise chain into a single kernel and movement ops must stay
//! zero-cost view rewrites.

mod common;
use common::*;

use gradix::{ops, with_backend, DType, Device, Tensor, Val};

#[test]
fn test_elementwise_chain_values() {
    setup();
    // y = (x + x) * (x - 1) over arange(8)
    let x = Val::from(Tensor::arange(0.0, 8.0, 1.0, DType::F32, Some(Device::Cpu)).unwrap());
    let y = ops::mul(&ops::add(&x, &x).unwrap(), &ops::subs(&x, 1.0).unwrap()).unwrap();
    assert_close(
        &read(&y),
        &[-0.0, 0.0, 4.0, 12.0, 24.0, 40.0, 60.0, 84.0],
        0.0,
    );
}

#[test]
fn test_elementwise_chain_is_one_dispatch() {
    setup();
    let (dispatches_before, buffers_before) = with_backend(Device::Cpu, |b| {
        Ok((b.dispatch_count(), b.allocated_buffers()))
    })
    .unwrap();
    let x = Val::from(Tensor::arange(0.0, 8.0, 1.0, DType::F32, Some(Device::Cpu)).unwrap());
    let y = ops::mul(&ops::add(&x, &x).unwrap(), &ops::subs(&x, 1.0).unwrap()).unwrap();
    let mut t = y.into_tensor().unwrap();
    t.realize().unwrap();
    let buffers_after_realize =
        with_backend(Device::Cpu, |b| Ok(b.allocated_buffers())).unwrap();
    let _ = t.to_vec().unwrap();
    let dispatches_after = with_backend(Device::Cpu, |b| Ok(b.dispatch_count())).unwrap();
    // Exactly one output buffer was allocated and one kernel dispatched.
    assert_eq!(buffers_after_realize - buffers_before, 1);
    assert_eq!(dispatches_after - dispatches_before, 1);
}

#[test]
fn test_reshape_transpose_reshape() {
    setup();
    // arange(12).reshape([3,4]).transpose([1,0]).reshape([2,6])
    let x = Tensor::arange(0.0, 12.0, 1.0, DType::I32, None).unwrap();
    let t = x
        .reshape(&[3, 4])
        .unwrap()
        .transpose(Some(&[1, 0]))
        .unwrap()
        .reshape(&[2, 6])
        .unwrap();
    assert_eq!(
        read_t(&t),
        vec![0.0, 4.0, 8.0, 1.0, 5.0, 9.0, 2.0, 6.0, 10.0, 3.0, 7.0, 11.0]
    );
}

#[test]
fn test_reshape_round_trip_property() {
    setup();
    let x = f32s(&[2, 6], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
    let back = x.reshape(&[3, 4]).unwrap().reshape(&[2, 6]).unwrap();
    assert_eq!(read_t(&back), read_t(&x));
}

#[test]
fn test_transpose_round_trip_property() {
    setup();
    let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
    let x = f32s(&[2, 3, 4], &data);
    let p = [2, 0, 1];
    // inverse permutation of p
    let mut inv = [0usize; 3];
    for (i, &a) in p.iter().enumerate() {
        inv[a] = i;
    }
    let back = x.transpose(Some(&p)).unwrap().transpose(Some(&inv)).unwrap();
    assert_eq!(read_t(&back), read_t(&x));
}

#[test]
fn test_slice_flip_pad() {
    setup();
    let x = Tensor::arange(0.0, 10.0, 1.0, DType::F32, None).unwrap();
    let s = x.slice(&[2], &[9], Some(&[3])).unwrap();
    assert_eq!(read_t(&s), vec![2.0, 5.0, 8.0]);
    let f = s.flip(&[0]).unwrap();
    assert_eq!(read_t(&f), vec![8.0, 5.0, 2.0]);
    let p = f.pad(&[(1, 2)]).unwrap();
    assert_eq!(read_t(&p), vec![0.0, 8.0, 5.0, 2.0, 0.0, 0.0]);
}

#[test]
fn test_concat_and_stack() {
    setup();
    let a = f32s(&[2], &[1.0, 2.0]);
    let b = f32s(&[3], &[3.0, 4.0, 5.0]);
    let c = Tensor::concat(&[&a, &b], 0).unwrap();
    assert_eq!(read_t(&c), vec![1.0, 2.0, 3.0, 4.0, 5.0]);

    let d = f32s(&[2], &[6.0, 7.0]);
    let s = Tensor::stack(&[&a, &d], 0).unwrap();
    assert_eq!(s.shape(), &[2, 2]);
    assert_eq!(read_t(&s), vec![1.0, 2.0, 6.0, 7.0]);
}

#[test]
fn test_tile_and_repeat() {
    setup();
    let x = f32s(&[2], &[1.0, 2.0]);
    let t = x.tile(&[3]).unwrap();
    assert_eq!(read_t(&t), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    let r = x.repeat(3, 0).unwrap();
    assert_eq!(read_t(&r), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
}

#[test]
fn test_broadcast_to() {
    setup();
    let x = f32s(&[1, 3], &[1.0, 2.0, 3.0]);
    let b = x.broadcast_to(&[2, 3]).unwrap();
    assert_eq!(read_t(&b), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    assert!(f32s(&[2], &[1.0, 2.0]).broadcast_to(&[3]).is_err());
}

#[test]
fn test_eye_and_linspace() {
    setup();
    let e = Tensor::eye(2, Some(3), 1, DType::F32, None).unwrap();
    assert_eq!(read_t(&e), vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    let l = Tensor::linspace(0.0, 1.0, 5, DType::F32, None).unwrap();
    assert_close(&read_t(&l), &[0.0, 0.25, 0.5, 0.75, 1.0], 1e-7);
}

#[test]
fn test_where_and_cast() {
    setup();
    let x = f32s(&[4], &[1.0, -2.0, 3.0, -4.0]);
    let v = Val::from(x);
    let mask = ops::gt(&v, &ops::full_like(&v, 0.0).unwrap()).unwrap();
    let y = ops::where_(&mask, &v, &ops::zeros_like(&v).unwrap()).unwrap();
    assert_eq!(read(&y), vec![1.0, 0.0, 3.0, 0.0]);
    let i = ops::cast(&y, DType::I32).unwrap();
    assert_eq!(i.dtype(), DType::I32);
    assert_eq!(read(&i), vec![1.0, 0.0, 3.0, 0.0]);
}

#[test]
fn test_shape_usage_errors_are_synchronous() {
    setup();
    let x = f32s(&[4], &[1.0; 4]);
    assert!(x.reshape(&[3]).is_err());
    assert!(x.transpose(Some(&[0, 0])).is_err());
    assert!(x.slice(&[0], &[9], None).is_err());
    let y = f32s(&[3], &[1.0; 3]);
    let v = vals(&[x, y]);
    assert!(ops::add(&v[0], &v[1]).is_err());
}

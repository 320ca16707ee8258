//! Reductions: axis handling, identities over empty axes, fused epilogues,
//! extremum indices.

mod common;
use common::*;

use gradix::{DType, Tensor};

#[test]
fn test_min_max_along_axes() {
    setup();
    let x = i32s(&[2, 3], &[3, 1, 4, 2, 5, 0]);
    assert_eq!(read_t(&x.min(Some(&[0]), false).unwrap()), vec![2.0, 1.0, 0.0]);
    assert_eq!(read_t(&x.max(Some(&[0]), false).unwrap()), vec![3.0, 5.0, 4.0]);
    assert_eq!(read_t(&x.min(None, false).unwrap()), vec![0.0]);
    assert_eq!(read_t(&x.argmax(Some(1)).unwrap()), vec![2.0, 1.0]);
}

#[test]
fn test_sum_and_prod() {
    setup();
    let x = i32s(&[2, 3], &[1, 2, 3, 4, 5, 6]);
    assert_eq!(read_t(&x.sum(Some(&[1]), false).unwrap()), vec![6.0, 15.0]);
    assert_eq!(read_t(&x.sum(Some(&[0]), false).unwrap()), vec![5.0, 7.0, 9.0]);
    assert_eq!(read_t(&x.prod(None, false).unwrap()), vec![720.0]);
}

#[test]
fn test_keepdims_shape() {
    setup();
    let x = f32s(&[2, 3], &[1.0; 6]);
    let s = x.sum(Some(&[1]), true).unwrap();
    assert_eq!(s.shape(), &[2, 1]);
    assert_eq!(read_t(&s), vec![3.0, 3.0]);
}

#[test]
fn test_mean_uses_epilogue() {
    setup();
    let x = f32s(&[4], &[1.0, 2.0, 3.0, 4.0]);
    let m = x.mean(None, false).unwrap();
    assert_eq!(read_t(&m), vec![2.5]);
    let m2 = x.reshape(&[2, 2]).unwrap().mean(Some(&[0]), false).unwrap();
    assert_eq!(read_t(&m2), vec![2.0, 3.0]);
}

#[test]
fn test_empty_axis_reduction_yields_identity() {
    setup();
    let x = Tensor::zeros(&[3, 0], DType::F32, None).unwrap();
    assert_eq!(read_t(&x.sum(Some(&[1]), false).unwrap()), vec![0.0, 0.0, 0.0]);
    assert_eq!(read_t(&x.prod(Some(&[1]), false).unwrap()), vec![1.0, 1.0, 1.0]);
    let mx = x.max(Some(&[1]), false).unwrap();
    assert_eq!(read_t(&mx), vec![f64::NEG_INFINITY; 3]);
}

#[test]
fn test_bool_reductions_are_logical() {
    setup();
    let x = Tensor::from_bool(&[4], &[true, false, true, false], None).unwrap();
    // sum = any, prod = all
    assert_eq!(read_t(&x.sum(None, false).unwrap()), vec![1.0]);
    assert_eq!(read_t(&x.prod(None, false).unwrap()), vec![0.0]);
}

#[test]
fn test_argmin_ties_take_first() {
    setup();
    let x = i32s(&[5], &[2, 0, 1, 0, 3]);
    assert_eq!(read_t(&x.argmin(Some(0)).unwrap()), vec![1.0]);
}

#[test]
fn test_reduction_over_view() {
    setup();
    // reduce over a transposed view: sums of the original columns
    let x = i32s(&[2, 3], &[1, 2, 3, 4, 5, 6]);
    let t = x.transpose(Some(&[1, 0])).unwrap();
    assert_eq!(read_t(&t.sum(Some(&[1]), false).unwrap()), vec![5.0, 7.0, 9.0]);
}

#[test]
fn test_reduce_axis_out_of_bounds() {
    setup();
    let x = f32s(&[2, 2], &[1.0; 4]);
    assert!(x.sum(Some(&[2]), false).is_err());
    assert!(x.sum(Some(&[0, 0]), false).is_err());
}

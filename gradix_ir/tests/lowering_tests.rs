//! Integration tests: shape trackers lowered to ALU index expressions and
//! evaluated against a host buffer.

use gradix_ir::{
    AluExp, DType, EvalCtx, GlobalRead, Scalar, ShapeTracker, SpecialKind,
};
use pretty_assertions::assert_eq;

/// A single f32 buffer addressed as input 0.
struct OneBuffer(Vec<f32>);

impl GlobalRead for OneBuffer {
    fn load(&self, gid: usize, index: i64, dtype: DType) -> Scalar {
        assert_eq!(gid, 0);
        assert_eq!(dtype, DType::F32);
        Scalar::F32(self.0[index as usize])
    }
}

fn read_all(tracker: &ShapeTracker, data: Vec<f32>) -> Vec<f32> {
    let globals = OneBuffer(data);
    let shape = tracker.shape().to_vec();
    let size = tracker.size();
    let flat = AluExp::gidx(size);
    let idxs = gradix_ir::view::unflatten_alu(&flat, &shape);
    let exp = AluExp::global_view(DType::F32, 0, tracker.clone(), idxs).simplify();
    (0..size as i64)
        .map(|i| {
            let mut ctx = EvalCtx::new(&globals);
            ctx.set_index(SpecialKind::Gidx, i);
            exp.evaluate(&ctx).to_f64() as f32
        })
        .collect()
}

#[test]
fn test_reshape_transpose_reshape_reads() {
    // arange(12).reshape([3,4]).transpose([1,0]).reshape([2,6])
    let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
    let tracker = ShapeTracker::from_shape(&[12])
        .reshape(&[3, 4])
        .unwrap()
        .permute(&[1, 0])
        .unwrap()
        .reshape(&[2, 6])
        .unwrap();
    assert_eq!(
        read_all(&tracker, data),
        vec![0.0, 4.0, 8.0, 1.0, 5.0, 9.0, 2.0, 6.0, 10.0, 3.0, 7.0, 11.0]
    );
}

#[test]
fn test_padded_reads_yield_zero() {
    let tracker = ShapeTracker::from_shape(&[3]).pad(&[(1, 1)]).unwrap();
    assert_eq!(
        read_all(&tracker, vec![5.0, 6.0, 7.0]),
        vec![0.0, 5.0, 6.0, 7.0, 0.0]
    );
}

#[test]
fn test_broadcast_and_flip_reads() {
    let tracker = ShapeTracker::from_shape(&[1, 3])
        .expand(&[2, 3])
        .unwrap()
        .flip(&[false, true])
        .unwrap();
    assert_eq!(
        read_all(&tracker, vec![1.0, 2.0, 3.0]),
        vec![3.0, 2.0, 1.0, 3.0, 2.0, 1.0]
    );
}

#[test]
fn test_strided_slice_reads() {
    let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let tracker = ShapeTracker::from_shape(&[10])
        .slice(&[1], &[10], Some(&[4]))
        .unwrap();
    assert_eq!(read_all(&tracker, data), vec![1.0, 5.0, 9.0]);
}

#[test]
fn test_tracker_serde_round_trip() {
    let tracker = ShapeTracker::from_shape(&[4, 5])
        .permute(&[1, 0])
        .unwrap()
        .pad(&[(0, 1), (2, 0)])
        .unwrap();
    let json = serde_json::to_string(&tracker).unwrap();
    let back: ShapeTracker = serde_json::from_str(&json).unwrap();
    assert_eq!(tracker, back);
}

#[test]
fn test_offset_expression_is_simplified() {
    // A contiguous tracker lowers to the identity on the flat index.
    let tracker = ShapeTracker::from_shape(&[8]);
    let flat = AluExp::gidx(8);
    let (off, valid) = tracker.to_alu(&[flat.clone()]);
    assert_eq!(off, flat);
    assert_eq!(valid.as_const(), Some(Scalar::Bool(true)));
}

//! Lazy views and stacks: identity laws, write routing, staleness and
//! storage-mode transitions.
//! Run with: cargo test -p kore-tensordict --test lazy_tests

use kore_core::{DType, Device, KoreError, StorageMode, Tensor, TensorIndex};
use kore_tensordict::{
    stack, AnyTensorDict, TensorDict, TensorDictBase, TensorDictError, TensorDictKind,
};
use rstest::rstest;

fn grid() -> TensorDict {
    TensorDict::new(
        [
            ("a", Tensor::arange(0.0, 24.0, 1.0).reshape(&[2, 3, 4]).unwrap()),
            ("m", Tensor::zeros(&[2, 3], DType::I64)),
        ],
        [2, 3],
        None,
    )
    .unwrap()
}

fn row(value: f64) -> TensorDict {
    let inner = TensorDict::new(
        [("h", Tensor::full(&[2, 3], value, DType::F32))],
        [2],
        None,
    )
    .unwrap();
    let td = TensorDict::new(
        [("x", Tensor::full(&[2, 4], value, DType::F32))],
        [2],
        None,
    )
    .unwrap();
    td.set("inner", inner).unwrap();
    td
}

fn rows() -> Vec<TensorDict> {
    vec![row(0.0), row(1.0), row(2.0)]
}

// ============================================================================
// Identity laws
// ============================================================================

#[rstest]
#[case(0)]
#[case(1)]
#[case(2)]
#[case(-1)]
fn test_unsqueeze_then_squeeze_is_identity(#[case] dim: isize) {
    let td = grid();
    let up = td.unsqueeze(dim).unwrap();
    assert_eq!(up.kind(), TensorDictKind::Unsqueezed);
    assert_eq!(up.batch_dims(), 3);
    let back = up.squeeze(dim).unwrap();
    assert!(back.same_as(&td.to_any()));
}

#[rstest]
#[case(&[1, 0])]
#[case(&[0, 1])]
fn test_permute_inverse_is_identity(#[case] order: &[usize]) {
    let td = grid();
    let p = td.permute(order).unwrap();
    let mut inverse = vec![0; order.len()];
    for (i, &o) in order.iter().enumerate() {
        inverse[o] = i;
    }
    assert!(p.permute(&inverse).unwrap().same_as(&td.to_any()));
}

#[rstest]
#[case(&[6])]
#[case(&[3, 2])]
#[case(&[-1, 1])]
fn test_view_back_is_identity(#[case] shape: &[isize]) {
    let td = grid();
    let v = td.view(shape).unwrap();
    assert_eq!(v.kind(), TensorDictKind::Viewed);
    assert!(v.view(&[2, 3]).unwrap().same_as(&td.to_any()));
}

#[test]
fn test_squeeze_non_unit_is_noop() {
    let td = grid();
    assert!(td.squeeze(0).unwrap().same_as(&td.to_any()));
}

#[test]
fn test_lazy_stack_index_returns_source() {
    let parts = rows();
    let lazy = stack(&parts, 0).unwrap();
    let picked = lazy.index(&[1.into()]).unwrap();
    assert!(picked.same_as(&parts[1].to_any()));
}

// ============================================================================
// Reads and writes through views
// ============================================================================

#[test]
fn test_permuted_write_reaches_source() {
    let td = grid();
    let p = td.permute(&[1, 0]).unwrap();
    assert_eq!(p.batch_size().dims(), &[3, 2]);
    assert_eq!(p.get_tensor("a").unwrap().shape().dims(), &[3, 2, 4]);
    p.set_at("m", &[2.into(), 0.into()], &Tensor::from_i64(&[9], &[]))
        .unwrap();
    let m = td.get_tensor("m").unwrap().to_vec_i64();
    assert_eq!(m, vec![0, 0, 9, 0, 0, 0]);
}

#[test]
fn test_viewed_write_reaches_source() {
    let td = grid();
    let v = td.view(&[6]).unwrap();
    let tail = v.get_sub_tensordict(&[(4..).into()]).unwrap();
    tail.fill_("m", 1.0).unwrap();
    assert_eq!(td.get_tensor("m").unwrap().to_vec_i64(), vec![0, 0, 0, 0, 1, 1]);
}

#[test]
fn test_unsqueezed_set_new_key() {
    let td = grid();
    let up = td.unsqueeze(0).unwrap();
    up.set("z", Tensor::ones(&[1, 2, 3])).unwrap();
    assert_eq!(td.get_tensor("z").unwrap().shape().dims(), &[2, 3]);
}

#[test]
fn test_lazy_stack_reads_nested_lazily() {
    let lazy = stack(&rows(), 0).unwrap();
    assert_eq!(lazy.batch_size().dims(), &[3, 2]);
    let inner = lazy.get_nested("inner").unwrap();
    assert_eq!(inner.kind(), TensorDictKind::LazyStacked);
    assert_eq!(inner.batch_size().dims(), &[3, 2]);
    let h = inner.get_tensor("h").unwrap();
    assert_eq!(h.shape().dims(), &[3, 2, 3]);
    assert_eq!(h.sum_all(), 6.0 * (0.0 + 1.0 + 2.0));
}

#[test]
fn test_lazy_stack_fill_reaches_sources() {
    let parts = rows();
    let lazy = stack(&parts, 0).unwrap();
    lazy.fill_("x", 5.0).unwrap();
    assert!(parts
        .iter()
        .all(|p| p.get_tensor("x").unwrap().to_vec_f32().iter().all(|&v| v == 5.0)));
}

#[test]
fn test_sub_view_over_lazy_stack_writes_back() {
    let parts = rows();
    let lazy = stack(&parts, 0).unwrap();
    let head = lazy.get_sub_tensordict(&[(0..2).into()]).unwrap();
    head.fill_("x", 3.0).unwrap();
    assert_eq!(parts[0].get_tensor("x").unwrap().sum_all(), 24.0);
    assert_eq!(parts[1].get_tensor("x").unwrap().sum_all(), 24.0);
    assert_eq!(parts[2].get_tensor("x").unwrap().sum_all(), 16.0);

    let across = lazy.get_sub_tensordict(&[(..).into(), 1.into()]).unwrap();
    across.fill_("x", -1.0).unwrap();
    let x = parts[2].get_tensor("x").unwrap().to_vec_f32();
    assert_eq!(x, vec![2.0, 2.0, 2.0, 2.0, -1.0, -1.0, -1.0, -1.0]);
}

#[test]
fn test_lazy_stack_set_splits_value() {
    let parts = rows();
    let lazy = stack(&parts, 1).unwrap();
    assert_eq!(lazy.batch_size().dims(), &[2, 3]);
    lazy.set("y", Tensor::arange(0.0, 6.0, 1.0).reshape(&[2, 3]).unwrap())
        .unwrap();
    assert_eq!(parts[0].get_tensor("y").unwrap().to_vec_f32(), vec![0.0, 3.0]);
    assert_eq!(parts[2].get_tensor("y").unwrap().to_vec_f32(), vec![2.0, 5.0]);

    let bad = Tensor::zeros(&[3, 3], DType::F32);
    assert!(lazy.set("w", bad).is_err());
    assert!(parts.iter().all(|p| !p.contains("w")));
}

#[test]
fn test_lazy_stack_mask_materializes() {
    let lazy = stack(&rows(), 0).unwrap();
    let mask = Tensor::from_bool(&[true, false, false, true, true, true], &[3, 2]);
    let out = lazy.index(&[mask.into()]).unwrap();
    assert_eq!(out.kind(), TensorDictKind::Eager);
    assert_eq!(out.batch_size().dims(), &[4]);
    assert_eq!(
        out.get_tensor("x").unwrap().index(&[(..).into(), 0.into()]).unwrap().to_vec_f32(),
        vec![0.0, 1.0, 2.0, 2.0]
    );
}

// ============================================================================
// Stack validation
// ============================================================================

#[test]
fn test_stack_key_mismatch() {
    let a = TensorDict::new([("x", Tensor::ones(&[2]))], [2], None).unwrap();
    let b = TensorDict::new([("y", Tensor::ones(&[2]))], [2], None).unwrap();
    let err = stack(&[a.clone(), b.clone()], 0).unwrap_err();
    assert!(matches!(err, TensorDictError::KeyMismatch(_)));
    assert_eq!(a.key_list(), vec!["x"]);
    assert_eq!(b.key_list(), vec!["y"]);
}

#[rstest]
#[case::batch(
    TensorDict::new([("x", Tensor::ones(&[3]))], [3], None).unwrap(),
    "shape"
)]
#[case::device(
    TensorDict::new([("x", Tensor::zeros_on(&[2], DType::F32, Device::Cuda(0)))], [2], None).unwrap(),
    "device"
)]
#[case::kind(
    {
        let td = TensorDict::empty([2], None);
        td.set("x", TensorDict::empty([2], None)).unwrap();
        td
    },
    "kind"
)]
#[case::dtype(
    TensorDict::new([("x", Tensor::zeros(&[2], DType::I64))], [2], None).unwrap(),
    "dtype"
)]
fn test_stack_rejects_incompatible(#[case] other: TensorDict, #[case] what: &str) {
    let base = TensorDict::new([("x", Tensor::ones(&[2]))], [2], None).unwrap();
    let err = stack(&[base, other], 0).unwrap_err();
    let ok = match what {
        "shape" => matches!(err, TensorDictError::ShapeMismatch(_)),
        "device" => matches!(err, TensorDictError::DeviceMismatch { .. }),
        "dtype" => matches!(err, TensorDictError::DTypeMismatch { .. }),
        _ => matches!(err, TensorDictError::KindMismatch { .. }),
    };
    assert!(ok, "{what}: got {err:?}");
}

#[test]
fn test_stack_of_stacks_rejects_dtype_conflict() {
    let floats = stack(&rows(), 0).unwrap();
    let ints = rows();
    for td in &ints {
        td.set("x", Tensor::zeros(&[2, 4], DType::I64)).unwrap();
    }
    let ints = stack(&ints, 0).unwrap();
    let err = stack(&[floats.clone(), ints], 0).unwrap_err();
    assert!(matches!(err, TensorDictError::DTypeMismatch { ref key, .. } if key == "x"));

    let doubles = rows();
    for td in &doubles {
        td.get_nested("inner")
            .unwrap()
            .set("h", Tensor::zeros(&[2, 3], DType::F64))
            .unwrap();
    }
    let doubles = stack(&doubles, 0).unwrap().permute(&[1, 0]).unwrap();
    let floats = floats.permute(&[1, 0]).unwrap();
    let err = stack(&[floats, doubles], 0).unwrap_err();
    assert!(matches!(err, TensorDictError::DTypeMismatch { ref key, .. } if key == "inner.h"));
}

#[test]
fn test_entry_meta_matches_read() {
    let lazy = stack(&rows(), 1).unwrap();
    let views: Vec<AnyTensorDict> = vec![
        lazy.to_any(),
        lazy.unsqueeze(1).unwrap(),
        lazy.view(&[6]).unwrap(),
        lazy.permute(&[1, 0]).unwrap(),
        lazy.get_sub_tensordict(&[(0..1).into()]).unwrap().into(),
    ];
    for v in &views {
        for key in ["x", "inner"] {
            let read = v.get(key).unwrap().meta();
            assert_eq!(v.entry_meta(key).unwrap(), read, "{:?} {key}", v.kind());
        }
    }
}

#[test]
fn test_stack_of_stacks_reads_no_leaves_to_validate() {
    let left = rows();
    let right = rows();
    let inner_left = stack(&left, 0).unwrap();
    let inner_right = stack(&right, 0).unwrap();
    // the right stack can no longer build "x", but its metadata still answers
    right[2].set("x", Tensor::zeros(&[2, 5], DType::F32)).unwrap();
    assert!(inner_right.get("x").is_err());

    let outer = stack(&[inner_left, inner_right], 0).unwrap();
    assert_eq!(outer.batch_size().dims(), &[2, 3, 2]);
    assert_eq!(outer.entry_meta("x").unwrap().shape.dims(), &[2, 3, 2, 4]);
    let inner = outer.get_nested("inner").unwrap();
    assert_eq!(inner.kind(), TensorDictKind::LazyStacked);
    assert_eq!(inner.get_tensor("h").unwrap().shape().dims(), &[2, 3, 2, 3]);
    assert!(matches!(
        outer.get("x"),
        Err(TensorDictError::Tensor(KoreError::ShapeMismatch { .. }))
    ));
}

// ============================================================================
// Staleness
// ============================================================================

#[test]
fn test_views_go_stale_after_batch_change() {
    let td = grid();
    let views: Vec<AnyTensorDict> = vec![
        td.unsqueeze(0).unwrap(),
        td.view(&[6]).unwrap(),
        td.permute(&[1, 0]).unwrap(),
        td.get_sub_tensordict(&[(0..1).into()]).unwrap().into(),
    ];
    td.set_batch_size(&[2]).unwrap();
    for v in &views {
        assert!(
            matches!(v.get("a"), Err(TensorDictError::StaleReference(_))),
            "{:?} should be stale",
            v.kind()
        );
    }
}

#[test]
fn test_lazy_stack_goes_stale() {
    let parts = rows();
    let lazy = stack(&parts, 0).unwrap();
    parts[1].set_batch_size(&[]).unwrap();
    assert!(matches!(
        lazy.get("x"),
        Err(TensorDictError::StaleReference(_))
    ));
}

// ============================================================================
// Storage modes
// ============================================================================

#[test]
fn test_share_memory_marks_every_leaf() {
    let td = row(1.0);
    assert!(!td.is_shared());
    td.share_memory_().unwrap();
    assert!(td.is_shared());
    let h = td.get_path(&["inner", "h"]).unwrap().into_tensor("h").unwrap();
    assert_eq!(h.storage_mode(), StorageMode::Shared);
    assert_eq!(td.storage_mode(), StorageMode::Shared);
}

#[test]
fn test_memmap_is_all_or_nothing() {
    let td = grid();
    td.get_tensor("m").unwrap().share_memory_().unwrap();
    assert!(td.memmap_().is_err());
    assert_eq!(td.get_tensor("a").unwrap().storage_mode(), StorageMode::Private);
    assert!(!td.is_memmapped());
}

#[test]
fn test_memmap_rejects_accelerator() {
    let td = grid().to(Device::Cuda(0)).unwrap();
    assert!(td.memmap_().is_err());
    assert!(!td.is_memmapped());
}

#[test]
fn test_lazy_stack_memmap_reaches_sources() {
    let parts = rows();
    let lazy = stack(&parts, 0).unwrap();
    lazy.memmap_().unwrap();
    assert!(lazy.is_memmapped());
    assert!(parts.iter().all(|p| p.is_memmapped()));
}

#[test]
fn test_materialize_breaks_aliasing() {
    let td = grid();
    let up = td.unsqueeze(1).unwrap();
    let owned = up.materialize().unwrap();
    assert_eq!(owned.batch_size().dims(), &[2, 1, 3]);
    owned.fill_("m", 4.0).unwrap();
    assert_eq!(td.get_tensor("m").unwrap().sum_all(), 0.0);

    let idx: Vec<TensorIndex> = vec![(..).into(), 0.into()];
    assert_eq!(
        owned.index(&idx).unwrap().get_tensor("a").unwrap().shape().dims(),
        &[2, 3, 4]
    );
}

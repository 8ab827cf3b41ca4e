//! Index expressions over leading tensor dimensions.
//!
//! Every index result is a view (see [`Tensor`]): basic items keep strided
//! addressing, a single integer list or boolean mask switches the result to
//! an explicit offset table. Writing through the result with
//! [`Tensor::index_put_`] therefore updates the indexed source.

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use crate::dtype::DType;
use crate::error::KoreError;
use crate::shape::{normalize_axis, Shape};
use crate::tensor::Tensor;
use crate::Result;

/// One item of an index expression.
#[derive(Debug, Clone)]
pub enum TensorIndex {
    /// A single position (negative counts from the end); drops the dimension.
    Select(isize),
    /// Python-style range with a positive step; out-of-range bounds clamp.
    Slice {
        start: Option<isize>,
        stop: Option<isize>,
        step: usize,
    },
    /// The whole dimension (`..`).
    Full,
    /// Insert a size-1 dimension.
    NewAxis,
    /// Integer positions along one dimension.
    List(Vec<isize>),
    /// Boolean mask over one or more consecutive dimensions; they collapse
    /// into a single dimension sized by the number of `true` entries.
    Mask(Tensor),
}

impl TensorIndex {
    pub fn slice(start: isize, stop: isize) -> Self {
        TensorIndex::Slice {
            start: Some(start),
            stop: Some(stop),
            step: 1,
        }
    }

    pub fn step_by(start: Option<isize>, stop: Option<isize>, step: usize) -> Self {
        TensorIndex::Slice { start, stop, step }
    }

    /// Whether this item is a list or mask.
    pub fn is_advanced(&self) -> bool {
        matches!(self, TensorIndex::List(_) | TensorIndex::Mask(_))
    }

    pub fn is_select(&self) -> bool {
        matches!(self, TensorIndex::Select(_))
    }

    /// Whether this item keeps a whole dimension untouched.
    pub fn is_full(&self) -> bool {
        matches!(
            self,
            TensorIndex::Full
                | TensorIndex::Slice {
                    start: None | Some(0),
                    stop: None,
                    step: 1
                }
        )
    }

    /// Number of input dimensions this item consumes.
    pub fn span(&self) -> usize {
        match self {
            TensorIndex::NewAxis => 0,
            TensorIndex::Mask(m) => m.ndim(),
            _ => 1,
        }
    }

    /// Positions this item picks from a single dimension of length `size`.
    pub fn positions(&self, size: usize) -> Result<Vec<usize>> {
        if self.span() != 1 {
            return Err(oob(format!("{self:?} does not address a single dimension")));
        }
        let steps = resolve(&[size], std::slice::from_ref(self))?;
        Ok(match steps.into_iter().next() {
            Some(Step::Select { index }) => vec![index],
            Some(Step::Slice { start, len, step }) => (0..len).map(|k| start + k * step).collect(),
            Some(Step::Take { picks, .. }) => picks,
            Some(Step::NewAxis) | None => Vec::new(),
        })
    }
}

macro_rules! impl_index_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for TensorIndex {
                fn from(i: $t) -> Self {
                    TensorIndex::Select(i as isize)
                }
            }

            impl From<Range<$t>> for TensorIndex {
                fn from(r: Range<$t>) -> Self {
                    TensorIndex::slice(r.start as isize, r.end as isize)
                }
            }

            impl From<RangeFrom<$t>> for TensorIndex {
                fn from(r: RangeFrom<$t>) -> Self {
                    TensorIndex::step_by(Some(r.start as isize), None, 1)
                }
            }

            impl From<RangeTo<$t>> for TensorIndex {
                fn from(r: RangeTo<$t>) -> Self {
                    TensorIndex::step_by(None, Some(r.end as isize), 1)
                }
            }

            impl From<Vec<$t>> for TensorIndex {
                fn from(v: Vec<$t>) -> Self {
                    TensorIndex::List(v.into_iter().map(|i| i as isize).collect())
                }
            }
        )*
    };
}

impl_index_from_int!(i32, i64, isize, usize);

impl From<RangeFull> for TensorIndex {
    fn from(_: RangeFull) -> Self {
        TensorIndex::Full
    }
}

/// Boolean tensors become masks, anything else an integer list.
impl From<Tensor> for TensorIndex {
    fn from(t: Tensor) -> Self {
        if t.dtype() == DType::Bool {
            TensorIndex::Mask(t)
        } else {
            TensorIndex::List(t.to_vec_i64().into_iter().map(|i| i as isize).collect())
        }
    }
}

/// An index item resolved against a concrete shape.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Select { index: usize },
    Slice { start: usize, len: usize, step: usize },
    NewAxis,
    Take { span: usize, picks: Vec<usize> },
}

fn oob(msg: String) -> KoreError {
    KoreError::InvalidIndex(msg)
}

/// Validate `index` against `dims` and resolve negative positions, slice
/// bounds and mask selections.
pub(crate) fn resolve(dims: &[usize], index: &[TensorIndex]) -> Result<Vec<Step>> {
    let ndim = dims.len();
    let mut d = 0usize;
    let mut advanced = 0usize;
    let mut steps = Vec::with_capacity(index.len());

    for item in index {
        let span = item.span();
        if d + span > ndim {
            return Err(oob(format!(
                "too many indices: {} dimension(s) indexed but only {ndim} available",
                d + span
            )));
        }
        match item {
            TensorIndex::Select(i) => {
                let size = dims[d];
                let index = normalize_axis(*i, size, 0).ok_or_else(|| {
                    oob(format!("index {i} is out of bounds for dimension {d} with size {size}"))
                })?;
                steps.push(Step::Select { index });
            }
            TensorIndex::Full => steps.push(Step::Slice {
                start: 0,
                len: dims[d],
                step: 1,
            }),
            TensorIndex::Slice { start, stop, step } => {
                if *step == 0 {
                    return Err(oob("slice step must be positive".into()));
                }
                let size = dims[d] as isize;
                let clamp = |v: isize| -> usize {
                    let v = if v < 0 { v + size } else { v };
                    v.clamp(0, size) as usize
                };
                let start = start.map(clamp).unwrap_or(0);
                let stop = stop.map(clamp).unwrap_or(dims[d]);
                let len = if stop > start {
                    (stop - start).div_ceil(*step)
                } else {
                    0
                };
                steps.push(Step::Slice {
                    start,
                    len,
                    step: *step,
                });
            }
            TensorIndex::NewAxis => steps.push(Step::NewAxis),
            TensorIndex::List(list) => {
                advanced += 1;
                let size = dims[d];
                let picks = list
                    .iter()
                    .map(|&i| {
                        normalize_axis(i, size, 0).ok_or_else(|| {
                            oob(format!(
                                "index {i} is out of bounds for dimension {d} with size {size}"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                steps.push(Step::Take { span: 1, picks });
            }
            TensorIndex::Mask(mask) => {
                advanced += 1;
                if mask.dtype() != DType::Bool {
                    return Err(oob(format!("mask must be bool, got {}", mask.dtype())));
                }
                if span == 0 {
                    return Err(oob("0-d masks are not supported".into()));
                }
                if mask.shape().dims() != &dims[d..d + span] {
                    return Err(oob(format!(
                        "mask of shape {} does not match dimensions {:?} starting at {d}",
                        mask.shape(),
                        &dims[d..d + span]
                    )));
                }
                let picks = mask
                    .to_vec_bool()
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, keep)| keep.then_some(i))
                    .collect();
                steps.push(Step::Take { span, picks });
            }
        }
        d += span;
    }

    if advanced > 1 {
        return Err(oob(
            "at most one integer-list or mask item is supported per index".into(),
        ));
    }
    Ok(steps)
}

/// Shape obtained by applying `index` to a tensor of shape `dims`.
pub fn index_shape(dims: &[usize], index: &[TensorIndex]) -> Result<Shape> {
    let steps = resolve(dims, index)?;
    let mut out = Vec::with_capacity(dims.len() + 1);
    let mut d = 0;
    for step in &steps {
        match step {
            Step::Select { .. } => d += 1,
            Step::Slice { len, .. } => {
                out.push(*len);
                d += 1;
            }
            Step::NewAxis => out.push(1),
            Step::Take { span, picks } => {
                out.push(picks.len());
                d += span;
            }
        }
    }
    out.extend_from_slice(&dims[d..]);
    Ok(Shape::from(out))
}

impl Tensor {
    /// View selected by `index` (applied to the leading dimensions).
    pub fn index(&self, index: &[TensorIndex]) -> Result<Tensor> {
        let steps = resolve(self.shape().dims(), index)?;
        let mut t = self.clone();
        let mut d = 0;
        for step in &steps {
            t = match step {
                Step::Select { index } => t.select_at(d, *index)?,
                Step::Slice { start, len, step } => {
                    d += 1;
                    t.slice_at(d - 1, *start, *len, *step)?
                }
                Step::NewAxis => {
                    d += 1;
                    t.unsqueeze_at(d - 1)?
                }
                Step::Take { span, picks } => {
                    d += 1;
                    t.take_at(d - 1, *span, picks)
                }
            };
        }
        Ok(t)
    }

    /// Write `value` (broadcast to the indexed shape) into the region selected
    /// by `index`.
    pub fn index_put_(&self, index: &[TensorIndex], value: &Tensor) -> Result<()> {
        self.index(index)?.copy_(value)
    }

    /// Set the entries selected by a boolean mask over the leading dims.
    pub fn masked_fill_(&self, mask: &Tensor, value: f64) -> Result<()> {
        self.index(&[TensorIndex::Mask(mask.clone())])?.fill_(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Tensor {
        Tensor::arange(0.0, 12.0, 1.0).reshape(&[3, 4]).unwrap()
    }

    #[test]
    fn test_basic_index_shapes() {
        let t = grid();
        assert_eq!(t.index(&[1.into()]).unwrap().shape().dims(), &[4]);
        assert_eq!(t.index(&[(..).into(), (1..3).into()]).unwrap().shape().dims(), &[3, 2]);
        assert_eq!(t.index(&[TensorIndex::NewAxis]).unwrap().shape().dims(), &[1, 3, 4]);
        assert_eq!(
            t.index(&[TensorIndex::step_by(None, None, 2)]).unwrap().to_vec_f32(),
            vec![0.0, 1.0, 2.0, 3.0, 8.0, 9.0, 10.0, 11.0]
        );
    }

    #[test]
    fn test_negative_and_clamped_slices() {
        let t = grid();
        assert_eq!(t.index(&[(-1).into()]).unwrap().to_vec_f32(), vec![8.0, 9.0, 10.0, 11.0]);
        assert_eq!(t.index(&[(1..10).into()]).unwrap().shape().dims(), &[2, 4]);
        assert_eq!(t.index(&[(2..1).into()]).unwrap().shape().dims(), &[0, 4]);
    }

    #[test]
    fn test_list_index_aliases_source() {
        let t = grid();
        let cols = t.index(&[(..).into(), vec![1, 3].into()]).unwrap();
        assert_eq!(cols.shape().dims(), &[3, 2]);
        assert_eq!(cols.to_vec_f32(), vec![1.0, 3.0, 5.0, 7.0, 9.0, 11.0]);
        t.fill_(-1.0).unwrap();
        assert!(cols.to_vec_f32().iter().all(|&v| v == -1.0));
        cols.fill_(2.0).unwrap();
        assert_eq!(t.to_vec_f32()[..4].to_vec(), vec![-1.0, 2.0, -1.0, 2.0]);
    }

    #[test]
    fn test_mask_flattens_masked_dims() {
        let t = Tensor::arange(0.0, 24.0, 1.0).reshape(&[3, 4, 2]).unwrap();
        let mask = Tensor::from_bool(
            &[true, false, true, false, false, true, true, false, true, false, false, true],
            &[3, 4],
        );
        let m = t.index(&[mask.clone().into()]).unwrap();
        assert_eq!(m.shape().dims(), &[6, 2]);
        assert_eq!(m.select(0, 0).unwrap().to_vec_f32(), vec![0.0, 1.0]);
        assert_eq!(m.select(0, 1).unwrap().to_vec_f32(), vec![4.0, 5.0]);
        assert_eq!(index_shape(&[3, 4, 2], &[mask.into()]).unwrap().dims(), &[6, 2]);
    }

    #[test]
    fn test_mask_shape_must_match() {
        let t = grid();
        let mask = Tensor::from_bool(&[true, false], &[2]);
        assert!(matches!(t.index(&[mask.into()]), Err(KoreError::InvalidIndex(_))));
        let not_bool = TensorIndex::Mask(Tensor::zeros(&[3], DType::F32));
        assert!(t.index(&[not_bool]).is_err());
    }

    #[test]
    fn test_out_of_range() {
        let t = grid();
        assert!(t.index(&[3.into()]).is_err());
        assert!(t.index(&[0.into(), 0.into(), 0.into()]).is_err());
        assert!(t.index(&[vec![0, 5].into()]).is_err());
        assert!(t
            .index(&[vec![0].into(), vec![1].into()])
            .is_err());
    }

    #[test]
    fn test_index_put_and_masked_fill() {
        let t = grid();
        t.index_put_(&[(..).into(), vec![0, 2].into()], &Tensor::scalar(0.0)).unwrap();
        assert_eq!(t.index(&[0.into()]).unwrap().to_vec_f32(), vec![0.0, 1.0, 0.0, 3.0]);

        let mask = Tensor::from_bool(&[false, true, false], &[3]);
        t.masked_fill_(&mask, 7.0).unwrap();
        assert_eq!(t.index(&[1.into()]).unwrap().to_vec_f32(), vec![7.0; 4]);
    }

    #[test]
    fn test_views_of_gathered_stay_aliased() {
        let t = grid();
        let picked = t.index(&[vec![2, 0].into()]).unwrap();
        let col = picked.permute(&[1, 0]).unwrap().select(0, 3).unwrap();
        assert_eq!(col.to_vec_f32(), vec![11.0, 3.0]);
        col.fill_(0.0).unwrap();
        assert_eq!(t.to_vec_f32()[11], 0.0);
        assert_eq!(t.to_vec_f32()[3], 0.0);
    }

    #[test]
    fn test_positions() {
        assert_eq!(TensorIndex::Select(-1).positions(4).unwrap(), vec![3]);
        assert_eq!(TensorIndex::step_by(Some(1), None, 2).positions(6).unwrap(), vec![1, 3, 5]);
        assert_eq!(TensorIndex::Full.positions(2).unwrap(), vec![0, 1]);
        let mask = Tensor::from_bool(&[false, true, true], &[3]);
        assert_eq!(TensorIndex::Mask(mask).positions(3).unwrap(), vec![1, 2]);
        assert!(TensorIndex::NewAxis.positions(3).is_err());
        assert!(TensorIndex::List(vec![4]).positions(3).is_err());
    }

    #[test]
    fn test_from_tensor() {
        assert!(matches!(
            TensorIndex::from(Tensor::from_bool(&[true], &[1])),
            TensorIndex::Mask(_)
        ));
        match TensorIndex::from(Tensor::from_i64(&[2, 0], &[2])) {
            TensorIndex::List(v) => assert_eq!(v, vec![2, 0]),
            other => panic!("unexpected {other:?}"),
        }
    }
}

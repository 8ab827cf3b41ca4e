use smallvec::SmallVec;
use std::fmt;

/// Ordered dimension sizes with stack-allocated storage for ≤4 dimensions.
///
/// Used both for full tensor shapes and for the leading "batch" shapes that
/// containers share across their entries.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Scalar shape (0 dimensions).
    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Get dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Get size of a specific dimension.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Whether this is a scalar (0-dimensional).
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Whether `prefix` matches the leading dimensions of this shape.
    pub fn starts_with(&self, prefix: &[usize]) -> bool {
        self.dims.len() >= prefix.len() && &self.dims[..prefix.len()] == prefix
    }

    /// Dimensions after the first `n`.
    pub fn trailing(&self, n: usize) -> &[usize] {
        &self.dims[n.min(self.dims.len())..]
    }

    /// This shape followed by `tail`.
    pub fn concat(&self, tail: &[usize]) -> Shape {
        let mut dims = self.dims.clone();
        dims.extend_from_slice(tail);
        Shape { dims }
    }

    /// Copy with `size` inserted at `axis` (`axis <= ndim`).
    pub fn inserted(&self, axis: usize, size: usize) -> Shape {
        let mut dims = self.dims.clone();
        dims.insert(axis, size);
        Shape { dims }
    }

    /// Copy with `axis` removed (`axis < ndim`).
    pub fn removed(&self, axis: usize) -> Shape {
        let mut dims = self.dims.clone();
        dims.remove(axis);
        Shape { dims }
    }

    /// Copy with dimensions reordered so that output dim `i` is input dim `order[i]`.
    pub fn permuted(&self, order: &[usize]) -> Shape {
        Shape {
            dims: order.iter().map(|&o| self.dims[o]).collect(),
        }
    }

    /// Compute default strides for a contiguous row-major layout.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 4]> {
        let ndim = self.dims.len();
        if ndim == 0 {
            return SmallVec::new();
        }
        let mut strides = SmallVec::from_elem(0usize, ndim);
        strides[ndim - 1] = 1;
        for i in (0..ndim - 1).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Attempt to broadcast this shape with another.
    /// Returns the broadcasted shape or None if incompatible.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let max_ndim = self.ndim().max(other.ndim());
        let mut result = SmallVec::with_capacity(max_ndim);

        for i in 0..max_ndim {
            let a = if i < self.ndim() {
                self.dims[self.ndim() - 1 - i]
            } else {
                1
            };
            let b = if i < other.ndim() {
                other.dims[other.ndim() - 1 - i]
            } else {
                1
            };

            if a == b {
                result.push(a);
            } else if a == 1 {
                result.push(b);
            } else if b == 1 {
                result.push(a);
            } else {
                return None;
            }
        }

        result.reverse();
        Some(Shape { dims: result })
    }

    /// Validate and compute a reshape target.
    /// At most one dimension can be -1 (inferred). Zero-sized targets are
    /// accepted when the element count matches.
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<Shape> {
        let numel = self.numel();
        let mut inferred_idx = None;
        let mut known_product: usize = 1;

        for (i, &d) in target.iter().enumerate() {
            if d == -1 {
                if inferred_idx.is_some() {
                    return None; // multiple -1s
                }
                inferred_idx = Some(i);
            } else if d < 0 {
                return None;
            } else {
                known_product = known_product.checked_mul(d as usize)?;
            }
        }

        let mut result: SmallVec<[usize; 4]> = target
            .iter()
            .map(|&d| if d == -1 { 0 } else { d as usize })
            .collect();

        if let Some(idx) = inferred_idx {
            if known_product == 0 || numel % known_product != 0 {
                return None;
            }
            result[idx] = numel / known_product;
        }

        let result_shape = Shape { dims: result };
        if result_shape.numel() != numel {
            return None;
        }
        Some(result_shape)
    }
}

/// Resolve a possibly negative axis against `ndim` dimensions.
///
/// `extra` widens the accepted range, e.g. `1` for insertion points.
pub fn normalize_axis(axis: isize, ndim: usize, extra: usize) -> Option<usize> {
    let bound = (ndim + extra) as isize;
    let axis = if axis < 0 { axis + bound } else { axis };
    if axis < 0 || axis >= bound {
        None
    } else {
        Some(axis as usize)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

impl From<&Vec<usize>> for Shape {
    fn from(dims: &Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&Shape> for Shape {
    fn from(shape: &Shape) -> Self {
        shape.clone()
    }
}

macro_rules! impl_shape_from_array {
    ($($n:expr),*) => {
        $(
            impl From<[usize; $n]> for Shape {
                fn from(dims: [usize; $n]) -> Self {
                    Shape::new(&dims)
                }
            }
        )*
    };
}

impl_shape_from_array!(0, 1, 2, 3, 4, 5, 6);

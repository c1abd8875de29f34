use serde::{Deserialize, Serialize};

/// Dense f32 tensor with an explicit shape (flat, row-major).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor from owned buffers.
    ///
    /// # Panics
    /// - if the shape's element count does not match `data.len()`
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        let elements: usize = shape.iter().product();
        assert_eq!(
            elements,
            data.len(),
            "shape {shape:?} does not describe {} elements",
            data.len()
        );
        Self { shape, data }
    }

    /// Single-element tensor, the shape used for scalar graph inputs.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![1],
            data: vec![value],
        }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One named value crossing the engine boundary.
///
/// Scalars and events could be encoded as one-element tensors, but the
/// runner cares about the distinction: event ids are `i64` tokens consumed
/// by wait/record operators and finiteness flags are booleans produced by
/// the optimizer graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(Tensor),
    Scalar(f32),
    Event(i64),
    Flag(bool),
}

impl Value {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<i64> {
        match self {
            Value::Event(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

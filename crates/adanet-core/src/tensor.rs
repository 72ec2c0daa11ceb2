//! Dense tensor values produced by the execution phase.
//!
//! Tensors are row-major with a leading "candidate" axis whenever they come out
//! of a stack. Only the handful of operations the iteration needs are provided.

use crate::error::{IterationError, IterationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Float,
    Int,
    Bool,
    Str,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float => "float",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Str => "string",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl TensorData {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Float(_) => DType::Float,
            Self::Int(_) => DType::Int,
            Self::Bool(_) => DType::Bool,
            Self::Str(_) => DType::Str,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Str(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slice(&self, range: Range<usize>) -> Self {
        match self {
            Self::Float(v) => Self::Float(v[range].to_vec()),
            Self::Int(v) => Self::Int(v[range].to_vec()),
            Self::Bool(v) => Self::Bool(v[range].to_vec()),
            Self::Str(v) => Self::Str(v[range].to_vec()),
        }
    }

    fn cycle(&self, times: usize) -> Self {
        fn cycled<T: Clone>(v: &[T], times: usize) -> Vec<T> {
            v.iter().cloned().cycle().take(v.len() * times).collect()
        }
        match self {
            Self::Float(v) => Self::Float(cycled(v, times)),
            Self::Int(v) => Self::Int(cycled(v, times)),
            Self::Bool(v) => Self::Bool(cycled(v, times)),
            Self::Str(v) => Self::Str(cycled(v, times)),
        }
    }

    fn extend(&mut self, other: &Self) -> IterationResult<()> {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.extend_from_slice(b),
            (Self::Int(a), Self::Int(b)) => a.extend_from_slice(b),
            (Self::Bool(a), Self::Bool(b)) => a.extend_from_slice(b),
            (Self::Str(a), Self::Str(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(IterationError::TypeMismatch(format!(
                    "cannot combine {} and {} values",
                    a.dtype(),
                    b.dtype()
                )))
            }
        }
        Ok(())
    }

    fn element_json(&self, i: usize) -> serde_json::Value {
        match self {
            Self::Float(v) => serde_json::json!(v[i]),
            Self::Int(v) => serde_json::json!(v[i]),
            Self::Bool(v) => serde_json::json!(v[i]),
            Self::Str(v) => serde_json::json!(v[i]),
        }
    }
}

/// A dense n-dimensional value.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: TensorData) -> IterationResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(IterationError::TypeMismatch(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self { shape: Vec::new(), data: TensorData::Float(vec![value]) }
    }

    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self { shape: Vec::new(), data: TensorData::Int(vec![value]) }
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self { shape: Vec::new(), data: TensorData::Bool(vec![value]) }
    }

    #[must_use]
    pub fn scalar_str(value: impl Into<String>) -> Self {
        Self { shape: Vec::new(), data: TensorData::Str(vec![value.into()]) }
    }

    #[must_use]
    pub fn vector_f64(values: Vec<f64>) -> Self {
        Self { shape: vec![values.len()], data: TensorData::Float(values) }
    }

    #[must_use]
    pub fn vector_i64(values: Vec<i64>) -> Self {
        Self { shape: vec![values.len()], data: TensorData::Int(values) }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    fn expect_scalar(&self, what: &str) -> IterationResult<()> {
        if self.is_scalar() {
            Ok(())
        } else {
            Err(IterationError::TypeMismatch(format!(
                "expected a scalar {what}, got shape {:?}",
                self.shape
            )))
        }
    }

    /// Reads a scalar float. Integer scalars are widened.
    pub fn as_f64(&self) -> IterationResult<f64> {
        self.expect_scalar("float")?;
        match &self.data {
            TensorData::Float(v) => Ok(v[0]),
            #[allow(clippy::cast_precision_loss)]
            TensorData::Int(v) => Ok(v[0] as f64),
            other => Err(IterationError::TypeMismatch(format!(
                "expected a float scalar, got {}",
                other.dtype()
            ))),
        }
    }

    pub fn as_i64(&self) -> IterationResult<i64> {
        self.expect_scalar("int")?;
        match &self.data {
            TensorData::Int(v) => Ok(v[0]),
            other => Err(IterationError::TypeMismatch(format!(
                "expected an int scalar, got {}",
                other.dtype()
            ))),
        }
    }

    pub fn as_bool(&self) -> IterationResult<bool> {
        self.expect_scalar("bool")?;
        match &self.data {
            TensorData::Bool(v) => Ok(v[0]),
            other => Err(IterationError::TypeMismatch(format!(
                "expected a bool scalar, got {}",
                other.dtype()
            ))),
        }
    }

    /// Stacks same-typed, same-shaped tensors along a new leading axis.
    pub fn stack(items: &[Self]) -> IterationResult<Self> {
        let Some(first) = items.first() else {
            return Err(IterationError::Evaluation("cannot stack zero tensors".to_string()));
        };
        let mut data = first.data.clone();
        for item in &items[1..] {
            if item.shape != first.shape {
                return Err(IterationError::TypeMismatch(format!(
                    "cannot stack shapes {:?} and {:?}",
                    first.shape, item.shape
                )));
            }
            data.extend(&item.data)?;
        }
        let mut shape = Vec::with_capacity(first.rank() + 1);
        shape.push(items.len());
        shape.extend_from_slice(&first.shape);
        Ok(Self { shape, data })
    }

    /// Selects entry `index` along the leading axis.
    pub fn index(&self, index: i64) -> IterationResult<Self> {
        let Some(&len) = self.shape.first() else {
            return Err(IterationError::TypeMismatch("cannot index into a scalar".to_string()));
        };
        let position = usize::try_from(index)
            .ok()
            .filter(|i| *i < len)
            .ok_or(IterationError::IndexOutOfRange { index, len })?;
        let inner: Vec<usize> = self.shape[1..].to_vec();
        let stride: usize = inner.iter().product();
        let start = position * stride;
        Ok(Self { shape: inner, data: self.data.slice(start..start + stride) })
    }

    /// Repeats a scalar or vector `times` times into a vector.
    pub fn tile(&self, times: usize) -> IterationResult<Self> {
        if self.rank() > 1 {
            return Err(IterationError::TypeMismatch(format!(
                "tile expects a scalar or vector, got shape {:?}",
                self.shape
            )));
        }
        let data = self.data.cycle(times);
        Ok(Self { shape: vec![data.len()], data })
    }

    pub fn cast(&self, dtype: DType) -> IterationResult<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        #[allow(clippy::cast_precision_loss)]
        let data = match (&self.data, dtype) {
            (TensorData::Float(v), DType::Int) => TensorData::Int(v.iter().map(|x| x.trunc() as i64).collect()),
            (TensorData::Int(v), DType::Float) => TensorData::Float(v.iter().map(|x| *x as f64).collect()),
            (TensorData::Bool(v), DType::Int) => TensorData::Int(v.iter().map(|x| i64::from(*x)).collect()),
            (TensorData::Bool(v), DType::Float) => {
                TensorData::Float(v.iter().map(|x| if *x { 1.0 } else { 0.0 }).collect())
            }
            (TensorData::Float(v), DType::Bool) => TensorData::Bool(v.iter().map(|x| *x != 0.0).collect()),
            (TensorData::Int(v), DType::Bool) => TensorData::Bool(v.iter().map(|x| *x != 0).collect()),
            (data, to) => {
                return Err(IterationError::TypeMismatch(format!(
                    "cannot cast {} to {}",
                    data.dtype(),
                    to
                )))
            }
        };
        Ok(Self { shape: self.shape.clone(), data })
    }

    /// Sum and element count of a numeric tensor.
    pub fn sum_and_count(&self) -> IterationResult<(f64, usize)> {
        let floats = self.cast(DType::Float)?;
        match floats.data {
            TensorData::Float(v) => Ok((v.iter().sum(), v.len())),
            _ => unreachable!("cast to float yields float data"),
        }
    }

    /// Nested JSON arrays mirroring the tensor's shape.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        self.json_at(0, 0)
    }

    fn json_at(&self, axis: usize, offset: usize) -> serde_json::Value {
        if axis == self.shape.len() {
            return self.data.element_json(offset);
        }
        let stride: usize = self.shape[axis + 1..].iter().product();
        let items = (0..self.shape[axis])
            .map(|i| self.json_at(axis + 1, offset + i * stride))
            .collect();
        serde_json::Value::Array(items)
    }
}

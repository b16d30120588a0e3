//! Typed parameter spaces and parameter vectors.
//!
//! A [`ParameterSpace`] is an ordered list of named dimensions. A
//! [`ParameterVector`] is one point in that space. Search algorithms only see
//! these two types plus a scalar score.

use std::fmt;
use std::hash::{Hash, Hasher};

use rand::Rng;

use super::error::QtsimError;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamKind {
    Continuous { min: f64, max: f64 },
    Integer { min: i64, max: i64 },
    Categorical(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParamDim {
    pub name: String,
    pub kind: ParamKind,
}

impl ParamDim {
    pub fn continuous(name: &str, min: f64, max: f64) -> Self {
        ParamDim {
            name: name.to_string(),
            kind: ParamKind::Continuous { min, max },
        }
    }

    pub fn integer(name: &str, min: i64, max: i64) -> Self {
        ParamDim {
            name: name.to_string(),
            kind: ParamKind::Integer { min, max },
        }
    }

    pub fn categorical(name: &str, labels: &[&str]) -> Self {
        ParamDim {
            name: name.to_string(),
            kind: ParamKind::Categorical(labels.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Whether at least one legal value exists.
    pub fn is_feasible(&self) -> bool {
        match &self.kind {
            ParamKind::Continuous { min, max } => min.is_finite() && max.is_finite() && min <= max,
            ParamKind::Integer { min, max } => min <= max,
            ParamKind::Categorical(labels) => !labels.is_empty(),
        }
    }

    pub fn contains(&self, value: &ParamValue) -> bool {
        match (&self.kind, value) {
            (ParamKind::Continuous { min, max }, ParamValue::Float(v)) => {
                v.is_finite() && *v >= *min && *v <= *max
            }
            (ParamKind::Continuous { min, max }, ParamValue::Int(v)) => {
                let v = *v as f64;
                v >= *min && v <= *max
            }
            (ParamKind::Integer { min, max }, ParamValue::Int(v)) => *v >= *min && *v <= *max,
            (ParamKind::Categorical(labels), ParamValue::Category(c)) => labels.contains(c),
            _ => false,
        }
    }

    /// Discrete values visited by grid search. Continuous ranges are split
    /// into `steps` evenly spaced points including both bounds.
    pub fn grid_values(&self, steps: usize) -> Vec<ParamValue> {
        if !self.is_feasible() {
            return Vec::new();
        }
        match &self.kind {
            ParamKind::Continuous { min, max } => {
                if steps <= 1 || min == max {
                    return vec![ParamValue::Float(*min)];
                }
                let step = (max - min) / (steps - 1) as f64;
                (0..steps)
                    .map(|i| {
                        let v = if i == steps - 1 { *max } else { min + step * i as f64 };
                        ParamValue::Float(v)
                    })
                    .collect()
            }
            ParamKind::Integer { min, max } => (*min..=*max).map(ParamValue::Int).collect(),
            ParamKind::Categorical(labels) => {
                labels.iter().cloned().map(ParamValue::Category).collect()
            }
        }
    }

    fn grid_len(&self, steps: usize) -> u128 {
        if !self.is_feasible() {
            return 0;
        }
        match &self.kind {
            ParamKind::Continuous { min, max } => {
                if steps <= 1 || min == max {
                    1
                } else {
                    steps as u128
                }
            }
            ParamKind::Integer { min, max } => (i128::from(*max) - i128::from(*min) + 1) as u128,
            ParamKind::Categorical(labels) => labels.len() as u128,
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> ParamValue {
        match &self.kind {
            ParamKind::Continuous { min, max } => ParamValue::Float(rng.gen_range(*min..=*max)),
            ParamKind::Integer { min, max } => ParamValue::Int(rng.gen_range(*min..=*max)),
            ParamKind::Categorical(labels) => {
                ParamValue::Category(labels[rng.gen_range(0..labels.len())].clone())
            }
        }
    }

    /// A nearby value: a uniform step of at most `scale` times the range
    /// width, clamped to the bounds. Categorical dimensions jump to a random
    /// label.
    pub fn neighbor<R: Rng>(&self, value: &ParamValue, scale: f64, rng: &mut R) -> ParamValue {
        match (&self.kind, value) {
            (ParamKind::Continuous { min, max }, ParamValue::Float(v)) => {
                let width = (max - min) * scale.clamp(0.0, 1.0);
                let step = if width > 0.0 { rng.gen_range(-width..=width) } else { 0.0 };
                ParamValue::Float((v + step).clamp(*min, *max))
            }
            (ParamKind::Integer { min, max }, ParamValue::Int(v)) => {
                // i128 holds the full width of any i64 range
                let (lo, hi) = (i128::from(*min), i128::from(*max));
                let width = ((hi - lo) as f64 * scale.clamp(0.0, 1.0)).round() as i128;
                let width = width.max(1);
                let step = rng.gen_range(-width..=width);
                let next = (i128::from(*v) + step).clamp(lo, hi);
                ParamValue::Int(i64::try_from(next).unwrap_or(*v))
            }
            _ => self.sample(rng),
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Category(String),
}

// Float equality is bitwise so vectors can key the evaluation cache.
impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Float(a), ParamValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ParamValue::Int(a), ParamValue::Int(b)) => a == b,
            (ParamValue::Category(a), ParamValue::Category(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ParamValue {}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ParamValue::Float(v) => {
                0u8.hash(state);
                v.to_bits().hash(state);
            }
            ParamValue::Int(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            ParamValue::Category(v) => {
                2u8.hash(state);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Category(v) => f.write_str(v),
        }
    }
}

/// An ordered point in a [`ParameterSpace`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterVector(Vec<ParamValue>);

impl ParameterVector {
    pub fn new(values: Vec<ParamValue>) -> Self {
        ParameterVector(values)
    }

    pub fn empty() -> Self {
        ParameterVector(Vec::new())
    }

    pub fn values(&self) -> &[ParamValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn float(&self, index: usize) -> Result<f64, QtsimError> {
        match self.0.get(index) {
            Some(ParamValue::Float(v)) => Ok(*v),
            Some(ParamValue::Int(v)) => Ok(*v as f64),
            _ => Err(QtsimError::invalid_param(&format!("#{index}"), "expected a number")),
        }
    }

    pub fn int(&self, index: usize) -> Result<i64, QtsimError> {
        match self.0.get(index) {
            Some(ParamValue::Int(v)) => Ok(*v),
            _ => Err(QtsimError::invalid_param(&format!("#{index}"), "expected an integer")),
        }
    }

    /// Integer parameter used as a window length or count; must be positive.
    pub fn period(&self, index: usize) -> Result<usize, QtsimError> {
        let v = self.int(index)?;
        if v < 1 {
            return Err(QtsimError::invalid_param(&format!("#{index}"), "must be at least 1"));
        }
        Ok(v as usize)
    }

    pub fn category(&self, index: usize) -> Result<&str, QtsimError> {
        match self.0.get(index) {
            Some(ParamValue::Category(v)) => Ok(v),
            _ => Err(QtsimError::invalid_param(&format!("#{index}"), "expected a category label")),
        }
    }

    pub fn concat(parts: &[ParameterVector]) -> Self {
        ParameterVector(parts.iter().flat_map(|p| p.0.iter().cloned()).collect())
    }

    /// Split into consecutive pieces of the given lengths.
    pub fn split(&self, lengths: &[usize]) -> Result<Vec<ParameterVector>, QtsimError> {
        let total: usize = lengths.iter().sum();
        if total != self.0.len() {
            return Err(QtsimError::invalid_param(
                "parameters",
                &format!("expected {total} values, got {}", self.0.len()),
            ));
        }
        let mut offset = 0;
        Ok(lengths
            .iter()
            .map(|&len| {
                let part = ParameterVector(self.0[offset..offset + len].to_vec());
                offset += len;
                part
            })
            .collect())
    }
}

impl fmt::Display for ParameterVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterSpace {
    dims: Vec<ParamDim>,
}

impl ParameterSpace {
    pub fn new(dims: Vec<ParamDim>) -> Self {
        ParameterSpace { dims }
    }

    pub fn dims(&self) -> &[ParamDim] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Concatenate spaces in order, prefixing dimension names with `prefix[i]`.
    pub fn concat(parts: &[(String, ParameterSpace)]) -> Self {
        let dims = parts
            .iter()
            .flat_map(|(prefix, space)| {
                space.dims.iter().map(move |d| ParamDim {
                    name: format!("{prefix}.{}", d.name),
                    kind: d.kind.clone(),
                })
            })
            .collect();
        ParameterSpace { dims }
    }

    /// True when at least one vector satisfies every dimension.
    pub fn is_feasible(&self) -> bool {
        self.dims.iter().all(ParamDim::is_feasible)
    }

    pub fn validate(&self, vector: &ParameterVector) -> Result<(), QtsimError> {
        if vector.len() != self.dims.len() {
            return Err(QtsimError::invalid_param(
                "parameters",
                &format!("expected {} values, got {}", self.dims.len(), vector.len()),
            ));
        }
        for (dim, value) in self.dims.iter().zip(vector.values()) {
            if !dim.contains(value) {
                return Err(QtsimError::invalid_param(
                    &dim.name,
                    &format!("value {value} is outside {:?}", dim.kind),
                ));
            }
        }
        Ok(())
    }

    /// Number of grid points, saturating at `u128::MAX`.
    pub fn grid_size(&self, continuous_steps: usize) -> u128 {
        self.dims
            .iter()
            .fold(1u128, |acc, d| acc.saturating_mul(d.grid_len(continuous_steps)))
    }

    /// Cartesian product of per-dimension grid values. The last dimension
    /// varies fastest.
    pub fn grid(&self, continuous_steps: usize) -> Vec<ParameterVector> {
        let mut points: Vec<Vec<ParamValue>> = vec![Vec::new()];
        for dim in &self.dims {
            let values = dim.grid_values(continuous_steps);
            let mut next = Vec::with_capacity(points.len() * values.len());
            for prefix in &points {
                for v in &values {
                    let mut p = prefix.clone();
                    p.push(v.clone());
                    next.push(p);
                }
            }
            points = next;
        }
        points.into_iter().map(ParameterVector).collect()
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> ParameterVector {
        ParameterVector(self.dims.iter().map(|d| d.sample(rng)).collect())
    }

    /// Uniform crossover: each gene comes from either parent with equal odds.
    pub fn crossover<R: Rng>(
        &self,
        a: &ParameterVector,
        b: &ParameterVector,
        rng: &mut R,
    ) -> ParameterVector {
        ParameterVector(
            a.values()
                .iter()
                .zip(b.values())
                .map(|(x, y)| if rng.gen_bool(0.5) { x.clone() } else { y.clone() })
                .collect(),
        )
    }

    /// Resample each gene with probability `rate`.
    pub fn mutate<R: Rng>(
        &self,
        vector: &ParameterVector,
        rate: f64,
        rng: &mut R,
    ) -> ParameterVector {
        let rate = rate.clamp(0.0, 1.0);
        ParameterVector(
            self.dims
                .iter()
                .zip(vector.values())
                .map(|(d, v)| if rng.gen_bool(rate) { d.sample(rng) } else { v.clone() })
                .collect(),
        )
    }

    /// Move one randomly chosen dimension to a nearby value.
    pub fn neighbor<R: Rng>(
        &self,
        vector: &ParameterVector,
        scale: f64,
        rng: &mut R,
    ) -> ParameterVector {
        let mut values = vector.values().to_vec();
        if !self.dims.is_empty() {
            let i = rng.gen_range(0..self.dims.len());
            values[i] = self.dims[i].neighbor(&values[i], scale, rng);
        }
        ParameterVector(values)
    }

    /// Parse a comma-separated list, typing each item by its dimension.
    pub fn parse_vector(&self, text: &str) -> Result<ParameterVector, QtsimError> {
        let items: Vec<&str> = if text.trim().is_empty() {
            Vec::new()
        } else {
            text.split(',').map(str::trim).collect()
        };
        if items.len() != self.dims.len() {
            return Err(QtsimError::invalid_param(
                "parameters",
                &format!("expected {} values, got {}", self.dims.len(), items.len()),
            ));
        }
        let values = self
            .dims
            .iter()
            .zip(items)
            .map(|(dim, item)| match &dim.kind {
                ParamKind::Continuous { .. } => item
                    .parse::<f64>()
                    .map(ParamValue::Float)
                    .map_err(|_| QtsimError::invalid_param(&dim.name, &format!("'{item}' is not a number"))),
                ParamKind::Integer { .. } => item
                    .parse::<i64>()
                    .map(ParamValue::Int)
                    .map_err(|_| QtsimError::invalid_param(&dim.name, &format!("'{item}' is not an integer"))),
                ParamKind::Categorical(_) => Ok(ParamValue::Category(item.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let vector = ParameterVector(values);
        self.validate(&vector)?;
        Ok(vector)
    }
}

//! Read-only history cube (instrument × date × field) and its windowed view.
//!
//! Values are stored contiguously as `[instrument][field][date]` so a single
//! instrument/field series is one slice. Missing cells hold `f64::NAN` in
//! storage and are surfaced as `None` by the accessors.

use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::error::QtsimError;

/// Optional field flagging an instrument as suspended on a date (any value > 0.5).
pub const HALTED_FIELD: &str = "halted";

/// How [`HistoryView::window`] treats cells that were never recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FillPolicy {
    /// Missing cells are a [`QtsimError::DataGap`].
    #[default]
    None,
    /// Carry the last recorded value forward, looking back before the window start.
    ForwardFill,
    Zero,
    /// Keep the no-value marker.
    NoValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryCube {
    instruments: Vec<String>,
    dates: Vec<NaiveDate>,
    fields: Vec<String>,
    values: Vec<f64>,
    categories: HashMap<String, Vec<String>>,
    instrument_index: HashMap<String, usize>,
    field_index: HashMap<String, usize>,
}

impl HistoryCube {
    /// Build a cube from raw parts. `values` is laid out `[instrument][field][date]`.
    ///
    /// Dates must be strictly increasing and labels unique; anything else is a
    /// contract breach, since normalization happens in [`HistoryCubeBuilder`].
    pub fn new(
        instruments: Vec<String>,
        dates: Vec<NaiveDate>,
        fields: Vec<String>,
        values: Vec<f64>,
    ) -> Result<Self, QtsimError> {
        let expected = instruments.len() * fields.len() * dates.len();
        if values.len() != expected {
            return Err(QtsimError::breach(format!(
                "cube shape {}x{}x{} needs {} values, got {}",
                instruments.len(),
                dates.len(),
                fields.len(),
                expected,
                values.len()
            )));
        }
        if let Some(w) = dates.windows(2).find(|w| w[0] >= w[1]) {
            return Err(QtsimError::breach(format!(
                "dates not strictly increasing: {} then {}",
                w[0], w[1]
            )));
        }
        let instrument_index = label_index("instrument", &instruments)?;
        let field_index = label_index("field", &fields)?;
        Ok(HistoryCube {
            instruments,
            dates,
            fields,
            values,
            categories: HashMap::new(),
            instrument_index,
            field_index,
        })
    }

    /// Attach the label table used to decode a categorical field.
    pub fn with_categories(mut self, field: &str, labels: Vec<String>) -> Self {
        self.categories.insert(field.to_string(), labels);
        self
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// (instruments, dates, fields)
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.instruments.len(), self.dates.len(), self.fields.len())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn instrument_index(&self, instrument: &str) -> Option<usize> {
        self.instrument_index.get(instrument).copied()
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.field_index.get(field).copied()
    }

    pub fn date_index(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Index of the last date on or before `date`.
    pub fn date_index_at_or_before(&self, date: NaiveDate) -> Option<usize> {
        self.dates.partition_point(|d| *d <= date).checked_sub(1)
    }

    fn offset(&self, instrument: usize, field: usize) -> usize {
        (instrument * self.fields.len() + field) * self.dates.len()
    }

    /// Contiguous series of one field for one instrument, NaN where missing.
    pub fn series(&self, instrument: usize, field: usize) -> &[f64] {
        let start = self.offset(instrument, field);
        &self.values[start..start + self.dates.len()]
    }

    pub fn series_by_name(&self, instrument: &str, field: &str) -> Result<&[f64], QtsimError> {
        let i = self.require_instrument(instrument)?;
        let f = self.require_field(field)?;
        Ok(self.series(i, f))
    }

    pub fn value(&self, instrument: usize, field: usize, date: usize) -> Option<f64> {
        let v = self.values[self.offset(instrument, field) + date];
        if v.is_nan() { None } else { Some(v) }
    }

    pub fn get(&self, instrument: &str, field: &str, date: NaiveDate) -> Option<f64> {
        let i = self.instrument_index(instrument)?;
        let f = self.field_index(field)?;
        let d = self.date_index(date)?;
        self.value(i, f, d)
    }

    /// Decode a categorical cell through the field's label table.
    pub fn category(&self, instrument: &str, field: &str, date: NaiveDate) -> Option<&str> {
        let code = self.get(instrument, field, date)?;
        let labels = self.categories.get(field)?;
        if code < 0.0 {
            return None;
        }
        labels.get(code as usize).map(String::as_str)
    }

    /// Price recorded and positive, and not flagged by [`HALTED_FIELD`].
    pub fn is_tradable(&self, instrument: usize, price_field: usize, date: usize) -> bool {
        let priced = self
            .value(instrument, price_field, date)
            .is_some_and(|p| p > 0.0);
        let halted = self
            .field_index(HALTED_FIELD)
            .and_then(|h| self.value(instrument, h, date))
            .is_some_and(|flag| flag > 0.5);
        priced && !halted
    }

    pub fn require_instrument(&self, instrument: &str) -> Result<usize, QtsimError> {
        self.instrument_index(instrument)
            .ok_or_else(|| QtsimError::UnknownLabel {
                axis: "instrument",
                label: instrument.to_string(),
            })
    }

    pub fn require_field(&self, field: &str) -> Result<usize, QtsimError> {
        self.field_index(field).ok_or_else(|| QtsimError::UnknownLabel {
            axis: "field",
            label: field.to_string(),
        })
    }
}

fn label_index(axis: &'static str, labels: &[String]) -> Result<HashMap<String, usize>, QtsimError> {
    let mut index = HashMap::with_capacity(labels.len());
    for (i, label) in labels.iter().enumerate() {
        if index.insert(label.clone(), i).is_some() {
            return Err(QtsimError::breach(format!("duplicate {axis} label {label}")));
        }
    }
    Ok(index)
}

/// Collects unordered records and normalizes them into a [`HistoryCube`].
///
/// Instruments and fields keep first-seen order. The date axis is sorted and
/// deduplicated; a repeated cell keeps the last recorded value.
#[derive(Debug, Default)]
pub struct HistoryCubeBuilder {
    instruments: Vec<String>,
    fields: Vec<String>,
    cells: HashMap<(usize, usize, NaiveDate), f64>,
    categories: HashMap<String, Vec<String>>,
}

impl HistoryCubeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the position of an instrument on the instrument axis.
    pub fn instrument(&mut self, instrument: &str) -> usize {
        intern(&mut self.instruments, instrument)
    }

    pub fn field(&mut self, field: &str) -> usize {
        intern(&mut self.fields, field)
    }

    pub fn record(&mut self, instrument: &str, field: &str, date: NaiveDate, value: f64) -> &mut Self {
        let i = self.instrument(instrument);
        let f = self.field(field);
        let value = if value.is_finite() { value } else { f64::NAN };
        self.cells.insert((i, f, date), value);
        self
    }

    pub fn record_category(
        &mut self,
        instrument: &str,
        field: &str,
        date: NaiveDate,
        label: &str,
    ) -> &mut Self {
        let labels = self.categories.entry(field.to_string()).or_default();
        let code = intern(labels, label);
        self.record(instrument, field, date, code as f64)
    }

    pub fn build(self) -> Result<HistoryCube, QtsimError> {
        let dates: Vec<NaiveDate> = self
            .cells
            .keys()
            .map(|(_, _, d)| *d)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let date_pos: HashMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let (n_fields, n_dates) = (self.fields.len(), dates.len());
        let mut values = vec![f64::NAN; self.instruments.len() * n_fields * n_dates];
        for ((i, f, date), value) in self.cells {
            values[(i * n_fields + f) * n_dates + date_pos[&date]] = value;
        }

        let mut cube = HistoryCube::new(self.instruments, dates, self.fields, values)?;
        cube.categories = self.categories;
        Ok(cube)
    }
}

fn intern(labels: &mut Vec<String>, label: &str) -> usize {
    match labels.iter().position(|l| l == label) {
        Some(i) => i,
        None => {
            labels.push(label.to_string());
            labels.len() - 1
        }
    }
}

/// Shared read-only access to a cube with a configured fill policy.
///
/// Cloning is cheap; every clone reads the same immutable cube.
#[derive(Debug, Clone)]
pub struct HistoryView {
    cube: Arc<HistoryCube>,
    fill: FillPolicy,
}

impl HistoryView {
    pub fn new(cube: HistoryCube, fill: FillPolicy) -> Self {
        HistoryView {
            cube: Arc::new(cube),
            fill,
        }
    }

    pub fn cube(&self) -> &HistoryCube {
        &self.cube
    }

    pub fn fill_policy(&self) -> FillPolicy {
        self.fill
    }

    /// Sub-cube for the given labels over `[start, end]`, filled per policy.
    pub fn window(
        &self,
        instruments: &[&str],
        fields: &[&str],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HistoryCube, QtsimError> {
        if start > end {
            return Err(QtsimError::breach(format!(
                "window start {start} after end {end}"
            )));
        }
        let dates = self.cube.dates();
        let lo = dates.partition_point(|d| *d < start);
        let hi = dates.partition_point(|d| *d <= end);
        self.extract(instruments, fields, lo, hi)
    }

    /// The last `length` dates up to and including `end`, for every instrument and field.
    pub fn lookback(&self, end: NaiveDate, length: usize) -> Result<HistoryCube, QtsimError> {
        let hi = self.cube.dates().partition_point(|d| *d <= end);
        let lo = hi.saturating_sub(length);
        let instruments = self.all_instruments();
        let fields = self.all_fields();
        self.extract(&instruments, &fields, lo, hi)
    }

    /// Every instrument and field over `[start, end]`.
    pub fn segment(&self, start: NaiveDate, end: NaiveDate) -> Result<HistoryCube, QtsimError> {
        let instruments = self.all_instruments();
        let fields = self.all_fields();
        self.window(&instruments, &fields, start, end)
    }

    fn all_instruments(&self) -> Vec<&str> {
        self.cube.instruments().iter().map(String::as_str).collect()
    }

    fn all_fields(&self) -> Vec<&str> {
        self.cube.fields().iter().map(String::as_str).collect()
    }

    fn extract(
        &self,
        instruments: &[&str],
        fields: &[&str],
        lo: usize,
        hi: usize,
    ) -> Result<HistoryCube, QtsimError> {
        let cube = &*self.cube;
        let inst_idx = instruments
            .iter()
            .map(|i| cube.require_instrument(i))
            .collect::<Result<Vec<_>, _>>()?;
        let field_idx = fields
            .iter()
            .map(|f| cube.require_field(f))
            .collect::<Result<Vec<_>, _>>()?;

        let n_dates = hi - lo;
        let mut values = Vec::with_capacity(inst_idx.len() * field_idx.len() * n_dates);
        for &i in &inst_idx {
            for &f in &field_idx {
                let full = cube.series(i, f);
                let mut carry = full[..lo].iter().rev().copied().find(|v| !v.is_nan());
                for (offset, &v) in full[lo..hi].iter().enumerate() {
                    if !v.is_nan() {
                        carry = Some(v);
                        values.push(v);
                        continue;
                    }
                    let filled = match self.fill {
                        FillPolicy::None => {
                            return Err(QtsimError::DataGap {
                                instrument: cube.instruments()[i].clone(),
                                field: cube.fields()[f].clone(),
                                date: cube.dates()[lo + offset],
                            });
                        }
                        FillPolicy::ForwardFill => carry.unwrap_or(f64::NAN),
                        FillPolicy::Zero => 0.0,
                        FillPolicy::NoValue => f64::NAN,
                    };
                    values.push(filled);
                }
            }
        }

        let mut window = HistoryCube::new(
            instruments.iter().map(|s| s.to_string()).collect(),
            cube.dates()[lo..hi].to_vec(),
            fields.iter().map(|s| s.to_string()).collect(),
            values,
        )?;
        for field in fields {
            if let Some(labels) = cube.categories.get(*field) {
                window = window.with_categories(field, labels.clone());
            }
        }
        Ok(window)
    }
}

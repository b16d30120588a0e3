//! Date × instrument signal matrix.

use chrono::NaiveDate;

use super::error::QtsimError;

/// Row-major (one row per date) matrix of signals or weights.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMatrix {
    dates: Vec<NaiveDate>,
    instruments: Vec<String>,
    values: Vec<f64>,
}

impl SignalMatrix {
    /// All-zero matrix.
    pub fn zeros(dates: Vec<NaiveDate>, instruments: Vec<String>) -> Self {
        let values = vec![0.0; dates.len() * instruments.len()];
        SignalMatrix {
            dates,
            instruments,
            values,
        }
    }

    pub fn from_rows(
        dates: Vec<NaiveDate>,
        instruments: Vec<String>,
        values: Vec<f64>,
    ) -> Result<Self, QtsimError> {
        if values.len() != dates.len() * instruments.len() {
            return Err(QtsimError::breach(format!(
                "signal buffer holds {} values, shape is {}x{}",
                values.len(),
                dates.len(),
                instruments.len()
            )));
        }
        Ok(SignalMatrix {
            dates,
            instruments,
            values,
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    /// (dates, instruments)
    pub fn shape(&self) -> (usize, usize) {
        (self.dates.len(), self.instruments.len())
    }

    pub fn get(&self, date: usize, instrument: usize) -> f64 {
        self.values[date * self.instruments.len() + instrument]
    }

    pub fn set(&mut self, date: usize, instrument: usize, value: f64) {
        let width = self.instruments.len();
        self.values[date * width + instrument] = value;
    }

    pub fn row(&self, date: usize) -> &[f64] {
        let width = self.instruments.len();
        &self.values[date * width..(date + 1) * width]
    }

    pub fn row_mut(&mut self, date: usize) -> &mut [f64] {
        let width = self.instruments.len();
        &mut self.values[date * width..(date + 1) * width]
    }

    pub fn column(&self, instrument: usize) -> Vec<f64> {
        (0..self.dates.len()).map(|d| self.get(d, instrument)).collect()
    }

    /// Write a whole column at once; `values` must cover every date.
    pub fn set_column(&mut self, instrument: usize, values: &[f64]) -> Result<(), QtsimError> {
        if values.len() != self.dates.len() || instrument >= self.instruments.len() {
            return Err(QtsimError::breach(format!(
                "column {instrument} of length {} does not fit {}x{} matrix",
                values.len(),
                self.dates.len(),
                self.instruments.len()
            )));
        }
        for (d, v) in values.iter().enumerate() {
            self.set(d, instrument, *v);
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Keep only the given date rows, in order.
    pub fn select_rows(&self, rows: &[usize]) -> SignalMatrix {
        let width = self.instruments.len();
        let mut values = Vec::with_capacity(rows.len() * width);
        for &r in rows {
            values.extend_from_slice(self.row(r));
        }
        SignalMatrix {
            dates: rows.iter().map(|&r| self.dates[r]).collect(),
            instruments: self.instruments.clone(),
            values,
        }
    }
}

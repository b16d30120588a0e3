//! CSV file data provider.
//!
//! One file per instrument, `<instrument>.csv`, with a `date` column
//! (`YYYY-MM-DD`) followed by one column per field. Empty cells are
//! treated as never recorded.

use chrono::NaiveDate;
use std::fs;
use std::path::PathBuf;

use crate::domain::error::QtsimError;
use crate::ports::data_port::{DataProvider, HistoryFragment, Observation};

pub struct CsvDataProvider {
    base_path: PathBuf,
}

impl CsvDataProvider {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, instrument: &str) -> PathBuf {
        self.base_path.join(format!("{instrument}.csv"))
    }

    /// Instruments with a data file, sorted.
    pub fn list_instruments(&self) -> Result<Vec<String>, QtsimError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| QtsimError::Provider {
            reason: format!("failed to read directory {}: {e}", self.base_path.display()),
        })?;

        let mut instruments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| QtsimError::Provider {
                reason: format!("directory entry error: {e}"),
            })?;
            let name = entry.file_name();
            if let Some(stem) = name.to_string_lossy().strip_suffix(".csv") {
                instruments.push(stem.to_string());
            }
        }
        instruments.sort();
        Ok(instruments)
    }

    /// Rows of one field for one instrument; `None` when the file or column is absent.
    fn read_field(
        &self,
        instrument: &str,
        field: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<Vec<Observation>>, QtsimError> {
        let path = self.csv_path(instrument);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| QtsimError::Provider {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let headers = rdr.headers().map_err(|e| QtsimError::Provider {
            reason: format!("{}: CSV header error: {e}", path.display()),
        })?;
        let Some(column) = headers.iter().position(|h| h.trim() == field) else {
            return Ok(None);
        };

        let mut observations = Vec::new();
        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| QtsimError::Provider {
                reason: format!("{}: CSV parse error: {e}", path.display()),
            })?;
            let date_str = record.get(0).unwrap_or_default().trim();
            let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").map_err(|e| {
                QtsimError::Provider {
                    reason: format!("{} row {}: invalid date '{date_str}': {e}", path.display(), line + 1),
                }
            })?;
            if date < start || date > end {
                continue;
            }
            let raw = record.get(column).unwrap_or_default().trim();
            if raw.is_empty() {
                continue;
            }
            let value: f64 = raw.parse().map_err(|e| QtsimError::Provider {
                reason: format!("{} row {}: invalid {field} value '{raw}': {e}", path.display(), line + 1),
            })?;
            observations.push(Observation {
                instrument: instrument.to_string(),
                date,
                value,
            });
        }
        Ok(Some(observations))
    }
}

impl DataProvider for CsvDataProvider {
    fn fetch(
        &self,
        data_id: &str,
        instruments: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HistoryFragment, QtsimError> {
        let mut fragment = HistoryFragment {
            data_id: data_id.to_string(),
            ..Default::default()
        };
        for instrument in instruments {
            match self.read_field(instrument, data_id, start, end)? {
                Some(rows) => fragment.observations.extend(rows),
                None => fragment.missing.push(instrument.clone()),
            }
        }
        Ok(fragment)
    }
}

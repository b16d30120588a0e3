//! Data provider port and history assembly.

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::domain::error::QtsimError;
use crate::domain::history::{HistoryCube, HistoryCubeBuilder};

/// One recorded value.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub instrument: String,
    pub date: NaiveDate,
    pub value: f64,
}

/// Result of one fetch: whatever the provider had for one data id.
///
/// Instruments the provider knows nothing about are listed in `missing`
/// rather than failing the whole request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryFragment {
    pub data_id: String,
    pub observations: Vec<Observation>,
    pub missing: Vec<String>,
}

pub trait DataProvider {
    /// Values of `data_id` (a field such as `close`) for `instruments` over
    /// `[start, end]`. Throttled providers return
    /// [`QtsimError::RateLimited`].
    fn fetch(
        &self,
        data_id: &str,
        instruments: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HistoryFragment, QtsimError>;
}

/// Fetch every field and assemble the fragments into one cube.
///
/// Every requested instrument and field gets a slot in the cube even when
/// the provider returned nothing for it, so gaps surface later as
/// [`QtsimError::DataGap`] instead of unknown labels.
pub fn load_history(
    provider: &dyn DataProvider,
    fields: &[&str],
    instruments: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<HistoryCube, QtsimError> {
    load_history_with_optional(provider, fields, &[], instruments, start, end)
}

/// [`load_history`] plus `optional` fields such as the halt flag, which
/// most providers do not carry. Their absence is not worth a warning.
pub fn load_history_with_optional(
    provider: &dyn DataProvider,
    fields: &[&str],
    optional: &[&str],
    instruments: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<HistoryCube, QtsimError> {
    let mut builder = HistoryCubeBuilder::new();
    for instrument in instruments {
        builder.instrument(instrument);
    }
    let optional = optional.iter().filter(|f| !fields.contains(f));
    for (field, required) in fields.iter().map(|f| (f, true)).chain(optional.map(|f| (f, false))) {
        builder.field(field);
        let fragment = provider.fetch(field, instruments, start, end)?;
        if !fragment.missing.is_empty() {
            if required {
                warn!(field, missing = ?fragment.missing, "provider has no data for some instruments");
            } else {
                debug!(field, missing = ?fragment.missing, "optional field not provided");
            }
        }
        debug!(field, observations = fragment.observations.len(), "fragment loaded");
        for obs in fragment.observations {
            if obs.date < start || obs.date > end {
                continue;
            }
            builder.record(&obs.instrument, field, obs.date, obs.value);
        }
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapProvider {
        data: HashMap<(String, String), Vec<(NaiveDate, f64)>>,
    }

    impl DataProvider for MapProvider {
        fn fetch(
            &self,
            data_id: &str,
            instruments: &[String],
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<HistoryFragment, QtsimError> {
            let mut fragment = HistoryFragment {
                data_id: data_id.to_string(),
                ..Default::default()
            };
            for inst in instruments {
                match self.data.get(&(inst.clone(), data_id.to_string())) {
                    Some(rows) => fragment.observations.extend(rows.iter().map(|(d, v)| Observation {
                        instrument: inst.clone(),
                        date: *d,
                        value: *v,
                    })),
                    None => fragment.missing.push(inst.clone()),
                }
            }
            Ok(fragment)
        }
    }

    struct Throttled;

    impl DataProvider for Throttled {
        fn fetch(&self, _: &str, _: &[String], _: NaiveDate, _: NaiveDate) -> Result<HistoryFragment, QtsimError> {
            Err(QtsimError::RateLimited { retry_after_secs: 30 })
        }
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn optional_fields_get_a_slot_even_when_absent() {
        let mut data = HashMap::new();
        data.insert(("A".to_string(), "close".to_string()), vec![(d(1), 10.0), (d(2), 11.0)]);
        data.insert(("A".to_string(), "halted".to_string()), vec![(d(1), 1.0)]);
        let provider = MapProvider { data };
        let names = vec!["A".to_string(), "B".to_string()];
        let cube =
            load_history_with_optional(&provider, &["close"], &["halted", "close"], &names, d(1), d(2))
                .unwrap();
        assert_eq!(cube.fields(), ["close", "halted"]);
        let close = cube.field_index("close").unwrap();
        assert!(!cube.is_tradable(0, close, 0));
        assert!(cube.is_tradable(0, close, 1));
    }

    #[test]
    fn assembles_fragments_and_keeps_missing_slots() {
        let mut data = HashMap::new();
        data.insert(
            ("A".to_string(), "close".to_string()),
            vec![(d(2), 10.0), (d(1), 9.0), (d(20), 99.0)],
        );
        let provider = MapProvider { data };
        let names = vec!["A".to_string(), "B".to_string()];
        let cube = load_history(&provider, &["close"], &names, d(1), d(10)).unwrap();
        assert_eq!(cube.instruments(), &names[..]);
        assert_eq!(cube.dates(), &[d(1), d(2)]);
        assert_eq!(cube.get("A", "close", d(1)), Some(9.0));
        assert_eq!(cube.get("B", "close", d(1)), None);
    }

    #[test]
    fn rate_limit_propagates() {
        let err = load_history(&Throttled, &["close"], &["A".to_string()], d(1), d(2)).unwrap_err();
        assert!(matches!(err, QtsimError::RateLimited { retry_after_secs: 30 }));
    }
}

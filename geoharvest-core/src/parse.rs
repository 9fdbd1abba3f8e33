use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::records::{non_empty, FeatureClass, GeonameRecord};
use crate::CurateError;

pub const DEFAULT_MIN_POPULATION: u64 = 500;
pub const DEFAULT_PROGRESS_FRACTION: f64 = 0.01;

/// Pulses emitted while a country file is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportProgress {
    /// Cumulative percentage of the file consumed, 1..=100.
    Percent(u8),
    /// Emitted exactly once, after EOF.
    Complete,
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Expected ISO-3166 code; rows naming another country are dropped.
    pub country_code: String,
    pub min_population: u64,
    pub progress_fraction: f64,
}

impl ParseOptions {
    pub fn new(country_code: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
            min_population: DEFAULT_MIN_POPULATION,
            progress_fraction: DEFAULT_PROGRESS_FRACTION,
        }
    }
}

/// The two curated sequences, each preserving file order.
#[derive(Debug, Default)]
pub struct ParsedCountry {
    pub admins: Vec<GeonameRecord>,
    pub populated: Vec<GeonameRecord>,
    pub dropped: u64,
}

/// Turns consumed-byte counts into "+1%" pulses. Emits at most one pulse
/// per call; the remainder carries over to later calls.
struct ProgressMeter {
    step: u64,
    emitted: u64,
}

impl ProgressMeter {
    fn new(file_size: u64, fraction: f64) -> Self {
        let step = (file_size as f64 * fraction).floor() as u64;
        Self {
            step: step.max(1),
            emitted: 0,
        }
    }

    fn tick(&mut self, consumed: u64) -> Option<u8> {
        if self.emitted >= 100 {
            return None;
        }
        if consumed / self.step > self.emitted {
            self.emitted += 1;
            Some(self.emitted as u8)
        } else {
            None
        }
    }
}

/// Stream-parse a full country text file into curated admin and populated
/// sequences.
///
/// `file_size` is the pre-scan size of the underlying file and only drives
/// progress metering. The `cancelled` flag is observed between lines so a
/// shutdown does not have to wait for a large country to finish.
pub fn parse_country_file<R: Read>(
    input: R,
    file_size: u64,
    options: &ParseOptions,
    mut progress: impl FnMut(ImportProgress),
    cancelled: &AtomicBool,
) -> Result<ParsedCountry, CurateError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .flexible(true)
        .quoting(false)
        .from_reader(input);

    let mut meter = ProgressMeter::new(file_size, options.progress_fraction);
    let mut parsed = ParsedCountry::default();
    let mut row = csv::ByteRecord::new();

    while rdr.read_byte_record(&mut row)? {
        if cancelled.load(Ordering::Relaxed) {
            return Err(CurateError::Cancelled);
        }
        match make_geoname_record(&row, options) {
            Some(record) => match record.feature_class {
                FeatureClass::Admin => parsed.admins.push(record),
                FeatureClass::Populated => parsed.populated.push(record),
            },
            None => parsed.dropped += 1,
        }
        if let Some(percent) = meter.tick(rdr.position().byte()) {
            progress(ImportProgress::Percent(percent));
        }
    }
    progress(ImportProgress::Complete);

    tracing::debug!(
        country = %options.country_code,
        admins = parsed.admins.len(),
        populated = parsed.populated.len(),
        dropped = parsed.dropped,
        "country file parsed"
    );
    Ok(parsed)
}

// Retained 0-indexed columns of the geoname table:
// 0 geonameid, 1 name, 4 latitude, 5 longitude, 6 feature class,
// 7 feature code, 8 country code, 10..13 admin1..admin4,
// 14 population, 17 timezone.
//
// Short rows are tolerated: the record is dropped unless every required
// column is present, and a non-numeric population drops it silently.
fn make_geoname_record(row: &csv::ByteRecord, options: &ParseOptions) -> Option<GeonameRecord> {
    let id = non_empty(row, 0)?.parse().ok()?;
    let name = non_empty(row, 1)?;
    let latitude = non_empty(row, 4)?.parse().ok()?;
    let longitude = non_empty(row, 5)?.parse().ok()?;
    let feature_class = non_empty(row, 6)?;
    let feature_code = non_empty(row, 7)?;
    let country_code = non_empty(row, 8)?;
    let population = non_empty(row, 14)?.parse().ok()?;
    let timezone = non_empty(row, 17)?;

    if country_code != options.country_code {
        return None;
    }

    let feature_class = keep_geoname_record(
        feature_class,
        feature_code,
        population,
        options.min_population,
    )?;

    Some(GeonameRecord {
        id,
        name: name.to_owned(),
        latitude,
        longitude,
        feature_class,
        feature_code: feature_code.to_owned(),
        country_code: country_code.to_owned(),
        admin1: non_empty(row, 10).map(str::to_owned),
        admin2: non_empty(row, 11).map(str::to_owned),
        admin3: non_empty(row, 12).map(str::to_owned),
        admin4: non_empty(row, 13).map(str::to_owned),
        population,
        timezone: timezone.to_owned(),
        admin1_txt: None,
        admin2_txt: None,
        admin3_txt: None,
        admin4_txt: None,
    })
}

/// The record filter.
///
/// Class `A` keeps administrative subdivisions and political entities;
/// class `P` keeps settlement codes at or above the population floor
/// (inclusive). Everything else is dropped.
fn keep_geoname_record(
    class: &str,
    code: &str,
    population: u64,
    min_population: u64,
) -> Option<FeatureClass> {
    match class {
        "A" => matches!(
            code,
            "ADM1"
                | "ADM2"
                | "ADM3"
                | "ADM4"
                | "ADM5"
                | "ADMD"
                | "PCL"
                | "PCLD"
                | "PCLF"
                | "PCLI"
                | "PCLS"
        )
        .then_some(FeatureClass::Admin),
        "P" if population >= min_population => matches!(
            code,
            "PPL" | "PPLA" | "PPLA2" | "PPLA3" | "PPLA4" | "PPLC" | "PPLG" | "PPLS" | "PPLX"
        )
        .then_some(FeatureClass::Populated),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_emits_at_most_one_pulse_per_tick() {
        let mut meter = ProgressMeter::new(100, 0.01);
        // a big jump still yields a single pulse, the rest carries over
        assert_eq!(meter.tick(50), Some(1));
        assert_eq!(meter.tick(50), Some(2));
        assert_eq!(meter.tick(51), Some(3));
    }

    #[test]
    fn meter_caps_at_one_hundred() {
        let mut meter = ProgressMeter::new(100, 0.01);
        for _ in 0..200 {
            meter.tick(10_000);
        }
        assert_eq!(meter.emitted, 100);
        assert_eq!(meter.tick(20_000), None);
    }

    #[test]
    fn meter_never_divides_by_zero_on_tiny_files() {
        let mut meter = ProgressMeter::new(10, 0.01);
        assert_eq!(meter.tick(1), Some(1));
    }

    #[test]
    fn population_filter_boundary_is_inclusive() {
        assert_eq!(keep_geoname_record("P", "PPL", 499, 500), None);
        assert_eq!(
            keep_geoname_record("P", "PPL", 500, 500),
            Some(FeatureClass::Populated)
        );
    }

    #[test]
    fn admin_filter_ignores_population() {
        assert_eq!(
            keep_geoname_record("A", "ADM1", 0, 500),
            Some(FeatureClass::Admin)
        );
        assert_eq!(keep_geoname_record("A", "ADM6", 0, 500), None);
    }

    #[test]
    fn other_classes_are_dropped() {
        assert_eq!(keep_geoname_record("H", "LK", 10_000, 500), None);
        assert_eq!(keep_geoname_record("P", "PPLW", 10_000, 500), None);
    }
}

//! CSV export of a finished acquisition.
//!
//! One record per sample, in arrival order, 13 columns:
//!
//! | column | content |
//! |---|---|
//! | `Timestamp` | local time, `%Y-%m-%d %H:%M:%S%.6f` |
//! | `CAN ID` | source identifier, uppercase hex (`1A5`) |
//! | `x[g]` `y[g]` `z[g]` | raw channels |
//! | `x_incl[g]` .. `z_acc[g]` | low-pass then high-pass channels |
//! | `Tetha_XZ[deg]` `Tetha_YZ[deg]` | tilt angles |
//!
//! Numbers are written with the shortest decimal text that parses back to the same
//! `f64`, so a re-read export reproduces the in-memory values exactly. Derived columns are
//! left empty when no derived channels exist (sessions with fewer than two samples).
//!
//! Export only ever runs on a frozen buffer, after acquisition has stopped.

use crate::data::filter_engine::DerivedChannels;
use crate::error::AppResult;
#[cfg(not(feature = "storage_csv"))]
use crate::error::DaqError;
use crate::frame::Sample;
use std::path::Path;

/// Header row, in column order.
pub const CSV_HEADER: [&str; 13] = [
    "Timestamp",
    "CAN ID",
    "x[g]",
    "y[g]",
    "z[g]",
    "x_incl[g]",
    "y_incl[g]",
    "z_incl[g]",
    "x_acc[g]",
    "y_acc[g]",
    "z_acc[g]",
    "Tetha_XZ[deg]",
    "Tetha_YZ[deg]",
];

/// `chrono` format of the timestamp column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Formats one export record.
pub fn export_record(sample: &Sample, derived: Option<[f64; 8]>) -> [String; 13] {
    let derived = derived.map(|row| row.map(format_value));
    let cell = |i: usize| derived.as_ref().map(|d| d[i].clone()).unwrap_or_default();
    [
        sample.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        format!("{:X}", sample.source_id),
        format_value(sample.x),
        format_value(sample.y),
        format_value(sample.z),
        cell(0),
        cell(1),
        cell(2),
        cell(3),
        cell(4),
        cell(5),
        cell(6),
        cell(7),
    ]
}

/// Shortest round-trip decimal form of `value`.
pub fn format_value(value: f64) -> String {
    value.to_string()
}

/// Writes the header and one record per sample to `writer`. Returns the record count.
#[cfg(feature = "storage_csv")]
pub fn write_csv<W: std::io::Write>(
    writer: W,
    samples: &[Sample],
    derived: Option<&DerivedChannels>,
) -> AppResult<usize> {
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    csv_writer.write_record(CSV_HEADER)?;
    for (i, sample) in samples.iter().enumerate() {
        let row = derived.and_then(|d| d.row(i));
        csv_writer.write_record(export_record(sample, row))?;
    }
    csv_writer.flush()?;
    Ok(samples.len())
}

/// Creates (or truncates) `path` and writes the export into it.
pub fn export_csv(
    path: &Path,
    samples: &[Sample],
    derived: Option<&DerivedChannels>,
) -> AppResult<usize> {
    #[cfg(not(feature = "storage_csv"))]
    {
        let _ = (path, samples, derived);
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    #[cfg(feature = "storage_csv")]
    {
        let file = std::fs::File::create(path)?;
        let count = write_csv(std::io::BufWriter::new(file), samples, derived)?;
        tracing::info!(path = %path.display(), records = count, "CSV export written");
        Ok(count)
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::data::filter_engine::FilterEngine;
    use chrono::{Local, TimeZone};

    fn samples(n: usize) -> Vec<Sample> {
        let t0 = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        (0..n)
            .map(|i| Sample {
                timestamp: t0 + chrono::Duration::milliseconds(10 * i as i64),
                source_id: 0x1A5,
                x: -0.061 + i as f64 * 0.001,
                y: 0.331,
                z: -0.939,
            })
            .collect()
    }

    fn export_to_string(samples: &[Sample], derived: Option<&DerivedChannels>) -> String {
        let mut out = Vec::new();
        write_csv(&mut out, samples, derived).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn header_has_thirteen_columns_in_order() {
        let text = export_to_string(&[], None);
        assert_eq!(
            text.trim_end(),
            "Timestamp,CAN ID,x[g],y[g],z[g],x_incl[g],y_incl[g],z_incl[g],x_acc[g],y_acc[g],z_acc[g],Tetha_XZ[deg],Tetha_YZ[deg]"
        );
    }

    #[test]
    fn one_record_per_sample_in_order() {
        let input = samples(25);
        let derived = FilterEngine::default().compute(&input, 100.0);
        let text = export_to_string(&input, Some(&derived));
        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 25);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.len(), 13);
            assert_eq!(&record[1], "1A5");
            assert_eq!(record[2].parse::<f64>().unwrap(), input[i].x);
        }
        assert_eq!(&records[0][0], "2024-03-01 12:00:00.000000");
        assert_eq!(&records[1][0], "2024-03-01 12:00:00.010000");
    }

    #[test]
    fn numbers_round_trip_exactly() {
        let input = samples(40);
        let derived = FilterEngine::default().compute(&input, 50.0);
        let text = export_to_string(&input, Some(&derived));
        let mut reader = csv::Reader::from_reader(text.as_bytes());
        for (i, record) in reader.records().enumerate() {
            let record = record.unwrap();
            let expected = derived.row(i).unwrap();
            for (k, value) in expected.iter().enumerate() {
                let parsed: f64 = record[5 + k].parse().unwrap();
                assert_eq!(parsed.to_bits(), value.to_bits());
            }
        }
    }

    #[test]
    fn raw_only_when_no_derived_channels() {
        let input = samples(1);
        let text = export_to_string(&input, None);
        let line = text.lines().nth(1).unwrap();
        assert_eq!(line, "2024-03-01 12:00:00.000000,1A5,-0.061,0.331,-0.939,,,,,,,,");
    }

    #[test]
    fn export_to_file_and_reports_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");
        assert_eq!(export_csv(&path, &samples(3), None).unwrap(), 3);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);

        let missing = dir.path().join("no_such_dir").join("x.csv");
        assert!(export_csv(&missing, &samples(3), None).is_err());
    }
}

//! Byte-level codec: legacy-encoded CSV in, normalized CSV out.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rbetl_core::{NormalizedRecord, VENDOR};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("csv parse error: {0}")]
    Csv(#[from] csv::Error),
    #[error("normalized csv missing required column {0}")]
    MissingColumn(&'static str),
    #[error("normalized csv row {row}: invalid {field}: {value}")]
    InvalidField {
        row: usize,
        field: &'static str,
        value: String,
    },
}

/// Column order of the normalized CSV artifact written to the landing store
/// and accepted by the manual backfill path.
pub const NORMALIZED_COLUMNS: [&str; 15] = [
    "store_id",
    "store_name",
    "reserve_date",
    "booking_date",
    "start_time",
    "end_time",
    "course_name",
    "headcount",
    "channel",
    "status",
    "vendor",
    "ingestion_ts",
    "run_id",
    "record_key",
    "record_hash",
];

/// Decode a raw portal extract into text. Probe order follows the source
/// portal's observed outputs: strict UTF-8 (BOM tolerated), then Shift_JIS
/// rejecting decodes that report errors, then lossy UTF-8 as a last resort.
/// Trying UTF-8 first matters: valid UTF-8 kanji bytes often also decode as
/// Shift_JIS pairs, silently producing mojibake.
pub fn decode_csv_bytes(bytes: &[u8]) -> String {
    let stripped = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(stripped) {
        return text.to_string();
    }
    let (decoded, _, had_errors) = encoding_rs::SHIFT_JIS.decode(stripped);
    if !had_errors {
        return decoded.into_owned();
    }
    tracing::warn!(len = bytes.len(), "extract bytes decode as neither utf-8 nor shift_jis, using lossy utf-8");
    String::from_utf8_lossy(stripped).into_owned()
}

/// A header-led delimited table parsed into per-row field maps. Rows the
/// reader rejects are counted, not fatal.
#[derive(Debug, Default)]
pub struct ParsedTable {
    pub rows: Vec<HashMap<String, String>>,
    pub malformed_rows: usize,
}

pub fn parse_delimited(text: &str) -> Result<ParsedTable, CodecError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();

    let mut table = ParsedTable::default();
    for (idx, record) in reader.records().enumerate() {
        match record {
            Ok(record) => {
                let row = headers
                    .iter()
                    .zip(record.iter())
                    .filter(|(h, _)| !h.is_empty())
                    .map(|(h, v)| (h.to_string(), v.to_string()))
                    .collect();
                table.rows.push(row);
            }
            Err(err) => {
                tracing::warn!(row = idx + 1, error = %err, "skipping malformed csv row");
                table.malformed_rows += 1;
            }
        }
    }
    Ok(table)
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Encode normalized records in the fixed 15-column layout, UTF-8.
pub fn write_normalized_csv(records: &[NormalizedRecord]) -> Result<Vec<u8>, CodecError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(NORMALIZED_COLUMNS)?;
    for record in records {
        writer.write_record([
            record.store_id.clone(),
            opt(&record.store_name),
            record.reserve_date.format("%Y-%m-%d").to_string(),
            record
                .booking_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            record
                .start_time
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default(),
            record
                .end_time
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default(),
            opt(&record.course_name),
            record.headcount.map(|h| h.to_string()).unwrap_or_default(),
            opt(&record.channel),
            opt(&record.status),
            record.vendor.clone(),
            record.ingestion_ts.to_rfc3339(),
            record.run_id.to_string(),
            record.record_key.clone(),
            record.record_hash.clone(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|err| CodecError::Csv(csv::Error::from(err.into_error())))
}

fn non_empty(row: &HashMap<String, String>, key: &str) -> Option<String> {
    row.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Parse an already-normalized CSV (the manual backfill input). Content
/// fields are validated strictly; metadata columns may be absent, in which
/// case the supplied run id and timestamp fill them in.
pub fn parse_normalized_csv(
    bytes: &[u8],
    run_id: Uuid,
    ingestion_ts: DateTime<Utc>,
) -> Result<Vec<NormalizedRecord>, CodecError> {
    let text = decode_csv_bytes(bytes);
    let table = parse_delimited(&text)?;

    let mut records = Vec::with_capacity(table.rows.len());
    for (idx, row) in table.rows.iter().enumerate() {
        let row_no = idx + 1;
        let store_id =
            non_empty(row, "store_id").ok_or(CodecError::MissingColumn("store_id"))?;
        let reserve_date_raw =
            non_empty(row, "reserve_date").ok_or(CodecError::MissingColumn("reserve_date"))?;
        let reserve_date = NaiveDate::parse_from_str(&reserve_date_raw, "%Y-%m-%d").map_err(
            |_| CodecError::InvalidField {
                row: row_no,
                field: "reserve_date",
                value: reserve_date_raw.clone(),
            },
        )?;
        let record_key =
            non_empty(row, "record_key").ok_or(CodecError::MissingColumn("record_key"))?;
        let record_hash =
            non_empty(row, "record_hash").ok_or(CodecError::MissingColumn("record_hash"))?;

        let parse_date = |field: &'static str| -> Result<Option<NaiveDate>, CodecError> {
            match non_empty(row, field) {
                None => Ok(None),
                Some(value) => NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                    .map(Some)
                    .map_err(|_| CodecError::InvalidField {
                        row: row_no,
                        field,
                        value,
                    }),
            }
        };
        let parse_time = |field: &'static str| -> Result<Option<NaiveTime>, CodecError> {
            match non_empty(row, field) {
                None => Ok(None),
                Some(value) => NaiveTime::parse_from_str(&value, "%H:%M:%S")
                    .map(Some)
                    .map_err(|_| CodecError::InvalidField {
                        row: row_no,
                        field,
                        value,
                    }),
            }
        };

        let headcount = match non_empty(row, "headcount") {
            None => None,
            Some(value) => Some(value.parse::<u32>().map_err(|_| CodecError::InvalidField {
                row: row_no,
                field: "headcount",
                value,
            })?),
        };

        let ingestion_ts = match non_empty(row, "ingestion_ts") {
            None => ingestion_ts,
            Some(value) => DateTime::parse_from_rfc3339(&value)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| CodecError::InvalidField {
                    row: row_no,
                    field: "ingestion_ts",
                    value,
                })?,
        };

        records.push(NormalizedRecord {
            store_id,
            store_name: non_empty(row, "store_name"),
            reserve_date,
            booking_date: parse_date("booking_date")?,
            start_time: parse_time("start_time")?,
            end_time: parse_time("end_time")?,
            course_name: non_empty(row, "course_name"),
            headcount,
            channel: non_empty(row, "channel"),
            status: non_empty(row, "status"),
            vendor: non_empty(row, "vendor").unwrap_or_else(|| VENDOR.to_string()),
            ingestion_ts,
            run_id,
            record_key,
            record_hash,
        });
    }
    Ok(records)
}

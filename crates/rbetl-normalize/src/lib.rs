//! Portal-column mapping, type conversion and key/hash derivation.

pub mod codec;

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rbetl_core::{NormalizedRecord, RawExtract, StoreConfig, VENDOR};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub use codec::CodecError;

pub const CRATE_NAME: &str = "rbetl-normalize";

/// Portal-native header -> common-schema field. Headers outside this table
/// are dropped. Canonical names map to themselves so already-normalized
/// input passes through.
fn map_column(header: &str) -> Option<&'static str> {
    match header.trim() {
        "店舗ID" | "store_id" => Some("store_id"),
        "店舗名" | "店舗" | "store_name" => Some("store_name"),
        "予約日" | "来店日" | "日付" | "reserve_date" => Some("reserve_date"),
        "予約受付日" | "受付日" | "登録日" | "booking_date" => Some("booking_date"),
        "予約時間" | "開始時間" | "時間" | "start_time" => Some("start_time"),
        "終了時間" | "end_time" => Some("end_time"),
        "コース名" | "プラン名" | "メニュー名" | "コース" | "course_name" => {
            Some("course_name")
        }
        "人数" | "名数" | "予約者数" | "headcount" => Some("headcount"),
        "経路" | "媒体" | "流入元" | "channel" => Some("channel"),
        "予約ステータス" | "ステータス" | "状態" | "status" => Some("status"),
        "予約番号" | "ID" | "reservation_id" => Some("reservation_id"),
        _ => None,
    }
}

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d/%m/%Y", "%Y年%m月%d日"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S"];
const TIME_FORMATS: [&str; 3] = ["%H:%M:%S", "%H:%M", "%H時%M分"];

/// Try each known date shape in order, first match wins.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts.date());
        }
    }
    None
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(raw, format).ok())
}

/// Non-negative integer after stripping every non-digit character
/// ("4名" -> 4, "12 people" -> 12).
pub fn parse_headcount(raw: &str) -> Option<u32> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Cleaned-raw fallback for values outside the fixed vocabularies:
/// lower-cased, whitespace collapsed to underscores. Unknown vocabulary is
/// tolerated, not rejected.
fn clean_token(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

pub fn canonicalize_channel(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let canonical = match trimmed {
        "ネット予約" | "ネット" | "WEB" | "web" | "online" => "online",
        "電話" | "TEL" | "tel" | "phone" => "phone",
        "ウォークイン" | "walk-in" | "walkin" => "walk_in",
        "グルメサイト" | "gourmet_site" => "gourmet_site",
        _ => return Some(clean_token(trimmed)),
    };
    Some(canonical.to_string())
}

pub fn canonicalize_status(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let canonical = match trimmed {
        "確定" | "confirmed" => "confirmed",
        "キャンセル" | "取消" | "cancel" | "cancelled" | "canceled" => "cancelled",
        "保留" | "pending" => "pending",
        "完了" | "completed" | "done" => "completed",
        _ => return Some(clean_token(trimmed)),
    };
    Some(canonical.to_string())
}

/// How the stable identity of a reservation is derived. The portal does not
/// reliably expose a durable reservation identifier, so `Auto` uses it when
/// present and falls back to the composite natural key. The composite key is
/// a heuristic proxy for identity: it collides or drifts if the source
/// changes any component of an existing reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    #[default]
    Auto,
    Natural,
    Composite,
}

fn composite_key(
    store_id: &str,
    reserve_date: NaiveDate,
    start_time: Option<NaiveTime>,
    course_name: Option<&str>,
    headcount: Option<u32>,
    channel: Option<&str>,
) -> String {
    let mut parts = vec![
        store_id.to_string(),
        reserve_date.format("%Y-%m-%d").to_string(),
    ];
    if let Some(time) = start_time {
        parts.push(time.format("%H:%M:%S").to_string());
    }
    if let Some(course) = course_name {
        parts.push(course.to_string());
    }
    if let Some(headcount) = headcount {
        parts.push(headcount.to_string());
    }
    if let Some(channel) = channel {
        parts.push(channel.to_string());
    }
    parts.join("|")
}

/// Content fingerprint: SHA-256 over the content fields only, in fixed
/// order. Metadata (run id, ingestion timestamp) never participates, so the
/// same content re-extracted later hashes identically.
pub fn content_hash(record: &NormalizedRecord) -> String {
    let mut hasher = Sha256::new();
    let mut push = |part: &str| {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    };
    push(&record.store_id);
    push(record.store_name.as_deref().unwrap_or(""));
    push(&record.reserve_date.format("%Y-%m-%d").to_string());
    push(
        &record
            .booking_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
    );
    push(
        &record
            .start_time
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default(),
    );
    push(
        &record
            .end_time
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default(),
    );
    push(record.course_name.as_deref().unwrap_or(""));
    push(&record.headcount.map(|h| h.to_string()).unwrap_or_default());
    push(record.channel.as_deref().unwrap_or(""));
    push(record.status.as_deref().unwrap_or(""));
    hex::encode(hasher.finalize())
}

/// Result of normalizing one raw extract. Row-level failures are counted
/// here, never propagated.
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub records: Vec<NormalizedRecord>,
    pub skipped_rows: usize,
    pub field_errors: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    pub key_strategy: KeyStrategy,
}

impl Normalizer {
    pub fn new(key_strategy: KeyStrategy) -> Self {
        Self { key_strategy }
    }

    /// Raw extract bytes -> normalized records. Every returned record has a
    /// non-null store id, vendor, reserve date, ingestion timestamp, run id,
    /// record key and record hash.
    pub fn normalize_extract(
        &self,
        extract: &RawExtract,
        store: &StoreConfig,
        run_id: Uuid,
        ingestion_ts: DateTime<Utc>,
    ) -> Result<NormalizeOutcome, CodecError> {
        let text = codec::decode_csv_bytes(&extract.bytes);
        let table = codec::parse_delimited(&text)?;

        let mut outcome = NormalizeOutcome {
            skipped_rows: table.malformed_rows,
            ..Default::default()
        };

        for (idx, raw_row) in table.rows.iter().enumerate() {
            match self.normalize_row(raw_row, store, run_id, ingestion_ts, &mut outcome) {
                Some(record) => outcome.records.push(record),
                None => {
                    tracing::warn!(
                        store_id = %store.store_id,
                        row = idx + 1,
                        "row skipped: reserve_date missing or unparseable"
                    );
                    outcome.skipped_rows += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn normalize_row(
        &self,
        raw_row: &HashMap<String, String>,
        store: &StoreConfig,
        run_id: Uuid,
        ingestion_ts: DateTime<Utc>,
        outcome: &mut NormalizeOutcome,
    ) -> Option<NormalizedRecord> {
        let mut mapped: HashMap<&'static str, &str> = HashMap::new();
        for (header, value) in raw_row {
            if let Some(field) = map_column(header) {
                let value = value.trim();
                if !value.is_empty() {
                    mapped.insert(field, value);
                }
            }
        }

        // reserve_date is the one required content field.
        let reserve_date = parse_date(mapped.get("reserve_date")?)?;

        let mut convert = |field: &'static str, parsed_ok: bool| {
            if mapped.contains_key(field) && !parsed_ok {
                tracing::warn!(store_id = %store.store_id, field, "field conversion failed, set to absent");
                outcome.field_errors += 1;
            }
        };

        let booking_date = mapped.get("booking_date").and_then(|v| parse_date(v));
        convert("booking_date", booking_date.is_some());
        let start_time = mapped.get("start_time").and_then(|v| parse_time(v));
        convert("start_time", start_time.is_some());
        let end_time = mapped.get("end_time").and_then(|v| parse_time(v));
        convert("end_time", end_time.is_some());
        let headcount = mapped.get("headcount").and_then(|v| parse_headcount(v));
        convert("headcount", headcount.is_some());

        let channel = mapped.get("channel").and_then(|v| canonicalize_channel(v));
        let status = mapped.get("status").and_then(|v| canonicalize_status(v));
        let course_name = mapped.get("course_name").map(|v| v.to_string());
        let store_name = store
            .store_name
            .clone()
            .or_else(|| mapped.get("store_name").map(|v| v.to_string()));

        let reservation_id = mapped.get("reservation_id").copied();
        let record_key = match (self.key_strategy, reservation_id) {
            (KeyStrategy::Natural, Some(id)) | (KeyStrategy::Auto, Some(id)) => {
                format!("{}|{}", store.store_id, id)
            }
            (KeyStrategy::Natural, None) => {
                // Natural keying was requested but the portal withheld the
                // identifier; composite is the only identity left.
                composite_key(
                    &store.store_id,
                    reserve_date,
                    start_time,
                    course_name.as_deref(),
                    headcount,
                    channel.as_deref(),
                )
            }
            (KeyStrategy::Composite, _) | (KeyStrategy::Auto, None) => composite_key(
                &store.store_id,
                reserve_date,
                start_time,
                course_name.as_deref(),
                headcount,
                channel.as_deref(),
            ),
        };

        let mut record = NormalizedRecord {
            store_id: store.store_id.clone(),
            store_name,
            reserve_date,
            booking_date,
            start_time,
            end_time,
            course_name,
            headcount,
            channel,
            status,
            vendor: VENDOR.to_string(),
            ingestion_ts,
            run_id,
            record_key,
            record_hash: String::new(),
        };
        record.record_hash = content_hash(&record);
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StoreConfig {
        StoreConfig {
            store_id: "S1".into(),
            store_name: Some("Sakura Tei".into()),
            username: "u".into(),
            password: "p".into(),
            days_back: 7,
            from_date: None,
            to_date: None,
            active: true,
        }
    }

    fn normalize(csv_text: &str) -> NormalizeOutcome {
        let extract = RawExtract {
            bytes: csv_text.as_bytes().to_vec(),
            downloaded_path: None,
        };
        Normalizer::default()
            .normalize_extract(&extract, &store(), Uuid::new_v4(), Utc::now())
            .expect("normalize")
    }

    #[test]
    fn dates_accept_each_known_format() {
        for raw in ["2026-08-01", "2026/08/01", "08/01/2026", "2026年08月01日", "2026-08-01 18:00:00"] {
            assert_eq!(
                parse_date(raw),
                NaiveDate::from_ymd_opt(2026, 8, 1),
                "format {raw}"
            );
        }
        assert_eq!(parse_date("first of august"), None);
    }

    #[test]
    fn times_normalize_to_hms() {
        let expected = NaiveTime::from_hms_opt(18, 30, 0);
        assert_eq!(parse_time("18:30"), expected);
        assert_eq!(parse_time("18:30:00"), expected);
        assert_eq!(parse_time("18時30分"), expected);
        assert_eq!(parse_time("evening"), None);
    }

    #[test]
    fn headcount_strips_non_digits() {
        assert_eq!(parse_headcount("4名"), Some(4));
        assert_eq!(parse_headcount(" 12 "), Some(12));
        assert_eq!(parse_headcount("unknown"), None);
    }

    #[test]
    fn vocabulary_fallback_cleans_unknown_values() {
        assert_eq!(canonicalize_status("確定").as_deref(), Some("confirmed"));
        assert_eq!(canonicalize_status("キャンセル").as_deref(), Some("cancelled"));
        assert_eq!(
            canonicalize_status("No Show Late").as_deref(),
            Some("no_show_late")
        );
        assert_eq!(canonicalize_channel("ネット予約").as_deref(), Some("online"));
        assert_eq!(canonicalize_channel("").as_deref(), None);
    }

    #[test]
    fn row_without_reserve_date_is_skipped_and_counted() {
        let outcome = normalize(
            "予約日,予約時間,人数\n2026-08-01,18:00,2\n,19:00,4\n2026-08-02,20:00,3\n",
        );
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.skipped_rows, 1);
    }

    #[test]
    fn unconvertible_optional_field_becomes_absent() {
        let outcome = normalize("予約日,人数,受付日\n2026-08-01,many,someday\n");
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].headcount, None);
        assert_eq!(outcome.records[0].booking_date, None);
        assert_eq!(outcome.field_errors, 2);
    }

    #[test]
    fn hash_ignores_run_metadata() {
        let outcome = normalize("予約日,予約時間,人数\n2026-08-01,18:00,2\n");
        let mut a = outcome.records[0].clone();
        let mut b = a.clone();
        b.run_id = Uuid::new_v4();
        b.ingestion_ts = Utc::now();
        a.record_hash = content_hash(&a);
        b.record_hash = content_hash(&b);
        assert_eq!(a.record_hash, b.record_hash);

        b.headcount = Some(5);
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn natural_key_used_when_reservation_id_present() {
        let outcome = normalize("予約日,予約番号\n2026-08-01,R-9\n");
        assert_eq!(outcome.records[0].record_key, "S1|R-9");
    }

    #[test]
    fn composite_key_used_when_identifier_absent() {
        let outcome = normalize("予約日,予約時間,コース名,人数,経路\n2026-08-01,18:00,Omakase,2,電話\n");
        assert_eq!(
            outcome.records[0].record_key,
            "S1|2026-08-01|18:00:00|Omakase|2|phone"
        );
    }

    #[test]
    fn shift_jis_extract_decodes() {
        let text = "予約日,人数\n2026-08-01,3\n";
        let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode(text);
        let extract = RawExtract {
            bytes: encoded.into_owned(),
            downloaded_path: None,
        };
        let outcome = Normalizer::default()
            .normalize_extract(&extract, &store(), Uuid::new_v4(), Utc::now())
            .expect("normalize");
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].headcount, Some(3));
    }

    #[test]
    fn utf8_japanese_is_not_misread_as_shift_jis() {
        let text = "予約日,ステータス\n2026-08-01,確定\n";
        let outcome = normalize(text);
        assert_eq!(outcome.records[0].status.as_deref(), Some("confirmed"));
    }

    #[test]
    fn normalized_csv_round_trips_through_backfill_parser() {
        let outcome = normalize("予約日,予約時間,人数,経路\n2026-08-01,18:00,2,電話\n");
        let bytes = codec::write_normalized_csv(&outcome.records).expect("encode");
        let parsed =
            codec::parse_normalized_csv(&bytes, outcome.records[0].run_id, Utc::now()).expect("parse");
        assert_eq!(parsed, outcome.records);
    }
}

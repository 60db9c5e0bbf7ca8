//! Raw source record → [`PriceCandidate`] normalization. Pure, no I/O.

use mandi_core::PriceCandidate;
use serde_json::Value as JsonValue;

use crate::RawRecord;

/// Canonical field names. Source keys are matched after lowercasing and decoding the
/// `_x0020_` space escape some data.gov.in resources use (`Min_x0020_Price`).
const COMMODITY: &str = "commodity";
const VARIETY: &str = "variety";
const STATE: &str = "state";
const DISTRICT: &str = "district";
const MARKET: &str = "market";
const ARRIVAL_DATE: &str = "arrival_date";
const MIN_PRICE: &str = "min_price";
const MAX_PRICE: &str = "max_price";
const MODAL_PRICE: &str = "modal_price";

fn canonical_field_name(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace("_x0020_", "_").replace(' ', "_")
}

fn lookup<'a>(record: &'a RawRecord, field: &str) -> Option<&'a JsonValue> {
    if let Some(value) = record.get(field) {
        return Some(value);
    }
    record
        .iter()
        .find(|(key, _)| canonical_field_name(key) == field)
        .map(|(_, value)| value)
}

fn text_field(record: &RawRecord, field: &str) -> Option<String> {
    let text = match lookup(record, field)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Numeric coercion. Anything that does not parse to a finite number is absent, not zero.
fn price_field(record: &RawRecord, field: &str) -> Option<f64> {
    let value = match lookup(record, field)? {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

pub fn normalize_record(record: &RawRecord) -> PriceCandidate {
    PriceCandidate {
        commodity: text_field(record, COMMODITY),
        variety: text_field(record, VARIETY),
        state: text_field(record, STATE),
        district: text_field(record, DISTRICT),
        market: text_field(record, MARKET),
        arrival_date: text_field(record, ARRIVAL_DATE),
        min_price: price_field(record, MIN_PRICE),
        max_price: price_field(record, MAX_PRICE),
        modal_price: price_field(record, MODAL_PRICE),
    }
}

/// One candidate per input record, in input order.
pub fn normalize_records(records: &[RawRecord]) -> Vec<PriceCandidate> {
    records.iter().map(normalize_record).collect()
}

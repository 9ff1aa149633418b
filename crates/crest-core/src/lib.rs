//! Core domain vocabulary and field normalization for CREST.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "crest-core";

/// Canonical research-report opinion codes.
///
/// The ratings table is seeded with exactly these four codes and nothing is
/// ever added to it at ingest time: [`RatingCode::classify`] is total, so any
/// broker phrasing lands on one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RatingCode {
    Buy,
    Sell,
    Hold,
    None,
}

impl RatingCode {
    pub const ALL: [RatingCode; 4] = [
        RatingCode::Buy,
        RatingCode::Sell,
        RatingCode::Hold,
        RatingCode::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RatingCode::Buy => "Buy",
            RatingCode::Sell => "Sell",
            RatingCode::Hold => "Hold",
            RatingCode::None => "None",
        }
    }

    /// Human-readable label as it appears in the source data set.
    pub fn description(&self) -> &'static str {
        match self {
            RatingCode::Buy => "매수",
            RatingCode::Sell => "매도",
            RatingCode::Hold => "보유/중립",
            RatingCode::None => "투자의견 없음",
        }
    }

    /// Classify a free-text broker opinion into a canonical code.
    ///
    /// Matching is case-insensitive on the trimmed input, against fixed
    /// synonym sets covering the English and Korean terms (and the known
    /// broker-specific phrasings) observed in the source listings. Anything
    /// unrecognized classifies as `None`; there is no error path.
    pub fn classify(raw: Option<&str>) -> RatingCode {
        let Some(raw) = raw else {
            return RatingCode::None;
        };
        let s = raw.trim().to_lowercase();

        if matches!(
            s.as_str(),
            "" | "nr" | "투자의견없음" | "n/a" | "na" | "notrated" | "-"
        ) {
            return RatingCode::None;
        }
        if matches!(s.as_str(), "buy" | "매수" | "tradingbuy") {
            return RatingCode::Buy;
        }
        if s == "hold" {
            return RatingCode::Hold;
        }
        if matches!(s.as_str(), "sell" | "매도" | "underperform") {
            return RatingCode::Sell;
        }

        RatingCode::None
    }
}

/// Trim a free-text field, mapping blank input to `None`.
pub fn normalize_str(s: Option<&str>) -> Option<String> {
    let trimmed = s?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Lenient integer parse: strips thousands-separator commas and surrounding
/// whitespace; malformed input is "no data", never an error.
pub fn parse_int(value: Option<&str>) -> Option<i64> {
    let v = value?.replace(',', "");
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    v.parse().ok()
}

/// Lenient float parse with the same rules as [`parse_int`].
pub fn parse_float(value: Option<&str>) -> Option<f64> {
    let v = value?.replace(',', "");
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    v.parse().ok()
}

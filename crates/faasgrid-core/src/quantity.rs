//! Kubernetes resource quantity parsing.
//!
//! Accepts the apimachinery grammar: a decimal number followed by an
//! optional binary suffix (`Ki`..`Ei`), decimal suffix (`n`, `u`, `m`, `k`,
//! `M`..`E`) or decimal exponent (`e3`, `E-2`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// A validated resource quantity such as `"0.5"`, `"250m"` or `"1Gi"`.
///
/// The original text is kept verbatim; [`value`](Self::value) gives the
/// amount in base units (cores or bytes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceQuantity {
    raw: String,
    value: f64,
}

impl ResourceQuantity {
    /// Parse and validate a quantity string. Negative amounts are rejected.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let raw = input.trim();
        let invalid = |reason| CoreError::InvalidQuantity {
            value: input.to_string(),
            reason,
        };

        if raw.is_empty() {
            return Err(invalid("empty quantity"));
        }

        let (number, suffix) = split_number(raw);
        if number.is_empty() {
            return Err(invalid("missing numeric part"));
        }
        let mantissa = parse_number(number).ok_or_else(|| invalid("malformed number"))?;
        let multiplier = suffix_multiplier(suffix).ok_or_else(|| invalid("unknown suffix"))?;
        let value = mantissa * multiplier;

        if !value.is_finite() {
            return Err(invalid("out of range"));
        }
        if value < 0.0 {
            return Err(invalid("must not be negative"));
        }

        Ok(Self {
            raw: raw.to_string(),
            value,
        })
    }

    /// The quantity exactly as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Amount in base units.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Amount in thousandths of the base unit, rounded up.
    pub fn milli_value(&self) -> u64 {
        (self.value * 1000.0).ceil() as u64
    }
}

impl fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ResourceQuantity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceQuantity {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceQuantity> for String {
    fn from(q: ResourceQuantity) -> Self {
        q.raw
    }
}

/// Split `"1.5Gi"` into `("1.5", "Gi")`. A leading sign belongs to the number.
fn split_number(s: &str) -> (&str, &str) {
    let end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '+' || c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s.split_at(end)
}

fn parse_number(s: &str) -> Option<f64> {
    let unsigned = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (int, frac) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if !int.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse::<f64>().ok()
}

fn suffix_multiplier(suffix: &str) -> Option<f64> {
    let m = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp => {
            let digits = exp.strip_prefix(['e', 'E'])?;
            let unsigned = digits.strip_prefix(['+', '-']).unwrap_or(digits);
            if unsigned.is_empty() || !unsigned.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            10f64.powi(digits.parse::<i32>().ok()?)
        }
    };
    Some(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_cpu_values() {
        assert_eq!(ResourceQuantity::parse("1.0").unwrap().value(), 1.0);
        assert_eq!(ResourceQuantity::parse("0.2").unwrap().milli_value(), 200);
        assert_eq!(ResourceQuantity::parse(".5").unwrap().milli_value(), 500);
        assert_eq!(ResourceQuantity::parse("2").unwrap().value(), 2.0);
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(ResourceQuantity::parse("250m").unwrap().milli_value(), 250);
        assert_eq!(ResourceQuantity::parse("1Gi").unwrap().value(), 1073741824.0);
        assert_eq!(ResourceQuantity::parse("256Mi").unwrap().value(), 268435456.0);
        assert_eq!(ResourceQuantity::parse("1k").unwrap().value(), 1000.0);
        assert_eq!(ResourceQuantity::parse("1e3").unwrap().value(), 1000.0);
    }

    #[test]
    fn keeps_original_text() {
        let q = ResourceQuantity::parse(" 1Gi ").unwrap();
        assert_eq!(q.as_str(), "1Gi");
        assert_eq!(q.to_string(), "1Gi");
    }

    #[test]
    fn rejects_malformed_values() {
        for bad in ["", "not-a-number", "1.2.3", "Gi", "1Gb", "1e", "-1", "1 Gi", "."] {
            assert!(
                matches!(
                    ResourceQuantity::parse(bad),
                    Err(CoreError::InvalidQuantity { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn serde_round_trips_as_string() {
        let q: ResourceQuantity = serde_json::from_str("\"512Mi\"").unwrap();
        assert_eq!(serde_json::to_string(&q).unwrap(), "\"512Mi\"");
        assert!(serde_json::from_str::<ResourceQuantity>("\"lots\"").is_err());
    }
}

//! Result cell model and its canonical text rendering
//!
//! Every value a query can return is mapped onto [`Cell`] by the engine, and
//! [`render`] turns any cell into the text written to the output file. The
//! rendering is total: there is no input for which it fails or panics, and
//! kinds the engine does not recognize land in [`Cell::Unknown`].
//!
//! New value kinds are added here and nowhere else.

use bigdecimal::{BigDecimal, RoundingMode};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::types::ipnetwork::IpNetwork;
use sqlx::types::mac_address::MacAddress;

/// Text written for SQL NULL
pub const NULL_MARKER: &str = "[null]";

/// Text written when a structured value cannot be encoded
pub const BAD_DATA_MARKER: &str = "bad data";

/// Fractional digits kept for arbitrary-precision decimals.
///
/// Anything beyond this is rounded away (half away from zero).
pub const DECIMAL_SCALE: i64 = 5;

/// Fractional digits written for floating point values
pub const FLOAT_PRECISION: usize = 6;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const TIMESTAMPTZ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %:z";

/// One typed value from one column of one row
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Boolean(bool),
    /// Any integer width; the widest PostgreSQL integer fits with room to spare
    Integer(i128),
    Float(f64),
    Decimal(BigDecimal),
    Text(String),
    HardwareAddr(MacAddress),
    Binary(Vec<u8>),
    /// Address with prefix (inet / cidr)
    Network(IpNetwork),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Interval(PgInterval),
    /// Structured document (json / jsonb)
    Json(serde_json::Value),
    /// Fallback for kinds without a dedicated rule
    Unknown { type_name: String, text: String },
}

impl Cell {
    pub fn unknown(type_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Unknown {
            type_name: type_name.into(),
            text: text.into(),
        }
    }
}

/// Render a cell as canonical text. Never fails.
pub fn render(cell: &Cell) -> String {
    match cell {
        Cell::Null => NULL_MARKER.to_string(),
        Cell::Boolean(value) => value.to_string(),
        Cell::Integer(value) => value.to_string(),
        Cell::Float(value) => format!("{:.*}", FLOAT_PRECISION, value),
        Cell::Decimal(value) => render_decimal(value),
        Cell::Text(value) => value.clone(),
        Cell::HardwareAddr(value) => value.to_string(),
        Cell::Binary(value) => format!("\\x{}", hex::encode(value)),
        Cell::Network(value) => value.to_string(),
        Cell::Timestamp(value) => value.format(TIMESTAMP_FORMAT).to_string(),
        Cell::TimestampTz(value) => value.format(TIMESTAMPTZ_FORMAT).to_string(),
        Cell::Date(value) => value.to_string(),
        Cell::Time(value) => value.to_string(),
        Cell::Interval(value) => render_interval(value),
        Cell::Json(value) => {
            serde_json::to_string(value).unwrap_or_else(|_| BAD_DATA_MARKER.to_string())
        }
        Cell::Unknown { type_name, text } => format!("({}): {}", type_name, text),
    }
}

/// Render every cell of a row, preserving column order
pub fn render_row(cells: &[Cell]) -> Vec<String> {
    cells.iter().map(render).collect()
}

fn render_decimal(value: &BigDecimal) -> String {
    value
        .with_scale_round(DECIMAL_SCALE, RoundingMode::HalfUp)
        .to_plain_string()
}

/// PostgreSQL-style `N mons N days HH:MM:SS[.ffffff]`, zero parts omitted
fn render_interval(value: &PgInterval) -> String {
    let mut parts = Vec::with_capacity(3);

    if value.months != 0 {
        let unit = if value.months.abs() == 1 { "mon" } else { "mons" };
        parts.push(format!("{} {}", value.months, unit));
    }

    if value.days != 0 {
        let unit = if value.days.abs() == 1 { "day" } else { "days" };
        parts.push(format!("{} {}", value.days, unit));
    }

    if value.microseconds != 0 || parts.is_empty() {
        let sign = if value.microseconds < 0 { "-" } else { "" };
        let micros = value.microseconds.unsigned_abs();
        let secs = micros / 1_000_000;
        let frac = micros % 1_000_000;

        let mut clock = format!(
            "{}{:02}:{:02}:{:02}",
            sign,
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
        if frac != 0 {
            clock.push_str(&format!(".{:06}", frac));
        }
        parts.push(clock);
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::str::FromStr;

    #[test]
    fn test_render_null() {
        assert_eq!(render(&Cell::Null), "[null]");
    }

    #[test]
    fn test_render_boolean() {
        assert_eq!(render(&Cell::Boolean(true)), "true");
        assert_eq!(render(&Cell::Boolean(false)), "false");
    }

    #[test]
    fn test_render_integer_without_grouping() {
        assert_eq!(render(&Cell::Integer(1_234_567)), "1234567");
        assert_eq!(render(&Cell::Integer(i64::MIN as i128)), "-9223372036854775808");
        assert_eq!(render(&Cell::Integer(u64::MAX as i128)), "18446744073709551615");
    }

    #[test]
    fn test_render_float_six_digits() {
        assert_eq!(render(&Cell::Float(1.5)), "1.500000");
        assert_eq!(render(&Cell::Float(-0.1234567)), "-0.123457");
        assert_eq!(render(&Cell::Float(f64::NAN)), "NaN");
        assert_eq!(render(&Cell::Float(f64::INFINITY)), "inf");
    }

    #[test]
    fn test_render_decimal_one_third() {
        let third = BigDecimal::from(1) / BigDecimal::from(3);
        assert_eq!(render(&Cell::Decimal(third)), "0.33333");
    }

    #[test]
    fn test_render_decimal_rounds_half_away_from_zero() {
        let two_thirds = BigDecimal::from(2) / BigDecimal::from(3);
        assert_eq!(render(&Cell::Decimal(two_thirds)), "0.66667");

        let half = BigDecimal::from_str("-1.000005").unwrap();
        assert_eq!(render(&Cell::Decimal(half)), "-1.00001");
    }

    #[test]
    fn test_render_decimal_pads_to_scale() {
        assert_eq!(render(&Cell::Decimal(BigDecimal::from(42))), "42.00000");
        assert_eq!(render(&Cell::Decimal(BigDecimal::from(0))), "0.00000");
    }

    #[test]
    fn test_render_text_verbatim() {
        let text = "comma, \"quote\"\nnewline";
        assert_eq!(render(&Cell::Text(text.to_string())), text);
    }

    #[test]
    fn test_render_hardware_addr() {
        let mac = MacAddress::new([0x08, 0x00, 0x2b, 0x01, 0x02, 0x03]);
        assert_eq!(
            render(&Cell::HardwareAddr(mac)).to_lowercase(),
            "08:00:2b:01:02:03"
        );
    }

    #[test]
    fn test_render_binary_hex() {
        assert_eq!(render(&Cell::Binary(vec![0xde, 0xad, 0xbe, 0xef])), "\\xdeadbeef");
        assert_eq!(render(&Cell::Binary(Vec::new())), "\\x");
    }

    #[test]
    fn test_render_network() {
        let net = IpNetwork::from_str("10.1.0.0/16").unwrap();
        assert_eq!(render(&Cell::Network(net)), "10.1.0.0/16");
    }

    #[test]
    fn test_render_timestamps() {
        let naive = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 0)
            .unwrap();
        assert_eq!(render(&Cell::Timestamp(naive)), "2024-03-09 07:05:00");

        let utc = Utc.from_utc_datetime(&naive);
        assert_eq!(render(&Cell::TimestampTz(utc)), "2024-03-09 07:05:00 +00:00");

        assert_eq!(render(&Cell::Date(naive.date())), "2024-03-09");
        assert_eq!(render(&Cell::Time(naive.time())), "07:05:00");
    }

    #[test]
    fn test_render_interval() {
        let interval = PgInterval {
            months: 14,
            days: 1,
            microseconds: 3_723_000_500,
        };
        assert_eq!(render(&Cell::Interval(interval)), "14 mons 1 day 01:02:03.000500");

        let zero = PgInterval {
            months: 0,
            days: 0,
            microseconds: 0,
        };
        assert_eq!(render(&Cell::Interval(zero)), "00:00:00");

        let negative = PgInterval {
            months: 0,
            days: 0,
            microseconds: -90_000_000,
        };
        assert_eq!(render(&Cell::Interval(negative)), "-00:01:30");
    }

    #[test]
    fn test_render_json_compact() {
        let value = serde_json::json!({"region": "eu", "weights": [1, 2]});
        assert_eq!(
            render(&Cell::Json(value)),
            r#"{"region":"eu","weights":[1,2]}"#
        );
    }

    #[test]
    fn test_render_unknown_fallback() {
        assert_eq!(render(&Cell::unknown("TypeName", "value")), "(TypeName): value");
    }

    #[test]
    fn test_render_row_preserves_order() {
        let row = vec![Cell::Integer(1), Cell::Null, Cell::Text("x".into())];
        assert_eq!(render_row(&row), vec!["1", "[null]", "x"]);
    }

    fn arb_cell() -> impl Strategy<Value = Cell> {
        prop_oneof![
            Just(Cell::Null),
            any::<bool>().prop_map(Cell::Boolean),
            any::<i128>().prop_map(Cell::Integer),
            any::<f64>().prop_map(Cell::Float),
            (any::<i64>(), 0i64..40).prop_map(|(digits, scale)| {
                Cell::Decimal(BigDecimal::new(digits.into(), scale))
            }),
            ".*".prop_map(Cell::Text),
            any::<[u8; 6]>().prop_map(|b| Cell::HardwareAddr(MacAddress::new(b))),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Cell::Binary),
            (any::<[u8; 4]>(), 0u8..=32).prop_map(|(octets, prefix)| {
                let addr = std::net::Ipv4Addr::from(octets);
                let net = sqlx::types::ipnetwork::Ipv4Network::new(addr, prefix)
                    .map(IpNetwork::V4)
                    .unwrap_or_else(|_| IpNetwork::from(std::net::IpAddr::V4(addr)));
                Cell::Network(net)
            }),
            (-1_000_000_000i64..1_000_000_000).prop_map(|secs| {
                Cell::TimestampTz(Utc.timestamp_opt(secs * 10, 0).unwrap())
            }),
            (any::<i32>(), any::<i32>(), any::<i64>()).prop_map(|(months, days, microseconds)| {
                Cell::Interval(PgInterval {
                    months,
                    days,
                    microseconds,
                })
            }),
            ("[a-z]{0,8}", any::<i64>()).prop_map(|(k, v)| {
                Cell::Json(serde_json::json!({ k: v }))
            }),
            ("[A-Za-z_]{1,16}", ".*").prop_map(|(t, v)| Cell::unknown(t, v)),
        ]
    }

    proptest! {
        #[test]
        fn prop_render_is_total(cell in arb_cell()) {
            let text = render(&cell);
            if matches!(cell, Cell::Null) {
                prop_assert_eq!(text, NULL_MARKER);
            }
        }

        #[test]
        fn prop_decimal_has_exact_scale(digits in any::<i64>(), scale in 0i64..30) {
            let text = render(&Cell::Decimal(BigDecimal::new(digits.into(), scale)));
            let fraction = text.split('.').nth(1).unwrap_or("");
            prop_assert_eq!(fraction.len(), DECIMAL_SCALE as usize);
        }
    }
}

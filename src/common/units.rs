//! Physical unit newtypes with human-readable text encoding.
//!
//! Every unit serializes as `"<value> <prefix><unit>"`, for example
//! `2_400_000 Hz` becomes `"2.40 MHz"`. Parsing accepts the same form with an
//! optional space, a case-insensitive unit suffix and the SI prefixes
//! `K`, `M`, `G` and `T`. Plain numbers are read as the base unit so that
//! hand-written configs can skip the string form.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// SI prefixes used for encoding, index = power of 1000.
const PREFIXES: [&str; 5] = ["", "K", "M", "G", "T"];

/// Error returned when a unit string cannot be parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitError {
    /// The string did not match `<number>[ ]<prefix><unit>`.
    Malformed(String),
    /// The unit suffix did not match the expected unit.
    WrongUnit { expected: &'static str, found: String },
    /// The prefix is not one of the supported SI prefixes.
    UnknownPrefix(String),
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitError::Malformed(s) => write!(f, "malformed unit value '{}', expected the form '100 MHz'", s),
            UnitError::WrongUnit { expected, found } => write!(f, "expected unit '{}', found '{}'", expected, found),
            UnitError::UnknownPrefix(p) => write!(f, "unknown SI prefix '{}'", p),
        }
    }
}

impl std::error::Error for UnitError {}

/// Format a base-unit value with the largest prefix keeping the mantissa >= 1.
pub fn marshal_unit(value: f64, unit: &str) -> String {
    let mut order = 0;
    let mut mantissa = value;
    while mantissa.abs() >= 1000.0 && order < PREFIXES.len() - 1 {
        mantissa /= 1000.0;
        order += 1;
    }
    format!("{:.2} {}{}", mantissa, PREFIXES[order], unit)
}

/// Parse a `"<number>[ ]<prefix><unit>"` string into a base-unit value.
pub fn unmarshal_unit(text: &str, unit: &'static str) -> Result<f64, UnitError> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| UnitError::Malformed(text.to_string()))?;
    let (number, suffix) = trimmed.split_at(split);
    // At most one space between the number and the unit.
    let number = number.strip_suffix(' ').unwrap_or(number);
    if number.is_empty() || !number.chars().enumerate().all(|(i, c)| c.is_ascii_digit() || c == '.' || (i == 0 && c == '-')) {
        return Err(UnitError::Malformed(text.to_string()));
    }
    if !suffix.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(UnitError::Malformed(text.to_string()));
    }
    let value: f64 = number.parse().map_err(|_| UnitError::Malformed(text.to_string()))?;

    if suffix.len() < unit.len() || !suffix[suffix.len() - unit.len()..].eq_ignore_ascii_case(unit) {
        return Err(UnitError::WrongUnit {
            expected: unit,
            found: suffix.to_string(),
        });
    }
    let prefix = &suffix[..suffix.len() - unit.len()];
    let multiplier = match prefix {
        "" => 1.0,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "g" | "G" => 1e9,
        "t" | "T" => 1e12,
        other => return Err(UnitError::UnknownPrefix(other.to_string())),
    };
    Ok(value * multiplier)
}

struct UnitVisitor {
    unit: &'static str,
}

impl<'de> Visitor<'de> for UnitVisitor {
    type Value = f64;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a number or a string such as '10 K{}'", self.unit)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
        unmarshal_unit(v, self.unit).map_err(E::custom)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
        Ok(v as f64)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
        Ok(v as f64)
    }
}

macro_rules! unit_type {
    ($(#[$meta:meta])* $name:ident, $unit:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
        pub struct $name(pub f64);

        impl $name {
            /// Unit symbol without prefix.
            pub const UNIT: &'static str = $unit;

            /// Value in the base unit.
            pub fn value(self) -> f64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&marshal_unit(self.0, $unit))
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnitError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                unmarshal_unit(s, $unit).map($name)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&marshal_unit(self.0, $unit))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(UnitVisitor { unit: $unit }).map($name)
            }
        }
    };
}

unit_type!(
    /// Frequency in hertz.
    Frequency,
    "Hz"
);
unit_type!(
    /// Distance in metres.
    Distance,
    "m"
);
unit_type!(
    /// Attenuation in decibels.
    Attenuation,
    "dB"
);
unit_type!(
    /// Symbol rate in bits per second.
    Baud,
    "bps"
);
unit_type!(
    /// Size in bytes.
    SizeBytes,
    "B"
);

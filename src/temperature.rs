use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lowest target the vendor API accepts, in Fahrenheit.
pub const MIN_TARGET_F: f64 = 50.0;
/// Highest target the vendor API accepts, in Fahrenheit.
pub const MAX_TARGET_F: f64 = 86.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TemperatureUnit {
    #[serde(rename = "C")]
    Celsius,
    #[default]
    #[serde(rename = "F")]
    Fahrenheit,
}

impl TemperatureUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "C",
            TemperatureUnit::Fahrenheit => "F",
        }
    }

    /// Convert `value` from this unit into `to`. Same-unit conversion returns
    /// the input bit-for-bit.
    pub fn convert(self, value: f64, to: TemperatureUnit) -> f64 {
        match (self, to) {
            (TemperatureUnit::Celsius, TemperatureUnit::Fahrenheit) => value * 9.0 / 5.0 + 32.0,
            (TemperatureUnit::Fahrenheit, TemperatureUnit::Celsius) => (value - 32.0) * 5.0 / 9.0,
            _ => value,
        }
    }
}

impl FromStr for TemperatureUnit {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C" => Ok(TemperatureUnit::Celsius),
            "F" => Ok(TemperatureUnit::Fahrenheit),
            _ => Err(ValidationError::InvalidUnit(s.to_string())),
        }
    }
}

impl fmt::Display for TemperatureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convert between unit tokens ("C"/"F", case-insensitive, surrounding
/// whitespace ignored).
pub fn convert(value: f64, from_unit: &str, to_unit: &str) -> Result<f64, ValidationError> {
    let from: TemperatureUnit = from_unit.parse()?;
    let to: TemperatureUnit = to_unit.parse()?;
    Ok(from.convert(value, to))
}

/// Check a target against the vendor's accepted range and return it
/// normalized to Fahrenheit.
pub fn validate_target_temperature(value: f64, unit: TemperatureUnit) -> Result<f64, ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite);
    }
    let value_f = unit.convert(value, TemperatureUnit::Fahrenheit);
    if !(MIN_TARGET_F..=MAX_TARGET_F).contains(&value_f) {
        return Err(ValidationError::OutOfRange {
            value_f,
            min_f: MIN_TARGET_F,
            max_f: MAX_TARGET_F,
        });
    }
    Ok(value_f)
}

/// A reading in the unit the device reported it in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub value: f64,
    pub unit: TemperatureUnit,
}

impl Temperature {
    pub fn new(value: f64, unit: TemperatureUnit) -> Self {
        Self { value, unit }
    }

    /// Display-side conversion; the stored reading is left alone.
    pub fn in_unit(&self, unit: TemperatureUnit) -> f64 {
        self.unit.convert(self.value, unit)
    }

    pub fn celsius(&self) -> f64 {
        self.in_unit(TemperatureUnit::Celsius)
    }

    pub fn fahrenheit(&self) -> f64 {
        self.in_unit(TemperatureUnit::Fahrenheit)
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}\u{00b0}{}", self.value, self.unit)
    }
}

/// Round to one decimal place for the wire.
pub(crate) fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_tokens_are_trimmed_and_case_insensitive() {
        assert_eq!(" c ".parse::<TemperatureUnit>(), Ok(TemperatureUnit::Celsius));
        assert_eq!("f".parse::<TemperatureUnit>(), Ok(TemperatureUnit::Fahrenheit));
        assert!(matches!(
            "K".parse::<TemperatureUnit>(),
            Err(ValidationError::InvalidUnit(ref s)) if s == "K"
        ));
        assert!("".parse::<TemperatureUnit>().is_err());
    }

    #[test]
    fn known_points() {
        assert_eq!(convert(0.0, "C", "F").unwrap(), 32.0);
        assert_eq!(convert(212.0, "F", "C").unwrap(), 100.0);
        assert!((convert(-40.0, "c", "f").unwrap() + 40.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_target_unit_reported() {
        assert_eq!(
            convert(20.0, "C", "Kelvin"),
            Err(ValidationError::InvalidUnit("Kelvin".into()))
        );
    }

    #[test]
    fn range_is_closed() {
        assert_eq!(validate_target_temperature(50.0, TemperatureUnit::Fahrenheit), Ok(50.0));
        assert_eq!(validate_target_temperature(86.0, TemperatureUnit::Fahrenheit), Ok(86.0));
        assert!(validate_target_temperature(49.999, TemperatureUnit::Fahrenheit).is_err());
        assert!(validate_target_temperature(86.001, TemperatureUnit::Fahrenheit).is_err());
    }

    #[test]
    fn celsius_targets_normalized_before_check() {
        assert_eq!(validate_target_temperature(10.0, TemperatureUnit::Celsius), Ok(50.0));
        assert_eq!(validate_target_temperature(30.0, TemperatureUnit::Celsius), Ok(86.0));
        assert!(validate_target_temperature(9.9, TemperatureUnit::Celsius).is_err());
        assert!(validate_target_temperature(f64::NAN, TemperatureUnit::Celsius).is_err());
    }

    #[test]
    fn display_keeps_native_unit() {
        let t = Temperature::new(21.5, TemperatureUnit::Celsius);
        assert_eq!(format!("{t}"), "21.5\u{00b0}C");
        assert!((t.fahrenheit() - 70.7).abs() < 1e-9);
        assert_eq!(t.value, 21.5);
    }
}

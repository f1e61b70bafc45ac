//! Linear calibration between raw driver values and physical target units,
//! plus the safety limits that guard writes.
//!
//! Drivers speak in a raw unit (typically volts from a DAQ card). A
//! [`Calibration`] maps that onto the unit the experimenter thinks in:
//!
//! ```text
//! target = slope * raw + offset
//! raw    = (target - offset) / slope
//! ```
//!
//! Both coefficients are validated at construction, so a calibration that
//! exists can always be inverted.

use crate::error::{AppResult, LabError, PropertyAddress};
use crate::units::{Quantity, Unit};

/// Linear raw ↔ target transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    /// Unit of the calibrated (target) values
    pub target_unit: Unit,
    slope: f64,
    offset: f64,
}

impl Calibration {
    /// Create a calibration. Fails when `slope` is zero or either coefficient is not finite.
    pub fn new(target_unit: Unit, slope: f64, offset: f64) -> AppResult<Self> {
        if !slope.is_finite() || !offset.is_finite() {
            return Err(LabError::Calibration(format!(
                "coefficients must be finite (slope={slope}, offset={offset})"
            )));
        }
        if slope == 0.0 {
            return Err(LabError::Calibration(
                "slope must be non-zero, otherwise the calibration cannot be inverted".into(),
            ));
        }
        Ok(Self {
            target_unit,
            slope,
            offset,
        })
    }

    /// Identity transform expressed in `unit`.
    pub fn identity(unit: Unit) -> Self {
        Self {
            target_unit: unit,
            slope: 1.0,
            offset: 0.0,
        }
    }

    /// Slope coefficient.
    pub fn slope(&self) -> f64 {
        self.slope
    }

    /// Offset coefficient, in the target unit.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// True unless `slope == 1` and `offset == 0`.
    pub fn is_trivial(&self) -> bool {
        self.slope == 1.0 && self.offset == 0.0
    }

    /// Raw driver value to target unit.
    pub fn to_target(&self, raw: f64) -> f64 {
        self.slope * raw + self.offset
    }

    /// Target value to raw driver value.
    pub fn to_raw(&self, target: f64) -> AppResult<f64> {
        let raw = (target - self.offset) / self.slope;
        if !raw.is_finite() {
            return Err(LabError::Calibration(format!(
                "{target} {} has no finite raw equivalent (slope={}, offset={})",
                self.target_unit, self.slope, self.offset
            )));
        }
        Ok(raw)
    }

    /// Convert a unit-tagged target quantity to the raw value.
    pub fn quantity_to_raw(&self, value: &Quantity) -> AppResult<f64> {
        self.to_raw(value.value_in(&self.target_unit)?)
    }
}

/// Inclusive safety bounds in the target unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    min: f64,
    max: f64,
    /// Unit of `min` and `max`
    pub unit: Unit,
}

impl Limits {
    /// Create limits. Fails when `min > max` or either bound is NaN.
    pub fn new(min: f64, max: f64, unit: Unit) -> AppResult<Self> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(LabError::Configuration(format!(
                "limits require min <= max, got [{min}, {max}] {unit}"
            )));
        }
        Ok(Self { min, max, unit })
    }

    /// Build limits from two quantities, converting both to `unit`.
    pub fn from_quantities(min: &Quantity, max: &Quantity, unit: &Unit) -> AppResult<Self> {
        Self::new(min.value_in(unit)?, max.value_in(unit)?, unit.clone())
    }

    /// Lower bound.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Whether `value` (already in `self.unit`) lies within the bounds.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Check a requested value, producing `LimitViolation` for `address` when it is out of range.
    pub fn check(&self, address: &PropertyAddress, value: f64) -> AppResult<()> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(LabError::LimitViolation {
                address: address.clone(),
                value,
                min: self.min,
                max: self.max,
                unit: self.unit.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nm() -> Unit {
        Unit::parse("nm").unwrap()
    }

    #[test]
    fn test_zero_slope_rejected() {
        let err = Calibration::new(nm(), 0.0, 1.0).unwrap_err();
        assert!(matches!(err, LabError::Calibration(_)));
        assert!(Calibration::new(nm(), f64::NAN, 0.0).is_err());
        assert!(Calibration::new(nm(), 1.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_round_trip_within_tolerance() {
        let coefficients = [(2.5, -3.0), (-0.001, 1500.0), (1e6, 1e-6), (3.0, 0.0)];
        let raws = [-1e6, -10.0, -0.5, 0.0, 1e-9, 0.75, 4.2, 1e5];
        for (slope, offset) in coefficients {
            let cal = Calibration::new(nm(), slope, offset).unwrap();
            for raw in raws {
                let back = cal.to_raw(cal.to_target(raw)).unwrap();
                let tolerance = 1e-9 * raw.abs().max(1.0) * (offset / slope).abs().max(1.0);
                assert!(
                    (back - raw).abs() <= tolerance,
                    "slope={slope} offset={offset} raw={raw} back={back}"
                );
            }
        }
    }

    #[test]
    fn test_to_raw_non_finite() {
        let cal = Calibration::new(nm(), 1e-300, 0.0).unwrap();
        assert!(matches!(cal.to_raw(1e300), Err(LabError::Calibration(_))));
    }

    #[test]
    fn test_quantity_to_raw_checks_units() {
        let cal = Calibration::new(Unit::parse("mW").unwrap(), 2.0, 0.0).unwrap();
        let q: Quantity = "0.004 W".parse().unwrap();
        assert!((cal.quantity_to_raw(&q).unwrap() - 2.0).abs() < 1e-12);

        let wrong: Quantity = "4 nm".parse().unwrap();
        assert!(matches!(
            cal.quantity_to_raw(&wrong),
            Err(LabError::UnitMismatch { .. })
        ));
    }

    #[test]
    fn test_limits() {
        assert!(Limits::new(2.0, 1.0, nm()).is_err());
        let limits = Limits::new(1480.0, 1640.0, nm()).unwrap();
        let addr = PropertyAddress::new("laser", "wavelength");
        assert!(limits.check(&addr, 1480.0).is_ok());
        assert!(limits.check(&addr, 1640.0).is_ok());
        assert!(matches!(
            limits.check(&addr, 1700.0),
            Err(LabError::LimitViolation { .. })
        ));

        let from_um = Limits::from_quantities(
            &"1.48 um".parse().unwrap(),
            &"1.64 um".parse().unwrap(),
            &nm(),
        )
        .unwrap();
        assert!((from_um.min() - 1480.0).abs() < 1e-9);
    }
}

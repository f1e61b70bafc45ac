//! Physical units and unit-tagged quantities.
//!
//! Every value crossing the property boundary carries an explicit [`Unit`].
//! Units are parsed from the short symbols used in configuration files
//! (`"nm"`, `"mW"`, `"nm/s"`, `"V"`) and reduced to a scale factor plus a
//! dimension vector over base symbols. Two units are compatible when their
//! dimensions agree; converting between them only rescales the magnitude.
//!
//! Symbols that are not recognised (`"counts"`, `"%"`) are kept as opaque
//! dimensions: they convert only to themselves, never silently to anything else.
//!
//! ```rust
//! use labscan::units::{Quantity, Unit};
//!
//! let speed: Quantity = "10 nm/s".parse().unwrap();
//! let um_per_s = speed.to(&Unit::parse("um/s").unwrap()).unwrap();
//! assert!((um_per_s.magnitude - 0.01).abs() < 1e-12);
//! ```

use crate::error::{AppResult, LabError};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Base symbols understood by the parser.
const BASE_SYMBOLS: &[&str] = &[
    "m", "s", "V", "A", "W", "Hz", "K", "g", "deg", "rad", "Pa", "J", "Ohm", "F",
];

/// SI prefixes accepted in front of a base symbol.
const PREFIXES: &[(&str, f64)] = &[
    ("p", 1e-12),
    ("n", 1e-9),
    ("u", 1e-6),
    ("µ", 1e-6),
    ("m", 1e-3),
    ("c", 1e-2),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
];

/// A physical unit: scale relative to its base symbols plus their exponents.
#[derive(Debug, Clone)]
pub struct Unit {
    symbol: String,
    scale: f64,
    dims: BTreeMap<String, i32>,
}

impl Unit {
    /// The dimensionless unit (bare numbers).
    pub fn dimensionless() -> Self {
        Self {
            symbol: String::new(),
            scale: 1.0,
            dims: BTreeMap::new(),
        }
    }

    /// Parse a unit expression such as `nm`, `mW`, `nm/s` or `m^2`.
    pub fn parse(expr: &str) -> AppResult<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(Self::dimensionless());
        }

        let mut parts = expr.split('/');
        let numerator = parts.next().unwrap_or_default();
        let denominator = parts.next();
        if parts.next().is_some() {
            return Err(LabError::Configuration(format!(
                "Unit '{expr}' has more than one '/'"
            )));
        }

        let mut unit = Self {
            symbol: expr.to_string(),
            scale: 1.0,
            dims: BTreeMap::new(),
        };
        unit.accumulate(numerator, 1)?;
        if let Some(den) = denominator {
            unit.accumulate(den, -1)?;
        }
        unit.dims.retain(|_, exp| *exp != 0);
        Ok(unit)
    }

    fn accumulate(&mut self, product: &str, sign: i32) -> AppResult<()> {
        for factor in product.split(['*', '·', ' ']).filter(|f| !f.is_empty()) {
            if factor == "1" {
                continue;
            }
            let (symbol, exponent) = match factor.split_once('^') {
                Some((sym, exp)) => {
                    let exp: i32 = exp.parse().map_err(|_| {
                        LabError::Configuration(format!("Bad exponent in unit factor '{factor}'"))
                    })?;
                    (sym, exp)
                }
                None => (factor, 1),
            };
            let (base, prefix_scale) = split_prefix(symbol);
            let exponent = exponent * sign;
            self.scale *= prefix_scale.powi(exponent);
            *self.dims.entry(base.to_string()).or_insert(0) += exponent;
        }
        Ok(())
    }

    /// The symbol as written in configuration.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// True for the unit of bare numbers.
    pub fn is_dimensionless(&self) -> bool {
        self.dims.is_empty()
    }

    /// Whether values in `other` can be converted to this unit.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.dims == other.dims
    }

    /// The quotient unit `self / other`, e.g. `nm` / `s` = `nm/s`.
    pub fn per(&self, other: &Unit) -> Unit {
        let mut dims = self.dims.clone();
        for (base, exp) in &other.dims {
            *dims.entry(base.clone()).or_insert(0) -= exp;
        }
        dims.retain(|_, exp| *exp != 0);
        let symbol = if self.symbol.contains('/') {
            format!("({})/{}", self.symbol, other.symbol)
        } else {
            format!("{}/{}", self.symbol, other.symbol)
        };
        Unit {
            symbol,
            scale: self.scale / other.scale,
            dims,
        }
    }

    /// Multiplicative factor taking a magnitude in `self` to a magnitude in `target`.
    pub fn factor_to(&self, target: &Unit) -> AppResult<f64> {
        if !self.is_compatible(target) {
            return Err(LabError::UnitMismatch {
                expected: target.symbol.clone(),
                found: self.symbol.clone(),
            });
        }
        Ok(self.scale / target.scale)
    }
}

/// Strip an SI prefix when the remainder is a known base symbol.
fn split_prefix(symbol: &str) -> (&str, f64) {
    if BASE_SYMBOLS.contains(&symbol) {
        return (symbol, 1.0);
    }
    for (prefix, scale) in PREFIXES {
        if let Some(rest) = symbol.strip_prefix(prefix) {
            if BASE_SYMBOLS.contains(&rest) {
                return (rest, *scale);
            }
        }
    }
    (symbol, 1.0)
}

impl PartialEq for Unit {
    /// Equal when compatible and identically scaled (`nm/s` == `nm*s^-1`).
    fn eq(&self, other: &Self) -> bool {
        self.dims == other.dims && (self.scale - other.scale).abs() <= f64::EPSILON * self.scale.abs()
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

impl FromStr for Unit {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Unit::parse(s)
    }
}

impl Serialize for Unit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.symbol)
    }
}

/// A magnitude tagged with its unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quantity {
    /// Numeric value
    pub magnitude: f64,
    /// Unit the magnitude is expressed in
    pub unit: Unit,
}

impl Quantity {
    /// Build a quantity from a magnitude and an already parsed unit.
    pub fn new(magnitude: f64, unit: Unit) -> Self {
        Self { magnitude, unit }
    }

    /// Convert to another unit of the same dimension.
    pub fn to(&self, target: &Unit) -> AppResult<Quantity> {
        let factor = self.unit.factor_to(target)?;
        Ok(Quantity::new(self.magnitude * factor, target.clone()))
    }

    /// Magnitude expressed in `target`.
    pub fn value_in(&self, target: &Unit) -> AppResult<f64> {
        Ok(self.to(target)?.magnitude)
    }

    /// Interpret a dimensionless quantity as being expressed in `unit`.
    ///
    /// Configuration files may give bare numbers where a unit is implied by
    /// context (limits, defaults). Quantities that already carry a unit are
    /// returned unchanged.
    pub fn or_unit(self, unit: &Unit) -> Quantity {
        if self.unit.is_dimensionless() {
            Quantity::new(self.magnitude, unit.clone())
        } else {
            self
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_dimensionless() {
            write!(f, "{}", self.magnitude)
        } else {
            write!(f, "{} {}", self.magnitude, self.unit)
        }
    }
}

impl FromStr for Quantity {
    type Err = LabError;

    /// Accepts `"10 nm/s"`, `"1491nm"`, `"1e-3 V"` and bare numbers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = numeric_prefix_len(s);
        let (number, unit) = s.split_at(split);
        let magnitude: f64 = number.parse().map_err(|_| {
            LabError::Configuration(format!("'{s}' is not a quantity (expected e.g. '10 nm')"))
        })?;
        Ok(Quantity::new(magnitude, Unit::parse(unit)?))
    }
}

fn numeric_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len() {
        let c = bytes[end];
        let is_exponent = (c == b'e' || c == b'E')
            && end > 0
            && bytes
                .get(end + 1)
                .is_some_and(|n| n.is_ascii_digit() || *n == b'-' || *n == b'+');
        let is_sign = (c == b'-' || c == b'+')
            && (end == 0 || bytes[end - 1] == b'e' || bytes[end - 1] == b'E');
        if c.is_ascii_digit() || c == b'.' || is_exponent || is_sign {
            end += 1;
        } else {
            break;
        }
    }
    end
}

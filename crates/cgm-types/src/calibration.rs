//! Factory and user-supplied calibration data.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Factory calibration coefficients read from FRAM.
///
/// `i3`/`i4` define the raw-to-glucose line, `i1`/`i2` the thermistor
/// scaling, and `i5`/`i6` a final slope/offset adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FactoryCalibration {
    pub i1: i32,
    pub i2: i32,
    pub i3: i32,
    pub i4: i32,
    pub i5: i32,
    pub i6: i32,
}

impl FactoryCalibration {
    /// Coefficients that map raw values to themselves (scaled by 100 / i4).
    #[must_use]
    pub fn identity() -> Self {
        Self {
            i1: 0,
            i2: 0,
            i3: 0,
            i4: 100,
            i5: 0,
            i6: 0,
        }
    }
}

/// A user-entered reference point: factory value `x` should read as `y`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CustomCalibrationPoint {
    pub id: Uuid,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    pub x: f64,
    pub y: f64,
}

impl CustomCalibrationPoint {
    #[must_use]
    pub fn new(timestamp: OffsetDateTime, x: f64, y: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            x,
            y,
        }
    }
}

/// Ordered set of custom calibration points.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CustomCalibration {
    pub points: Vec<CustomCalibrationPoint>,
}

impl CustomCalibration {
    pub fn push(&mut self, point: CustomCalibrationPoint) {
        self.points.push(point);
    }

    /// Remove a point by id. Returns whether a point was removed.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.points.len();
        self.points.retain(|p| p.id != id);
        self.points.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Least-squares line `(slope, intercept)` through the points.
    ///
    /// `None` with fewer than two points or when the fit is not finite
    /// (all points share the same `x`).
    #[must_use]
    pub fn regression(&self) -> Option<(f64, f64)> {
        if self.points.len() < 2 {
            return None;
        }

        let n = self.points.len() as f64;
        let (sx, sy, sxx, sxy) = self.points.iter().fold(
            (0.0, 0.0, 0.0, 0.0),
            |(sx, sy, sxx, sxy), p| (sx + p.x, sy + p.y, sxx + p.x * p.x, sxy + p.x * p.y),
        );

        let slope = (n * sxy - sx * sy) / (n * sxx - sx * sx);
        let intercept = (sy - slope * sx) / n;

        (slope.is_finite() && intercept.is_finite()).then_some((slope, intercept))
    }

    /// Apply the fitted line to a factory value, or return it unchanged
    /// when no usable fit exists.
    #[must_use]
    pub fn apply(&self, value: f64) -> f64 {
        match self.regression() {
            Some((slope, intercept)) => slope * value + intercept,
            None => value,
        }
    }
}

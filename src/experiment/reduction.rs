//! Resistance reduction strategies.
//!
//! A reduction turns the raw readings of one excitation step into a single
//! resistance value. Each strategy declares which source polarities it needs
//! per reading; the acquisition loop drives those polarities in order and
//! hands the collected [`PolarityReading`]s back for reduction.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A single reading at one polarity of an excitation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolarityReading {
    /// Commanded source value, including its sign.
    pub commanded: f64,
    /// Measured response (usually voltage).
    pub response: f64,
    /// Source value reported by the instrument, if it reports one.
    pub sensed_excitation: Option<f64>,
}

impl PolarityReading {
    /// The excitation to divide by: sensed if available, else commanded.
    pub fn excitation(&self) -> f64 {
        self.sensed_excitation.unwrap_or(self.commanded)
    }
}

/// Output of one reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reduced {
    /// Offset-corrected response for the step.
    pub response: f64,
    /// Mean resistance over all readings.
    pub resistance: f64,
    /// Relative standard deviation of the per-reading resistances.
    pub spread: f64,
}

/// Turns grouped readings into a resistance.
pub trait Reduction: Send + Sync + Debug {
    /// Multipliers applied to the excitation value for each reading.
    fn polarities(&self) -> &[f64];

    /// Resistance of one reading group (one entry per polarity).
    fn resistance(&self, group: &[PolarityReading]) -> f64;

    /// Response of one reading group.
    fn response(&self, group: &[PolarityReading]) -> f64;

    /// Reduces all groups of one excitation step.
    fn reduce(&self, groups: &[Vec<PolarityReading>]) -> Reduced {
        let resistances: Vec<f64> = groups.iter().map(|g| self.resistance(g)).collect();
        let responses: Vec<f64> = groups.iter().map(|g| self.response(g)).collect();
        let resistance = mean(&resistances);
        Reduced {
            response: mean(&responses),
            resistance,
            spread: relative_spread(&resistances, resistance),
        }
    }
}

/// Four-wire measurement: R = V / I.
#[derive(Debug, Clone, Default)]
pub struct FourPoint;

impl Reduction for FourPoint {
    fn polarities(&self) -> &[f64] {
        &[1.0]
    }

    fn resistance(&self, group: &[PolarityReading]) -> f64 {
        mean(&group.iter().map(|r| r.response / r.excitation()).collect::<Vec<_>>())
    }

    fn response(&self, group: &[PolarityReading]) -> f64 {
        mean(&group.iter().map(|r| r.response).collect::<Vec<_>>())
    }
}

/// Two-wire measurement with a known lead resistance subtracted.
#[derive(Debug, Clone, Default)]
pub struct TwoPoint {
    pub lead_resistance: f64,
}

impl Reduction for TwoPoint {
    fn polarities(&self) -> &[f64] {
        &[1.0]
    }

    fn resistance(&self, group: &[PolarityReading]) -> f64 {
        FourPoint.resistance(group) - self.lead_resistance
    }

    fn response(&self, group: &[PolarityReading]) -> f64 {
        FourPoint.response(group)
    }
}

/// Current reversal. Each reading is a `+I`/`-I` pair; thermoelectric
/// offsets appear with the same sign at both polarities and cancel.
#[derive(Debug, Clone, Default)]
pub struct Delta;

impl Reduction for Delta {
    fn polarities(&self) -> &[f64] {
        &[1.0, -1.0]
    }

    fn resistance(&self, group: &[PolarityReading]) -> f64 {
        match group {
            [pos, neg] => 0.5 * (pos.response / pos.excitation() + neg.response / neg.excitation()),
            _ => FourPoint.resistance(group),
        }
    }

    fn response(&self, group: &[PolarityReading]) -> f64 {
        match group {
            [pos, neg] => 0.5 * (pos.response - neg.response),
            _ => FourPoint.response(group),
        }
    }
}

/// Serializable choice of reduction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ReductionMethod {
    #[default]
    FourPoint,
    TwoPoint {
        #[serde(default)]
        lead_resistance: f64,
    },
    Delta,
}

impl ReductionMethod {
    pub fn build(&self) -> Box<dyn Reduction> {
        match *self {
            ReductionMethod::FourPoint => Box::new(FourPoint),
            ReductionMethod::TwoPoint { lead_resistance } => Box::new(TwoPoint { lead_resistance }),
            ReductionMethod::Delta => Box::new(Delta),
        }
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation divided by |mean|. Zero for a single value.
pub(crate) fn relative_spread(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
        / (values.len() - 1) as f64;
    let std = variance.sqrt();
    if mean == 0.0 {
        if std == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        std / mean.abs()
    }
}

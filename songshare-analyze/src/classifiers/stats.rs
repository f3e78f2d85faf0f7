//! Robust statistics shared by the derived classifiers

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Scale factor turning a median absolute deviation into a normal-consistent spread
const MAD_SCALE: f64 = 1.4826;

/// Robust center/spread estimator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RobustEstimator {
    /// Median center, 1.4826 x median absolute deviation spread
    Mad,
    /// Mean and standard deviation after discarding `fraction` from each tail
    Trimmed { fraction: f64 },
}

impl Default for RobustEstimator {
    fn default() -> Self {
        RobustEstimator::Mad
    }
}

impl RobustEstimator {
    /// Robust location of `values`
    pub fn center(&self, values: &[f64]) -> Option<f64> {
        match self {
            RobustEstimator::Mad => median(values),
            RobustEstimator::Trimmed { fraction } => mean(&trimmed(values, *fraction)),
        }
    }

    /// Robust spread of `values`
    pub fn spread(&self, values: &[f64]) -> Option<f64> {
        match self {
            RobustEstimator::Mad => {
                let center = median(values)?;
                let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
                median(&deviations).map(|mad| MAD_SCALE * mad)
            }
            RobustEstimator::Trimmed { fraction } => std_dev(&trimmed(values, *fraction)),
        }
    }

    /// Parameter snapshot for provenance
    pub fn describe(&self) -> serde_json::Value {
        match self {
            RobustEstimator::Mad => json!({ "method": "mad" }),
            RobustEstimator::Trimmed { fraction } => {
                json!({ "method": "trimmed", "fraction": fraction })
            }
        }
    }

    /// Check estimator parameters
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RobustEstimator::Mad => Ok(()),
            RobustEstimator::Trimmed { fraction } => {
                if fraction.is_finite() && (0.0..0.5).contains(fraction) {
                    Ok(())
                } else {
                    Err(format!("trim fraction {} must be within [0, 0.5)", fraction))
                }
            }
        }
    }
}

/// Median of `values`; None when empty
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Sorted copy with `fraction` of the values removed from each tail
///
/// Never trims to nothing: if trimming would empty the slice the full sorted
/// slice is returned.
pub fn trimmed(values: &[f64], fraction: f64) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let cut = (sorted.len() as f64 * fraction.max(0.0)).floor() as usize;
    if cut * 2 >= sorted.len() {
        return sorted;
    }
    sorted[cut..sorted.len() - cut].to_vec()
}

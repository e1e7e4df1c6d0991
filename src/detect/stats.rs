use crate::detect::DetectError;

/// Scales MAD to a consistent estimator of the standard deviation under a
/// normal distribution.
pub const MAD_SCALE: f64 = 1.4826;

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

/// Median; the mean of the two middle order statistics for even lengths.
pub fn median(values: &[f64]) -> Result<f64, DetectError> {
    if values.is_empty() {
        return Err(DetectError::EmptySeries);
    }
    let v = sorted(values);
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        Ok((v[mid - 1] + v[mid]) / 2.0)
    } else {
        Ok(v[mid])
    }
}

/// Median absolute deviation of `values` around `center`.
pub fn mad(values: &[f64], center: f64) -> Result<f64, DetectError> {
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}

/// Robust z-score: `|value - median| / (1.4826 * mad)`.
///
/// A zero MAD means the calibration window was constant, so any deviation at
/// all is infinitely unlikely.
pub fn robust_z(value: f64, median: f64, mad: f64) -> f64 {
    if mad > 0.0 {
        return (value - median).abs() / (MAD_SCALE * mad);
    }
    if value != median {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Population standard deviation. Diagnostics only, never a detection input.
pub fn stddev(values: &[f64]) -> Result<f64, DetectError> {
    if values.is_empty() {
        return Err(DetectError::EmptySeries);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n;
    Ok(variance.sqrt())
}

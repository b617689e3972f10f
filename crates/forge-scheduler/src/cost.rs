use forge_common::{CostBreakdown, CostEstimate};

use crate::error::{Result, SchedulerError};

/// Platform fee charged on top of raw GPU cost.
pub const PLATFORM_OVERHEAD: f64 = 0.15;

/// Cost of running `gpu_count` GPUs for `hours` at `rate_per_gpu_hour`.
///
/// Every field is rounded to cents from the unrounded figures, so `total` may
/// differ from `gpu_cost + platform_overhead` by a cent.
pub fn estimate(gpu_count: u32, hours: f64, rate_per_gpu_hour: f64) -> CostEstimate {
    let gpu_cost = f64::from(gpu_count) * hours * rate_per_gpu_hour;
    let overhead = gpu_cost * PLATFORM_OVERHEAD;

    CostEstimate {
        gpu_cost: round2(gpu_cost),
        platform_overhead: round2(overhead),
        total: round2(gpu_cost + overhead),
        breakdown: CostBreakdown {
            gpu_count,
            hours,
            rate_per_gpu_hour,
        },
    }
}

/// Boundary check for externally supplied estimate inputs.
pub fn validate(hours: f64, rate_per_gpu_hour: f64) -> Result<()> {
    if !hours.is_finite() || hours < 0.0 {
        return Err(SchedulerError::InvalidRequest(format!(
            "hours must be a non-negative number, got {hours}"
        )));
    }
    if !rate_per_gpu_hour.is_finite() || rate_per_gpu_hour < 0.0 {
        return Err(SchedulerError::InvalidRequest(format!(
            "rate must be a non-negative number, got {rate_per_gpu_hour}"
        )));
    }
    Ok(())
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

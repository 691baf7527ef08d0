//! Statistical outlier marking between solver restarts.
//!
//! A feature (one board corner, both coordinates) is an outlier when its
//! residual sits more than 3 sigma off the weighted mean of all live,
//! ROI-inside corner residuals. The threshold variance is the worse of the
//! data's own variance and the expected observation noise: a very good solve
//! must not start rejecting points at its own (tiny) noise floor, and a poor
//! solve must not hide model errors behind a huge one.
//!
//! Outliers never unmark. Point observations are never marked.

use crate::observations::{roi_weight, BoardObservation, RegionOfInterest};

const SIGMA_CUTOFF: f64 = 3.0;

/// Mark new outliers based on the current residuals. Returns whether
/// anything new was marked, and the total number of marked features.
pub(crate) fn mark_outliers(
    outliers: &mut [bool],
    observations_board: &[BoardObservation],
    roi: Option<&[RegionOfInterest]>,
    x_measurements: &[f64],
    expected_pixel_stdev: f64,
) -> (bool, usize) {
    // pass 1: weighted mean over the pooled x and y residual components
    let mut sum_mean = 0.0;
    let mut sum_weight = 0.0;
    let mut i_feature = 0;
    for obs in observations_board {
        for corner in &obs.corners {
            let weight_roi = roi_weight(roi, obs.i_camera, corner.x, corner.y);
            if !outliers[i_feature] && weight_roi == 1.0 {
                let weight = weight_roi * corner.weight;
                sum_mean += weight
                    * (x_measurements[2 * i_feature] + x_measurements[2 * i_feature + 1]);
                sum_weight += weight;
            }
            i_feature += 1;
        }
    }
    let mean = sum_mean / (2.0 * sum_weight);

    // pass 2: weighted variance
    let mut var = 0.0;
    let mut i_feature = 0;
    for obs in observations_board {
        for corner in &obs.corners {
            let weight_roi = roi_weight(roi, obs.i_camera, corner.x, corner.y);
            if !outliers[i_feature] && weight_roi == 1.0 {
                let weight = weight_roi * corner.weight;
                let dx = x_measurements[2 * i_feature] - mean;
                let dy = x_measurements[2 * i_feature + 1] - mean;
                var += weight * (dx * dx + dy * dy);
            }
            i_feature += 1;
        }
    }
    var /= 2.0 * sum_weight;
    if var < expected_pixel_stdev * expected_pixel_stdev {
        var = expected_pixel_stdev * expected_pixel_stdev;
    }

    // pass 3: mark
    let cutoff = SIGMA_CUTOFF * SIGMA_CUTOFF * var;
    let mut marked_any = false;
    let mut i_feature = 0;
    for obs in observations_board {
        for corner in &obs.corners {
            let weight_roi = roi_weight(roi, obs.i_camera, corner.x, corner.y);
            if !outliers[i_feature] && weight_roi == 1.0 {
                let dx = x_measurements[2 * i_feature] - mean;
                let dy = x_measurements[2 * i_feature + 1] - mean;
                if dx * dx > cutoff || dy * dy > cutoff {
                    outliers[i_feature] = true;
                    marked_any = true;
                }
            }
            i_feature += 1;
        }
    }

    (marked_any, outliers.iter().filter(|&&m| m).count())
}

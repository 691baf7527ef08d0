//! Observation types and calibration-object geometry.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Residuals of corners projecting outside the region of interest are
/// attenuated to this weight. Not zero: fully dead residuals could leave the
/// problem indeterminate.
pub const ROI_OUTSIDE_WEIGHT: f64 = 1e-3;

/// One detected chessboard corner: pixel coordinates plus the detector's
/// confidence weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerObservation {
    pub x: f64,
    pub y: f64,
    pub weight: f64,
}

/// One camera's view of the calibration object in one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardObservation {
    pub i_camera: usize,
    pub i_frame: usize,
    /// Row-major `width_n * width_n` corners.
    pub corners: Vec<CornerObservation>,
    /// Keep the measurement rows but zero the residuals. The Jacobian still
    /// touches the frame block so the Hessian stays full-rank.
    pub skip: bool,
}

/// One camera's view of an isolated tracked point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PointObservation {
    pub i_camera: usize,
    pub i_point: usize,
    pub x: f64,
    pub y: f64,
    pub weight: f64,
    /// Known camera-to-point distance. A positive value adds one range
    /// residual after the two pixel residuals.
    pub dist: Option<f64>,
    pub skip: bool,
}

impl PointObservation {
    pub fn has_range(&self) -> bool {
        matches!(self.dist, Some(d) if d > 0.0)
    }
}

/// Ellipse-like per-camera region of interest over the imager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub cx: f64,
    pub cy: f64,
    pub rx: f64,
    pub ry: f64,
}

impl RegionOfInterest {
    pub fn weight(&self, x: f64, y: f64) -> f64 {
        let dx = (x - self.cx) / self.rx;
        let dy = (y - self.cy) / self.ry;
        if dx * dx + dy * dy < 1.0 {
            1.0
        } else {
            ROI_OUTSIDE_WEIGHT
        }
    }
}

pub(crate) fn roi_weight(
    roi: Option<&[RegionOfInterest]>,
    i_camera: usize,
    x: f64,
    y: f64,
) -> f64 {
    match roi {
        Some(roi) => roi[i_camera].weight(x, y),
        None => 1.0,
    }
}

/// Reference-frame position of board corner (ix, iy) and the gradient of its
/// z displacement with respect to the warp parameters.
///
/// The warp is an additive parabolic flex along each board axis, with the
/// parameter giving the deflection at the center: with the ends at 0 and
/// W-1, d = 4 k (i/(W-1)) (1 - i/(W-1)).
pub(crate) fn board_point(
    ix: usize,
    iy: usize,
    spacing: f64,
    width_n: usize,
    warp: Option<[f64; 2]>,
) -> (Vector3<f64>, [f64; 2]) {
    let r = 1.0 / (width_n - 1) as f64;
    let xr = ix as f64 * r;
    let yr = iy as f64 * r;
    let dx = 4.0 * xr * (1.0 - xr);
    let dy = 4.0 * yr * (1.0 - yr);
    let z = match warp {
        Some(w) => w[0] * dx + w[1] * dy,
        None => 0.0,
    };
    (
        Vector3::new(ix as f64 * spacing, iy as f64 * spacing, z),
        [dx, dy],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn warp_deflection_vanishes_at_the_edges_and_peaks_at_the_center() {
        let w = 10;
        let (p, _) = board_point(0, 0, 1.0, w, Some([0.01, 0.02]));
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-15);
        let (p, _) = board_point(9, 9, 1.0, w, Some([0.01, 0.02]));
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-12);

        // an even grid has no exact center sample; 4 k x (1 - x) peaks at k
        let (_, d) = board_point(4, 4, 1.0, 9, Some([0.01, 0.02]));
        assert_relative_eq!(d[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(d[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn roi_weight_attenuates_but_does_not_kill() {
        let roi = RegionOfInterest { cx: 500.0, cy: 400.0, rx: 300.0, ry: 200.0 };
        assert_eq!(roi.weight(500.0, 400.0), 1.0);
        assert_eq!(roi.weight(900.0, 400.0), ROI_OUTSIDE_WEIGHT);
        assert!(roi.weight(900.0, 400.0) > 0.0);
    }
}

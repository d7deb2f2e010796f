//! Calibration from device camera space to screen space.
//!
//! Two transform families:
//! - **Homography** (preferred): 3x3 projective map fitted by DLT least
//!   squares over all point pairs, with a deterministic RANSAC pass when
//!   more than four points are available. Accuracy is reported as the mean
//!   reprojection error over all points.
//! - **Linear** (fallback): independent per-axis scale/offset derived from
//!   per-axis min/max; a degenerate axis collapses to identity for that
//!   axis.
//!
//! A computed homography always carries linear coefficients fitted from the
//! same points so the per-sample degenerate-divisor fallback has a target.
//! All fitting runs in f64; there is no linear-algebra dependency.
use crate::error::CalibrationError;
use gazed_config::{CalibrationDoc, CalibrationPointDoc};

/// Reprojection threshold (px) for RANSAC inlier classification.
const RANSAC_REPROJ_PX: f64 = 5.0;
/// Homogeneous divisor magnitude below which a sample falls back to linear.
const DEGENERATE_W: f64 = 1e-8;
/// Cap on the deterministic 4-subset enumeration.
const RANSAC_MAX_SUBSETS: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct CalibrationPoint {
    pub index: u32,
    pub screen_x: f64,
    pub screen_y: f64,
    pub device_x: f64,
    pub device_y: f64,
    pub confidence: f64,
    pub ts_ms: u64,
}

/// Per-axis scale/offset: screen = scale * device + offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearCoeffs {
    pub scale_x: f64,
    pub scale_y: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl LinearCoeffs {
    pub fn identity() -> Self {
        Self {
            scale_x: 1.0,
            scale_y: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }

    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.scale_x * x + self.offset_x,
            self.scale_y * y + self.offset_y,
        )
    }
}

#[derive(Debug, Clone)]
pub enum TransformMethod {
    Linear(LinearCoeffs),
    Homography {
        /// Row-major, h[2][2] normalized to 1.
        h: [[f64; 3]; 3],
        /// Per-sample fallback when the homogeneous divisor degenerates.
        fallback: LinearCoeffs,
    },
}

/// A computed device→screen transform. Written once per computation and
/// atomically swapped into session state.
#[derive(Debug, Clone)]
pub struct CalibrationTransform {
    pub method: TransformMethod,
    pub accuracy_px: f64,
    pub points_used: usize,
    pub screen_w: u32,
    pub screen_h: u32,
    pub calibrated: bool,
    pub fallback_reason: Option<&'static str>,
}

impl CalibrationTransform {
    /// Uncalibrated passthrough: screen := device, clamped to bounds.
    pub fn identity(screen_w: u32, screen_h: u32) -> Self {
        Self {
            method: TransformMethod::Linear(LinearCoeffs::identity()),
            accuracy_px: 0.0,
            points_used: 0,
            screen_w,
            screen_h,
            calibrated: false,
            fallback_reason: None,
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self.method {
            TransformMethod::Linear(_) => "linear",
            TransformMethod::Homography { .. } => "homography",
        }
    }

    /// Map device coordinates to screen coordinates, clamped to bounds.
    pub fn apply(&self, device_x: f64, device_y: f64) -> (f64, f64) {
        let (sx, sy) = match &self.method {
            TransformMethod::Linear(c) => c.apply(device_x, device_y),
            TransformMethod::Homography { h, fallback } => {
                let w = h[2][0] * device_x + h[2][1] * device_y + h[2][2];
                if w.abs() < DEGENERATE_W {
                    tracing::warn!(
                        device_x,
                        device_y,
                        "degenerate homogeneous divisor, falling back to linear for this sample"
                    );
                    fallback.apply(device_x, device_y)
                } else {
                    (
                        (h[0][0] * device_x + h[0][1] * device_y + h[0][2]) / w,
                        (h[1][0] * device_x + h[1][1] * device_y + h[1][2]) / w,
                    )
                }
            }
        };
        (
            sx.clamp(0.0, f64::from(self.screen_w)),
            sy.clamp(0.0, f64::from(self.screen_h)),
        )
    }

    pub fn to_doc(&self, points: &[CalibrationPoint]) -> CalibrationDoc {
        let (homography, lin) = match &self.method {
            TransformMethod::Linear(c) => (None, *c),
            TransformMethod::Homography { h, fallback } => (Some(*h), *fallback),
        };
        CalibrationDoc {
            method: self.method_name().to_string(),
            homography,
            scale_x: lin.scale_x,
            scale_y: lin.scale_y,
            offset_x: lin.offset_x,
            offset_y: lin.offset_y,
            accuracy_px: self.accuracy_px,
            points_used: self.points_used,
            screen_width_px: self.screen_w,
            screen_height_px: self.screen_h,
            calibrated: self.calibrated,
            fallback_reason: self.fallback_reason.map(str::to_string),
            points: points
                .iter()
                .map(|p| CalibrationPointDoc {
                    index: p.index,
                    screen_x: p.screen_x,
                    screen_y: p.screen_y,
                    device_x: p.device_x,
                    device_y: p.device_y,
                    confidence: p.confidence,
                    ts_ms: p.ts_ms,
                })
                .collect(),
            created_at_ms: crate::util::wall_ms(),
        }
    }

    pub fn from_doc(doc: &CalibrationDoc) -> Self {
        let lin = LinearCoeffs {
            scale_x: doc.scale_x,
            scale_y: doc.scale_y,
            offset_x: doc.offset_x,
            offset_y: doc.offset_y,
        };
        let method = match doc.homography {
            Some(h) if doc.method == "homography" => TransformMethod::Homography { h, fallback: lin },
            _ => TransformMethod::Linear(lin),
        };
        Self {
            method,
            accuracy_px: doc.accuracy_px,
            points_used: doc.points_used,
            screen_w: doc.screen_width_px,
            screen_h: doc.screen_height_px,
            calibrated: doc.calibrated,
            fallback_reason: None,
        }
    }
}

/// Calibration lifecycle: Idle → Collecting → Computing → Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibratorState {
    #[default]
    Idle,
    Collecting,
    Computing,
    Ready,
}

impl CalibratorState {
    pub fn as_str(self) -> &'static str {
        match self {
            CalibratorState::Idle => "idle",
            CalibratorState::Collecting => "collecting",
            CalibratorState::Computing => "computing",
            CalibratorState::Ready => "ready",
        }
    }
}

/// Collects point pairs and computes the transform. Points are mutable
/// during collection (duplicate indices overwrite) and frozen on compute.
#[derive(Debug, Default)]
pub struct Calibrator {
    state: CalibratorState,
    points: Vec<CalibrationPoint>,
}

impl Calibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CalibratorState {
        self.state
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    /// Clear points and start collecting.
    pub fn begin(&mut self) {
        self.points.clear();
        self.state = CalibratorState::Collecting;
    }

    /// Record one point pair. A duplicate target index overwrites the
    /// earlier capture for that target.
    pub fn capture(&mut self, point: CalibrationPoint) -> Result<(), CalibrationError> {
        if self.state() != CalibratorState::Collecting {
            return Err(CalibrationError::NotCollecting);
        }
        if let Some(existing) = self.points.iter_mut().find(|p| p.index == point.index) {
            *existing = point;
        } else {
            self.points.push(point);
        }
        Ok(())
    }

    /// Freeze the collected points and compute a transform. On failure the
    /// caller keeps its existing transform; the collected points survive so
    /// the client can capture more and retry.
    pub fn compute(
        &mut self,
        prefer_homography: bool,
        screen_w: u32,
        screen_h: u32,
    ) -> Result<CalibrationTransform, CalibrationError> {
        if self.points.len() < 4 {
            return Err(CalibrationError::InsufficientPoints {
                got: self.points.len(),
            });
        }
        self.state = CalibratorState::Computing;

        let (linear, linear_accuracy) = fit_linear(&self.points);
        let transform = if prefer_homography {
            match fit_homography(&self.points) {
                Ok((h, accuracy)) => CalibrationTransform {
                    method: TransformMethod::Homography {
                        h,
                        fallback: linear,
                    },
                    accuracy_px: accuracy,
                    points_used: self.points.len(),
                    screen_w,
                    screen_h,
                    calibrated: true,
                    fallback_reason: None,
                },
                Err(e) => {
                    let reason = match e {
                        CalibrationError::SingularSystem => "singular_system",
                        CalibrationError::RansacRejection => "ransac_rejection",
                        _ => "homography_failed",
                    };
                    tracing::warn!(error = %e, "homography failed, falling back to linear");
                    CalibrationTransform {
                        method: TransformMethod::Linear(linear),
                        accuracy_px: linear_accuracy,
                        points_used: self.points.len(),
                        screen_w,
                        screen_h,
                        calibrated: true,
                        fallback_reason: Some(reason),
                    }
                }
            }
        } else {
            CalibrationTransform {
                method: TransformMethod::Linear(linear),
                accuracy_px: linear_accuracy,
                points_used: self.points.len(),
                screen_w,
                screen_h,
                calibrated: true,
                fallback_reason: None,
            }
        };

        self.state = CalibratorState::Ready;
        tracing::info!(
            method = transform.method_name(),
            accuracy_px = transform.accuracy_px,
            points = transform.points_used,
            "calibration computed"
        );
        Ok(transform)
    }
}

/// Independent per-axis scale/offset from per-axis min/max, offset anchored
/// at the means. An axis where every device value is identical collapses to
/// identity for that axis.
fn fit_linear(points: &[CalibrationPoint]) -> (LinearCoeffs, f64) {
    let n = points.len() as f64;

    let axis = |dev: &dyn Fn(&CalibrationPoint) -> f64,
                scr: &dyn Fn(&CalibrationPoint) -> f64|
     -> (f64, f64) {
        let (mut dmin, mut dmax) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut smin, mut smax) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut dsum, mut ssum) = (0.0, 0.0);
        for p in points {
            let d = dev(p);
            let s = scr(p);
            dmin = dmin.min(d);
            dmax = dmax.max(d);
            smin = smin.min(s);
            smax = smax.max(s);
            dsum += d;
            ssum += s;
        }
        let spread = dmax - dmin;
        if spread.abs() < f64::EPSILON || !spread.is_finite() {
            (1.0, 0.0)
        } else {
            let scale = (smax - smin) / spread;
            let offset = ssum / n - scale * dsum / n;
            (scale, offset)
        }
    };

    let (scale_x, offset_x) = axis(&|p| p.device_x, &|p| p.screen_x);
    let (scale_y, offset_y) = axis(&|p| p.device_y, &|p| p.screen_y);
    let coeffs = LinearCoeffs {
        scale_x,
        scale_y,
        offset_x,
        offset_y,
    };

    let mut err_sum = 0.0;
    for p in points {
        let (px, py) = coeffs.apply(p.device_x, p.device_y);
        err_sum += ((px - p.screen_x).powi(2) + (py - p.screen_y).powi(2)).sqrt();
    }
    (coeffs, err_sum / n)
}

/// DLT least squares with h33 = 1: each pair contributes two rows of
///   h11 x + h12 y + h13 - u h31 x - u h32 y = u
///   h21 x + h22 y + h23 - v h31 x - v h32 y = v
/// solved via the 8x8 normal equations. With more than four points a
/// deterministic RANSAC pass over 4-point subsets rejects outliers first.
/// Returns the matrix and the mean reprojection error over ALL points.
fn fit_homography(points: &[CalibrationPoint]) -> Result<([[f64; 3]; 3], f64), CalibrationError> {
    let h = if points.len() == 4 {
        solve_dlt(points)?
    } else {
        ransac_homography(points)?
    };
    Ok((h, mean_reprojection_error(&h, points)))
}

fn solve_dlt(points: &[CalibrationPoint]) -> Result<[[f64; 3]; 3], CalibrationError> {
    // Normal equations: m = AᵀA (8x8), rhs = Aᵀb.
    let mut m = [[0.0f64; 8]; 8];
    let mut rhs = [0.0f64; 8];
    for p in points {
        let (x, y, u, v) = (p.device_x, p.device_y, p.screen_x, p.screen_y);
        let rows: [([f64; 8], f64); 2] = [
            ([x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y], u),
            ([0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y], v),
        ];
        for (row, b) in rows {
            for i in 0..8 {
                for j in 0..8 {
                    m[i][j] += row[i] * row[j];
                }
                rhs[i] += row[i] * b;
            }
        }
    }

    let h = solve_8x8(m, rhs).ok_or(CalibrationError::SingularSystem)?;
    Ok([
        [h[0], h[1], h[2]],
        [h[3], h[4], h[5]],
        [h[6], h[7], 1.0],
    ])
}

/// Gaussian elimination with partial pivoting. Returns None when a pivot
/// degenerates (singular system).
fn solve_8x8(mut m: [[f64; 8]; 8], mut b: [f64; 8]) -> Option<[f64; 8]> {
    const N: usize = 8;
    for col in 0..N {
        let mut pivot = col;
        for row in (col + 1)..N {
            if m[row][col].abs() > m[pivot][col].abs() {
                pivot = row;
            }
        }
        if m[pivot][col].abs() < 1e-10 {
            return None;
        }
        m.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..N {
            let factor = m[row][col] / m[col][col];
            for k in col..N {
                m[row][k] -= factor * m[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; N];
    for col in (0..N).rev() {
        let mut acc = b[col];
        for k in (col + 1)..N {
            acc -= m[col][k] * x[k];
        }
        x[col] = acc / m[col][col];
        if !x[col].is_finite() {
            return None;
        }
    }
    Some(x)
}

fn reprojection_error(h: &[[f64; 3]; 3], p: &CalibrationPoint) -> f64 {
    let w = h[2][0] * p.device_x + h[2][1] * p.device_y + h[2][2];
    if w.abs() < DEGENERATE_W {
        return f64::INFINITY;
    }
    let u = (h[0][0] * p.device_x + h[0][1] * p.device_y + h[0][2]) / w;
    let v = (h[1][0] * p.device_x + h[1][1] * p.device_y + h[1][2]) / w;
    ((u - p.screen_x).powi(2) + (v - p.screen_y).powi(2)).sqrt()
}

fn mean_reprojection_error(h: &[[f64; 3]; 3], points: &[CalibrationPoint]) -> f64 {
    let sum: f64 = points.iter().map(|p| reprojection_error(h, p)).sum();
    sum / points.len() as f64
}

/// Deterministic RANSAC: enumerate 4-point subsets in index order (capped),
/// fit each exactly, score inliers by reprojection error, keep the best
/// consensus and refit on its inliers. Requiring a consensus of more than
/// half the points matches the engine's fallback contract.
fn ransac_homography(points: &[CalibrationPoint]) -> Result<[[f64; 3]; 3], CalibrationError> {
    let n = points.len();
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut subsets = 0usize;

    'outer: for a in 0..n {
        for b in (a + 1)..n {
            for c in (b + 1)..n {
                for d in (c + 1)..n {
                    if subsets >= RANSAC_MAX_SUBSETS {
                        break 'outer;
                    }
                    subsets += 1;
                    let subset = [points[a], points[b], points[c], points[d]];
                    let Ok(h) = solve_dlt(&subset) else {
                        continue;
                    };
                    let inliers: Vec<usize> = (0..n)
                        .filter(|&i| reprojection_error(&h, &points[i]) <= RANSAC_REPROJ_PX)
                        .collect();
                    if inliers.len() > best_inliers.len() {
                        best_inliers = inliers;
                    }
                }
            }
        }
    }

    if best_inliers.len() * 2 < n {
        return Err(CalibrationError::RansacRejection);
    }
    let consensus: Vec<CalibrationPoint> = best_inliers.iter().map(|&i| points[i]).collect();
    solve_dlt(&consensus)
}

//! Loss-peak detection on a sampled curve.

use serde::{Deserialize, Serialize};

/// A local maximum of a sampled curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub index: usize,
    /// Abscissa of the maximum (the caller's `x`, usually `log10 ω`).
    pub position: f64,
    pub height: f64,
    /// Full width at half maximum in `x` units, when both flanks drop below half height.
    pub width: Option<f64>,
    /// Ratio of the shorter to the longer half-width (1 = symmetric).
    pub symmetry: Option<f64>,
    /// Height above the higher of the two valleys separating this maximum
    /// from taller ground (or the band edge) on either side.
    pub prominence: f64,
}

/// Interior local maxima of `y(x)` with `y ≥ min_height`, in ascending `x`.
///
/// End points are never reported: a maximum at the edge of the band is not a
/// resolved peak.
pub fn find_peaks(x: &[f64], y: &[f64], min_height: f64) -> Vec<Peak> {
    let n = x.len().min(y.len());
    if n < 3 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for i in 1..n - 1 {
        if !(y[i] > y[i - 1] && y[i] >= y[i + 1] && y[i] >= min_height) {
            continue;
        }
        let half = 0.5 * y[i];
        let left = crossing(x, y, i, half, Direction::Left);
        let right = crossing(x, y, i, half, Direction::Right);
        let (width, symmetry) = match (left, right) {
            (Some(l), Some(r)) => {
                let (a, b) = (x[i] - l, r - x[i]);
                let sym = if a.max(b) > 0.0 { a.min(b) / a.max(b) } else { 1.0 };
                (Some(r - l), Some(sym))
            }
            _ => (None, None),
        };
        out.push(Peak {
            index: i,
            position: x[i],
            height: y[i],
            width,
            symmetry,
            prominence: prominence(y, i),
        });
    }
    out
}

fn prominence(y: &[f64], i: usize) -> f64 {
    let mut left = y[i];
    for v in y[..i].iter().rev() {
        if *v > y[i] {
            break;
        }
        left = left.min(*v);
    }
    let mut right = y[i];
    for v in &y[i + 1..] {
        if *v > y[i] {
            break;
        }
        right = right.min(*v);
    }
    y[i] - left.max(right)
}

#[derive(Clone, Copy)]
enum Direction {
    Left,
    Right,
}

/// Linearly interpolated `x` where `y` first drops below `level` walking away from `i`.
fn crossing(x: &[f64], y: &[f64], i: usize, level: f64, dir: Direction) -> Option<f64> {
    let n = x.len().min(y.len());
    let mut j = i;
    loop {
        let next = match dir {
            Direction::Left => j.checked_sub(1)?,
            Direction::Right => {
                if j + 1 >= n {
                    return None;
                }
                j + 1
            }
        };
        if y[next] < level {
            let t = (y[j] - level) / (y[j] - y[next]);
            return Some(x[j] + t * (x[next] - x[j]));
        }
        j = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_peak_has_expected_width() {
        let x: Vec<f64> = (0..201).map(|i| -5.0 + 0.05 * i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| (-v * v / 2.0).exp()).collect();
        let peaks = find_peaks(&x, &y, 0.1);
        assert_eq!(peaks.len(), 1);
        let p = &peaks[0];
        assert!((p.position).abs() < 1e-9);
        // FWHM of a unit Gaussian is 2√(2 ln 2).
        assert!((p.width.unwrap() - 2.354_82).abs() < 1e-2);
        assert!(p.symmetry.unwrap() > 0.98);
    }

    #[test]
    fn edge_maxima_and_small_bumps_are_ignored() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y = [5.0, 4.0, 3.0, 3.2, 1.0];
        assert!(find_peaks(&x, &y, 3.5).is_empty());
        assert_eq!(find_peaks(&x, &y, 0.0).len(), 1);
    }

    #[test]
    fn prominence_separates_ripples_from_peaks() {
        let x: Vec<f64> = (0..9).map(|i| i as f64).collect();
        let y = [0.0, 1.0, 3.0, 2.9, 2.95, 1.0, 0.5, 2.0, 0.0];
        let peaks = find_peaks(&x, &y, 0.0);
        assert_eq!(peaks.len(), 3);
        assert!((peaks[0].prominence - 3.0).abs() < 1e-12);
        assert!((peaks[1].prominence - 0.05).abs() < 1e-12);
        assert!((peaks[2].prominence - 1.5).abs() < 1e-12);
    }
}

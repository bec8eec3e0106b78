//! Circular moves (G2/G3) broken into straight segments.
//!
//! [`ArcSegments`] is a lazy, restartable iterator over segment endpoints.
//! Stop early by dropping it; clone it to replay from the start. The last
//! point is always the commanded endpoint, never the angularly stepped one.

use std::f64::consts::TAU;

use thiserror::Error;

use crate::config::{ARC_MAX_SEGMENTS, ARC_RADIUS_MIN_MM, ARC_SEGMENT_LEN_MM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winding {
    Clockwise,
    CounterClockwise,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcError {
    #[error("arc radius below minimum")]
    RadiusTooSmall,
    #[error("no arc of that radius joins the endpoints")]
    NoSolution,
    #[error("arc endpoints coincide for an R-form arc")]
    DegenerateChord,
}

#[derive(Debug, Clone)]
pub struct ArcSegments {
    center: (f64, f64),
    end: (f64, f64),
    radius: f64,
    theta_start: f64,
    /// Signed angular step per segment.
    theta_step: f64,
    sweep: f64,
    count: usize,
    next: usize,
}

impl ArcSegments {
    /// Arc with the center given as an offset `(i, j)` from `start`.
    pub fn from_center(
        start: (f64, f64),
        end: (f64, f64),
        offset: (f64, f64),
        winding: Winding,
    ) -> Result<Self, ArcError> {
        Self::with_segment_len(start, end, offset, winding, ARC_SEGMENT_LEN_MM)
    }

    /// Arc through `start` and `end` with radius `r`. A negative `r` selects
    /// the arc longer than a half circle.
    pub fn from_radius(
        start: (f64, f64),
        end: (f64, f64),
        r: f64,
        winding: Winding,
    ) -> Result<Self, ArcError> {
        let abs_r = r.abs();
        if abs_r < ARC_RADIUS_MIN_MM {
            return Err(ArcError::RadiusTooSmall);
        }

        let mid = ((start.0 + end.0) * 0.5, (start.1 + end.1) * 0.5);
        let dx = end.0 - start.0;
        let dy = end.1 - start.1;
        let chord = dx.hypot(dy);
        let half_chord = chord * 0.5;
        if half_chord > abs_r {
            return Err(ArcError::NoSolution);
        }
        if chord < ARC_RADIUS_MIN_MM {
            return Err(ArcError::DegenerateChord);
        }

        let h = (abs_r * abs_r - half_chord * half_chord).sqrt();
        // unit perpendicular, left of the chord direction
        let perp = (-dy / chord, dx / chord);

        // Minor arc: center left of travel for CCW, right for CW.
        let mut use_left = winding == Winding::CounterClockwise;
        if r < 0.0 {
            use_left = !use_left;
        }
        let center = if use_left {
            (mid.0 + h * perp.0, mid.1 + h * perp.1)
        } else {
            (mid.0 - h * perp.0, mid.1 - h * perp.1)
        };

        Self::from_center(start, end, (center.0 - start.0, center.1 - start.1), winding)
    }

    pub fn with_segment_len(
        start: (f64, f64),
        end: (f64, f64),
        offset: (f64, f64),
        winding: Winding,
        segment_len: f64,
    ) -> Result<Self, ArcError> {
        let center = (start.0 + offset.0, start.1 + offset.1);
        let r_start = (start.0 - center.0).hypot(start.1 - center.1);
        let r_end = (end.0 - center.0).hypot(end.1 - center.1);
        // tolerate slightly inconsistent I/J from the program
        let radius = 0.5 * (r_start + r_end);
        if !(radius >= ARC_RADIUS_MIN_MM) {
            return Err(ArcError::RadiusTooSmall);
        }

        let theta_start = (start.1 - center.1).atan2(start.0 - center.0);
        let theta_end = (end.1 - center.1).atan2(end.0 - center.0);

        let mut sweep = match winding {
            Winding::Clockwise => theta_start - theta_end,
            Winding::CounterClockwise => theta_end - theta_start,
        };
        if sweep <= 0.0 {
            sweep += TAU;
        }
        if (end.0 - start.0).abs() < ARC_RADIUS_MIN_MM && (end.1 - start.1).abs() < ARC_RADIUS_MIN_MM {
            sweep = TAU;
        }

        let arc_length = radius * sweep;
        let count = if segment_len > 0.0 {
            ((arc_length / segment_len).ceil() as usize).clamp(1, ARC_MAX_SEGMENTS)
        } else {
            ARC_MAX_SEGMENTS
        };

        let mut theta_step = sweep / count as f64;
        if winding == Winding::Clockwise {
            theta_step = -theta_step;
        }

        Ok(Self {
            center,
            end,
            radius,
            theta_start,
            theta_step,
            sweep,
            count,
            next: 1,
        })
    }

    pub fn center(&self) -> (f64, f64) {
        self.center
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Total angular travel in radians, always in `(0, 2π]`.
    pub fn sweep(&self) -> f64 {
        self.sweep
    }

    pub fn segment_count(&self) -> usize {
        self.count
    }
}

impl Iterator for ArcSegments {
    type Item = (f64, f64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.count {
            return None;
        }
        let k = self.next;
        self.next += 1;
        if k == self.count {
            return Some(self.end);
        }
        let theta = self.theta_start + self.theta_step * k as f64;
        Some((
            self.center.0 + self.radius * theta.cos(),
            self.center.1 + self.radius * theta.sin(),
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.count + 1).saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for ArcSegments {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn approx_eq(a: f64, b: f64) {
        assert!(
            (a - b).abs() <= 1e-6,
            "expected {:.6}, got {:.6} (|diff|={:.6})",
            b,
            a,
            (a - b).abs()
        );
    }

    #[test]
    fn quarter_circle_cw_ends_exactly_on_target() {
        let arc = ArcSegments::from_center((10.0, 0.0), (0.0, 10.0), (-10.0, 0.0), Winding::Clockwise).unwrap();
        approx_eq(arc.radius(), 10.0);
        // CW from 0° to 90° goes the long way round.
        approx_eq(arc.sweep(), 1.5 * PI);
        let points: Vec<_> = arc.collect();
        assert_eq!(points.last().copied(), Some((0.0, 10.0)));
        for (x, y) in &points {
            approx_eq(x.hypot(*y), 10.0);
        }
    }

    #[test]
    fn ccw_quarter_takes_short_way() {
        let arc = ArcSegments::from_center((10.0, 0.0), (0.0, 10.0), (-10.0, 0.0), Winding::CounterClockwise)
            .unwrap();
        approx_eq(arc.sweep(), 0.5 * PI);
        let expected = (10.0 * 0.5 * PI / ARC_SEGMENT_LEN_MM).ceil() as usize;
        assert_eq!(arc.segment_count(), expected);
        assert_eq!(arc.len(), expected);
        // first point is a small CCW step from the start
        let first = arc.clone().next().unwrap();
        assert!(first.0 < 10.0 && first.1 > 0.0);
    }

    #[test]
    fn coincident_endpoints_make_a_full_circle() {
        let arc = ArcSegments::from_center((5.0, 0.0), (5.0, 0.0), (-5.0, 0.0), Winding::CounterClockwise).unwrap();
        approx_eq(arc.sweep(), 2.0 * PI);
        assert!(arc.segment_count() >= 1);
        assert_eq!(arc.last(), Some((5.0, 0.0)));
    }

    #[test]
    fn tiny_radius_is_rejected() {
        let err = ArcSegments::from_center((0.0, 0.0), (0.0, 0.0), (0.0, 0.0), Winding::Clockwise).unwrap_err();
        assert_eq!(err, ArcError::RadiusTooSmall);
    }

    #[test]
    fn segment_count_is_capped() {
        let arc = ArcSegments::from_center((0.0, 0.0), (0.0, 0.0), (1.0e6, 0.0), Winding::Clockwise).unwrap();
        assert_eq!(arc.segment_count(), ARC_MAX_SEGMENTS);
    }

    #[test]
    fn short_arc_still_has_one_segment() {
        let arc = ArcSegments::from_center((1.0, 0.0), (0.9999, 0.01), (-1.0, 0.0), Winding::CounterClockwise).unwrap();
        assert_eq!(arc.segment_count(), 1);
        assert_eq!(arc.collect::<Vec<_>>(), vec![(0.9999, 0.01)]);
    }

    #[test]
    fn radius_form_picks_minor_and_major_centers() {
        let minor = ArcSegments::from_radius((0.0, 0.0), (10.0, 0.0), 5.0, Winding::Clockwise).unwrap();
        approx_eq(minor.center().0, 5.0);
        approx_eq(minor.center().1, 0.0);
        approx_eq(minor.sweep(), PI);

        // R=10 across a 10mm chord: minor arc is 60°, major is 300°.
        let short = ArcSegments::from_radius((0.0, 0.0), (10.0, 0.0), 10.0, Winding::CounterClockwise).unwrap();
        approx_eq(short.sweep(), PI / 3.0);
        assert!(short.center().1 > 0.0);

        let long = ArcSegments::from_radius((0.0, 0.0), (10.0, 0.0), -10.0, Winding::CounterClockwise).unwrap();
        approx_eq(long.sweep(), 5.0 * PI / 3.0);
        assert!(long.center().1 < 0.0);
        assert_eq!(long.last(), Some((10.0, 0.0)));

        let cw = ArcSegments::from_radius((0.0, 0.0), (10.0, 0.0), 10.0, Winding::Clockwise).unwrap();
        approx_eq(cw.sweep(), PI / 3.0);
        assert!(cw.center().1 < 0.0);
    }

    #[test]
    fn radius_form_failures() {
        assert_eq!(
            ArcSegments::from_radius((0.0, 0.0), (10.0, 0.0), 4.0, Winding::Clockwise).unwrap_err(),
            ArcError::NoSolution
        );
        assert_eq!(
            ArcSegments::from_radius((1.0, 1.0), (1.0, 1.0), 4.0, Winding::Clockwise).unwrap_err(),
            ArcError::DegenerateChord
        );
        assert_eq!(
            ArcSegments::from_radius((0.0, 0.0), (1.0, 0.0), 0.0, Winding::Clockwise).unwrap_err(),
            ArcError::RadiusTooSmall
        );
    }

    #[test]
    fn iterator_is_restartable_and_stoppable() {
        let arc = ArcSegments::from_center((10.0, 0.0), (-10.0, 0.0), (-10.0, 0.0), Winding::CounterClockwise).unwrap();
        let first_three: Vec<_> = arc.clone().take(3).collect();
        let again: Vec<_> = arc.clone().take(3).collect();
        assert_eq!(first_three, again);
        assert_eq!(arc.count(), (10.0 * PI / ARC_SEGMENT_LEN_MM).ceil() as usize);
    }
}

use crate::FrameError;
use nalgebra::{Point2, Vector2};
use pianocal_core::piano;
use serde::{Deserialize, Serialize};

/// Step used by [`KeyboardCorners::nudge_black_key_length`].
pub const BLACK_KEY_LENGTH_STEP: f64 = 0.5;

/// Default grab radius, in pixels, for picking a corner to drag.
pub const DEFAULT_DRAG_RADIUS: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Self::TopLeft,
        Self::TopRight,
        Self::BottomLeft,
        Self::BottomRight,
    ];
}

/// The four marked corners of the playable key span plus the black-key
/// length in millimetres.
///
/// "Top" is the back edge of the keys (towards the fallboard), "bottom" the
/// key fronts. Every constructor and mutator keeps the quadrilateral simple
/// and the black-key length positive; a rejected edit leaves the value
/// unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyboardCorners {
    pub top_left: Point2<f64>,
    pub top_right: Point2<f64>,
    pub bottom_left: Point2<f64>,
    pub bottom_right: Point2<f64>,
    pub black_key_length: f64,
}

impl KeyboardCorners {
    pub fn new(
        top_left: Point2<f64>,
        top_right: Point2<f64>,
        bottom_left: Point2<f64>,
        bottom_right: Point2<f64>,
        black_key_length: f64,
    ) -> Result<Self, FrameError> {
        let corners = Self {
            top_left,
            top_right,
            bottom_left,
            bottom_right,
            black_key_length,
        };
        corners.validate()?;
        Ok(corners)
    }

    /// Corners in `[top-left, top-right, bottom-left, bottom-right]` order.
    pub fn from_array(points: [Point2<f64>; 4], black_key_length: f64) -> Result<Self, FrameError> {
        let [tl, tr, bl, br] = points;
        Self::new(tl, tr, bl, br, black_key_length)
    }

    /// Assign four clicks to corners: the two upper points (smaller `y`) are
    /// the top edge, each pair ordered left to right.
    pub fn from_unordered(points: [Point2<f64>; 4], black_key_length: f64) -> Result<Self, FrameError> {
        let mut by_y = points;
        by_y.sort_by(|a, b| a.y.total_cmp(&b.y));
        let mut top = [by_y[0], by_y[1]];
        let mut bottom = [by_y[2], by_y[3]];
        top.sort_by(|a, b| a.x.total_cmp(&b.x));
        bottom.sort_by(|a, b| a.x.total_cmp(&b.x));
        Self::new(top[0], top[1], bottom[0], bottom[1], black_key_length)
    }

    /// Corners with the standard black-key length.
    pub fn with_default_length(points: [Point2<f64>; 4]) -> Result<Self, FrameError> {
        Self::from_array(points, piano::DEFAULT_BLACK_KEY_LENGTH)
    }

    pub fn get(&self, corner: Corner) -> Point2<f64> {
        match corner {
            Corner::TopLeft => self.top_left,
            Corner::TopRight => self.top_right,
            Corner::BottomLeft => self.bottom_left,
            Corner::BottomRight => self.bottom_right,
        }
    }

    fn slot(&mut self, corner: Corner) -> &mut Point2<f64> {
        match corner {
            Corner::TopLeft => &mut self.top_left,
            Corner::TopRight => &mut self.top_right,
            Corner::BottomLeft => &mut self.bottom_left,
            Corner::BottomRight => &mut self.bottom_right,
        }
    }

    /// `[top-left, top-right, bottom-left, bottom-right]`.
    pub fn points(&self) -> [Point2<f64>; 4] {
        Corner::ALL.map(|c| self.get(c))
    }

    /// Boundary order (top-left, top-right, bottom-right, bottom-left).
    fn ring(&self) -> [Point2<f64>; 4] {
        [
            self.top_left,
            self.top_right,
            self.bottom_right,
            self.bottom_left,
        ]
    }

    /// Drag `corner` to `to`.
    pub fn move_corner(&mut self, corner: Corner, to: Point2<f64>) -> Result<(), FrameError> {
        let mut edited = *self;
        *edited.slot(corner) = to;
        edited.validate()?;
        *self = edited;
        Ok(())
    }

    /// Corner closest to `p` within `max_distance` pixels, if any.
    pub fn nearest_corner(&self, p: Point2<f64>, max_distance: f64) -> Option<Corner> {
        Corner::ALL
            .into_iter()
            .map(|c| (c, (self.get(c) - p).norm()))
            .filter(|(_, d)| *d <= max_distance)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(c, _)| c)
    }

    /// Change the black-key length by `steps` increments of
    /// [`BLACK_KEY_LENGTH_STEP`]; returns the new length.
    pub fn nudge_black_key_length(&mut self, steps: i32) -> Result<f64, FrameError> {
        let length = self.black_key_length + steps as f64 * BLACK_KEY_LENGTH_STEP;
        self.set_black_key_length(length)?;
        Ok(length)
    }

    pub fn set_black_key_length(&mut self, length: f64) -> Result<(), FrameError> {
        check_black_key_length(length)?;
        self.black_key_length = length;
        Ok(())
    }

    /// Reject collinear, self-intersecting and concave quadrilaterals.
    pub fn validate(&self) -> Result<(), FrameError> {
        check_black_key_length(self.black_key_length)?;
        check_simple_quad(&self.ring())
    }
}

fn check_black_key_length(length: f64) -> Result<(), FrameError> {
    if length.is_finite() && length > 0.0 {
        Ok(())
    } else {
        Err(FrameError::InvalidBlackKeyLength(length))
    }
}

#[inline]
fn cross(o: Point2<f64>, a: Point2<f64>, b: Point2<f64>) -> f64 {
    let (u, v): (Vector2<f64>, Vector2<f64>) = (a - o, b - o);
    u.x * v.y - u.y * v.x
}

/// `ring` lists the vertices in boundary order.
pub(crate) fn check_simple_quad(ring: &[Point2<f64>; 4]) -> Result<(), FrameError> {
    if ring.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(FrameError::degenerate("corner coordinates are not finite"));
    }
    let extent = ring
        .iter()
        .flat_map(|p| ring.iter().map(move |q| (*p - *q).norm()))
        .fold(0.0_f64, f64::max);
    if extent <= 0.0 {
        return Err(FrameError::degenerate("all corners coincide"));
    }
    let tolerance = 1e-9 * extent * extent;

    let turns = [(0, 1, 2), (1, 2, 3), (2, 3, 0), (3, 0, 1)]
        .map(|(i, j, k)| cross(ring[i], ring[j], ring[k]));
    if turns.iter().any(|t| t.abs() <= tolerance) {
        return Err(FrameError::degenerate("three corners are collinear"));
    }

    // Opposite edges must not cross: (0,1) vs (2,3) and (1,2) vs (3,0).
    for (e, f) in [((0, 1), (2, 3)), ((1, 2), (3, 0))] {
        let (p1, p2) = (ring[e.0], ring[e.1]);
        let (q1, q2) = (ring[f.0], ring[f.1]);
        let d1 = cross(p1, p2, q1);
        let d2 = cross(p1, p2, q2);
        let d3 = cross(q1, q2, p1);
        let d4 = cross(q1, q2, p2);
        if d1.signum() != d2.signum() && d3.signum() != d4.signum() {
            return Err(FrameError::degenerate("edges intersect (corners out of order)"));
        }
    }

    // A reflex corner puts the homography's horizon inside the key bed.
    if turns.iter().any(|t| t.signum() != turns[0].signum()) {
        return Err(FrameError::degenerate(
            "corners do not form a convex quadrilateral",
        ));
    }
    Ok(())
}

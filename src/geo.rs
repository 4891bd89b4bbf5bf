//! Geographic math: haversine distance, polyline measures, and point
//! projection onto a route polyline.
//!
//! Projection works in a local equirectangular plane around the fix, which
//! is accurate to well under a meter at the cross-track distances the
//! snapper cares about (tens of meters).

use crate::types::Coordinate;

/// Mean Earth radius (m).
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates (m).
pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Cumulative distances (m) along a polyline; `out[i]` is the distance from
/// the first vertex to vertex `i`. Empty or single-point polylines yield
/// all-zero entries.
pub fn cumulative_distances_m(polyline: &[Coordinate]) -> Vec<f64> {
    let mut cum = Vec::with_capacity(polyline.len());
    let mut total = 0.0;
    for (i, point) in polyline.iter().enumerate() {
        if i > 0 {
            total += haversine_m(polyline[i - 1], *point);
        }
        cum.push(total);
    }
    cum
}

/// Total length of a polyline (m).
pub fn polyline_length_m(polyline: &[Coordinate]) -> f64 {
    cumulative_distances_m(polyline).last().copied().unwrap_or(0.0)
}

/// Result of projecting a point onto a polyline.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    /// Nearest point on the polyline.
    pub point: Coordinate,
    /// Perpendicular distance from the input to the polyline (m).
    pub cross_track_m: f64,
    /// Fractional position along the polyline by distance, 0..1.
    pub fraction: f64,
    /// Distance from the polyline start to the projected point (m).
    pub along_m: f64,
}

/// Project `fix` onto the nearest segment of `polyline`.
///
/// Returns `None` for degenerate polylines (fewer than two vertices).
pub fn project_onto_polyline(polyline: &[Coordinate], fix: Coordinate) -> Option<Projection> {
    if polyline.len() < 2 {
        return None;
    }

    let cum = cumulative_distances_m(polyline);
    let total = *cum.last()?;
    if total <= 0.0 {
        return None;
    }

    // Local planar frame centred on the fix; lon is scaled by cos(lat).
    let lat0 = fix.lat.to_radians();
    let meters_per_deg_lat = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
    let meters_per_deg_lon = meters_per_deg_lat * lat0.cos();

    let to_plane = |c: Coordinate| -> (f64, f64) {
        (
            (c.lon - fix.lon) * meters_per_deg_lon,
            (c.lat - fix.lat) * meters_per_deg_lat,
        )
    };

    let mut best: Option<Projection> = None;

    for i in 0..polyline.len() - 1 {
        let (ax, ay) = to_plane(polyline[i]);
        let (bx, by) = to_plane(polyline[i + 1]);
        let (dx, dy) = (bx - ax, by - ay);
        let seg_len_sq = dx * dx + dy * dy;

        // t is the clamped parameter of the foot of the perpendicular.
        let t = if seg_len_sq <= f64::EPSILON {
            0.0
        } else {
            ((-ax * dx - ay * dy) / seg_len_sq).clamp(0.0, 1.0)
        };

        let (px, py) = (ax + t * dx, ay + t * dy);
        let dist = (px * px + py * py).sqrt();

        if best.map(|b| dist < b.cross_track_m).unwrap_or(true) {
            let seg_geo_len = cum[i + 1] - cum[i];
            let along = cum[i] + t * seg_geo_len;
            let point = Coordinate::new(
                polyline[i].lat + t * (polyline[i + 1].lat - polyline[i].lat),
                polyline[i].lon + t * (polyline[i + 1].lon - polyline[i].lon),
            );
            best = Some(Projection {
                point,
                cross_track_m: dist,
                fraction: (along / total).clamp(0.0, 1.0),
                along_m: along,
            });
        }
    }

    best
}

/// Coordinate at a fractional position along the polyline (inverse of
/// projection). Clamps to the endpoints.
pub fn point_at_fraction(polyline: &[Coordinate], fraction: f64) -> Option<Coordinate> {
    if polyline.is_empty() {
        return None;
    }
    if polyline.len() == 1 || fraction <= 0.0 {
        return polyline.first().copied();
    }
    if fraction >= 1.0 {
        return polyline.last().copied();
    }

    let cum = cumulative_distances_m(polyline);
    let total = *cum.last()?;
    let target = fraction * total;

    for i in 0..polyline.len() - 1 {
        if cum[i + 1] >= target {
            let seg_len = cum[i + 1] - cum[i];
            let t = if seg_len <= 0.0 {
                0.0
            } else {
                (target - cum[i]) / seg_len
            };
            return Some(Coordinate::new(
                polyline[i].lat + t * (polyline[i + 1].lat - polyline[i].lat),
                polyline[i].lon + t * (polyline[i + 1].lon - polyline[i].lon),
            ));
        }
    }

    polyline.last().copied()
}

//! Polygon rasterisation onto a label slice
//!
//! Vertices are pixel centres. A polygon covers its interior (even-odd rule,
//! sampled at integer rows) plus every pixel its edges pass through, so a
//! traced boundary paints back the pixels it was traced from.

use ndarray::ArrayViewMut2;

/// Paint `value` over the polygon given as `[x0, y0, x1, y1, ...]`.
/// Coordinates are truncated to integers; pixels outside the slice are
/// clipped. Earlier values are overwritten.
pub fn fill_polygon(slice: &mut ArrayViewMut2<'_, u8>, coords: &[f64], value: u8) {
    let points: Vec<(i64, i64)> = coords
        .chunks_exact(2)
        .map(|c| (c[0] as i64, c[1] as i64))
        .collect();
    if points.is_empty() {
        return;
    }

    let (h, w) = slice.dim();
    let (h, w) = (h as i64, w as i64);

    let y_min = points.iter().map(|p| p.1).min().unwrap_or(0).max(0);
    let y_max = points.iter().map(|p| p.1).max().unwrap_or(-1).min(h - 1);

    let n = points.len();
    let mut crossings: Vec<f64> = Vec::with_capacity(n);

    for y in y_min..=y_max {
        crossings.clear();
        for i in 0..n {
            let (x1, y1) = points[i];
            let (x2, y2) = points[(i + 1) % n];
            if y1 == y2 {
                continue;
            }
            let (lo, hi) = if y1 < y2 { (y1, y2) } else { (y2, y1) };
            // Half-open so a shared vertex counts once
            if y < lo || y >= hi {
                continue;
            }
            let t = (y - y1) as f64 / (y2 - y1) as f64;
            crossings.push(x1 as f64 + t * (x2 - x1) as f64);
        }
        crossings.sort_by(|a, b| a.total_cmp(b));

        for pair in crossings.chunks_exact(2) {
            let from = (pair[0].ceil() as i64).max(0);
            let to = (pair[1].floor() as i64).min(w - 1);
            for x in from..=to {
                slice[[y as usize, x as usize]] = value;
            }
        }
    }

    for i in 0..n {
        draw_line(slice, points[i], points[(i + 1) % n], value);
    }
}

/// Bresenham line, clipped to the slice
fn draw_line(slice: &mut ArrayViewMut2<'_, u8>, from: (i64, i64), to: (i64, i64), value: u8) {
    let (h, w) = slice.dim();
    let (h, w) = (h as i64, w as i64);

    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if x >= 0 && y >= 0 && x < w && y < h {
            slice[[y as usize, x as usize]] = value;
        }
        if x == to.0 && y == to.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

//! External boundary tracing of binary masks
//!
//! Foreground is 8-connected, background 4-connected. Only components that
//! touch the background surrounding the image are traced; components sitting
//! inside another component's hole are skipped, as are holes themselves.
//!
//! Points are `(x, y)` pixel coordinates (column, row).

use ndarray::ArrayView2;
use std::collections::VecDeque;

/// Neighbour offsets in clockwise order for a y-down image:
/// E, SE, S, SW, W, NW, N, NE
const DIRS: [(i64, i64); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

const WEST: usize = 4;

pub type Point = (i64, i64);

fn dir_index(dx: i64, dy: i64) -> Option<usize> {
    DIRS.iter().position(|&d| d == (dx, dy))
}

struct Grid<'a> {
    mask: ArrayView2<'a, bool>,
    height: i64,
    width: i64,
}

impl<'a> Grid<'a> {
    fn new(mask: ArrayView2<'a, bool>) -> Self {
        let (h, w) = mask.dim();
        Self {
            mask,
            height: h as i64,
            width: w as i64,
        }
    }

    fn is_fg(&self, x: i64, y: i64) -> bool {
        x >= 0
            && y >= 0
            && x < self.width
            && y < self.height
            && self.mask[[y as usize, x as usize]]
    }

    /// Next boundary pixel clockwise from `back` around `p`, with the new
    /// backtrack direction relative to that pixel
    fn step(&self, p: Point, back: usize) -> Option<(Point, usize)> {
        for i in 1..=8 {
            let d = (back + i) % 8;
            let q = (p.0 + DIRS[d].0, p.1 + DIRS[d].1);
            if self.is_fg(q.0, q.1) {
                let prev_d = (back + i - 1) % 8;
                let prev = (p.0 + DIRS[prev_d].0, p.1 + DIRS[prev_d].1);
                let new_back = dir_index(prev.0 - q.0, prev.1 - q.1)?;
                return Some((q, new_back));
            }
        }
        None
    }
}

/// Trace the outer boundary starting at the raster-first pixel of a component
fn trace_from(grid: &Grid<'_>, start: Point) -> Vec<Point> {
    let mut contour = vec![start];

    let (first, first_back) = match grid.step(start, WEST) {
        Some(s) => s,
        None => return contour,
    };

    let limit = 4 * (grid.width * grid.height) as usize + 8;
    let (mut cur, mut back) = (first, first_back);

    for _ in 0..limit {
        let (next, next_back) = match grid.step(cur, back) {
            Some(s) => s,
            None => break,
        };
        if cur == start && next == first {
            break;
        }
        contour.push(cur);
        cur = next;
        back = next_back;
    }

    contour
}

/// Pixels reachable from outside the image through 4-connected background.
/// Indexed on a grid padded by one pixel on every side.
fn outside_background(grid: &Grid<'_>) -> Vec<bool> {
    let pw = (grid.width + 2) as usize;
    let ph = (grid.height + 2) as usize;
    let mut seen = vec![false; pw * ph];
    let mut queue = VecDeque::from([(0usize, 0usize)]);
    seen[0] = true;

    while let Some((px, py)) = queue.pop_front() {
        for (dx, dy) in [(1i64, 0i64), (-1, 0), (0, 1), (0, -1)] {
            let nx = px as i64 + dx;
            let ny = py as i64 + dy;
            if nx < 0 || ny < 0 || nx >= pw as i64 || ny >= ph as i64 {
                continue;
            }
            let idx = ny as usize * pw + nx as usize;
            if seen[idx] || grid.is_fg(nx - 1, ny - 1) {
                continue;
            }
            seen[idx] = true;
            queue.push_back((nx as usize, ny as usize));
        }
    }

    seen
}

/// Outer contours of every externally visible component, in raster order
/// of each component's first pixel
pub fn external_contours(mask: ArrayView2<'_, bool>) -> Vec<Vec<Point>> {
    let grid = Grid::new(mask);
    let (h, w) = (grid.height, grid.width);
    if h == 0 || w == 0 {
        return Vec::new();
    }

    let outside = outside_background(&grid);
    let pw = (w + 2) as usize;
    let touches_outside = |x: i64, y: i64| {
        [(1i64, 0i64), (-1, 0), (0, 1), (0, -1)]
            .iter()
            .any(|(dx, dy)| outside[(y + dy + 1) as usize * pw + (x + dx + 1) as usize])
    };

    let mut visited = vec![false; (w * h) as usize];
    let mut contours = Vec::new();

    for y in 0..h {
        for x in 0..w {
            if !grid.is_fg(x, y) || visited[(y * w + x) as usize] {
                continue;
            }

            // Flood the 8-connected component, noting whether it is external
            let mut external = false;
            let mut queue = VecDeque::from([(x, y)]);
            visited[(y * w + x) as usize] = true;
            while let Some((cx, cy)) = queue.pop_front() {
                external |= touches_outside(cx, cy);
                for (dx, dy) in DIRS {
                    let (nx, ny) = (cx + dx, cy + dy);
                    if grid.is_fg(nx, ny) && !visited[(ny * w + nx) as usize] {
                        visited[(ny * w + nx) as usize] = true;
                        queue.push_back((nx, ny));
                    }
                }
            }

            if external {
                contours.push(trace_from(&grid, (x, y)));
            }
        }
    }

    contours
}

/// Drop vertices lying on a straight run (incoming direction equals outgoing)
pub fn simplify(contour: &[Point]) -> Vec<Point> {
    let n = contour.len();
    if n < 3 {
        return contour.to_vec();
    }

    let direction = |a: Point, b: Point| ((b.0 - a.0).signum(), (b.1 - a.1).signum());

    (0..n)
        .filter(|&i| {
            let prev = contour[(i + n - 1) % n];
            let next = contour[(i + 1) % n];
            direction(prev, contour[i]) != direction(contour[i], next)
        })
        .map(|i| contour[i])
        .collect()
}

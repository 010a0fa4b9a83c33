///! Coarse 2-D grid over the galactic (x, z) plane
///!
///! Each axis is cut into 1000 ly slices which two compression tables merge
///! into cells: narrow around Sol and the galactic core, wide in the outer
///! regions where systems are sparse. A cell id is `x_index + 100 * z_index`.

use starcat_common::from_fixed;

pub const XLEFT: i32 = -20500;
pub const XRIGHT: i32 = 20000;
pub const ZBOT: i32 = -10000;
pub const ZTOP: i32 = 70000;

/// Width of one table slice in light years
pub const SLICE_LY: i32 = 1000;

/// Multiplier applied to the z index when forming a cell id
pub const GRID_ROW: i32 = 100;

#[rustfmt::skip]
static COMPRESS_X: [u8; 41] = [
    0, 1, 1, 1, 1, 2, 2, 2, 2, 2,           // -20500 .. -10500
    3, 3, 4, 4, 5, 5, 6, 7, 8, 9,           // -10500 .. -500
    10, 11, 12, 13, 14, 14, 15, 15, 16, 16, // -500 .. 9500
    17, 17, 17, 17, 17, 18, 18, 18, 18, 18, // 9500 .. 19500
    19,                                     // 19500 ..
];

#[rustfmt::skip]
static COMPRESS_Z: [u8; 81] = [
    0, 0, 0, 0, 0, 1, 1, 1, 1, 1,           // -10000 .. 0
    2, 3, 4, 5, 6, 7, 7, 8, 8, 9,           // 0 .. 10000
    9, 10, 10, 11, 11, 12, 12, 13, 13, 14,  // 10000 .. 20000
    15, 16, 17, 18, 19, 20, 21, 22, 23, 24, // 20000 .. 30000, galactic core
    25, 25, 26, 26, 27, 27, 28, 28, 29, 29, // 30000 .. 40000
    30, 30, 30, 31, 31, 31, 32, 32, 32, 32, // 40000 .. 50000
    33, 33, 33, 33, 33, 34, 34, 34, 34, 34, // 50000 .. 60000
    35, 35, 35, 35, 35, 36, 36, 36, 36, 36, // 60000 .. 70000
    36,                                     // 70000
];

/// Bounding rectangle of one grid cell, in light years
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridRect {
    pub xmin: f64,
    pub xmax: f64,
    pub zmin: f64,
    pub zmax: f64,
}

impl GridRect {
    /// Half-open containment test (`min <= v < max`)
    pub fn contains(&self, x: f64, z: f64) -> bool {
        x >= self.xmin && x < self.xmax && z >= self.zmin && z < self.zmax
    }

    pub fn centre(&self) -> (f64, f64) {
        (
            (self.xmin + self.xmax) / 2.0,
            (self.zmin + self.zmax) / 2.0,
        )
    }
}

fn slice_index(value: f64, low: i32, high: i32, len: usize) -> usize {
    let clamped = value.clamp(low as f64, high as f64);
    let index = ((clamped - low as f64) / SLICE_LY as f64) as usize;
    index.min(len - 1)
}

/// Cell id for a position in light years
pub fn id(x: f64, z: f64) -> i32 {
    let xi = slice_index(x, XLEFT, XRIGHT, COMPRESS_X.len());
    let zi = slice_index(z, ZBOT, ZTOP, COMPRESS_Z.len());
    id_from_components(COMPRESS_X[xi] as i32, COMPRESS_Z[zi] as i32)
}

/// Cell id for a fixed-point position
pub fn id_from_fixed(x: i32, z: i32) -> i32 {
    id(from_fixed(x), from_fixed(z))
}

pub fn id_from_components(x_index: i32, z_index: i32) -> i32 {
    x_index + GRID_ROW * z_index
}

/// Split a cell id into its (x, z) indices
pub fn components(id: i32) -> (i32, i32) {
    (id % GRID_ROW, id / GRID_ROW)
}

/// First slice and slice count of the run mapping to `index`
fn run_of(table: &[u8], index: i32) -> Option<(usize, usize)> {
    let start = table.iter().position(|&v| v as i32 == index)?;
    let len = table[start..]
        .iter()
        .take_while(|&&v| v as i32 == index)
        .count();
    Some((start, len))
}

/// Approximate position of a cell
///
/// Returns the lower-left corner, or the centre when `mid` is set.
pub fn xz(id: i32, mid: bool) -> Option<(f64, f64)> {
    let rect = cell_rect(id)?;
    if mid {
        Some(rect.centre())
    } else {
        Some((rect.xmin, rect.zmin))
    }
}

/// Rectangle covered by a cell
pub fn cell_rect(id: i32) -> Option<GridRect> {
    if id < 0 {
        return None;
    }
    let (xi, zi) = components(id);
    let (xstart, xlen) = run_of(&COMPRESS_X, xi)?;
    let (zstart, zlen) = run_of(&COMPRESS_Z, zi)?;

    let xmin = (XLEFT + xstart as i32 * SLICE_LY) as f64;
    let zmin = (ZBOT + zstart as i32 * SLICE_LY) as f64;
    Some(GridRect {
        xmin,
        xmax: xmin + (xlen as i32 * SLICE_LY) as f64,
        zmin,
        zmax: zmin + (zlen as i32 * SLICE_LY) as f64,
    })
}

pub fn is_valid(id: i32) -> bool {
    cell_rect(id).is_some()
}

fn distinct(table: &[u8]) -> Vec<i32> {
    let mut values: Vec<i32> = table.iter().map(|&v| v as i32).collect();
    values.dedup();
    values
}

/// Every valid cell id, ordered by z then x
pub fn all_ids() -> Vec<i32> {
    let xs = distinct(&COMPRESS_X);
    let zs = distinct(&COMPRESS_Z);
    zs.iter()
        .flat_map(|&z| xs.iter().map(move |&x| id_from_components(x, z)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_monotonic() {
        assert!(COMPRESS_X.windows(2).all(|w| w[0] <= w[1]));
        assert!(COMPRESS_Z.windows(2).all(|w| w[0] <= w[1]));
        assert!((*COMPRESS_X.last().unwrap() as i32) < GRID_ROW);
    }

    #[test]
    fn test_sol_cell() {
        let sol = id(0.0, 0.0);
        assert_eq!(components(sol), (10, 2));
        let rect = cell_rect(sol).unwrap();
        assert!(rect.contains(0.0, 0.0));
        assert_eq!(rect.xmin, -500.0);
        assert_eq!(rect.xmax, 500.0);
    }

    #[test]
    fn test_rect_contains_point() {
        let mut x = XLEFT as f64;
        while x < XRIGHT as f64 {
            let mut z = ZBOT as f64;
            while z < ZTOP as f64 {
                let cell = id(x, z);
                let rect = cell_rect(cell).unwrap();
                assert!(rect.contains(x, z), "({}, {}) not in cell {} {:?}", x, z, cell, rect);
                z += 377.0;
            }
            x += 411.0;
        }
    }

    #[test]
    fn test_out_of_bounds_is_clamped() {
        assert_eq!(id(-1.0e6, -1.0e6), id(XLEFT as f64, ZBOT as f64));
        assert_eq!(id(1.0e6, 1.0e6), id(XRIGHT as f64, ZTOP as f64));
    }

    #[test]
    fn test_xz_midpoint() {
        let cell = id(25000.0, 15000.0);
        let (lx, lz) = xz(cell, false).unwrap();
        let (mx, mz) = xz(cell, true).unwrap();
        assert!(mx > lx && mz > lz);
        assert!(xz(99, false).is_none());
    }

    #[test]
    fn test_all_ids() {
        let ids = all_ids();
        assert_eq!(ids.len(), 20 * 37);
        assert!(ids.iter().all(|&id| is_valid(id)));
        assert!(ids.contains(&id(0.0, 0.0)));
        assert!(ids.contains(&id(-15000.0, 65000.0)));
    }

    #[test]
    fn test_fixed_point_entry() {
        assert_eq!(id_from_fixed(128 * 3000, 128 * 25500), id(3000.0, 25500.0));
    }
}

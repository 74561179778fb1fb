//! Viridis colour map

/// Viridis anchor colours at evenly spaced positions in [0, 1]
const VIRIDIS: [[u8; 3]; 10] = [
    [0x44, 0x01, 0x54],
    [0x48, 0x28, 0x78],
    [0x3E, 0x4A, 0x89],
    [0x31, 0x68, 0x8E],
    [0x26, 0x82, 0x8E],
    [0x1F, 0x9E, 0x89],
    [0x35, 0xB7, 0x79],
    [0x6E, 0xCE, 0x58],
    [0xB5, 0xDE, 0x2B],
    [0xFD, 0xE7, 0x25],
];

/// Map an 8-bit intensity to RGB by linear interpolation between anchors
pub fn viridis(value: u8) -> [u8; 3] {
    let segments = (VIRIDIS.len() - 1) as f32;
    let pos = value as f32 / 255.0 * segments;
    let lo = (pos.floor() as usize).min(VIRIDIS.len() - 2);
    let t = pos - lo as f32;

    let mut rgb = [0u8; 3];
    for (c, out) in rgb.iter_mut().enumerate() {
        let a = VIRIDIS[lo][c] as f32;
        let b = VIRIDIS[lo + 1][c] as f32;
        *out = (a + (b - a) * t).round() as u8;
    }
    rgb
}

//! PNG slice directories ↔ volumes

use image::{GrayImage, RgbImage, RgbaImage};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use segloop_common::{Error, Result};
use std::path::{Path, PathBuf};

use super::colormap::viridis;
use super::volume::IntensityVolume;

/// Below this dynamic range a slice is taken as already scaled to [0, 1]
const FLAT_SLICE_EPSILON: f32 = 1e-6;

/// How slices are rendered
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceStyle {
    /// Viridis instead of grey
    pub colormap: bool,
    /// Alpha channel, transparent where the original voxel is exactly 0
    pub transparent_background: bool,
}

impl SliceStyle {
    /// Opaque grey, for source scans
    pub fn grey() -> Self {
        Self::default()
    }

    /// Viridis with transparent background, for segmentation overlays
    pub fn overlay() -> Self {
        Self {
            colormap: true,
            transparent_background: true,
        }
    }
}

/// File name of slice `index`
pub fn slice_file_name(index: usize) -> String {
    format!("slice_{:04}.png", index)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// PNG files directly inside `dir`, sorted by file name
pub fn list_png_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(dir.display().to_string()));
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_extension(p, &["png"]))
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn image_error(path: &Path, err: image::ImageError) -> Error {
    match err {
        image::ImageError::IoError(e) => Error::Io(e),
        other => Error::InvalidInput(format!("{}: {}", path.display(), other)),
    }
}

/// Stack a directory of PNG slices into a volume.
///
/// Slices are decoded as 8-bit grey in file name order and each is divided
/// by its own maximum (all-zero slices stay zero). Depth is the last axis.
pub fn png_dir_to_volume(dir: &Path) -> Result<IntensityVolume> {
    let files = list_png_files(dir)?;
    if files.is_empty() {
        return Err(Error::InvalidInput(format!(
            "No PNG files found in {}",
            dir.display()
        )));
    }

    let mut slices = Vec::with_capacity(files.len());
    let mut dims: Option<(u32, u32)> = None;

    for path in &files {
        let grey = image::open(path)
            .map_err(|e| image_error(path, e))?
            .to_luma8();
        let (w, h) = grey.dimensions();
        match dims {
            None => dims = Some((w, h)),
            Some(expected) if expected != (w, h) => {
                return Err(Error::InvalidInput(format!(
                    "{}: slice is {}x{}, expected {}x{}",
                    path.display(),
                    w,
                    h,
                    expected.0,
                    expected.1
                )));
            }
            Some(_) => {}
        }
        slices.push(grey);
    }

    let (w, h) = dims.unwrap_or((0, 0));
    let mut volume = Array3::<f32>::zeros((h as usize, w as usize, slices.len()));

    for (z, grey) in slices.iter().enumerate() {
        let max = grey.pixels().map(|p| p.0[0]).max().unwrap_or(0);
        let scale = if max > 0 { 1.0 / max as f32 } else { 1.0 };
        let mut plane = volume.index_axis_mut(Axis(2), z);
        for (x, y, p) in grey.enumerate_pixels() {
            plane[[y as usize, x as usize]] = p.0[0] as f32 * scale;
        }
    }

    Ok(volume)
}

/// Min-max scale a slice to 8 bits
fn normalise(slice: ArrayView2<'_, f32>) -> Array2<u8> {
    let min = slice.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = slice.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    if range > FLAT_SLICE_EPSILON {
        slice.mapv(|v| (((v - min) / range) * 255.0) as u8)
    } else {
        slice.mapv(|v| (v.clamp(0.0, 1.0) * 255.0) as u8)
    }
}

/// Render every slice of `volume` into `dir` as `slice_NNNN.png`
pub fn volume_to_png_dir(volume: &IntensityVolume, dir: &Path, style: SliceStyle) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let (h, w, depth) = volume.dim();
    let mut written = Vec::with_capacity(depth);

    for z in 0..depth {
        let original = volume.index_axis(Axis(2), z);
        let scaled = normalise(original);
        let path = dir.join(slice_file_name(z));

        let rgb = |y: usize, x: usize| -> [u8; 3] {
            let v = scaled[[y, x]];
            if style.colormap {
                viridis(v)
            } else {
                [v, v, v]
            }
        };

        if style.transparent_background {
            let img = RgbaImage::from_fn(w as u32, h as u32, |x, y| {
                let (x, y) = (x as usize, y as usize);
                let [r, g, b] = rgb(y, x);
                let alpha = if original[[y, x]] != 0.0 { 255 } else { 0 };
                image::Rgba([r, g, b, alpha])
            });
            img.save(&path).map_err(|e| image_error(&path, e))?;
        } else {
            let img = RgbImage::from_fn(w as u32, h as u32, |x, y| {
                image::Rgb(rgb(y as usize, x as usize))
            });
            img.save(&path).map_err(|e| image_error(&path, e))?;
        }

        written.push(path);
    }

    tracing::debug!(dir = %dir.display(), slices = depth, "Rendered volume slices");
    Ok(written)
}

/// Convert JPEG/TIFF images in `src` to PNG files in `dest`.
/// Unreadable files are logged and skipped.
pub fn convert_images_to_png(src: &Path, dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)?;
    let mut converted = 0;

    for entry in std::fs::read_dir(src)? {
        let path = entry?.path();
        if !path.is_file() || !has_extension(&path, &["jpg", "jpeg", "tif", "tiff"]) {
            continue;
        }
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(s) => s.to_string(),
            None => continue,
        };
        match image::open(&path) {
            Ok(img) => {
                let out = dest.join(format!("{}.png", stem));
                img.to_rgb8().save(&out).map_err(|e| image_error(&out, e))?;
                converted += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable image");
            }
        }
    }

    Ok(converted)
}

/// Write a grey slice (test fixtures and previews)
pub fn save_grey(path: &Path, slice: &Array2<u8>) -> Result<()> {
    let (h, w) = slice.dim();
    let img = GrayImage::from_fn(w as u32, h as u32, |x, y| {
        image::Luma([slice[[y as usize, x as usize]]])
    });
    img.save(path).map_err(|e| image_error(path, e))
}

//! NIfTI volume I/O
//!
//! Volumes are indexed `(row, column, slice)`, i.e. the first two NIfTI
//! axes form one 2D slice and the third axis is depth.

use ndarray::{Array3, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use segloop_common::{Error, Result};
use std::path::Path;

/// Label ids per voxel, background 0
pub type LabelVolume = Array3<u8>;

/// Raw intensities
pub type IntensityVolume = Array3<f32>;

/// True for `.nii` and `.nii.gz` file names
pub fn is_nifti_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".nii") || lower.ends_with(".nii.gz")
}

/// File name without `.nii` / `.nii.gz`
pub fn strip_nifti_ext(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".nii.gz") {
        &name[..name.len() - 7]
    } else if lower.ends_with(".nii") {
        &name[..name.len() - 4]
    } else {
        name
    }
}

fn nifti_error(path: &Path, err: nifti::NiftiError) -> Error {
    match err {
        nifti::NiftiError::Io(e) => Error::Io(e),
        other => Error::InvalidInput(format!("{}: {}", path.display(), other)),
    }
}

/// Read a volume as floating point intensities.
///
/// 2D images become a single slice; a trailing singleton 4th axis is dropped.
pub fn read_intensity_volume(path: &Path) -> Result<IntensityVolume> {
    if !path.is_file() {
        return Err(Error::NotFound(path.display().to_string()));
    }

    let object = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| nifti_error(path, e))?;
    let data = object
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| nifti_error(path, e))?;

    let data = match data.ndim() {
        2 => data.insert_axis(Axis(2)),
        3 => data,
        4 if data.shape()[3] == 1 => data.index_axis_move(Axis(3), 0),
        n => {
            return Err(Error::InvalidInput(format!(
                "{}: expected a 3D volume, found {} dimensions",
                path.display(),
                n
            )))
        }
    };

    data.into_dimensionality::<Ix3>()
        .map_err(|e| Error::InvalidInput(format!("{}: {}", path.display(), e)))
}

/// Read a segmentation volume; voxel values must be integral in 0..=255
pub fn read_label_volume(path: &Path) -> Result<LabelVolume> {
    let data = read_intensity_volume(path)?;
    if let Some(bad) = data
        .iter()
        .find(|v| !v.is_finite() || **v < 0.0 || **v > 255.0)
    {
        return Err(Error::InvalidInput(format!(
            "{}: label value {} out of range",
            path.display(),
            bad
        )));
    }
    Ok(data.mapv(|v| v.round() as u8))
}

pub fn write_label_volume(path: &Path, volume: &LabelVolume) -> Result<()> {
    ensure_parent(path)?;
    WriterOptions::new(path)
        .write_nifti(volume)
        .map_err(|e| nifti_error(path, e))
}

pub fn write_intensity_volume(path: &Path, volume: &IntensityVolume) -> Result<()> {
    ensure_parent(path)?;
    WriterOptions::new(path)
        .write_nifti(volume)
        .map_err(|e| nifti_error(path, e))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

//! COCO instance annotations ↔ label volumes
//!
//! Each depth slice of a volume is one COCO image (`slice_NNNN.png`, image id
//! = slice index). Each label present in a slice becomes one annotation
//! holding every external contour of that label as a polygon.
//!
//! Decoding places images by the trailing number in their file name and
//! paints annotations in document order; where polygons overlap the later
//! annotation wins.

use chrono::Datelike;
use ndarray::{Array2, ArrayView2, ArrayView3, Axis};
use segloop_common::{DatasetDescriptor, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use super::contour::{external_contours, simplify};
use super::raster::fill_polygon;
use super::slices::slice_file_name;
use super::volume::LabelVolume;

/// Largest slice index accepted when placing images by file name
pub const MAX_SLICES: usize = 4096;

/// Largest decoded volume, in voxels
pub const MAX_VOXELS: usize = 1 << 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<CocoInfo>,
    #[serde(default)]
    pub licenses: Vec<CocoLicense>,
    #[serde(default)]
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    #[serde(default)]
    pub categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CocoInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub contributor: String,
    #[serde(default)]
    pub date_created: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoLicense {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: i64,
    pub file_name: String,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub supercategory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub id: i64,
    pub image_id: i64,
    pub category_id: i64,
    #[serde(default)]
    pub segmentation: Segmentation,
    /// `[x, y, width, height]`, extents inclusive
    #[serde(default)]
    pub bbox: Vec<f64>,
    #[serde(default)]
    pub area: f64,
    #[serde(default)]
    pub iscrowd: u8,
}

/// Polygon lists, or a run-length mask for crowd annotations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
    Polygons(Vec<Vec<f64>>),
    Rle(RunLength),
}

impl Default for Segmentation {
    fn default() -> Self {
        Segmentation::Polygons(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLength {
    pub counts: RunLengthCounts,
    /// `[height, width]`
    pub size: [u32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunLengthCounts {
    Uncompressed(Vec<u64>),
    Compressed(String),
}

/// Encode a label volume as a COCO document.
///
/// Every non-zero label in the volume must be named by the dataset; an
/// unnamed label is a configuration error.
pub fn encode_volume(volume: ArrayView3<'_, u8>, dataset: &DatasetDescriptor) -> Result<CocoDocument> {
    let present: BTreeSet<u8> = volume.iter().copied().filter(|&v| v != 0).collect();
    let unknown: Vec<String> = present
        .iter()
        .filter(|&&v| dataset.label_name(v).is_none())
        .map(|v| v.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(Error::Config(format!(
            "Dataset {} has no name for label(s) {}",
            dataset.id,
            unknown.join(", ")
        )));
    }

    let (height, width, depth) = volume.dim();
    let mut images = Vec::with_capacity(depth);
    let mut annotations = Vec::new();
    let mut next_annotation_id = 0i64;

    for z in 0..depth {
        let slice = volume.index_axis(Axis(2), z);
        images.push(CocoImage {
            id: z as i64,
            file_name: slice_file_name(z),
            height: Some(height as u32),
            width: Some(width as u32),
        });

        let labels: BTreeSet<u8> = slice.iter().copied().filter(|&v| v != 0).collect();
        for label in labels {
            let (bbox, area) = match bounding_box(slice, label) {
                Some(b) => b,
                None => continue,
            };
            let polygons = label_polygons(slice, label);
            if polygons.is_empty() {
                continue;
            }

            annotations.push(CocoAnnotation {
                id: next_annotation_id,
                image_id: z as i64,
                category_id: label as i64,
                segmentation: Segmentation::Polygons(polygons),
                bbox,
                area: area as f64,
                iscrowd: 0,
            });
            next_annotation_id += 1;
        }
    }

    let now = chrono::Utc::now();
    Ok(CocoDocument {
        info: Some(CocoInfo {
            description: dataset.description.clone(),
            url: dataset.reference.clone(),
            version: dataset.release.clone(),
            year: now.year(),
            contributor: "segloop".to_string(),
            date_created: now.format("%Y-%m-%d").to_string(),
        }),
        licenses: vec![CocoLicense {
            id: 1,
            name: dataset.licence.clone(),
            url: String::new(),
        }],
        images,
        annotations,
        categories: dataset
            .labels
            .iter()
            .map(|l| CocoCategory {
                id: l.id as i64,
                name: l.name.clone(),
                supercategory: String::new(),
            })
            .collect(),
    })
}

/// `([x_min, y_min, width, height], voxel count)` of `label` in a slice
pub fn bounding_box(slice: ArrayView2<'_, u8>, label: u8) -> Option<(Vec<f64>, usize)> {
    let mut extent: Option<(usize, usize, usize, usize)> = None;
    let mut area = 0usize;

    for ((y, x), &v) in slice.indexed_iter() {
        if v != label {
            continue;
        }
        area += 1;
        extent = Some(match extent {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    extent.map(|(x0, y0, x1, y1)| {
        (
            vec![
                x0 as f64,
                y0 as f64,
                (x1 - x0 + 1) as f64,
                (y1 - y0 + 1) as f64,
            ],
            area,
        )
    })
}

/// Flattened external polygons of `label`; degenerate contours dropped
fn label_polygons(slice: ArrayView2<'_, u8>, label: u8) -> Vec<Vec<f64>> {
    let mask = slice.mapv(|v| v == label);
    external_contours(mask.view())
        .iter()
        .map(|c| simplify(c))
        .filter(|c| c.len() >= 3)
        .map(|c| {
            c.iter()
                .flat_map(|&(x, y)| [x as f64, y as f64])
                .collect::<Vec<f64>>()
        })
        .filter(|flat| flat.len() % 2 == 0 && flat.len() >= 6)
        .collect()
}

/// Trailing integer of a file stem: `slice_0007.png` → 7
pub fn slice_index(file_name: &str) -> Option<usize> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let stem = match base.rfind('.') {
        Some(dot) => &base[..dot],
        None => base,
    };
    stem.rsplit('_').next()?.parse().ok()
}

/// Decode a COCO document into a label volume `(height, width, depth)`.
///
/// Depth is the largest slice index plus one, so missing slices come back
/// as background.
pub fn decode_document(doc: &CocoDocument) -> Result<LabelVolume> {
    let first = doc
        .images
        .first()
        .ok_or_else(|| Error::InvalidInput("No images found in COCO annotations".to_string()))?;

    let size_of = |img: &CocoImage| -> Result<(u32, u32)> {
        match (img.height, img.width) {
            (Some(h), Some(w)) if h > 0 && w > 0 => Ok((h, w)),
            _ => Err(Error::InvalidInput(format!(
                "Image {} ({}) has no height/width",
                img.id, img.file_name
            ))),
        }
    };
    let (height, width) = size_of(first)?;

    let mut placed: Vec<(usize, &CocoImage)> = Vec::with_capacity(doc.images.len());
    for img in &doc.images {
        if size_of(img)? != (height, width) {
            return Err(Error::InvalidInput(format!(
                "Image {} is {}x{}, expected {}x{} like {}",
                img.file_name,
                img.width.unwrap_or(0),
                img.height.unwrap_or(0),
                width,
                height,
                first.file_name
            )));
        }
        let index = slice_index(&img.file_name).ok_or_else(|| {
            Error::InvalidInput(format!("No slice index in file name {}", img.file_name))
        })?;
        placed.push((index, img));
    }
    placed.sort_by_key(|(index, _)| *index);

    let depth = placed.last().map(|(index, _)| index + 1).unwrap_or(0);
    if depth > MAX_SLICES {
        return Err(Error::InvalidInput(format!(
            "Slice index {} in {} exceeds the {} slice limit",
            depth - 1,
            placed.last().map(|(_, img)| img.file_name.as_str()).unwrap_or(""),
            MAX_SLICES
        )));
    }
    let (height, width) = (height as usize, width as usize);
    let voxels = height
        .checked_mul(width)
        .and_then(|n| n.checked_mul(depth))
        .filter(|&n| n <= MAX_VOXELS)
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "Volume {}x{}x{} is too large to decode",
                width, height, depth
            ))
        })?;
    tracing::debug!(voxels, depth, "Decoding COCO document");
    let mut volume = LabelVolume::zeros((height, width, depth));

    let mut by_image: BTreeMap<i64, Vec<&CocoAnnotation>> = BTreeMap::new();
    for ann in &doc.annotations {
        by_image.entry(ann.image_id).or_default().push(ann);
    }

    for (index, img) in placed {
        let mut buffer = Array2::<u8>::zeros((height, width));
        for ann in by_image.get(&img.id).into_iter().flatten() {
            let value = u8::try_from(ann.category_id)
                .ok()
                .filter(|&v| v != 0)
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Annotation {} has category id {} outside 1..=255",
                        ann.id, ann.category_id
                    ))
                })?;
            paint_annotation(&mut buffer, ann, value);
        }
        volume.index_axis_mut(Axis(2), index).assign(&buffer);
    }

    Ok(volume)
}

fn paint_annotation(buffer: &mut Array2<u8>, ann: &CocoAnnotation, value: u8) {
    match &ann.segmentation {
        Segmentation::Polygons(polygons) => {
            for polygon in polygons {
                if polygon.len() < 6 || polygon.len() % 2 != 0 {
                    continue;
                }
                fill_polygon(&mut buffer.view_mut(), polygon, value);
            }
        }
        Segmentation::Rle(rle) => paint_run_length(buffer, ann.id, rle, value),
    }
}

/// Uncompressed COCO RLE: alternating background/foreground run lengths
/// over the mask in column-major order
fn paint_run_length(buffer: &mut Array2<u8>, annotation_id: i64, rle: &RunLength, value: u8) {
    let counts = match &rle.counts {
        RunLengthCounts::Uncompressed(counts) => counts,
        RunLengthCounts::Compressed(_) => {
            tracing::warn!(annotation_id, "Skipping compressed RLE segmentation");
            return;
        }
    };
    let (h, w) = buffer.dim();
    if rle.size != [h as u32, w as u32] {
        tracing::warn!(annotation_id, size = ?rle.size, "Skipping RLE with mismatched size");
        return;
    }

    let total = h * w;
    let mut pos = 0usize;
    for (i, &run) in counts.iter().enumerate() {
        let end = pos.saturating_add(usize::try_from(run).unwrap_or(usize::MAX)).min(total);
        if i % 2 == 1 {
            for p in pos..end {
                buffer[[p % h, p / h]] = value;
            }
        }
        pos = end;
        if pos >= total {
            break;
        }
    }
}

pub fn parse_document(bytes: &[u8]) -> Result<CocoDocument> {
    Ok(serde_json::from_slice(bytes)?)
}

/// COCO document from an export payload: a ZIP holding a JSON annotation
/// file, or the JSON itself
pub fn document_from_export(bytes: &[u8]) -> Result<CocoDocument> {
    if !bytes.starts_with(b"PK") {
        return parse_document(bytes);
    }

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::InvalidInput(format!("Export archive: {}", e)))?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::InvalidInput(format!("Export archive: {}", e)))?;
        if entry.is_file() && entry.name().to_ascii_lowercase().ends_with(".json") {
            let mut json = Vec::new();
            entry.read_to_end(&mut json)?;
            return parse_document(&json);
        }
    }

    Err(Error::InvalidInput(
        "Export archive contains no JSON annotation file".to_string(),
    ))
}

//! Format conversion between label volumes, COCO annotations and PNG slices

pub mod coco;
pub mod colormap;
pub mod contour;
pub mod raster;
pub mod slices;
pub mod volume;

pub use coco::{decode_document, document_from_export, encode_volume, CocoDocument};
pub use slices::{png_dir_to_volume, volume_to_png_dir, SliceStyle};
pub use volume::{IntensityVolume, LabelVolume};

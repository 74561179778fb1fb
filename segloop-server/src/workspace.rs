//! Working directory layout
//!
//! ```text
//! <root>/
//!   uploads/archives/           received upload files
//!   uploads/extract/<job>/      unpacked archives (removed after ingestion)
//!   uploads/inference/<job>/    nnU-Net input, <case>_<channel>.nii.gz
//!   uploads/niftis/             channel volumes, <job>_<case>_<channel>.nii.gz
//!   uploads/pngs/<job>_<case>/  source slices for display
//!   results/niftis/             segmentations, <job>_<case>.nii.gz
//!   results/pngs/<job>_<case>/  segmentation overlays
//!   results/tmp/<job>/          raw nnU-Net output (removed after each run)
//!   annotations/                exchanged COCO documents and decoded volumes
//! ```

use segloop_common::{Error, Result};
use std::path::{Path, PathBuf};

use crate::convert::volume::strip_nifti_ext;

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the fixed directories
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.archives_dir(),
            self.uploads_dir().join("extract"),
            self.uploads_dir().join("inference"),
            self.upload_niftis_dir(),
            self.upload_pngs_dir(),
            self.result_niftis_dir(),
            self.result_pngs_dir(),
            self.results_dir().join("tmp"),
            self.annotations_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.uploads_dir().join("archives")
    }

    pub fn extract_dir(&self, job_id: &str) -> PathBuf {
        self.uploads_dir().join("extract").join(job_id)
    }

    pub fn inference_input_dir(&self, job_id: &str) -> PathBuf {
        self.uploads_dir().join("inference").join(job_id)
    }

    pub fn upload_niftis_dir(&self) -> PathBuf {
        self.uploads_dir().join("niftis")
    }

    pub fn upload_pngs_dir(&self) -> PathBuf {
        self.uploads_dir().join("pngs")
    }

    /// Source slice directory for one case
    pub fn upload_png_dir(&self, job_id: &str, case_name: &str) -> PathBuf {
        self.upload_pngs_dir().join(format!("{}_{}", job_id, case_name))
    }

    pub fn result_niftis_dir(&self) -> PathBuf {
        self.results_dir().join("niftis")
    }

    pub fn result_pngs_dir(&self) -> PathBuf {
        self.results_dir().join("pngs")
    }

    pub fn result_png_dir(&self, job_id: &str, case_name: &str) -> PathBuf {
        self.result_pngs_dir().join(format!("{}_{}", job_id, case_name))
    }

    pub fn result_tmp_dir(&self, job_id: &str) -> PathBuf {
        self.results_dir().join("tmp").join(job_id)
    }

    pub fn annotations_dir(&self) -> PathBuf {
        self.root.join("annotations")
    }

    pub fn coco_annotation_path(&self, task_id: i64) -> PathBuf {
        self.annotations_dir()
            .join(format!("task_{}_coco_annotations.json", task_id))
    }

    pub fn corrected_volume_path(&self, task_id: i64) -> PathBuf {
        self.annotations_dir()
            .join(format!("task_{}_segmentation.nii.gz", task_id))
    }

    /// Resolve a client-supplied path (absolute or root-relative) and make
    /// sure it stays inside the workspace
    pub fn confine(&self, requested: &str) -> Result<PathBuf> {
        let requested = Path::new(requested);
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let canonical = candidate
            .canonicalize()
            .map_err(|_| Error::NotFound(candidate.display().to_string()))?;
        let root = self.root.canonicalize()?;

        if !canonical.starts_with(&root) {
            return Err(Error::InvalidInput(format!(
                "Path {} is outside the workspace",
                requested.display()
            )));
        }
        Ok(canonical)
    }

    /// Path relative to the workspace root, for handing out to clients
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

/// Derive a job id from an upload file name.
///
/// Volume/archive extensions are removed and everything outside
/// `[A-Za-z0-9-]` becomes `-`, so `<job>_<case>` splits at the first `_`.
pub fn job_id_from_filename(file_name: &str) -> Result<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let stem = strip_nifti_ext(base);
    let stem = stem
        .strip_suffix(".zip")
        .or_else(|| stem.strip_suffix(".ZIP"))
        .unwrap_or(stem);

    let job_id: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let job_id = job_id.trim_matches('-').to_string();

    if job_id.is_empty() {
        return Err(Error::InvalidInput(format!(
            "Cannot derive a job id from file name {:?}",
            file_name
        )));
    }
    Ok(job_id)
}

/// Restrict a case name to `[A-Za-z0-9_-]`
pub fn sanitize_case_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "case".to_string()
    } else {
        cleaned
    }
}

/// A result volume id, `<job>_<case>.nii.gz`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NiftiId {
    pub job_id: String,
    pub case_name: String,
}

impl NiftiId {
    pub fn parse(id: &str) -> Result<Self> {
        let (job_id, rest) = id
            .split_once('_')
            .ok_or_else(|| Error::InvalidInput(format!("Malformed NIfTI id: {}", id)))?;
        let case_name = strip_nifti_ext(rest);
        if job_id.is_empty() || case_name.is_empty() || case_name.contains(['/', '\\']) || job_id.contains(['/', '\\', '.']) {
            return Err(Error::InvalidInput(format!("Malformed NIfTI id: {}", id)));
        }
        Ok(Self {
            job_id: job_id.to_string(),
            case_name: case_name.to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}.nii.gz", self.job_id, self.case_name)
    }
}

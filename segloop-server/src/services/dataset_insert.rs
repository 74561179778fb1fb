//! Insertion of corrected cases into an nnU-Net raw dataset
//!
//! A dataset folder holds `imagesTr/`, `labelsTr/` and a `dataset.json`
//! manifest. Inserting a case copies the corrected label volume and every
//! raw channel into place and rewrites the manifest's training list.
//!
//! Everything the insertion needs is checked before the first write, so a
//! rejected insertion leaves the dataset folder untouched.

use regex::Regex;
use segloop_common::db::CaseChannel;
use segloop_common::{CaseNaming, DatasetDescriptor, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "dataset.json";

/// One `training` entry of the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingEntry {
    pub image: String,
    pub label: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The parts of `dataset.json` this module touches; other keys are kept as is
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "numTraining", default)]
    pub num_training: usize,
    #[serde(default)]
    pub training: Vec<TrainingEntry>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::InvalidInput(format!("Malformed manifest {}: {}", path.display(), e))
        })
    }

    /// Write through a temporary file so readers never see a partial manifest
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Replace any entry for the same case and refresh `numTraining`
    pub fn upsert(&mut self, entry: TrainingEntry) {
        self.training
            .retain(|e| e.image != entry.image && e.label != entry.label);
        self.training.push(entry);
        self.num_training = self.training.len();
    }
}

/// Leading number of a case name for numeric-suffix datasets
fn case_number(prefix: &str, case_name: &str) -> Result<Option<u64>> {
    let pattern = format!(r"(?i){}[_-]?(\d+)", regex::escape(prefix));
    let with_prefix = Regex::new(&pattern)
        .map_err(|e| Error::Config(format!("Bad case prefix {:?}: {}", prefix, e)))?;
    let any_digits = Regex::new(r"\d+")
        .map_err(|e| Error::Internal(e.to_string()))?;

    let digits = with_prefix
        .captures(case_name)
        .and_then(|c| c.get(1))
        .or_else(|| any_digits.find(case_name))
        .map(|m| m.as_str());

    // Digit runs longer than u64 fall through to None
    Ok(digits.and_then(|d| d.parse().ok()))
}

fn numbered(prefix: &str, number: u64, width: usize) -> String {
    format!("{}_{:0width$}", prefix, number, width = width)
}

/// Case id a corrected case receives in the dataset
pub fn derive_case_id(descriptor: &DatasetDescriptor, source_case: &str, manifest: &Manifest) -> Result<String> {
    match &descriptor.case_naming {
        CaseNaming::NumericSuffix { prefix, width } => {
            let number = case_number(prefix, source_case)?.ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Cannot derive a {} case number from {:?}",
                    descriptor.id, source_case
                ))
            })?;
            Ok(numbered(prefix, number, *width))
        }
        CaseNaming::Sequential { prefix, width } => {
            let number = manifest.num_training as u64;
            Ok(match prefix {
                Some(p) => numbered(p, number, *width),
                None => format!("{:0width$}", number, width = *width),
            })
        }
    }
}

/// Case name as shown to users, normalised by the dataset's naming rule.
/// Names without a usable number are returned unchanged.
pub fn display_name(descriptor: &DatasetDescriptor, case_name: &str) -> String {
    match &descriptor.case_naming {
        CaseNaming::NumericSuffix { prefix, width } => match case_number(prefix, case_name) {
            Ok(Some(n)) => numbered(prefix, n, *width),
            _ => case_name.to_string(),
        },
        CaseNaming::Sequential { .. } => case_name.to_string(),
    }
}

fn require(path: &Path, what: &str) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::NotFound(format!("{} {} does not exist", what, path.display())))
    }
}

/// Copies planned by a validated insertion
struct InsertPlan {
    case_id: String,
    copies: Vec<(PathBuf, PathBuf)>,
    entry: TrainingEntry,
    manifest: Manifest,
    manifest_path: PathBuf,
}

fn plan(
    dataset_dir: &Path,
    descriptor: &DatasetDescriptor,
    source_case: &str,
    label_path: &Path,
    channels: &[CaseChannel],
) -> Result<InsertPlan> {
    let images_dir = dataset_dir.join("imagesTr");
    let labels_dir = dataset_dir.join("labelsTr");
    let manifest_path = dataset_dir.join(MANIFEST_FILE);

    require(&images_dir, "Required folder")?;
    require(&labels_dir, "Required folder")?;
    require(&manifest_path, "Manifest")?;
    require(label_path, "Label volume")?;

    let manifest = Manifest::load(&manifest_path)?;
    let ending = manifest
        .rest
        .get("file_ending")
        .and_then(|v| v.as_str())
        .unwrap_or(&descriptor.file_ending)
        .to_string();

    let case_id = derive_case_id(descriptor, source_case, &manifest)?;

    let label_name = format!("{}{}", case_id, ending);
    let mut copies = vec![(label_path.to_path_buf(), labels_dir.join(&label_name))];

    for ch in 0..descriptor.channel_count() as u32 {
        let registered = channels.iter().find(|c| c.channel == ch).ok_or_else(|| {
            Error::NotFound(format!(
                "No raw file registered for case {} channel {:04}",
                source_case, ch
            ))
        })?;
        let src = PathBuf::from(&registered.raw_path);
        require(&src, "Raw channel file")?;
        copies.push((src, images_dir.join(format!("{}_{:04}{}", case_id, ch, ending))));
    }

    let entry = TrainingEntry {
        image: format!("./imagesTr/{}_0000{}", case_id, ending),
        label: format!("./labelsTr/{}", label_name),
        extra: serde_json::Map::new(),
    };

    Ok(InsertPlan {
        case_id,
        copies,
        entry,
        manifest,
        manifest_path,
    })
}

/// Sibling of `dest` a copy is written to before it replaces `dest`
fn partial_path(dest: &Path) -> PathBuf {
    let name = dest.file_name().and_then(|n| n.to_str()).unwrap_or("case");
    dest.with_file_name(format!(".{}.partial", name))
}

fn discard_partials(staged: &[(PathBuf, &Path)]) {
    for (partial, _) in staged {
        if partial.exists() {
            if let Err(e) = fs::remove_file(partial) {
                warn!("Failed to remove {}: {}", partial.display(), e);
            }
        }
    }
}

/// Insert one corrected case. Returns the case id it was stored under.
///
/// `channels` are the case-registry rows of the source case; every channel
/// the dataset declares must be present.
pub fn insert_case(
    dataset_dir: &Path,
    descriptor: &DatasetDescriptor,
    source_case: &str,
    label_path: &Path,
    channels: &[CaseChannel],
) -> Result<String> {
    let InsertPlan {
        case_id,
        copies,
        entry,
        mut manifest,
        manifest_path,
    } = plan(dataset_dir, descriptor, source_case, label_path, channels)?;

    // Files already in the dataset are only replaced once every copy landed
    let mut staged: Vec<(PathBuf, &Path)> = Vec::with_capacity(copies.len());
    for (src, dest) in &copies {
        let partial = partial_path(dest);
        debug!(src = %src.display(), dest = %dest.display(), "Copying case file");
        if let Err(e) = fs::copy(src, &partial) {
            staged.push((partial, dest.as_path()));
            discard_partials(&staged);
            return Err(e.into());
        }
        staged.push((partial, dest.as_path()));
    }
    for (i, (partial, dest)) in staged.iter().enumerate() {
        if let Err(e) = fs::rename(partial, dest) {
            discard_partials(&staged[i..]);
            return Err(e.into());
        }
    }

    manifest.upsert(entry);
    manifest.save(&manifest_path)?;

    info!(
        case_id = %case_id,
        dataset = %descriptor.id,
        num_training = manifest.num_training,
        "Inserted corrected case"
    );
    Ok(case_id)
}

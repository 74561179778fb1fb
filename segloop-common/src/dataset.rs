//! Dataset descriptors
//!
//! A [`DatasetDescriptor`] is the single source for everything that varies
//! between training datasets: label table, channel count, file ending and
//! the case naming convention. Handlers look one up in the
//! [`DatasetRegistry`] once and pass it down; nothing below the HTTP layer
//! consults a global table.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One foreground label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub id: u8,
    pub name: String,
    /// Display colour for the annotation platform (`#RRGGBB`)
    #[serde(default = "default_label_color")]
    pub color: String,
}

fn default_label_color() -> String {
    "#FF00FF".to_string()
}

/// How a corrected case is named inside the training dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaseNaming {
    /// Number taken from the source case name, e.g. `"la_3"` or
    /// `"patient_la_003"` becomes `la_003`.
    NumericSuffix { prefix: String, width: usize },
    /// Next number after the manifest's current training count
    /// (`0007`, or `<prefix>_0007` when a prefix is set).
    Sequential {
        #[serde(default)]
        prefix: Option<String>,
        width: usize,
    },
}

/// Everything that distinguishes one training dataset from another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Folder name under `nnUNet_raw`, e.g. `Dataset002_Heart`
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub licence: String,
    #[serde(default)]
    pub release: String,
    /// Channel (modality) names, in channel order
    pub channels: Vec<String>,
    /// Foreground labels; background (0) is implicit
    pub labels: Vec<LabelSpec>,
    #[serde(default = "default_file_ending")]
    pub file_ending: String,
    pub case_naming: CaseNaming,
    /// Case-name prefixes that identify uploads belonging to this dataset
    #[serde(default)]
    pub detect_prefixes: Vec<String>,
}

fn default_file_ending() -> String {
    ".nii.gz".to_string()
}

impl DatasetDescriptor {
    /// Multi-channel brain tumour dataset (four MRI modalities)
    pub fn brain_tumour() -> Self {
        Self {
            id: "Dataset001_BrainTumour".to_string(),
            name: "BRATS".to_string(),
            description: "Gliomas segmentation tumour and oedema in brain images".to_string(),
            reference: "https://www.med.upenn.edu/sbia/brats2017.html".to_string(),
            licence: "CC-BY-SA 4.0".to_string(),
            release: "2.0 04/05/2018".to_string(),
            channels: vec![
                "FLAIR".to_string(),
                "T1w".to_string(),
                "t1gd".to_string(),
                "T2w".to_string(),
            ],
            labels: vec![
                label(1, "edema", "#00FF00"),
                label(2, "non-enhancing tumor", "#0000FF"),
                label(3, "enhancing tumour", "#FFFF00"),
            ],
            file_ending: default_file_ending(),
            case_naming: CaseNaming::NumericSuffix {
                prefix: "BRATS".to_string(),
                width: 3,
            },
            detect_prefixes: vec!["BRATS".to_string(), "brats".to_string()],
        }
    }

    /// Single-channel left atrium dataset
    pub fn heart() -> Self {
        Self {
            id: "Dataset002_Heart".to_string(),
            name: "Heart".to_string(),
            description: "Left atrium segmentation in cardiac MRI".to_string(),
            reference: "Heart dataset reference".to_string(),
            licence: "CC-BY-SA 4.0".to_string(),
            release: "1.0".to_string(),
            channels: vec!["image".to_string()],
            labels: vec![label(1, "left_atrium", "#FF0000")],
            file_ending: default_file_ending(),
            case_naming: CaseNaming::NumericSuffix {
                prefix: "la".to_string(),
                width: 3,
            },
            detect_prefixes: vec!["la_".to_string()],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len().max(1)
    }

    /// Label name for a foreground id
    pub fn label_name(&self, id: u8) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.id == id)
            .map(|l| l.name.as_str())
    }

    /// Label id → name table (background excluded)
    pub fn label_table(&self) -> BTreeMap<u8, String> {
        self.labels
            .iter()
            .map(|l| (l.id, l.name.clone()))
            .collect()
    }

    /// True when a case name carries one of this dataset's prefixes
    pub fn matches_case_name(&self, case_name: &str) -> bool {
        self.detect_prefixes
            .iter()
            .any(|p| case_name.starts_with(p.as_str()))
    }

    /// Check internal consistency (non-empty id, unique non-zero labels)
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("Dataset id must not be empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for l in &self.labels {
            if l.id == 0 {
                return Err(Error::Config(format!(
                    "Dataset {}: label {:?} uses reserved background id 0",
                    self.id, l.name
                )));
            }
            if !seen.insert(l.id) {
                return Err(Error::Config(format!(
                    "Dataset {}: duplicate label id {}",
                    self.id, l.id
                )));
            }
        }
        Ok(())
    }
}

fn label(id: u8, name: &str, color: &str) -> LabelSpec {
    LabelSpec {
        id,
        name: name.to_string(),
        color: color.to_string(),
    }
}

/// Known datasets keyed by id
#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    datasets: BTreeMap<String, DatasetDescriptor>,
    default_id: String,
}

impl DatasetRegistry {
    /// Built-in datasets plus configured extras (extras replace built-ins
    /// with the same id)
    pub fn new(extra: Vec<DatasetDescriptor>, default_id: &str) -> Result<Self> {
        let mut datasets = BTreeMap::new();
        for d in [DatasetDescriptor::brain_tumour(), DatasetDescriptor::heart()]
            .into_iter()
            .chain(extra)
        {
            d.validate()?;
            datasets.insert(d.id.clone(), d);
        }

        if !datasets.contains_key(default_id) {
            return Err(Error::Config(format!(
                "Default dataset {} is not defined",
                default_id
            )));
        }

        Ok(Self {
            datasets,
            default_id: default_id.to_string(),
        })
    }

    pub fn builtin() -> Self {
        let mut datasets = BTreeMap::new();
        for d in [DatasetDescriptor::brain_tumour(), DatasetDescriptor::heart()] {
            datasets.insert(d.id.clone(), d);
        }
        Self {
            datasets,
            default_id: "Dataset001_BrainTumour".to_string(),
        }
    }

    pub fn get(&self, id: &str) -> Result<&DatasetDescriptor> {
        self.datasets
            .get(id)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown dataset: {}", id)))
    }

    pub fn default_dataset(&self) -> &DatasetDescriptor {
        // new() guarantees presence; builtin() uses a built-in id
        &self.datasets[&self.default_id]
    }

    /// First dataset whose detection prefixes match any of the case names
    pub fn detect<'a, I>(&self, case_names: I) -> Option<&DatasetDescriptor>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names: Vec<&str> = case_names.into_iter().collect();
        self.datasets
            .values()
            .find(|d| names.iter().any(|n| d.matches_case_name(n)))
    }

    /// Explicit id if given, else detection, else the default
    pub fn resolve<'a, I>(&self, requested: Option<&str>, case_names: I) -> Result<&DatasetDescriptor>
    where
        I: IntoIterator<Item = &'a str>,
    {
        match requested {
            Some(id) if !id.is_empty() => self.get(id),
            _ => Ok(self
                .detect(case_names)
                .unwrap_or_else(|| self.default_dataset())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatasetDescriptor> {
        self.datasets.values()
    }
}

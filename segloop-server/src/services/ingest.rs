//! Upload ingestion
//!
//! An upload (ZIP archive or a single NIfTI file) becomes one job: a set of
//! cases, each with one or more channel volumes staged as nnU-Net input
//! `<case>_<channel>.nii.gz`, plus a directory of PNG slices for display.
//!
//! Archive contents are taken in this order, the first kind present wins:
//! 1. NIfTI files
//! 2. modality folders (names ending in four digits) holding PNG slices,
//!    one channel each, grouped into cases by parent folder
//! 3. plain folders of PNG slices, plus JPEG/TIFF folders converted to PNG,
//!    one single-channel case each

use segloop_common::db::{CaseChannel, JobStatus, Upload};
use segloop_common::{time, DatasetRegistry, Error, Result};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::convert::slices::{convert_images_to_png, list_png_files, slice_file_name};
use crate::convert::volume::{is_nifti_name, read_intensity_volume, strip_nifti_ext, write_intensity_volume};
use crate::convert::{png_dir_to_volume, volume_to_png_dir, SliceStyle};
use crate::db;
use crate::services::nnunet::PredictConfig;
use crate::workspace::{sanitize_case_name, Workspace};

/// Extracted archive contents may be this many times the upload limit
const MAX_EXPANSION: u64 = 8;

/// Trailing four-digit channel/modality code of a name
fn four_digit_suffix(name: &str) -> Option<u32> {
    let tail = name.get(name.len().checked_sub(4)?..)?;
    if tail.bytes().all(|b| b.is_ascii_digit()) {
        tail.parse().ok()
    } else {
        None
    }
}

/// `la_003_0001` → (`la_003`, 1); names without a channel suffix are channel 0
pub fn split_channel(stem: &str) -> (String, u32) {
    if let Some((case, code)) = stem.rsplit_once('_') {
        if code.len() == 4 && !case.is_empty() {
            if let Some(channel) = four_digit_suffix(code) {
                return (case.to_string(), channel);
            }
        }
    }
    (stem.to_string(), 0)
}

/// One staged channel file
#[derive(Debug, Clone)]
pub struct StagedChannel {
    pub channel: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StagedCase {
    pub case_name: String,
    pub channels: Vec<StagedChannel>,
    /// Display slices (from the lowest channel)
    pub png_dir: PathBuf,
    /// Copies under `uploads/niftis`
    pub nifti_paths: Vec<PathBuf>,
}

/// Result of unpacking one upload
#[derive(Debug, Clone)]
pub struct StagedUpload {
    pub job_id: String,
    pub inference_dir: PathBuf,
    pub cases: Vec<StagedCase>,
}

impl StagedUpload {
    pub fn case_names(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(|c| c.case_name.as_str())
    }
}

/// Tracks everything created so a failed ingestion leaves nothing behind
struct Stager<'a> {
    ws: &'a Workspace,
    job_id: &'a str,
    inference_dir: PathBuf,
    extract_dir: PathBuf,
    created: Vec<PathBuf>,
    case_names: HashSet<String>,
}

impl<'a> Stager<'a> {
    fn new(ws: &'a Workspace, job_id: &'a str) -> Result<Self> {
        let inference_dir = ws.inference_input_dir(job_id);
        if let Some(parent) = inference_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir(&inference_dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::Conflict(format!("Job {} already exists", job_id))
            } else {
                Error::Io(e)
            }
        })?;

        let extract_dir = ws.extract_dir(job_id);
        if extract_dir.exists() {
            std::fs::remove_dir_all(&extract_dir)?;
        }
        std::fs::create_dir_all(&extract_dir)?;

        Ok(Self {
            ws,
            job_id,
            inference_dir,
            extract_dir,
            created: Vec::new(),
            case_names: HashSet::new(),
        })
    }

    fn claim_case_name(&mut self, raw: &str) -> Result<String> {
        let name = sanitize_case_name(raw);
        if !self.case_names.insert(name.clone()) {
            return Err(Error::InvalidInput(format!(
                "Upload contains case {} more than once",
                name
            )));
        }
        Ok(name)
    }

    /// Case name for images sitting directly in `dir`
    fn folder_case_name(&self, dir: &Path) -> String {
        if dir == self.extract_dir {
            self.job_id.to_string()
        } else {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.job_id.to_string())
        }
    }

    fn unpack(&mut self, upload: &Path, original_name: &str, max_bytes: u64) -> Result<()> {
        if is_nifti_name(original_name) {
            let file_name = Path::new(original_name)
                .file_name()
                .map(|n| n.to_os_string())
                .ok_or_else(|| Error::InvalidInput(format!("Bad file name {:?}", original_name)))?;
            std::fs::copy(upload, self.extract_dir.join(file_name))?;
            return Ok(());
        }
        extract_zip(upload, &self.extract_dir, max_bytes.saturating_mul(MAX_EXPANSION))
    }

    fn stage(&mut self) -> Result<Vec<StagedCase>> {
        let scan = scan_tree(&self.extract_dir);

        let modality: Vec<&PathBuf> = scan
            .png_dirs
            .iter()
            .filter(|d| is_modality_folder(d))
            .collect();
        let mut cases = if !scan.nifti_files.is_empty() {
            self.stage_niftis(&scan.nifti_files)?
        } else if !modality.is_empty() {
            self.stage_modality_folders(&modality)?
        } else {
            let mut cases = Vec::new();
            for dir in &scan.png_dirs {
                let raw = self.folder_case_name(dir);
                let case_name = self.claim_case_name(&raw)?;
                cases.push(self.stage_png_case(&case_name, &[(0, dir.as_path())])?);
            }
            cases
        };

        // JPEG/TIFF folders become extra cases whatever else the archive holds
        let converted_root = self.extract_dir.join(".converted");
        for dir in &scan.other_image_dirs {
            let raw = format!("{}_converted", self.folder_case_name(dir));
            let dest = converted_root.join(&raw);
            if convert_images_to_png(dir, &dest)? == 0 {
                continue;
            }
            let case_name = self.claim_case_name(&raw)?;
            cases.push(self.stage_png_case(&case_name, &[(0, dest.as_path())])?);
        }
        Ok(cases)
    }

    fn stage_niftis(&mut self, files: &[PathBuf]) -> Result<Vec<StagedCase>> {
        let mut grouped: BTreeMap<String, Vec<(u32, &PathBuf)>> = BTreeMap::new();
        for file in files {
            let name = file_name_of(file);
            let (case, channel) = split_channel(strip_nifti_ext(&name));
            grouped
                .entry(sanitize_case_name(&case))
                .or_default()
                .push((channel, file));
        }

        let mut cases = Vec::new();
        for (case_name, mut channels) in grouped {
            let case_name = self.claim_case_name(&case_name)?;
            channels.sort_by_key(|(ch, _)| *ch);

            let mut staged = Vec::new();
            let mut nifti_paths = Vec::new();
            for (i, (channel, src)) in channels.iter().enumerate() {
                if staged.iter().any(|s: &StagedChannel| s.channel == *channel) {
                    return Err(Error::InvalidInput(format!(
                        "Case {} has channel {:04} more than once",
                        case_name, channel
                    )));
                }
                let ext = nifti_ext(&file_name_of(src));
                let dest = self
                    .inference_dir
                    .join(format!("{}_{:04}{}", case_name, channel, ext));
                std::fs::copy(src, &dest)?;
                staged.push(StagedChannel {
                    channel: *channel,
                    path: dest,
                });

                let copy = self.ws.upload_niftis_dir().join(format!(
                    "{}_{}_{:04}{}",
                    self.job_id, case_name, channel, ext
                ));
                std::fs::copy(src, &copy)?;
                self.created.push(copy.clone());
                nifti_paths.push(copy);

                if i == 0 {
                    let png_dir = self.ws.upload_png_dir(self.job_id, &case_name);
                    self.created.push(png_dir.clone());
                    let volume = read_intensity_volume(src)?;
                    volume_to_png_dir(&volume, &png_dir, SliceStyle::grey())?;
                }
            }

            tracing::debug!(job_id = self.job_id, case = %case_name, channels = staged.len(), "Staged NIfTI case");
            cases.push(StagedCase {
                png_dir: self.ws.upload_png_dir(self.job_id, &case_name),
                case_name,
                channels: staged,
                nifti_paths,
            });
        }
        Ok(cases)
    }

    fn stage_modality_folders(&mut self, folders: &[&PathBuf]) -> Result<Vec<StagedCase>> {
        let mut grouped: BTreeMap<String, Vec<(u32, &Path)>> = BTreeMap::new();
        for folder in folders {
            let name = file_name_of(folder);
            let channel = four_digit_suffix(&name).unwrap_or(0);
            let parent = folder.parent().unwrap_or(&self.extract_dir);
            let case = self.folder_case_name(parent);
            grouped.entry(case).or_default().push((channel, folder.as_path()));
        }

        let mut cases = Vec::new();
        for (raw, mut channels) in grouped {
            let case_name = self.claim_case_name(&raw)?;
            channels.sort_by_key(|(ch, _)| *ch);
            if channels.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(Error::InvalidInput(format!(
                    "Case {} has two folders for the same channel",
                    case_name
                )));
            }
            cases.push(self.stage_png_case(&case_name, &channels)?);
        }
        Ok(cases)
    }

    /// Convert PNG folders (one per channel) into channel volumes
    fn stage_png_case(&mut self, case_name: &str, channels: &[(u32, &Path)]) -> Result<StagedCase> {
        let png_dir = self.ws.upload_png_dir(self.job_id, case_name);
        let mut staged = Vec::new();
        let mut nifti_paths = Vec::new();

        for (i, (channel, folder)) in channels.iter().enumerate() {
            let volume = png_dir_to_volume(folder)?;

            let dest = self
                .inference_dir
                .join(format!("{}_{:04}.nii.gz", case_name, channel));
            write_intensity_volume(&dest, &volume)?;
            staged.push(StagedChannel {
                channel: *channel,
                path: dest.clone(),
            });

            let copy = self.ws.upload_niftis_dir().join(format!(
                "{}_{}_{:04}.nii.gz",
                self.job_id, case_name, channel
            ));
            std::fs::copy(&dest, &copy)?;
            self.created.push(copy.clone());
            nifti_paths.push(copy);

            if i == 0 {
                self.created.push(png_dir.clone());
                copy_pngs(folder, &png_dir)?;
            }
        }

        tracing::debug!(job_id = self.job_id, case = %case_name, channels = staged.len(), "Staged PNG case");
        Ok(StagedCase {
            case_name: case_name.to_string(),
            channels: staged,
            png_dir,
            nifti_paths,
        })
    }

    fn discard(&self) {
        for path in self.created.iter().chain([&self.inference_dir]) {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            if let Err(e) = result {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to clean up after ingestion error");
                }
            }
        }
    }
}

impl Drop for Stager<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.extract_dir);
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn nifti_ext(name: &str) -> &'static str {
    if name.to_ascii_lowercase().ends_with(".gz") {
        ".nii.gz"
    } else {
        ".nii"
    }
}

fn is_modality_folder(dir: &Path) -> bool {
    dir.file_name()
        .and_then(|n| n.to_str())
        .map(|n| four_digit_suffix(n).is_some())
        .unwrap_or(false)
}

/// Copy a slice folder, renaming slices to `slice_NNNN.png` in sorted order
/// so the copy lines up with the volume built from it.
fn copy_pngs(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for (i, file) in list_png_files(src)?.iter().enumerate() {
        std::fs::copy(file, dest.join(slice_file_name(i)))?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct TreeScan {
    nifti_files: Vec<PathBuf>,
    png_dirs: Vec<PathBuf>,
    other_image_dirs: Vec<PathBuf>,
}

fn has_ext(name: &str, exts: &[&str]) -> bool {
    let lower = name.to_ascii_lowercase();
    exts.iter().any(|e| lower.ends_with(e))
}

/// Walk the extracted tree, skipping hidden entries and macOS metadata
fn scan_tree(root: &Path) -> TreeScan {
    let mut scan = TreeScan::default();
    let mut png_dirs = BTreeMap::new();
    let mut other_dirs = BTreeMap::new();

    let entries = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || {
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && name != "__MACOSX"
            }
        })
        .filter_map(|e| e.ok());

    for entry in entries {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let parent = entry.path().parent().unwrap_or(root).to_path_buf();
        if is_nifti_name(&name) {
            scan.nifti_files.push(entry.path().to_path_buf());
        } else if has_ext(&name, &[".png"]) {
            png_dirs.insert(parent, ());
        } else if has_ext(&name, &[".jpg", ".jpeg", ".tif", ".tiff"]) {
            other_dirs.insert(parent, ());
        }
    }

    scan.png_dirs = png_dirs.into_keys().collect();
    scan.other_image_dirs = other_dirs.into_keys().collect();
    scan
}

/// Extract a ZIP archive; entries that would land outside `dest` are rejected
pub fn extract_zip(archive_path: &Path, dest: &Path, max_total_bytes: u64) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::InvalidInput(format!("Not a valid ZIP archive: {}", e)))?;

    let mut total = 0u64;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::InvalidInput(format!("Corrupt ZIP entry {}: {}", i, e)))?;

        let relative = entry.enclosed_name().ok_or_else(|| {
            Error::InvalidInput(format!("Archive entry {:?} escapes the extraction folder", entry.name()))
        })?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        total = total.saturating_add(entry.size());
        if total > max_total_bytes {
            return Err(Error::InvalidInput(format!(
                "Archive expands beyond {} bytes",
                max_total_bytes
            )));
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Unpack `upload` into the workspace for `job_id`. Blocking.
///
/// On error every directory and file created for the job is removed. The
/// extraction folder is always removed.
pub fn stage_upload(
    ws: &Workspace,
    job_id: &str,
    upload: &Path,
    original_name: &str,
    max_upload_bytes: u64,
) -> Result<StagedUpload> {
    let mut stager = Stager::new(ws, job_id)?;

    let result = stager
        .unpack(upload, original_name, max_upload_bytes)
        .and_then(|_| stager.stage())
        .and_then(|cases| {
            if cases.is_empty() {
                Err(Error::InvalidInput(
                    "No valid PNG slices or NIfTI files found in uploaded archive".to_string(),
                ))
            } else {
                Ok(cases)
            }
        });

    match result {
        Ok(cases) => Ok(StagedUpload {
            job_id: job_id.to_string(),
            inference_dir: stager.inference_dir.clone(),
            cases,
        }),
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Ingestion failed, removing staged files");
            stager.discard();
            Err(e)
        }
    }
}

/// Parameters of one upload request
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub job_id: String,
    pub original_name: String,
    /// Where the received bytes were saved
    pub stored_path: PathBuf,
    pub config: PredictConfig,
    pub username: Option<String>,
    pub dataset: Option<String>,
}

/// What the client gets back
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestSummary {
    pub job_id: String,
    pub config: String,
    pub dataset: String,
    pub cases: Vec<String>,
    pub inference_dir: String,
    pub nifti_paths: Vec<String>,
    pub png_dirs: Vec<String>,
}

/// Register the job, stage the files, record the case registry
pub async fn ingest_upload(
    pool: &SqlitePool,
    ws: &Workspace,
    registry: &DatasetRegistry,
    max_upload_bytes: u64,
    request: UploadRequest,
) -> Result<IngestSummary> {
    if let Some(id) = request.dataset.as_deref().filter(|d| !d.is_empty()) {
        if let Err(e) = registry.get(id) {
            let _ = std::fs::remove_file(&request.stored_path);
            return Err(e);
        }
    }

    // The job store's primary key is the first guard against reuse
    let registered = db::jobs::insert_upload(
        pool,
        &Upload {
            job_id: request.job_id.clone(),
            username: request.username.clone(),
            archive_name: request.original_name.clone(),
            config: request.config.as_str().to_string(),
            dataset_id: registry.default_dataset().id.clone(),
            status: JobStatus::Processing,
            created_at: time::now_ms(),
        },
    )
    .await;
    if let Err(e) = registered {
        let _ = std::fs::remove_file(&request.stored_path);
        return Err(e);
    }

    let staged = {
        let ws = ws.clone();
        let job_id = request.job_id.clone();
        let upload = request.stored_path.clone();
        let name = request.original_name.clone();
        tokio::task::spawn_blocking(move || {
            let result = stage_upload(&ws, &job_id, &upload, &name, max_upload_bytes);
            let _ = std::fs::remove_file(&upload);
            result
        })
        .await
        .map_err(|e| Error::Internal(format!("Ingestion task failed: {}", e)))
        .and_then(|r| r)
    };

    let staged = match staged {
        Ok(staged) => staged,
        Err(e) => {
            // A conflicting directory belongs to someone else; only our row goes
            db::jobs::delete_upload(pool, &request.job_id).await?;
            return Err(e);
        }
    };

    let dataset = registry.resolve(request.dataset.as_deref(), staged.case_names())?;

    let job_id = staged.job_id.as_str();
    let rows: Vec<CaseChannel> = staged
        .cases
        .iter()
        .flat_map(|case| {
            case.channels.iter().map(move |ch| CaseChannel {
                job_id: job_id.to_string(),
                case_name: case.case_name.clone(),
                channel: ch.channel,
                dataset_id: dataset.id.clone(),
                raw_path: ch.path.display().to_string(),
                png_dir: Some(case.png_dir.display().to_string()),
            })
        })
        .collect();
    db::cases::insert_channels(pool, &rows).await?;
    db::jobs::complete_upload(pool, &staged.job_id, &dataset.id).await?;

    if dataset.channel_count() > 1 {
        for case in &staged.cases {
            if case.channels.len() < dataset.channel_count() {
                tracing::warn!(
                    job_id = %staged.job_id,
                    case = %case.case_name,
                    channels = case.channels.len(),
                    expected = dataset.channel_count(),
                    "Case has fewer channels than the dataset expects"
                );
            }
        }
    }

    tracing::info!(
        job_id = %staged.job_id,
        dataset = %dataset.id,
        cases = staged.cases.len(),
        "Upload ingested"
    );

    Ok(IngestSummary {
        job_id: staged.job_id.clone(),
        config: request.config.as_str().to_string(),
        dataset: dataset.id.clone(),
        cases: staged.cases.iter().map(|c| c.case_name.clone()).collect(),
        inference_dir: staged.inference_dir.display().to_string(),
        nifti_paths: staged
            .cases
            .iter()
            .flat_map(|c| c.nifti_paths.iter().map(|p| p.display().to_string()))
            .collect(),
        png_dirs: staged
            .cases
            .iter()
            .map(|c| c.png_dir.display().to_string())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::slices::save_grey;
    use ndarray::Array2;
    use std::io::Write;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure().unwrap();
        (dir, ws)
    }

    fn png_bytes(value: u8) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.png");
        let mut slice = Array2::<u8>::zeros((4, 5));
        slice[[1, 2]] = value;
        save_grey(&path, &slice).unwrap();
        std::fs::read(path).unwrap()
    }

    fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, bytes) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_split_channel() {
        assert_eq!(split_channel("la_003_0000"), ("la_003".to_string(), 0));
        assert_eq!(split_channel("BRATS_001_0003"), ("BRATS_001".to_string(), 3));
        assert_eq!(split_channel("la_003"), ("la_003".to_string(), 0));
    }

    #[test]
    fn test_png_folders_become_cases() {
        let (_dir, ws) = workspace();
        let archive = ws.archives_dir().join("scan.zip");
        write_zip(
            &archive,
            &[
                ("caseA/slice_0.png", png_bytes(10)),
                ("caseA/slice_1.png", png_bytes(20)),
                ("caseB/img.png", png_bytes(30)),
            ],
        );

        let staged = stage_upload(&ws, "scan", &archive, "scan.zip", 1 << 20).unwrap();

        let names: Vec<&str> = staged.case_names().collect();
        assert_eq!(names, vec!["caseA", "caseB"]);
        assert!(staged.inference_dir.join("caseA_0000.nii.gz").is_file());
        assert!(ws.upload_png_dir("scan", "caseA").join("slice_0001.png").is_file());
        assert!(ws.upload_png_dir("scan", "caseB").join("slice_0000.png").is_file());
        assert!(!ws.upload_png_dir("scan", "caseB").join("img.png").exists());
        assert!(ws.upload_niftis_dir().join("scan_caseB_0000.nii.gz").is_file());
        assert!(!ws.extract_dir("scan").exists());
    }

    #[test]
    fn test_modality_folders_group_into_one_case() {
        let (_dir, ws) = workspace();
        let archive = ws.archives_dir().join("brain.zip");
        write_zip(
            &archive,
            &[
                ("BRATS_006/BRATS_006_0000/a.png", png_bytes(1)),
                ("BRATS_006/BRATS_006_0001/a.png", png_bytes(2)),
                ("BRATS_006/BRATS_006_0002/a.png", png_bytes(3)),
                ("BRATS_006/BRATS_006_0003/a.png", png_bytes(4)),
            ],
        );

        let staged = stage_upload(&ws, "brain", &archive, "brain.zip", 1 << 20).unwrap();

        assert_eq!(staged.cases.len(), 1);
        let case = &staged.cases[0];
        assert_eq!(case.case_name, "BRATS_006");
        let channels: Vec<u32> = case.channels.iter().map(|c| c.channel).collect();
        assert_eq!(channels, vec![0, 1, 2, 3]);
        assert!(staged.inference_dir.join("BRATS_006_0003.nii.gz").is_file());
    }

    #[test]
    fn test_jpeg_folders_are_converted() {
        let (_dir, ws) = workspace();
        let mut jpeg = Vec::new();
        image::RgbImage::from_pixel(4, 4, image::Rgb([90, 90, 90]))
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        let archive = ws.archives_dir().join("photos.zip");
        write_zip(&archive, &[("shots/a.jpg", jpeg)]);

        let staged = stage_upload(&ws, "photos", &archive, "photos.zip", 1 << 20).unwrap();

        assert_eq!(staged.case_names().collect::<Vec<_>>(), vec!["shots_converted"]);
        assert!(ws.upload_png_dir("photos", "shots_converted").join("slice_0000.png").is_file());
    }

    #[test]
    fn test_jpeg_folders_convert_alongside_niftis() {
        // Given: An archive with a NIfTI case and a folder of JPEG slices
        let (_dir, ws) = workspace();
        let scratch = tempfile::tempdir().unwrap();
        let nifti = scratch.path().join("la_004_0000.nii.gz");
        write_intensity_volume(&nifti, &ndarray::Array3::<f32>::from_elem((4, 4, 2), 7.0)).unwrap();
        let mut jpeg = Vec::new();
        image::RgbImage::from_pixel(4, 4, image::Rgb([90, 90, 90]))
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        let archive = ws.archives_dir().join("mixed.zip");
        write_zip(
            &archive,
            &[
                ("la_004_0000.nii.gz", std::fs::read(&nifti).unwrap()),
                ("shots/a.jpg", jpeg),
            ],
        );

        // When: Staging it
        let staged = stage_upload(&ws, "mixed", &archive, "mixed.zip", 1 << 20).unwrap();

        // Then: Both become cases
        assert_eq!(
            staged.case_names().collect::<Vec<_>>(),
            vec!["la_004", "shots_converted"]
        );
        assert!(staged.inference_dir.join("la_004_0000.nii.gz").is_file());
        assert!(staged.inference_dir.join("shots_converted_0000.nii.gz").is_file());
    }

    #[test]
    fn test_empty_archive_leaves_nothing_behind() {
        let (_dir, ws) = workspace();
        let archive = ws.archives_dir().join("empty.zip");
        write_zip(&archive, &[("readme.txt", b"nothing here".to_vec())]);

        let err = stage_upload(&ws, "empty", &archive, "empty.zip", 1 << 20).unwrap_err();

        assert!(matches!(err, Error::InvalidInput(msg) if msg.contains("No valid")));
        assert!(!ws.inference_input_dir("empty").exists());
        assert!(!ws.extract_dir("empty").exists());
    }

    #[test]
    fn test_existing_job_directory_is_conflict() {
        let (_dir, ws) = workspace();
        std::fs::create_dir_all(ws.inference_input_dir("taken")).unwrap();
        let archive = ws.archives_dir().join("taken.zip");
        write_zip(&archive, &[("a/x.png", png_bytes(5))]);

        let err = stage_upload(&ws, "taken", &archive, "taken.zip", 1 << 20).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        // The other job's directory is untouched
        assert!(ws.inference_input_dir("taken").is_dir());
    }

    #[test]
    fn test_oversized_archive_rejected() {
        let (_dir, ws) = workspace();
        let archive = ws.archives_dir().join("big.zip");
        write_zip(&archive, &[("a/x.png", vec![0u8; 4096])]);

        let err = stage_upload(&ws, "big", &archive, "big.zip", 16).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(msg) if msg.contains("expands")));
        assert!(!ws.inference_input_dir("big").exists());
    }

    #[test]
    fn test_not_a_zip() {
        let (_dir, ws) = workspace();
        let archive = ws.archives_dir().join("junk.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();
        let err = stage_upload(&ws, "junk", &archive, "junk.zip", 1 << 20).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}

//! nnU-Net v2 command-line invocations
//!
//! Prediction runs with `-f all --disable_tta`. Training first plans and
//! preprocesses the dataset, then trains the requested fold.

use segloop_common::config::NnunetConfig;
use segloop_common::{Error, Result};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::tool_runner::{ToolCommand, ToolOutput, ToolRunner};

/// Inference configuration accepted by `nnUNetv2_predict -c`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictConfig {
    TwoD,
    ThreeDFullres,
}

impl PredictConfig {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictConfig::TwoD => "2d",
            PredictConfig::ThreeDFullres => "3d_fullres",
        }
    }
}

impl Default for PredictConfig {
    fn default() -> Self {
        PredictConfig::ThreeDFullres
    }
}

impl fmt::Display for PredictConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "2d" => Ok(PredictConfig::TwoD),
            "3d_fullres" => Ok(PredictConfig::ThreeDFullres),
            other => Err(Error::InvalidInput(format!(
                "Invalid configuration {:?}, expected 2d or 3d_fullres",
                other
            ))),
        }
    }
}

/// Training resolution accepted by `nnUNetv2_train`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainResolution {
    TwoD,
    ThreeD,
    ThreeDFullres,
}

impl TrainResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainResolution::TwoD => "2d",
            TrainResolution::ThreeD => "3d",
            TrainResolution::ThreeDFullres => "3d_fullres",
        }
    }
}

impl FromStr for TrainResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "2d" => Ok(TrainResolution::TwoD),
            "3d" => Ok(TrainResolution::ThreeD),
            "3d_fullres" => Ok(TrainResolution::ThreeDFullres),
            _ => Err(Error::InvalidInput(
                "resolution must be one of 2d, 3d, 3d_fullres".to_string(),
            )),
        }
    }
}

/// Cross-validation fold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    Index(u32),
    All,
}

impl fmt::Display for Fold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fold::Index(n) => write!(f, "{}", n),
            Fold::All => f.write_str("all"),
        }
    }
}

impl Fold {
    /// Accepts an integer or the string `"all"` (numeric strings too)
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let invalid = || Error::InvalidInput("folds must be an integer or 'all'".to_string());
        match value {
            serde_json::Value::String(s) if s == "all" => Ok(Fold::All),
            serde_json::Value::String(s) => s.trim().parse().map(Fold::Index).map_err(|_| invalid()),
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Fold::Index)
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

pub const DEFAULT_TRAINER: &str = "nnUNetTrainer_1epoch";

/// Builds and runs nnU-Net commands against one configured installation
#[derive(Debug, Clone)]
pub struct Nnunet {
    config: NnunetConfig,
    root: std::path::PathBuf,
}

impl Nnunet {
    pub fn new(config: NnunetConfig, root: &Path) -> Self {
        Self {
            config,
            root: root.to_path_buf(),
        }
    }

    /// Directory holding `<dataset id>/imagesTr` etc.
    pub fn raw_dir(&self) -> std::path::PathBuf {
        self.config.raw_dir(&self.root)
    }

    fn base_command(&self, program: &str) -> ToolCommand {
        ToolCommand::new(program, self.config.timeout())
            .env("nnUNet_raw", self.config.raw_dir(&self.root).display().to_string())
            .env(
                "nnUNet_preprocessed",
                self.config.preprocessed_dir(&self.root).display().to_string(),
            )
            .env(
                "nnUNet_results",
                self.config.results_dir(&self.root).display().to_string(),
            )
    }

    pub fn predict_command(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        dataset_id: &str,
        config: PredictConfig,
    ) -> ToolCommand {
        self.base_command(&self.config.predict_bin)
            .arg("-i")
            .arg(input_dir.display().to_string())
            .arg("-o")
            .arg(output_dir.display().to_string())
            .arg("-d")
            .arg(dataset_id)
            .arg("-c")
            .arg(config.as_str())
            .arg("-f")
            .arg("all")
            .arg("--disable_tta")
    }

    pub fn plan_command(&self, dataset_number: u32) -> ToolCommand {
        self.base_command(&self.config.plan_bin)
            .arg("-d")
            .arg(dataset_number.to_string())
    }

    pub fn train_command(
        &self,
        dataset_number: u32,
        resolution: TrainResolution,
        fold: Fold,
        trainer: &str,
    ) -> ToolCommand {
        self.base_command(&self.config.train_bin)
            .arg(dataset_number.to_string())
            .arg(resolution.as_str())
            .arg(fold.to_string())
            .arg("-tr")
            .arg(trainer)
    }

    /// Run prediction over every volume in `input_dir`
    pub async fn predict(
        &self,
        runner: &dyn ToolRunner,
        input_dir: &Path,
        output_dir: &Path,
        dataset_id: &str,
        config: PredictConfig,
    ) -> Result<ToolOutput> {
        std::fs::create_dir_all(output_dir)?;
        let command = self.predict_command(input_dir, output_dir, dataset_id, config);
        runner.run(&command).await
    }

    /// Plan/preprocess, then train one fold
    pub async fn train(
        &self,
        runner: &dyn ToolRunner,
        dataset_number: u32,
        resolution: TrainResolution,
        fold: Fold,
        trainer: &str,
    ) -> Result<()> {
        let plan = self.plan_command(dataset_number);
        runner.run(&plan).await?;

        let train = self.train_command(dataset_number, resolution, fold, trainer);
        runner.run(&train).await?;

        tracing::info!(
            dataset = dataset_number,
            resolution = resolution.as_str(),
            fold = %fold,
            trainer,
            "Training run finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nnunet() -> Nnunet {
        Nnunet::new(NnunetConfig::default(), Path::new("/data/segloop"))
    }

    #[test]
    fn test_predict_command_arguments() {
        let cmd = nnunet().predict_command(
            Path::new("/in"),
            Path::new("/out"),
            "Dataset002_Heart",
            PredictConfig::TwoD,
        );
        assert_eq!(cmd.program, "nnUNetv2_predict");
        assert_eq!(
            cmd.args,
            vec!["-i", "/in", "-o", "/out", "-d", "Dataset002_Heart", "-c", "2d", "-f", "all", "--disable_tta"]
        );
        assert!(cmd
            .env
            .contains(&("nnUNet_raw".to_string(), "/data/segloop/nnUNet_raw".to_string())));
        assert_eq!(cmd.env.len(), 3);
    }

    #[test]
    fn test_train_command_arguments() {
        let cmd = nnunet().train_command(2, TrainResolution::ThreeD, Fold::Index(0), DEFAULT_TRAINER);
        assert_eq!(cmd.program, "nnUNetv2_train");
        assert_eq!(cmd.args, vec!["2", "3d", "0", "-tr", "nnUNetTrainer_1epoch"]);

        let plan = nnunet().plan_command(2);
        assert_eq!(plan.args, vec!["-d", "2"]);
    }

    #[test]
    fn test_config_parsing() {
        assert_eq!("2d".parse::<PredictConfig>().unwrap(), PredictConfig::TwoD);
        assert!("3d".parse::<PredictConfig>().is_err());
        assert_eq!("3d".parse::<TrainResolution>().unwrap(), TrainResolution::ThreeD);
        assert!("4d".parse::<TrainResolution>().is_err());
    }

    #[test]
    fn test_fold_parsing() {
        assert_eq!(Fold::from_json(&json!("all")).unwrap(), Fold::All);
        assert_eq!(Fold::from_json(&json!(3)).unwrap(), Fold::Index(3));
        assert_eq!(Fold::from_json(&json!("2")).unwrap(), Fold::Index(2));
        assert!(Fold::from_json(&json!("x")).is_err());
        assert!(Fold::from_json(&json!(-1)).is_err());
        assert!(Fold::from_json(&json!(null)).is_err());
    }
}

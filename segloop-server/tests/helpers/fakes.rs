//! In-memory CVAT and nnU-Net

use async_trait::async_trait;
use segloop_common::{Error, Result};
use segloop_server::convert::volume::{read_intensity_volume, strip_nifti_ext, write_label_volume};
use segloop_server::services::cvat_client::{AnnotationPlatform, NewTask, PlatformSession, RemoteTask};
use segloop_server::services::poller::PollPolicy;
use segloop_server::services::tool_runner::{ToolCommand, ToolOutput, ToolRunner};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Accepts any user with the configured password
pub struct FakeCvat {
    password: String,
    next_id: AtomicI64,
    pub created: Mutex<Vec<NewTask>>,
    tasks: Mutex<HashMap<i64, String>>,
    pub data: Mutex<HashMap<i64, Vec<u8>>>,
    pub annotations: Mutex<HashMap<i64, Vec<u8>>>,
}

impl FakeCvat {
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            next_id: AtomicI64::new(1),
            created: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            data: Mutex::new(HashMap::new()),
            annotations: Mutex::new(HashMap::new()),
        }
    }

    fn known(&self, task_id: i64) -> Result<()> {
        if self.tasks.lock().unwrap().contains_key(&task_id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Task {} not found", task_id)))
        }
    }
}

#[async_trait]
impl AnnotationPlatform for FakeCvat {
    async fn login(&self, username: &str, password: &str) -> Result<PlatformSession> {
        if password == self.password {
            Ok(PlatformSession {
                token: format!("token-{}", username),
            })
        } else {
            Err(Error::Unauthorized("Invalid credentials".to_string()))
        }
    }

    async fn current_user(&self, session: &PlatformSession) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "token": session.token }))
    }

    async fn create_task(&self, _session: &PlatformSession, task: &NewTask) -> Result<RemoteTask> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created.lock().unwrap().push(task.clone());
        self.tasks.lock().unwrap().insert(id, task.name.clone());
        Ok(RemoteTask {
            id,
            name: task.name.clone(),
            status: Some("annotation".to_string()),
        })
    }

    async fn upload_task_data(
        &self,
        _session: &PlatformSession,
        task_id: i64,
        _archive_name: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        self.known(task_id)?;
        self.data.lock().unwrap().insert(task_id, archive);
        Ok(())
    }

    async fn upload_annotations(&self, _session: &PlatformSession, task_id: i64, coco_json: Vec<u8>) -> Result<()> {
        self.known(task_id)?;
        self.annotations.lock().unwrap().insert(task_id, coco_json);
        Ok(())
    }

    async fn get_task(&self, _session: &PlatformSession, task_id: i64) -> Result<RemoteTask> {
        let tasks = self.tasks.lock().unwrap();
        let name = tasks
            .get(&task_id)
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", task_id)))?;
        Ok(RemoteTask {
            id: task_id,
            name: name.clone(),
            status: Some("completed".to_string()),
        })
    }

    async fn export_annotations(&self, _session: &PlatformSession, task_id: i64, _policy: PollPolicy) -> Result<Vec<u8>> {
        self.known(task_id)?;
        self.annotations
            .lock()
            .unwrap()
            .get(&task_id)
            .cloned()
            .ok_or_else(|| Error::external("CVAT", format!("Task {} has no annotations", task_id)))
    }

    fn task_url(&self, task_id: i64) -> String {
        format!("http://cvat.test/tasks/{}", task_id)
    }
}

/// Stands in for the nnU-Net executables.
///
/// `nnUNetv2_predict` thresholds every `<case>_0000` input at half its
/// maximum and writes `<case>.nii.gz` into the output folder. Plan and
/// train commands only get recorded.
pub struct FakeNnunet {
    pub commands: Mutex<Vec<ToolCommand>>,
    pub fail_with: Option<String>,
}

impl FakeNnunet {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            fail_with: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        }
    }
}

pub fn arg_after<'a>(command: &'a ToolCommand, flag: &str) -> Option<&'a str> {
    let pos = command.args.iter().position(|a| a == flag)?;
    command.args.get(pos + 1).map(String::as_str)
}

fn predict(input: &Path, output: &Path) -> Result<usize> {
    let mut written = 0;
    for entry in std::fs::read_dir(input)? {
        let path: PathBuf = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let Some(case) = strip_nifti_ext(&name).strip_suffix("_0000") else {
            continue;
        };

        let volume = read_intensity_volume(&path)?;
        let max = volume.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let labels = volume.mapv(|v| u8::from(v > max / 2.0));
        write_label_volume(&output.join(format!("{}.nii.gz", case)), &labels)?;
        written += 1;
    }
    Ok(written)
}

#[async_trait]
impl ToolRunner for FakeNnunet {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        self.commands.lock().unwrap().push(command.clone());
        if let Some(message) = &self.fail_with {
            return Err(Error::external("nnU-Net", message.clone()));
        }

        let mut stdout = format!("{} finished", command.program);
        if command.program.ends_with("predict") {
            let input = PathBuf::from(arg_after(command, "-i").unwrap_or_default());
            let output = PathBuf::from(arg_after(command, "-o").unwrap_or_default());
            let count = predict(&input, &output)?;
            stdout = format!("Predicted {} cases", count);
        }

        Ok(ToolOutput {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

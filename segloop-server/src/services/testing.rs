//! In-memory annotation platform for workflow tests

use async_trait::async_trait;
use segloop_common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use super::cvat_client::{AnnotationPlatform, NewTask, PlatformSession, RemoteTask};
use super::poller::PollPolicy;

/// Accepts one password; exports return whatever annotations a task holds
pub(crate) struct FakePlatform {
    password: String,
    next_id: AtomicI64,
    pub created: Mutex<Vec<NewTask>>,
    tasks: Mutex<HashMap<i64, String>>,
    data: Mutex<HashMap<i64, Vec<u8>>>,
    annotations: Mutex<HashMap<i64, Vec<u8>>>,
}

impl FakePlatform {
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

    /// Pretend a task with corrected annotations already exists
    pub fn add_task(&self, task_id: i64, annotations: Vec<u8>) {
        self.tasks
            .lock()
            .unwrap()
            .insert(task_id, format!("task {}", task_id));
        self.annotations.lock().unwrap().insert(task_id, annotations);
    }

    /// Number of files in the slice archive uploaded to a task
    pub fn uploaded_slices(&self, task_id: i64) -> Option<usize> {
        let data = self.data.lock().unwrap();
        let bytes = data.get(&task_id)?;
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.clone())).ok()?;
        Some(archive.len())
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
impl AnnotationPlatform for FakePlatform {
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

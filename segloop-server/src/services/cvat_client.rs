//! CVAT REST client
//!
//! Authentication is a token obtained from `POST /api/auth/login` and sent
//! as `Authorization: Token <key>`. Any non-success status becomes an
//! external error carrying the response body.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use segloop_common::config::CvatConfig;
use segloop_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::poller::{poll_until, PollPolicy, PollStatus};

const USER_AGENT: &str = concat!("segloop/", env!("CARGO_PKG_VERSION"));
const SERVICE: &str = "CVAT";

/// Annotation format used for both upload and export
pub const COCO_FORMAT: &str = "COCO 1.0";

/// Authenticated platform session
#[derive(Debug, Clone)]
pub struct PlatformSession {
    pub token: String,
}

/// Label offered in a new task
#[derive(Debug, Clone, Serialize)]
pub struct TaskLabel {
    pub name: String,
    pub color: String,
    pub attributes: Vec<serde_json::Value>,
}

/// Task creation request
#[derive(Debug, Clone, Serialize)]
pub struct NewTask {
    pub name: String,
    pub labels: Vec<TaskLabel>,
}

/// Task as returned by the platform
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteTask {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportResponse {
    rq_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequestStatus {
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result_url: Option<String>,
}

/// Remote annotation platform operations used by the export/import flows
#[async_trait]
pub trait AnnotationPlatform: Send + Sync {
    /// Check credentials; rejected credentials are `Error::Unauthorized`
    async fn login(&self, username: &str, password: &str) -> Result<PlatformSession>;

    /// Profile of the authenticated user
    async fn current_user(&self, session: &PlatformSession) -> Result<serde_json::Value>;

    async fn create_task(&self, session: &PlatformSession, task: &NewTask) -> Result<RemoteTask>;

    /// Upload a ZIP of slice images as task data
    async fn upload_task_data(
        &self,
        session: &PlatformSession,
        task_id: i64,
        archive_name: &str,
        archive: Vec<u8>,
    ) -> Result<()>;

    /// Upload a COCO document as the task's annotations
    async fn upload_annotations(
        &self,
        session: &PlatformSession,
        task_id: i64,
        coco_json: Vec<u8>,
    ) -> Result<()>;

    async fn get_task(&self, session: &PlatformSession, task_id: i64) -> Result<RemoteTask>;

    /// Export the task's annotations as COCO and download the result
    /// (ZIP or raw JSON bytes)
    async fn export_annotations(
        &self,
        session: &PlatformSession,
        task_id: i64,
        policy: PollPolicy,
    ) -> Result<Vec<u8>>;

    /// Browser URL of a task
    fn task_url(&self, task_id: i64) -> String;
}

/// HTTP implementation
pub struct CvatClient {
    http_client: reqwest::Client,
    host: String,
}

impl CvatClient {
    pub fn new(config: &CvatConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::external(SERVICE, e.to_string()))?;

        Ok(Self {
            http_client,
            host: config.host.trim_end_matches('/').to_string(),
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api{}", self.host, path)
    }

    /// Absolute URL for a possibly host-relative link
    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.host, url.trim_start_matches('/'))
        }
    }

    fn auth(session: &PlatformSession) -> String {
        format!("Token {}", session.token)
    }

    /// Turn an unexpected status into an external error with the body text
    async fn check(response: Response, expected: &[StatusCode], what: &str) -> Result<Response> {
        let status = response.status();
        if expected.contains(&status) {
            return Ok(response);
        }
        let error_text = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), what, body = %error_text, "CVAT request failed");
        Err(Error::external(
            SERVICE,
            format!("{} returned HTTP {}: {}", what, status.as_u16(), error_text),
        ))
    }
}

fn network_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{} request: {}", SERVICE, err))
    } else {
        Error::external(SERVICE, err.to_string())
    }
}

#[async_trait]
impl AnnotationPlatform for CvatClient {
    async fn login(&self, username: &str, password: &str) -> Result<PlatformSession> {
        let response = self
            .http_client
            .post(self.api("/auth/login"))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Unauthorized(format!(
                "CVAT authentication failed: {}",
                error_text
            )));
        }
        let response = Self::check(response, &[StatusCode::OK], "login").await?;

        let body: LoginResponse = response.json().await.map_err(network_error)?;
        let token = body.key.filter(|k| !k.is_empty()).ok_or_else(|| {
            Error::Unauthorized("Failed to retrieve authentication token from CVAT".to_string())
        })?;

        tracing::debug!(username, "Authenticated with CVAT");
        Ok(PlatformSession { token })
    }

    async fn current_user(&self, session: &PlatformSession) -> Result<serde_json::Value> {
        let response = self
            .http_client
            .get(self.api("/users/self"))
            .header(reqwest::header::AUTHORIZATION, Self::auth(session))
            .send()
            .await
            .map_err(network_error)?;
        let response = Self::check(response, &[StatusCode::OK], "current user").await?;
        response.json().await.map_err(network_error)
    }

    async fn create_task(&self, session: &PlatformSession, task: &NewTask) -> Result<RemoteTask> {
        let response = self
            .http_client
            .post(self.api("/tasks"))
            .header(reqwest::header::AUTHORIZATION, Self::auth(session))
            .json(task)
            .send()
            .await
            .map_err(network_error)?;
        let response = Self::check(response, &[StatusCode::CREATED], "task creation").await?;
        let created: RemoteTask = response.json().await.map_err(network_error)?;

        tracing::info!(task_id = created.id, name = %task.name, "Created CVAT task");
        Ok(created)
    }

    async fn upload_task_data(
        &self,
        session: &PlatformSession,
        task_id: i64,
        archive_name: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        let part = Part::bytes(archive)
            .file_name(archive_name.to_string())
            .mime_str("application/zip")
            .map_err(network_error)?;
        let form = Form::new()
            .part("client_files[0]", part)
            .text("image_quality", "70")
            .text("use_zip_chunks", "true")
            .text("use_cache", "true")
            .text("chunk_size", "10");

        let response = self
            .http_client
            .post(self.api(&format!("/tasks/{}/data", task_id)))
            .header(reqwest::header::AUTHORIZATION, Self::auth(session))
            .multipart(form)
            .send()
            .await
            .map_err(network_error)?;
        Self::check(response, &[StatusCode::ACCEPTED], "task data upload").await?;
        Ok(())
    }

    async fn upload_annotations(
        &self,
        session: &PlatformSession,
        task_id: i64,
        coco_json: Vec<u8>,
    ) -> Result<()> {
        let part = Part::bytes(coco_json)
            .file_name(format!("task_{}_coco_annotations.json", task_id))
            .mime_str("application/json")
            .map_err(network_error)?;
        let form = Form::new().part("annotation_file", part);

        let response = self
            .http_client
            .put(self.api(&format!("/tasks/{}/annotations", task_id)))
            .query(&[("format", COCO_FORMAT)])
            .header(reqwest::header::AUTHORIZATION, Self::auth(session))
            .multipart(form)
            .send()
            .await
            .map_err(network_error)?;
        Self::check(
            response,
            &[StatusCode::OK, StatusCode::CREATED, StatusCode::ACCEPTED],
            "annotation upload",
        )
        .await?;
        Ok(())
    }

    async fn get_task(&self, session: &PlatformSession, task_id: i64) -> Result<RemoteTask> {
        let response = self
            .http_client
            .get(self.api(&format!("/tasks/{}", task_id)))
            .header(reqwest::header::AUTHORIZATION, Self::auth(session))
            .send()
            .await
            .map_err(network_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("Task {} not found in CVAT", task_id)));
        }
        let response = Self::check(response, &[StatusCode::OK], "task lookup").await?;
        response.json().await.map_err(network_error)
    }

    async fn export_annotations(
        &self,
        session: &PlatformSession,
        task_id: i64,
        policy: PollPolicy,
    ) -> Result<Vec<u8>> {
        let response = self
            .http_client
            .post(self.api(&format!("/tasks/{}/dataset/export", task_id)))
            .query(&[("format", COCO_FORMAT), ("save_images", "False")])
            .header(reqwest::header::AUTHORIZATION, Self::auth(session))
            .send()
            .await
            .map_err(network_error)?;
        let response = Self::check(response, &[StatusCode::ACCEPTED], "export request").await?;
        let export: ExportResponse = response.json().await.map_err(network_error)?;
        let rq_id = export.rq_id.ok_or_else(|| {
            Error::external(SERVICE, format!("No export request id returned for task {}", task_id))
        })?;

        tracing::info!(task_id, rq_id = %rq_id, "Export started, polling for completion");

        let status_url = self.api(&format!("/requests/{}", rq_id));
        let http_client = &self.http_client;
        let status_url = status_url.as_str();
        let result_url = poll_until("CVAT export", policy, move || async move {
            let response = http_client
                .get(status_url)
                .header(reqwest::header::AUTHORIZATION, Self::auth(session))
                .send()
                .await
                .map_err(network_error)?;
            let response = Self::check(response, &[StatusCode::OK], "export status").await?;
            let status: RequestStatus = response.json().await.map_err(network_error)?;

            match status.status.as_deref() {
                Some("finished") => status
                    .result_url
                    .map(PollStatus::Ready)
                    .ok_or_else(|| {
                        Error::external(SERVICE, format!("No result URL found for task {}", task_id))
                    }),
                Some("failed") => Err(Error::external(
                    SERVICE,
                    status
                        .message
                        .unwrap_or_else(|| format!("Export failed for task {}", task_id)),
                )),
                _ => Ok(PollStatus::Pending),
            }
        })
        .await?;

        let response = self
            .http_client
            .get(self.absolute(&result_url))
            .header(reqwest::header::AUTHORIZATION, Self::auth(session))
            .send()
            .await
            .map_err(network_error)?;
        let response = Self::check(response, &[StatusCode::OK], "export download").await?;
        let bytes = response.bytes().await.map_err(network_error)?;

        tracing::info!(task_id, bytes = bytes.len(), "Downloaded exported annotations");
        Ok(bytes.to_vec())
    }

    fn task_url(&self, task_id: i64) -> String {
        format!("{}/tasks/{}", self.host, task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(host: &str) -> CvatClient {
        CvatClient::new(&CvatConfig {
            host: host.to_string(),
            ..CvatConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let c = client("https://app.cvat.ai/");
        assert_eq!(c.api("/tasks"), "https://app.cvat.ai/api/tasks");
        assert_eq!(c.task_url(42), "https://app.cvat.ai/tasks/42");
        assert_eq!(
            c.absolute("/api/requests/abc/download"),
            "https://app.cvat.ai/api/requests/abc/download"
        );
        assert_eq!(c.absolute("https://cdn.example/x.zip"), "https://cdn.example/x.zip");
    }

    #[test]
    fn test_new_task_serialisation() {
        let task = NewTask {
            name: "Medical Scan - la_003".to_string(),
            labels: vec![TaskLabel {
                name: "left_atrium".to_string(),
                color: "#FF0000".to_string(),
                attributes: Vec::new(),
            }],
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["name"], "Medical Scan - la_003");
        assert_eq!(value["labels"][0]["color"], "#FF0000");
        assert!(value["labels"][0]["attributes"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_dependency_error() {
        let c = client("http://127.0.0.1:9");
        let err = c.login("u", "p").await.unwrap_err();
        assert!(matches!(err, Error::External { .. } | Error::Timeout(_)));
    }
}

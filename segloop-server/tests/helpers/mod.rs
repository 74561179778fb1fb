//! Shared fixtures for segloop-server integration tests
//!
//! In-memory stand-ins for CVAT and the nnU-Net executables, plus builders
//! for upload archives and multipart bodies.

#![allow(dead_code)]

pub mod fakes;

use axum::body::Body;
use axum::http::{header, Request};
use http_body_util::BodyExt;
use segloop_common::config::TomlConfig;
use segloop_server::services::tool_runner::ToolCommand;
use segloop_server::workspace::Workspace;
use segloop_server::AppState;
use serde_json::Value;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use fakes::{FakeCvat, FakeNnunet};

pub const CVAT_PASSWORD: &str = "correct-horse";
pub const BOUNDARY: &str = "segloop-test-boundary";

/// Application state over a temporary workspace and an in-memory database
pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub cvat: Arc<FakeCvat>,
    pub nnunet: Arc<FakeNnunet>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_nnunet(FakeNnunet::new()).await
    }

    pub async fn with_nnunet(nnunet: FakeNnunet) -> Self {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::new(dir.path());
        workspace.ensure().unwrap();

        let db = segloop_common::db::init_memory_database().await.unwrap();
        let mut config = TomlConfig::default();
        config.root_folder = Some(dir.path().to_path_buf());
        config.public_base_url = Some("http://segloop.test".to_string());
        config.cvat.poll.initial_delay_ms = 1;
        config.cvat.poll.max_delay_ms = 5;
        config.cvat.poll.deadline_secs = 2;

        let cvat = Arc::new(FakeCvat::new(CVAT_PASSWORD));
        let nnunet = Arc::new(nnunet);
        let state = AppState::new(db, config, workspace, cvat.clone(), nnunet.clone()).unwrap();

        Self {
            dir,
            state,
            cvat,
            nnunet,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn router(&self) -> axum::Router {
        segloop_server::build_router(self.state.clone())
    }

    /// Commands the fake nnU-Net saw, in order
    pub fn commands(&self) -> Vec<ToolCommand> {
        self.nnunet.commands.lock().unwrap().clone()
    }

    /// Create an empty nnU-Net raw dataset folder
    pub fn create_raw_dataset(&self, dataset_id: &str) -> PathBuf {
        let dir = self.state.nnunet.raw_dir().join(dataset_id);
        std::fs::create_dir_all(dir.join("imagesTr")).unwrap();
        std::fs::create_dir_all(dir.join("labelsTr")).unwrap();
        std::fs::write(
            dir.join("dataset.json"),
            r#"{"name": "test", "numTraining": 0, "training": [], "file_ending": ".nii.gz"}"#,
        )
        .unwrap();
        dir
    }
}

/// Grey slice with a bright square in the middle
pub fn png_slice(size: u32, brightness: u8) -> Vec<u8> {
    let img = image::GrayImage::from_fn(size, size, |x, y| {
        let inside = (size / 4..3 * size / 4).contains(&x) && (size / 4..3 * size / 4).contains(&y);
        image::Luma([if inside { brightness } else { 10 }])
    });
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// ZIP archive holding `entries` as (path, bytes)
pub fn zip_archive(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in entries {
        writer.start_file(name.as_str(), options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// One case folder of `slices` PNG slices
pub fn png_case_archive(case_name: &str, slices: usize) -> Vec<u8> {
    let entries: Vec<(String, Vec<u8>)> = (0..slices)
        .map(|i| {
            (
                format!("{}/slice_{:04}.png", case_name, i),
                png_slice(16, 200 + i as u8),
            )
        })
        .collect();
    zip_archive(&entries)
}

/// multipart/form-data body with a `file` part and plain text fields
pub fn multipart_body(file_name: &str, file: &[u8], fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            BOUNDARY, file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(file);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn upload_request(file_name: &str, file: &[u8], fields: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/inference/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(file_name, file, fields)))
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

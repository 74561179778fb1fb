//! HTTP routing and request validation tests
//!
//! Every request goes through the full router with in-memory stand-ins for
//! CVAT and nnU-Net.

mod helpers;

use axum::http::{header, Request, StatusCode};
use axum::body::Body;
use serde_json::json;
use segloop_common::db::JobStatus;
use segloop_server::db::jobs;
use tower::ServiceExt;

use helpers::fakes::FakeNnunet;
use helpers::{body_json, get_request, json_request, png_case_archive, upload_request, TestApp, CVAT_PASSWORD};

#[tokio::test]
async fn test_root_reports_running() {
    // Given: A fresh server
    let app = TestApp::new().await;

    // When: GET /
    let response = app.router().oneshot(get_request("/")).await.unwrap();

    // Then: Status message
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "segloop backend is running");
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = TestApp::new().await;

    let response = app.router().oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "segloop-server");
    assert!(body["version"].is_string());
    assert_eq!(body["database"], "ok");
    assert_eq!(body["open_sessions"], 0);
    assert_eq!(body["nnunet_raw_present"], false);
    assert!(body.get("last_error").is_none());
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = TestApp::new().await;

    let response = app.router().oneshot(get_request("/no/such/route")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_login_session_lifecycle() {
    // Given: A server and valid CVAT credentials
    let app = TestApp::new().await;

    // When: Logging in
    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/auth/login",
            json!({ "username": "alice", "password": CVAT_PASSWORD }),
        ))
        .await
        .unwrap();

    // Then: A new user with a session token
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["username"], "alice");
    assert_eq!(body["is_new_user"], true);
    assert_eq!(body["token"], "token-alice");
    let session = body["session_token"].as_str().unwrap().to_string();

    // And: The session identifies the user
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri("/auth/user")
                .header(header::AUTHORIZATION, format!("Bearer {}", session))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["user"]["username"], "alice");

    // And: A second login is not a new user
    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/auth/login",
            json!({ "username": "alice", "password": CVAT_PASSWORD }),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["is_new_user"], false);

    // And: Logout ends the session
    let logout = || {
        Request::builder()
            .method("POST")
            .uri("/auth/logout")
            .header(header::AUTHORIZATION, format!("Bearer {}", session))
            .body(Body::empty())
            .unwrap()
    };
    let response = app.router().oneshot(logout()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.router().oneshot(logout()).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_rejections() {
    let app = TestApp::new().await;

    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/auth/login",
            json!({ "username": "alice", "password": "wrong" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let response = app
        .router()
        .oneshot(json_request("POST", "/auth/login", json!({ "username": "alice" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.router().oneshot(get_request("/auth/user")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_upload_png_archive() {
    // Given: A ZIP with one PNG case folder
    let app = TestApp::new().await;
    let archive = png_case_archive("la_003", 3);

    // When: Uploading it
    let response = app
        .router()
        .oneshot(upload_request("heart_scans.zip", &archive, &[("config", "2d")]))
        .await
        .unwrap();

    // Then: The case is staged for inference under a derived job id
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["job_id"], "heart-scans");
    assert_eq!(body["config"], "2d");
    assert_eq!(body["dataset"], "Dataset002_Heart");
    assert_eq!(body["cases"], json!(["la_003"]));

    let ws = &app.state.workspace;
    assert!(ws.inference_input_dir("heart-scans").join("la_003_0000.nii.gz").is_file());
    assert!(ws.upload_png_dir("heart-scans", "la_003").join("slice_0002.png").is_file());
    // The received archive is not kept
    assert_eq!(std::fs::read_dir(ws.archives_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_duplicate_upload_is_conflict() {
    let app = TestApp::new().await;
    let archive = png_case_archive("la_003", 2);

    let first = app
        .router()
        .oneshot(upload_request("heart.zip", &archive, &[]))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .router()
        .oneshot(upload_request("heart.zip", &archive, &[]))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);

    // The first job's files survive
    let ws = &app.state.workspace;
    assert!(ws.inference_input_dir("heart").join("la_003_0000.nii.gz").is_file());
}

#[tokio::test]
async fn test_upload_validation() {
    let app = TestApp::new().await;
    let archive = png_case_archive("la_003", 2);

    let bad_config = app
        .router()
        .oneshot(upload_request("scan.zip", &archive, &[("config", "3d_lowres")]))
        .await
        .unwrap();
    assert_eq!(bad_config.status(), StatusCode::BAD_REQUEST);

    let bad_dataset = app
        .router()
        .oneshot(upload_request("scan.zip", &archive, &[("dataset", "Dataset999_Nope")]))
        .await
        .unwrap();
    assert_eq!(bad_dataset.status(), StatusCode::BAD_REQUEST);

    let not_zip = app
        .router()
        .oneshot(upload_request("scan.zip", b"definitely not a zip", &[]))
        .await
        .unwrap();
    assert_eq!(not_zip.status(), StatusCode::BAD_REQUEST);

    // Nothing half-ingested is left around
    let ws = &app.state.workspace;
    assert!(!ws.inference_input_dir("scan").exists());
    assert_eq!(std::fs::read_dir(ws.archives_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_run_validation() {
    let app = TestApp::new().await;

    let missing = app
        .router()
        .oneshot(json_request("POST", "/inference/run", json!({ "config": "2d" })))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let bad_config = app
        .router()
        .oneshot(json_request(
            "POST",
            "/inference/run",
            json!({ "job_id": "heart", "config": "4d" }),
        ))
        .await
        .unwrap();
    assert_eq!(bad_config.status(), StatusCode::BAD_REQUEST);

    let unknown = app
        .router()
        .oneshot(json_request("POST", "/inference/run", json!({ "job_id": "never-uploaded" })))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    assert!(app.commands().is_empty());
}

#[tokio::test]
async fn test_failed_inference_is_reported() {
    // Given: An uploaded job and an nnU-Net that fails
    let app = TestApp::with_nnunet(FakeNnunet::failing("CUDA out of memory")).await;
    let archive = png_case_archive("la_003", 2);
    let response = app
        .router()
        .oneshot(upload_request("heart.zip", &archive, &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // When: Running inference
    let response = app
        .router()
        .oneshot(json_request("POST", "/inference/run", json!({ "job_id": "heart" })))
        .await
        .unwrap();

    // Then: 500 carrying the tool's error, recorded on the job and in health
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("CUDA out of memory"));
    assert!(!app.state.workspace.result_tmp_dir("heart").exists());

    let status = app
        .router()
        .oneshot(get_request("/inference/status/heart"))
        .await
        .unwrap();
    let body = body_json(status).await;
    assert_eq!(body["job"]["status"], "failed");

    let health = body_json(app.router().oneshot(get_request("/health")).await.unwrap()).await;
    assert!(health["last_error"].as_str().unwrap().contains("heart"));
}

#[tokio::test]
async fn test_running_job_cannot_be_started_again() {
    // Given: An uploaded job whose inference is already running
    let app = TestApp::new().await;
    let archive = png_case_archive("la_003", 2);
    let response = app
        .router()
        .oneshot(upload_request("heart.zip", &archive, &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    jobs::create_inference_job(&app.state.db, "heart", None, "2d", "Dataset002_Heart")
        .await
        .unwrap();
    jobs::update_inference_status(&app.state.db, "heart", JobStatus::Processing, None)
        .await
        .unwrap();

    // When: Starting it again
    let response = app
        .router()
        .oneshot(json_request("POST", "/inference/run", json!({ "job_id": "heart" })))
        .await
        .unwrap();

    // Then: 409 and nnU-Net is never invoked
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(app.commands().is_empty());
    let status = body_json(
        app.router()
            .oneshot(get_request("/inference/status/heart"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status["job"]["status"], "processing");
}

#[tokio::test]
async fn test_status_of_unknown_job() {
    let app = TestApp::new().await;

    let response = app
        .router()
        .oneshot(get_request("/inference/status/ghost"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_nifti_files_empty_listing() {
    let app = TestApp::new().await;

    let response = app
        .router()
        .oneshot(get_request("/inference/nifti_files"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["nifti_files"], json!([]));
}

#[tokio::test]
async fn test_comparison_slices_validation() {
    let app = TestApp::new().await;

    let missing = app
        .router()
        .oneshot(get_request("/inference/comparison_slices?nifti_id=heart_la_003.nii.gz"))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let absent = app
        .router()
        .oneshot(get_request(
            "/inference/comparison_slices?nifti_id=heart_la_003.nii.gz&job_id=heart",
        ))
        .await
        .unwrap();
    assert_eq!(absent.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_slice_image_stays_inside_workspace() {
    // Given: A PNG outside the workspace and one inside
    let app = TestApp::new().await;
    let outside = tempfile::TempDir::new().unwrap();
    let secret = outside.path().join("secret.png");
    std::fs::write(&secret, helpers::png_slice(4, 255)).unwrap();

    let inside_dir = app.state.workspace.result_png_dir("job", "case");
    std::fs::create_dir_all(&inside_dir).unwrap();
    std::fs::write(inside_dir.join("slice_0000.png"), helpers::png_slice(4, 255)).unwrap();
    std::fs::write(inside_dir.join("notes.txt"), b"not an image").unwrap();

    let fetch = |path: String| {
        let url = reqwest::Url::parse_with_params("http://x/inference/slice_image", &[("path", path)]).unwrap();
        get_request(&format!("{}?{}", url.path(), url.query().unwrap()))
    };

    // Then: Outside is refused
    let response = app
        .router()
        .oneshot(fetch(secret.display().to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router()
        .oneshot(fetch("../../etc/passwd".to_string()))
        .await
        .unwrap();
    assert!(matches!(
        response.status(),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND
    ));

    // And: Only PNGs are served from inside
    let response = app
        .router()
        .oneshot(fetch("results/pngs/job_case/notes.txt".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router()
        .oneshot(fetch("results/pngs/job_case/slice_0000.png".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let bytes = helpers::body_bytes(response).await;
    assert!(bytes.starts_with(b"\x89PNG"));
}

#[tokio::test]
async fn test_cvat_request_validation() {
    let app = TestApp::new().await;

    let no_ids = app
        .router()
        .oneshot(json_request(
            "POST",
            "/cvat/upload_tasks",
            json!({ "nifti_ids": [], "cvat_username": "alice", "cvat_password": CVAT_PASSWORD }),
        ))
        .await
        .unwrap();
    assert_eq!(no_ids.status(), StatusCode::BAD_REQUEST);

    let no_credentials = app
        .router()
        .oneshot(json_request(
            "POST",
            "/cvat/upload_tasks",
            json!({ "nifti_ids": ["heart_la_003.nii.gz"] }),
        ))
        .await
        .unwrap();
    assert_eq!(no_credentials.status(), StatusCode::BAD_REQUEST);

    let bad_login = app
        .router()
        .oneshot(json_request(
            "POST",
            "/cvat/upload_tasks",
            json!({
                "nifti_ids": ["heart_la_003.nii.gz"],
                "cvat_username": "alice",
                "cvat_password": "wrong",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(bad_login.status(), StatusCode::UNAUTHORIZED);

    let bad_task_id = app
        .router()
        .oneshot(json_request(
            "POST",
            "/cvat/send-to-dataset",
            json!({ "task_ids": ["seven"], "username": "alice", "password": CVAT_PASSWORD }),
        ))
        .await
        .unwrap();
    assert_eq!(bad_task_id.status(), StatusCode::BAD_REQUEST);

    let no_tasks = app
        .router()
        .oneshot(json_request(
            "POST",
            "/cvat/send-to-dataset",
            json!({ "task_ids": [], "username": "alice", "password": CVAT_PASSWORD }),
        ))
        .await
        .unwrap();
    assert_eq!(no_tasks.status(), StatusCode::BAD_REQUEST);

    let empty_discard = app
        .router()
        .oneshot(json_request("POST", "/cvat/discard_files", json!({ "nifti_ids": [] })))
        .await
        .unwrap();
    assert_eq!(empty_discard.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_corrected_tasks_empty() {
    let app = TestApp::new().await;

    let response = app
        .router()
        .oneshot(get_request("/cvat/corrected-tasks"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["tasks"], json!([]));
}

#[tokio::test]
async fn test_training_runs_plan_then_train() {
    // Given: A server
    let app = TestApp::new().await;

    // When: Training dataset 2 with defaults
    let response = app
        .router()
        .oneshot(json_request("POST", "/train-nnunet", json!({ "dataset_id": 2 })))
        .await
        .unwrap();

    // Then: Plan/preprocess, then one training run
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert!(body["message"].as_str().unwrap().contains("dataset 2"));

    let commands = app.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].program, "nnUNetv2_plan_and_preprocess");
    assert_eq!(commands[0].args, vec!["-d", "2"]);
    assert_eq!(commands[1].program, "nnUNetv2_train");
    assert_eq!(
        commands[1].args,
        vec!["2", "3d_fullres", "all", "-tr", "nnUNetTrainer_1epoch"]
    );
}

#[tokio::test]
async fn test_training_with_explicit_options() {
    let app = TestApp::new().await;

    let response = app
        .router()
        .oneshot(json_request(
            "POST",
            "/train-nnunet",
            json!({ "dataset_id": 1, "resolution": "2d", "folds": 3, "trainer_class": "nnUNetTrainer" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let commands = app.commands();
    assert_eq!(commands[1].args, vec!["1", "2d", "3", "-tr", "nnUNetTrainer"]);
}

#[tokio::test]
async fn test_training_validation() {
    let app = TestApp::new().await;

    for body in [
        json!({}),
        json!({ "dataset_id": "2" }),
        json!({ "dataset_id": 2.5 }),
        json!({ "dataset_id": 2, "resolution": "3d_lowres" }),
        json!({ "dataset_id": 2, "folds": "some" }),
    ] {
        let response = app
            .router()
            .oneshot(json_request("POST", "/train-nnunet", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {}", body);
    }

    assert!(app.commands().is_empty());
}

#[tokio::test]
async fn test_failed_training_is_reported() {
    let app = TestApp::with_nnunet(FakeNnunet::failing("dataset not found")).await;

    let response = app
        .router()
        .oneshot(json_request("POST", "/train-nnunet", json!({ "dataset_id": 9 })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("dataset not found"));
    // Training stops after the failed planning step
    assert_eq!(app.commands().len(), 1);
}

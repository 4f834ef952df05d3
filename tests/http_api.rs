use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use rustiscorm_lms::{
    auth::{LEARNER_HEADER, ROLE_HEADER, TENANT_HEADER},
    config::Config,
    progress::LogProgress,
    repo::MemoryRepository,
    routes::{router, AppState},
    storage::MemoryStore,
};

const BOUNDARY: &str = "scorm-test-boundary";

const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest identifier="com.example.safety" xmlns:adlcp="http://www.adlnet.org/xsd/adlcp_rootv1p2">
  <metadata><schemaversion>1.2</schemaversion></metadata>
  <organizations default="ORG">
    <organization identifier="ORG">
      <title>Safety</title>
      <item identifier="I1" identifierref="R1"><title>Intro</title></item>
      <item identifier="G1">
        <title>Module</title>
        <item identifier="I2" identifierref="R2"><title>Part A</title></item>
        <item identifier="I3" identifierref="R3"><title>Part B</title></item>
      </item>
      <item identifier="I4" identifierref="R4"><title>Quiz</title></item>
    </organization>
  </organizations>
  <resources>
    <resource identifier="R1" type="webcontent" adlcp:scormtype="sco" href="intro.html"/>
    <resource identifier="R2" type="webcontent" adlcp:scormtype="sco" href="m/a.html"/>
    <resource identifier="R3" type="webcontent" adlcp:scormtype="sco" href="m/b.html"/>
    <resource identifier="R4" type="webcontent" adlcp:scormtype="sco" href="quiz.html"/>
  </resources>
</manifest>"#;

fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut w = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = zip::write::FileOptions::default();
    for (name, data) in entries {
        w.start_file(*name, opts).unwrap();
        w.write_all(data).unwrap();
    }
    w.finish().unwrap().into_inner()
}

fn course_archive() -> Vec<u8> {
    zip_archive(&[
        ("imsmanifest.xml", MANIFEST.as_bytes()),
        ("intro.html", b"<html>intro</html>"),
        ("m/a.html", b"<html>a</html>"),
        ("m/b.html", b"<html>b</html>"),
        ("quiz.html", b"<html>quiz</html>"),
        ("css/site.css", b"body{}"),
    ])
}

fn app() -> Router {
    let config = Config::from_lookup(|key| match key {
        "LAUNCH_SIGNING_KEY" => Some("integration-test-signing-key".into()),
        _ => None,
    })
    .unwrap();
    let state = AppState::new(
        &config,
        Arc::new(MemoryRepository::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(LogProgress),
    )
    .unwrap();
    router(state)
}

struct Who<'a> {
    learner: &'a str,
    tenant: Uuid,
    role: &'a str,
}

fn request(method: &str, uri: &str, who: &Who) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(LEARNER_HEADER, who.learner)
        .header(TENANT_HEADER, who.tenant.to_string())
        .header(ROLE_HEADER, who.role)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, req).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn multipart_upload(archive: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    write!(
        body,
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"course.zip\"\r\nContent-Type: application/zip\r\n\r\n"
    )
    .unwrap();
    body.extend_from_slice(archive);
    write!(body, "\r\n--{BOUNDARY}--\r\n").unwrap();
    body
}

async fn upload(app: &Router, who: &Who<'_>, archive: &[u8]) -> (StatusCode, Value) {
    let req = request("POST", "/api/packages", who)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_upload(archive)))
        .unwrap();
    send_json(app, req).await
}

async fn commit(app: &Router, who: &Who<'_>, co: &str, n: i64, payload: Value) -> (StatusCode, Value) {
    let req = request(
        "POST",
        &format!("/api/content-objects/{co}/attempts/{n}/commit"),
        who,
    )
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(payload.to_string()))
    .unwrap();
    send_json(app, req).await
}

#[tokio::test]
async fn health() {
    let app = app();
    let (status, body) = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn upload_launch_commit_and_summarize() {
    let app = app();
    let tenant = Uuid::new_v4();
    let instructor = Who {
        learner: "ines",
        tenant,
        role: "instructor",
    };
    let learner = Who {
        learner: "alice",
        tenant,
        role: "learner",
    };

    let (status, created) = upload(&app, &instructor, &course_archive()).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let objects = created["content_objects"].as_array().unwrap();
    let identifiers: Vec<&str> = objects
        .iter()
        .map(|o| o["identifier"].as_str().unwrap())
        .collect();
    assert_eq!(identifiers, vec!["I1", "I2", "I3", "I4"]);
    let co = objects[0]["id"].as_str().unwrap().to_string();

    // launch and fetch the entry file through the signed URL
    let (status, launch) = send_json(
        &app,
        request("GET", &format!("/api/content-objects/{co}/launch"), &learner)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{launch}");
    assert_eq!(launch["attempt_number"], 1);
    let entry_url = launch["entry_url"].as_str().unwrap();
    let res = app
        .clone()
        .oneshot(Request::builder().uri(entry_url).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "text/html");
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"<html>intro</html>");

    // sibling assets resolve under the same signed root
    let css_url = format!("{}/css/site.css", launch["content_root"].as_str().unwrap());
    let (status, css) = send(
        &app,
        Request::builder().uri(css_url).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(css, b"body{}");

    let (status, first) = commit(
        &app,
        &learner,
        &co,
        1,
        json!({"cmi.core.lesson_status": "incomplete", "cmi.core.session_time": "00:00:30"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first["first_terminal"], false);

    let (status, second) = commit(
        &app,
        &learner,
        &co,
        1,
        json!({"cmi.core.lesson_status": "completed", "cmi.core.score.raw": "80", "cmi.core.session_time": "00:00:45"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["first_terminal"], true);
    assert_eq!(second["attempt"]["status"], "completed");
    assert_eq!(second["attempt"]["score_raw"], 80.0);
    assert_eq!(second["attempt"]["total_time_ms"], 75_000);

    let (status, attempts) = send_json(
        &app,
        request("GET", &format!("/api/content-objects/{co}/attempts"), &learner)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(attempts.as_array().unwrap().len(), 1);

    let (status, denied) = send_json(
        &app,
        request("GET", &format!("/api/content-objects/{co}/summary"), &learner)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(denied["code"], "ACCESS_DENIED");

    let (status, summary) = send_json(
        &app,
        request("GET", &format!("/api/content-objects/{co}/summary"), &instructor)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["learners_attempted"], 1);
    assert_eq!(summary["learners_terminal"], 1);
    assert_eq!(summary["mean_score"], 80.0);
    assert_eq!(summary["completion_ratio"], 1.0);

    // the finished attempt makes the next launch start attempt 2
    let (_, relaunch) = send_json(
        &app,
        request("GET", &format!("/api/content-objects/{co}/launch"), &learner)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(relaunch["attempt_number"], 2);
}

#[tokio::test]
async fn player_shell_hosts_both_runtime_apis() {
    let app = app();
    let tenant = Uuid::new_v4();
    let instructor = Who {
        learner: "ines",
        tenant,
        role: "admin",
    };
    let (_, created) = upload(&app, &instructor, &course_archive()).await;
    let co = created["content_objects"][3]["id"].as_str().unwrap().to_string();

    let learner = Who {
        learner: "bob",
        tenant,
        role: "learner",
    };
    let (status, page) = send(
        &app,
        request("GET", &format!("/player/{co}"), &learner)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let page = String::from_utf8(page).unwrap();
    assert!(page.contains("window.API ="));
    assert!(page.contains("window.API_1484_11 ="));
    assert!(page.contains(&format!("/api/content-objects/{co}/attempts/1/commit")));
    assert!(page.contains("quiz.html"));
}

#[tokio::test]
async fn ingestion_and_access_errors_are_typed() {
    let app = app();
    let tenant = Uuid::new_v4();
    let instructor = Who {
        learner: "ines",
        tenant,
        role: "instructor",
    };

    let no_manifest = zip_archive(&[("index.html", b"<html/>")]);
    let (status, err) = upload(&app, &instructor, &no_manifest).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "MANIFEST_MISSING");

    let (status, err) = upload(&app, &instructor, b"definitely not a zip").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "ARCHIVE_INVALID");

    let learner = Who {
        learner: "alice",
        tenant,
        role: "learner",
    };
    let (status, err) = upload(&app, &learner, &course_archive()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["code"], "ACCESS_DENIED");

    let (status, err) = send_json(
        &app,
        Request::builder()
            .uri(format!("/api/content-objects/{}/launch", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "missing identity headers: {err}");

    let (status, err) = send_json(
        &app,
        request(
            "GET",
            &format!("/api/content-objects/{}/launch", Uuid::new_v4()),
            &learner,
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["code"], "CONTENT_OBJECT_NOT_FOUND");
}

#[tokio::test]
async fn deleted_package_stops_launching_but_keeps_history() {
    let app = app();
    let tenant = Uuid::new_v4();
    let instructor = Who {
        learner: "ines",
        tenant,
        role: "instructor",
    };
    let learner = Who {
        learner: "alice",
        tenant,
        role: "learner",
    };
    let (_, created) = upload(&app, &instructor, &course_archive()).await;
    let package_id = created["package"]["id"].as_str().unwrap().to_string();
    let co = created["content_objects"][0]["id"].as_str().unwrap().to_string();

    let (status, _) =
        commit(&app, &learner, &co, 1, json!({"status": "passed", "score": 91})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, deleted) = send_json(
        &app,
        request("DELETE", &format!("/api/packages/{package_id}"), &instructor)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["status"], "deleted");

    let (status, err) = send_json(
        &app,
        request("GET", &format!("/api/content-objects/{co}/launch"), &learner)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["code"], "PACKAGE_NOT_FOUND");

    let (status, best) = send_json(
        &app,
        request(
            "GET",
            &format!("/api/content-objects/{co}/attempts/best?learner_id=alice"),
            &instructor,
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(best["score_raw"], 91.0);
}

#[tokio::test]
async fn oversized_suspend_data_is_413_but_rest_is_kept() {
    let app = app();
    let tenant = Uuid::new_v4();
    let instructor = Who {
        learner: "ines",
        tenant,
        role: "instructor",
    };
    let learner = Who {
        learner: "alice",
        tenant,
        role: "learner",
    };
    let (_, created) = upload(&app, &instructor, &course_archive()).await;
    let co = created["content_objects"][0]["id"].as_str().unwrap().to_string();

    let (status, err) = commit(
        &app,
        &learner,
        &co,
        1,
        json!({"cmi.core.lesson_location": "p7", "cmi.suspend_data": "x".repeat(64_001)}),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(err["code"], "SUSPEND_DATA_TOO_LARGE");

    let (_, attempts) = send_json(
        &app,
        request("GET", &format!("/api/content-objects/{co}/attempts"), &learner)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(attempts[0]["location"], "p7");
    assert_eq!(attempts[0]["suspend_data"], Value::Null);
}

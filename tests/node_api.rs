use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use axum::http::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;
use contrace::node;

mod common;

fn session(body: &Value) -> (String, Value) {
    let map = body.as_object().unwrap();
    assert_eq!(map.len(), 1);
    let (id, info) = map.iter().next().unwrap();
    (id.clone(), info.clone())
}

#[tokio::test]
async fn lists_pods_and_hooks() {
    let root   = TempDir::new().unwrap();
    let scans  = Arc::new(AtomicUsize::new(0));
    let router = node::router(common::tracer(&root, scans.clone()).await);

    let before = scans.load(Ordering::SeqCst);
    let (status, pods) = common::call(&router, "GET", "/v1/pods", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scans.load(Ordering::SeqCst), before + 1);
    assert_eq!(pods["web-0"]["Containers"]["nginx"]["Tasks"], json!([100]));
    assert_eq!(pods["web-1"]["Containers"]["nginx"]["Pod"], "web-1");

    let (status, hooks) = common::call(&router, "GET", "/v1/trace-hooks", None).await;
    assert_eq!(status, StatusCode::OK);
    let (dir, group) = hooks.as_object().unwrap().iter().next().unwrap();
    assert!(dir.ends_with("echo"));
    assert_eq!(group["Tracers"]["echo"]["Description"], json!(["Echo the arguments"]));
}

#[tokio::test]
async fn rejects_unresolvable_sessions() {
    let root   = TempDir::new().unwrap();
    let router = node::router(common::tracer(&root, Default::default()).await);

    let req = json!({"pod": "db-*", "container": "*", "trace-hook": "echo"});
    let (status, _) = common::call(&router, "POST", "/v1/trace-session", Some(req)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let req = json!({"pod": "web-0", "container": "nginx", "trace-hook": "perf"});
    let (status, body) = common::call(&router, "POST", "/v1/trace-session", Some(req)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.as_str().unwrap().contains("perf"));

    let (status, body) = common::call(&router, "GET", "/v1/trace-session/all", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (status, _) = common::call(&router, "GET", "/v1/trace-session/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = common::call(&router, "GET", "/v1/trace-session/42", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = common::call(&router, "PUT", "/v1/trace-session/42", Some(json!({"run": true}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = common::call(&router, "DELETE", "/v1/trace-session/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn drives_a_session_through_its_lifecycle() {
    let root   = TempDir::new().unwrap();
    let router = node::router(common::tracer(&root, Default::default()).await);

    let req = json!({
        "pod":                "web-*",
        "container":          "nginx",
        "trace-hook":         "echo",
        "trace-arguments":    "-a  -b",
        "trace-user-context": "trace-42",
    });
    let (status, body) = common::call(&router, "POST", "/v1/trace-session", Some(req)).await;
    assert_eq!(status, StatusCode::OK);

    let (id, info) = session(&body);
    assert_eq!(info["Id"].as_u64().unwrap().to_string(), id);
    assert_eq!(info["Node"], "node-a");
    assert_eq!(info["Running"], false);
    assert_eq!(info["TraceParams"], json!(["-a", "-b"]));
    assert_eq!(info["Containers"], json!({"web-0": ["nginx"], "web-1": ["nginx"]}));
    assert_eq!(info["Output"], Value::Null);

    let uri = format!("/v1/trace-session/{}", id);

    let (status, body) = common::call(&router, "PUT", &uri, Some(json!({"run": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session(&body).1["Running"], true);

    let (status, _) = common::call(&router, "PUT", &uri, Some(json!({"run": true}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let running = format!("{}?running=true", "/v1/trace-session/all");
    let (_, body) = common::call(&router, "GET", &running, None).await;
    assert!(body.get(&id).is_some());

    let mut output = Value::Null;
    for _ in 0..200 {
        let (_, body) = common::call(&router, "GET", &uri, None).await;
        output = session(&body).1["Output"].clone();
        if output.as_array().map(|o| !o.is_empty()).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(output, json!(["args --pid 100 200 -a -b"]));

    let (status, body) = common::call(&router, "PUT", &uri, Some(json!({"run": false}))).await;
    assert_eq!(status, StatusCode::OK);
    let info = session(&body).1;
    assert_eq!(info["Running"], false);
    assert_eq!(info["Output"], json!(["args --pid 100 200 -a -b", "done trace-42"]));

    let (status, _) = common::call(&router, "PUT", &uri, Some(json!({"run": false}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = common::call(&router, "GET", &running, None).await;
    assert_eq!(body, json!({}));

    let (status, _) = common::call(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = common::call(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deletes_all_sessions() {
    let root   = TempDir::new().unwrap();
    let router = node::router(common::tracer(&root, Default::default()).await);

    for _ in 0..3 {
        let req = json!({"pod": "web-0", "container": "nginx", "trace-hook": "echo"});
        let (status, body) = common::call(&router, "POST", "/v1/trace-session", Some(req)).await;
        assert_eq!(status, StatusCode::OK);

        let uri = format!("/v1/trace-session/{}", session(&body).0);
        let (status, _) = common::call(&router, "PUT", &uri, Some(json!({"run": true}))).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, body) = common::call(&router, "GET", "/v1/trace-session/all", None).await;
    assert_eq!(body.as_object().unwrap().len(), 3);

    let (status, _) = common::call(&router, "DELETE", "/v1/trace-session/all", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = common::call(&router, "GET", "/v1/trace-session/all", None).await;
    assert_eq!(body, json!({}));
}

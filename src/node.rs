use std::collections::BTreeMap;
use std::sync::Arc;
use axum::{Json, Router};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use crate::data::PodMap;
use crate::error::Error;
use crate::hooks::{HookGroup, HookManager};
use crate::pods::ContainerRegistry;
use crate::session::{self, SessionChange, SessionInfo, SessionRegistry, SessionRequest};

pub struct Tracer {
    pub node:     String,
    pub pods:     Arc<ContainerRegistry>,
    pub hooks:    Arc<HookManager>,
    pub sessions: Arc<SessionRegistry>,
}

#[derive(Debug, Default, Deserialize)]
struct Filter {
    #[serde(default)]
    running: bool,
}

struct Failure(StatusCode, String);

type Answer<T> = Result<Json<T>, Failure>;

pub fn router(tracer: Arc<Tracer>) -> Router {
    Router::new()
        .route("/v1/pods",              get(pods))
        .route("/v1/trace-hooks",       get(hooks))
        .route("/v1/trace-session",     post(create))
        .route("/v1/trace-session/:id", get(describe).put(change).delete(destroy))
        .with_state(tracer)
}

async fn pods(State(tracer): State<Arc<Tracer>>) -> Json<PodMap> {
    if let Err(e) = tracer.pods.scan().await {
        warn!("pods scan failed: {:?}", e);
    }
    Json(tracer.pods.pods())
}

async fn hooks(State(tracer): State<Arc<Tracer>>) -> Json<BTreeMap<String, HookGroup>> {
    Json(tracer.hooks.groups().into_iter().map(|(dir, group)| {
        (dir.display().to_string(), group)
    }).collect())
}

async fn create(
    State(tracer): State<Arc<Tracer>>,
    Json(req):     Json<SessionRequest>,
) -> Answer<BTreeMap<String, SessionInfo>> {
    let id = tracer.sessions.new_session(&req).map_err(|e| {
        match e.is_resolution() {
            true  => Failure::new(StatusCode::NOT_FOUND, e),
            false => Failure::new(StatusCode::INTERNAL_SERVER_ERROR, e),
        }
    })?;

    debug!("new trace session {} on {}", id, tracer.node);

    let info = tracer.sessions.describe(id).await.map_err(Failure::internal)?;
    Ok(Json(BTreeMap::from([(id.to_string(), info)])))
}

async fn describe(
    State(tracer):  State<Arc<Tracer>>,
    Path(id):       Path<String>,
    Query(filter):  Query<Filter>,
) -> Answer<BTreeMap<String, SessionInfo>> {
    let all = tracer.sessions.list(&id, filter.running).await.map_err(|e| match e {
        Error::InvalidId(_) | Error::NoSession(_) => Failure::new(StatusCode::BAD_REQUEST, e),
        e                                         => Failure::internal(e),
    })?;
    Ok(Json(all))
}

async fn change(
    State(tracer): State<Arc<Tracer>>,
    Path(id):      Path<String>,
    Json(change):  Json<SessionChange>,
) -> Answer<BTreeMap<String, SessionInfo>> {
    let missing = |e: Error| match e {
        Error::InvalidId(_) | Error::NoSession(_) => Failure::new(StatusCode::NOT_FOUND, e),
        e if e.is_state()                         => Failure::new(StatusCode::NOT_FOUND, e),
        e                                         => Failure::internal(e),
    };

    let id = session::parse_id(&id).map_err(missing)?;
    tracer.sessions.change(id, change).await.map_err(missing)?;

    let info = tracer.sessions.describe(id).await.map_err(missing)?;
    Ok(Json(BTreeMap::from([(id.to_string(), info)])))
}

async fn destroy(
    State(tracer): State<Arc<Tracer>>,
    Path(id):      Path<String>,
) -> Answer<Map<String, Value>> {
    if id == session::ALL {
        tracer.sessions.destroy_all().await;
        tracer.hooks.reset_all().await;
        return Ok(Json(Map::new()));
    }

    let id = session::parse_id(&id).map_err(|e| Failure::new(StatusCode::NOT_FOUND, e))?;
    tracer.sessions.destroy(id).await.map_err(|e| match e {
        Error::NoSession(_) => Failure::new(StatusCode::NOT_FOUND, e),
        e                   => Failure::internal(e),
    })?;

    Ok(Json(Map::new()))
}

impl Failure {
    fn new(status: StatusCode, e: Error) -> Self {
        Self(status, e.to_string())
    }

    fn internal(e: Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        debug!("request failed with {}: {}", self.0, self.1);
        (self.0, Json(self.1)).into_response()
    }
}

use std::path::PathBuf;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::base_system::video_url::split_batch;
use crate::download::models::{JobSnapshot, SubmitOptions};
use crate::download::quality::Quality;
use crate::ui::web::state::AppState;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.into() })))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CreateJobsReq {
    #[serde(default)]
    pub(crate) urls: Vec<String>,
    /// 多行或逗号分隔的链接文本
    #[serde(default)]
    pub(crate) text: Option<String>,
    #[serde(default)]
    pub(crate) quality: Option<String>,
    #[serde(default)]
    pub(crate) destination: Option<String>,
    #[serde(default)]
    pub(crate) use_accelerator: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IdReq {
    pub(crate) id: String,
}

pub(crate) async fn list_jobs(State(state): State<AppState>) -> Json<Value> {
    let items = state.orchestrator.list();
    Json(json!({ "items": items }))
}

pub(crate) async fn get_job(
    State(state): State<AppState>,
    Query(q): Query<IdReq>,
) -> Result<Json<JobSnapshot>, StatusCode> {
    state
        .orchestrator
        .get(q.id.trim())
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub(crate) async fn create_jobs(
    State(state): State<AppState>,
    Json(req): Json<CreateJobsReq>,
) -> Result<Json<Value>, ApiError> {
    let options = submit_options(&state.defaults, &req)?;

    let mut urls = req.urls;
    if let Some(text) = req.text.as_deref() {
        urls.extend(split_batch(text));
    }
    urls.retain(|u| !u.trim().is_empty());
    if urls.is_empty() {
        return Err(bad_request("no urls"));
    }

    let orch = state.orchestrator.clone();
    let outcome = tokio::task::spawn_blocking(move || orch.submit(&urls, &options))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("submit task failed: {e}") })),
            )
        })?;

    Ok(Json(json!({
        "accepted": outcome.accepted,
        "rejected": outcome.rejected,
    })))
}

pub(crate) async fn cancel_job(
    State(state): State<AppState>,
    Json(req): Json<IdReq>,
) -> Result<Json<Value>, StatusCode> {
    if state.orchestrator.cancel(req.id.trim()) {
        Ok(Json(json!({"ok": true})))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

pub(crate) async fn clear_jobs(State(state): State<AppState>) -> Json<Value> {
    let removed = state.orchestrator.clear_terminal();
    Json(json!({ "removed": removed }))
}

fn submit_options(defaults: &SubmitOptions, req: &CreateJobsReq) -> Result<SubmitOptions, ApiError> {
    let mut options = defaults.clone();
    if let Some(raw) = req.quality.as_deref()
        && !raw.trim().is_empty()
    {
        options.quality = raw
            .parse::<Quality>()
            .map_err(|e| bad_request(e.to_string()))?;
    }
    if let Some(dest) = req.destination.as_deref()
        && !dest.trim().is_empty()
    {
        options.destination = PathBuf::from(dest.trim());
    }
    if let Some(flag) = req.use_accelerator {
        options.use_accelerator = flag;
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::base_system::tool_locator::Toolchain;
    use crate::download::events::EventSink;
    use crate::download::models::JobState;
    use crate::download::orchestrator::{Orchestrator, PoolSettings};
    use crate::download::testing::{Script, ScriptedBackend};

    fn state(dir: &std::path::Path) -> AppState {
        let backend = Arc::new(ScriptedBackend::new(Script::default()));
        let settings = PoolSettings {
            workers: 2,
            ..PoolSettings::default()
        };
        let sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        let orch = Orchestrator::start(settings, backend, Toolchain::default(), sinks).unwrap();
        AppState {
            bind_addrs: Arc::new(vec!["127.0.0.1:0".parse().unwrap()]),
            orchestrator: Arc::new(orch),
            defaults: Arc::new(SubmitOptions::new(
                Quality::Best,
                dir.to_path_buf(),
                true,
            )),
        }
    }

    #[test]
    fn request_overrides_defaults() {
        let defaults = SubmitOptions::new(Quality::Best, PathBuf::from("/tmp/a"), true);
        let req = CreateJobsReq {
            quality: Some("720p".into()),
            destination: Some(" /tmp/b ".into()),
            use_accelerator: Some(false),
            ..CreateJobsReq::default()
        };
        let opts = submit_options(&defaults, &req).unwrap();
        assert_eq!(opts.quality, Quality::P720);
        assert_eq!(opts.destination, PathBuf::from("/tmp/b"));
        assert!(!opts.use_accelerator);

        let bad = CreateJobsReq {
            quality: Some("8k".into()),
            ..CreateJobsReq::default()
        };
        let err = submit_options(&defaults, &bad).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_list_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());

        let req = CreateJobsReq {
            text: Some("https://youtu.be/abc\nnot a url".into()),
            ..CreateJobsReq::default()
        };
        let Json(body) = create_jobs(State(st.clone()), Json(req)).await.unwrap();
        assert_eq!(body["accepted"].as_array().unwrap().len(), 1);
        assert_eq!(body["rejected"][0]["reason"], "invalid_url");

        let id = body["accepted"][0].as_str().unwrap().to_string();
        let deadline = Instant::now() + Duration::from_secs(10);
        while st.orchestrator.get(&id).map(|s| s.state) != Some(JobState::Completed) {
            assert!(Instant::now() < deadline, "job did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let Json(list) = list_jobs(State(st.clone())).await;
        assert_eq!(list["items"].as_array().unwrap().len(), 1);

        let Json(found) = get_job(State(st.clone()), Query(IdReq { id: id.clone() }))
            .await
            .unwrap();
        assert_eq!(found.title, "Scripted clip");

        // 已结束的任务不可取消
        let cancel = cancel_job(State(st.clone()), Json(IdReq { id })).await;
        assert_eq!(cancel.unwrap_err(), StatusCode::NOT_FOUND);

        let Json(cleared) = clear_jobs(State(st.clone())).await;
        assert_eq!(cleared["removed"], 1);
        st.orchestrator.shutdown();
    }

    #[tokio::test]
    async fn empty_submission_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        let err = create_jobs(State(st.clone()), Json(CreateJobsReq::default()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        st.orchestrator.shutdown();
    }
}

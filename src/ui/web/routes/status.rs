use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::ui::web::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) async fn api_status(State(state): State<AppState>) -> Json<Value> {
    let orch = &state.orchestrator;
    let settings = orch.settings();
    Json(json!({
        "version": VERSION,
        "save_dir": state.defaults.destination.to_string_lossy(),
        "bind_addrs": state.bind_addrs.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
        "workers": settings.workers,
        "active_jobs": orch.active_count(),
        "preflight": orch.preflight(),
        "defaults": {
            "quality": state.defaults.quality.name(),
            "use_accelerator": state.defaults.use_accelerator,
        }
    }))
}

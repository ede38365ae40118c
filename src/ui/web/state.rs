use std::net::SocketAddr;
use std::sync::Arc;

use crate::download::models::SubmitOptions;
use crate::download::orchestrator::Orchestrator;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) bind_addrs: Arc<Vec<SocketAddr>>,
    pub(crate) orchestrator: Arc<Orchestrator>,
    /// 请求未指定时使用的提交参数（来自配置文件与命令行）
    pub(crate) defaults: Arc<SubmitOptions>,
}

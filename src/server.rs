// 该文件是 Shanan （山南西风） 项目的一部分。
// src/server.rs - HTTP 推流与查询服务
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  net::{SocketAddr, TcpListener},
  path::PathBuf,
  sync::{Arc, PoisonError, RwLock},
  thread::{self, JoinHandle},
  time::Duration,
};

use axum::{
  Router,
  http::{HeaderName, Method},
  routing::{get, post},
};
use tokio::sync::{oneshot, watch};
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::{
  error::ServerError,
  model::ModelSlot,
  output::SNAPSHOT_JPEG_QUALITY,
  pipeline::Publisher,
  stats::{DetectionStats, SystemSampler},
};

mod routes;
mod stream;

pub const FRAME_SEQUENCE_HEADER: &str = "x-frame-sequence";

/// 关闭时等待连接结束的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// 服务端共享状态
#[derive(Clone)]
pub struct AppState {
  pub(crate) publisher: Arc<Publisher>,
  pub(crate) models: Arc<ModelSlot>,
  pub(crate) stats: Arc<DetectionStats>,
  pub(crate) system: Arc<SystemSampler>,
  pub(crate) models_dir: Arc<RwLock<Option<PathBuf>>>,
  pub(crate) snapshot_quality: u8,
}

impl AppState {
  pub fn new(
    publisher: Arc<Publisher>,
    models: Arc<ModelSlot>,
    stats: Arc<DetectionStats>,
    models_dir: Option<PathBuf>,
  ) -> Self {
    Self {
      publisher,
      models,
      stats,
      system: Arc::new(SystemSampler::new()),
      models_dir: Arc::new(RwLock::new(models_dir)),
      snapshot_quality: SNAPSHOT_JPEG_QUALITY,
    }
  }

  pub fn with_snapshot_quality(mut self, quality: u8) -> Self {
    self.snapshot_quality = quality.clamp(1, 100);
    self
  }

  pub fn set_models_dir(&self, dir: Option<PathBuf>) {
    *self
      .models_dir
      .write()
      .unwrap_or_else(PoisonError::into_inner) = dir;
  }

  pub fn models_dir(&self) -> Option<PathBuf> {
    self
      .models_dir
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
}

/// 构建全部路由
pub fn router(state: AppState) -> Router {
  let cors = CorsLayer::new()
    .allow_origin(Any)
    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
    .allow_headers(Any)
    .expose_headers([HeaderName::from_static(FRAME_SEQUENCE_HEADER)]);

  Router::new()
    .route("/health", get(routes::health))
    .route("/api/results", get(routes::results))
    .route("/api/stats", get(routes::stats))
    .route("/api/models", get(routes::list_models))
    .route("/api/model", post(routes::switch_model))
    .route("/snapshot", get(stream::snapshot))
    .route("/frame/latest", get(stream::latest_frame))
    .route("/stream", get(stream::annotated_stream))
    .route("/stream/annotated", get(stream::annotated_stream))
    .route("/stream/raw", get(stream::raw_stream))
    .layer(cors)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// 在独立线程上运行的 HTTP 服务
pub struct StreamServer {
  addr: SocketAddr,
  shutdown: Option<oneshot::Sender<()>>,
  thread: Option<JoinHandle<()>>,
}

impl StreamServer {
  /// 绑定地址并在独立线程中启动服务，绑定失败时同步返回错误
  pub fn start(bind: &str, state: AppState) -> Result<Self, ServerError> {
    let listener = TcpListener::bind(bind).map_err(|e| ServerError::Bind(bind.to_string(), e))?;
    listener
      .set_nonblocking(true)
      .map_err(|e| ServerError::Bind(bind.to_string(), e))?;
    let addr = listener
      .local_addr()
      .map_err(|e| ServerError::Bind(bind.to_string(), e))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
      .worker_threads(2)
      .thread_name("shanan-http")
      .enable_all()
      .build()
      .map_err(ServerError::Runtime)?;

    let (tx, rx) = oneshot::channel::<()>();
    let app = router(state);

    let thread = thread::Builder::new()
      .name("shanan-server".to_string())
      .spawn(move || {
        runtime.block_on(async move {
          let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
              error!("无法接管监听套接字: {}", e);
              return;
            }
          };

          let (stop_tx, stop_rx) = watch::channel(false);
          let graceful = async move {
            let mut stop_rx = stop_rx;
            let _ = stop_rx.wait_for(|stop| *stop).await;
          };
          let serve = async move {
            if let Err(e) = axum::serve(listener, app)
              .with_graceful_shutdown(graceful)
              .await
            {
              error!("HTTP 服务异常退出: {}", e);
            }
          };
          let forced = async move {
            let _ = rx.await;
            let _ = stop_tx.send(true);
            tokio::time::sleep(SHUTDOWN_GRACE).await;
          };

          tokio::select! {
            _ = serve => {}
            _ = forced => warn!("仍有推流连接未关闭，强制停止 HTTP 服务"),
          }
        });
        // 推流连接是长连接，关闭时不等待其自然结束
        runtime.shutdown_background();
      })
      .map_err(ServerError::Runtime)?;

    info!("HTTP 服务已启动: http://{}", addr);
    Ok(Self {
      addr,
      shutdown: Some(tx),
      thread: Some(thread),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.addr
  }

  pub fn is_running(&self) -> bool {
    self.thread.is_some()
  }

  pub fn stop(&mut self) {
    if let Some(tx) = self.shutdown.take() {
      let _ = tx.send(());
    }
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        error!("HTTP 服务线程异常退出");
      }
      info!("HTTP 服务已停止");
    }
  }
}

impl Drop for StreamServer {
  fn drop(&mut self) {
    self.stop();
  }
}

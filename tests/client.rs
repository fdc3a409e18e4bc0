// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/client.rs - 推流客户端与服务端联调测试
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::Duration,
};

use bytes::Bytes;
use image::RgbImage;
use tokio::sync::mpsc;

use shanan_edge::{
  client::{ClientConfig, ClientUpdate, FAILED_TO_FETCH, InitialMode, Mode, StreamDriver},
  model::ModelSlot,
  output::encode_jpeg,
  pipeline::{CaptureState, PublishState, Publisher},
  server::{AppState, StreamServer},
  stats::DetectionStats,
};

/// 运行中的服务端与后台发布线程
struct LiveServer {
  server: StreamServer,
  running: Arc<AtomicBool>,
  publisher_thread: Option<thread::JoinHandle<()>>,
}

impl LiveServer {
  fn start(publish_frames: bool) -> Self {
    let publisher = Arc::new(Publisher::new());
    let state = AppState::new(
      publisher.clone(),
      Arc::new(ModelSlot::new()),
      Arc::new(DetectionStats::default()),
      None,
    );
    let server = StreamServer::start("127.0.0.1:0", state).unwrap();
    let running = Arc::new(AtomicBool::new(true));

    let publisher_thread = publish_frames.then(|| {
      let running = running.clone();
      thread::spawn(move || {
        let image = Arc::new(RgbImage::from_pixel(32, 24, image::Rgb([10, 200, 10])));
        let jpeg = Bytes::from(encode_jpeg(&image, 80).unwrap());
        while running.load(Ordering::Acquire) {
          publisher.publish(PublishState {
            annotated_jpeg: jpeg.clone(),
            raw_jpeg: jpeg.clone(),
            annotated_image: Some(image.clone()),
            raw_image: Some(image.clone()),
            sequence: publisher.next_sequence(),
            state: CaptureState::Running,
            ..PublishState::default()
          });
          thread::sleep(Duration::from_millis(20));
        }
      })
    });

    Self {
      server,
      running,
      publisher_thread,
    }
  }

  fn base_url(&self) -> String {
    format!("http://{}", self.server.local_addr())
  }
}

impl Drop for LiveServer {
  fn drop(&mut self) {
    self.running.store(false, Ordering::Release);
    if let Some(thread) = self.publisher_thread.take() {
      let _ = thread.join();
    }
    self.server.stop();
  }
}

async fn next_update(updates: &mut mpsc::UnboundedReceiver<ClientUpdate>) -> ClientUpdate {
  tokio::time::timeout(Duration::from_secs(10), updates.recv())
    .await
    .expect("update in time")
    .expect("driver alive")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polling_client_follows_sequence() {
  let server = LiveServer::start(true);
  let config = ClientConfig {
    initial_mode: InitialMode::Polling,
    poll_interval_ms: 20,
    ..ClientConfig::default()
  };
  let (driver, mut updates) = StreamDriver::new(server.base_url(), config).unwrap();
  let handle = driver.handle();
  let runner = tokio::spawn(driver.run());

  assert_eq!(
    next_update(&mut updates).await,
    ClientUpdate::ModeChanged(Mode::Polling)
  );

  let mut sequences = Vec::new();
  while sequences.len() < 3 {
    match next_update(&mut updates).await {
      ClientUpdate::Frame { sequence, jpeg } => {
        assert!(jpeg.starts_with(&[0xFF, 0xD8]));
        sequences.push(sequence.expect("polled frames carry a sequence"));
      }
      ClientUpdate::Connected(mode) => assert_eq!(mode, Mode::Polling),
      other => panic!("unexpected update: {other:?}"),
    }
  }
  assert!(sequences.windows(2).all(|w| w[0] != w[1]), "{sequences:?}");

  handle.stop();
  runner.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_client_streams_mjpeg() {
  let server = LiveServer::start(true);
  let (driver, mut updates) =
    StreamDriver::new(server.base_url(), ClientConfig::default()).unwrap();
  let handle = driver.handle();
  let runner = tokio::spawn(driver.run());

  assert_eq!(
    next_update(&mut updates).await,
    ClientUpdate::ModeChanged(Mode::Mjpeg)
  );
  assert_eq!(
    next_update(&mut updates).await,
    ClientUpdate::Connected(Mode::Mjpeg)
  );
  let mut frames = 0;
  while frames < 3 {
    if let ClientUpdate::Frame { sequence, jpeg } = next_update(&mut updates).await {
      assert_eq!(sequence, None);
      assert!(jpeg.starts_with(&[0xFF, 0xD8]));
      frames += 1;
    }
  }

  handle.switch_mode(Mode::Polling);
  loop {
    if next_update(&mut updates).await == ClientUpdate::ModeChanged(Mode::Polling) {
      break;
    }
  }

  handle.stop();
  runner.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_stream_falls_back_then_fails() {
  let server = LiveServer::start(false);
  let config = ClientConfig {
    connect_timeout_ms: 300,
    polling_retry_ms: 10,
    max_polling_failures: 3,
    ..ClientConfig::default()
  };
  let (driver, mut updates) = StreamDriver::new(server.base_url(), config).unwrap();
  let runner = tokio::spawn(driver.run());

  assert_eq!(
    next_update(&mut updates).await,
    ClientUpdate::ModeChanged(Mode::Mjpeg)
  );
  assert_eq!(
    next_update(&mut updates).await,
    ClientUpdate::ModeChanged(Mode::Polling)
  );
  match next_update(&mut updates).await {
    ClientUpdate::Failed(e) => assert_eq!(e.message, FAILED_TO_FETCH),
    other => panic!("unexpected update: {other:?}"),
  }
  runner.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_gateway_exhausts_retries() {
  let port = {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
  };
  let config = ClientConfig {
    initial_mode: InitialMode::Polling,
    polling_retry_ms: 10,
    max_polling_failures: 4,
    ..ClientConfig::default()
  };
  let (driver, mut updates) =
    StreamDriver::new(format!("http://127.0.0.1:{port}"), config).unwrap();
  let handle = driver.handle();
  let runner = tokio::spawn(driver.run());

  assert_eq!(
    next_update(&mut updates).await,
    ClientUpdate::ModeChanged(Mode::Polling)
  );
  match next_update(&mut updates).await {
    ClientUpdate::Failed(e) => assert_eq!(e.message, FAILED_TO_FETCH),
    other => panic!("unexpected update: {other:?}"),
  }

  // 终止状态下不再自动请求，页面重新可见时重新连接
  handle.set_visible(true);
  match next_update(&mut updates).await {
    ClientUpdate::Failed(e) => assert_eq!(e.message, FAILED_TO_FETCH),
    other => panic!("unexpected update: {other:?}"),
  }

  handle.stop();
  runner.await.unwrap();
}

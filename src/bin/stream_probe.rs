// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/stream_probe.rs - 推流客户端探测工具
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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shanan_edge::client::{ClientConfig, ClientUpdate, InitialMode, StreamDriver};

/// 连接网关并记录推流客户端事件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 网关地址，例如 http://192.168.1.10:8080
  #[arg(long, value_name = "URL")]
  pub url: String,

  /// 初始取帧方式
  #[arg(long, value_enum, default_value_t = InitialMode::Auto)]
  pub mode: InitialMode,

  /// 使用原始画面推流
  #[arg(long)]
  pub raw: bool,

  /// 收到指定帧数后退出，0 表示不限
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: usize,

  /// 将最后一帧保存到该路径
  #[arg(long, value_name = "FILE")]
  pub save: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  let config = ClientConfig {
    initial_mode: args.mode,
    annotated: !args.raw,
    ..ClientConfig::default()
  };

  let (driver, mut updates) =
    StreamDriver::new(args.url.clone(), config).context("无法创建 HTTP 客户端")?;
  let handle = driver.handle();
  let runner = tokio::spawn(driver.run());

  let interrupt = handle.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    interrupt.stop();
  })
  .context("无法注册 Ctrl-C 处理函数")?;

  info!("连接网关: {}", args.url);
  let mut frames = 0usize;
  let mut last_frame = None;
  while let Some(update) = updates.recv().await {
    match update {
      ClientUpdate::ModeChanged(mode) => info!("取帧方式: {:?}", mode),
      ClientUpdate::Connected(mode) => info!("已连接 ({:?})", mode),
      ClientUpdate::Frame { sequence, jpeg } => {
        frames += 1;
        match sequence {
          Some(sequence) => info!("帧 #{}: {} 字节", sequence, jpeg.len()),
          None => info!("推流帧: {} 字节", jpeg.len()),
        }
        last_frame = Some(jpeg);
        if args.frame_number > 0 && frames >= args.frame_number {
          warn!("已达到指定帧数 {}, 停止接收", args.frame_number);
          handle.stop();
        }
      }
      ClientUpdate::Failed(e) => {
        error!("{}", e);
        handle.stop();
      }
    }
  }

  runner.await.context("客户端任务异常退出")?;

  if let (Some(path), Some(jpeg)) = (&args.save, last_frame) {
    std::fs::write(path, &jpeg).with_context(|| format!("无法保存帧: {}", path.display()))?;
    info!("最后一帧已保存: {}", path.display());
  }
  info!("共收到 {} 帧", frames);
  Ok(())
}

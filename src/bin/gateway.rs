// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/gateway.rs - 边缘检测网关
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

use std::{sync::mpsc, thread, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shanan_edge::{InferenceContext, config::GatewayArgs};

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = GatewayArgs::parse();
  let config = args.resolve().context("无法读取网关配置")?;

  info!("Shanan 边缘检测网关 v{}", InferenceContext::version());
  info!("输入来源: {}", config.source);
  info!("监听地址: {}", config.bind_address());

  let mut ctx = InferenceContext::with_options(config.context_options());

  if let Some(model) = &config.model {
    info!("正在加载模型: {}", model.display());
    let status = ctx.load(model);
    if !status.is_ok() {
      warn!(
        "模型加载失败 ({}): {}，仅推送原始画面",
        status.code(),
        ctx.error().unwrap_or_default()
      );
    }
  }

  if !ctx.start_server_on(&config.bind_address()).is_ok() {
    bail!(
      "HTTP 服务启动失败: {}",
      ctx.error().unwrap_or_default()
    );
  }
  if !ctx.start_source(&config.source).is_ok() {
    bail!("输入源启动失败: {}", ctx.error().unwrap_or_default());
  }

  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法注册 Ctrl-C 处理函数")?;

  let _ = rx.recv();
  ctx.destroy();
  info!("网关已退出");
  Ok(())
}

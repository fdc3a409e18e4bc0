// 该文件是 Shanan （山南西风） 项目的一部分。
// src/client.rs - 推流客户端
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

//! 推流客户端。
//!
//! [`StreamClient`] 是不做 I/O 的状态机：输入事件，输出命令。
//! [`StreamDriver`] 用 tokio 与 reqwest 执行这些命令。

mod driver;
mod machine;

pub use self::driver::{ClientUpdate, DriverHandle, StreamDriver, read_multipart_frame};
pub use self::machine::{
  ClientConfig, Command, Event, FAILED_TO_FETCH, FetchId, InitialMode, Mode, Notification, Phase,
  ResourceId, StreamClient, StreamId, TimerId, TimerKind,
};

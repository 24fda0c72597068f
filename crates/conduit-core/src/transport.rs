//! 传输适配器向引擎提供的两个原语：`fill`（输入侧）与 `drain`（输出侧）。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 流式套接字、TLS 包装流、数据报与内存通道的 IO 形态各异，引擎只需要“产出一块字节”与
//!   “发送一段（可能分段的）字节”两种能力；
//! - 输入与输出拆成两个半部，读取循环与写出任务才能各自独占所有权，无需共享锁；
//!   分离（detach）时两个半部原样交还，可装入新的引擎实例。
//!
//! ## 契约（What）
//! - [`InputHalf::fill`] 返回 `Ok(0)` 表示输入结束；实现必须是取消安全的，
//!   因为引擎会在关闭/分离时丢弃挂起的 `fill` future；
//! - [`OutputHalf::drain`] 必须发送全部分段，返回实际发送的字节数；
//! - [`OutputHalf::close`] 是尽力而为的关闭，引擎会按 [`IoDisposition`] 过滤其错误；
//! - `classify` 允许适配器覆写默认的 IO 故障分类。

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::endpoint::Endpoints;
use crate::error::{IoDisposition, classify_io_error};
use crate::options::ConnectionOptions;

/// 写路径的冲刷模式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// 互斥区内暂存后交给写出任务，写出任务批量聚合后发送。
    #[default]
    Piped,
    /// 互斥区内立即调用 `drain`，每个包编码后同步发送。
    Direct,
}

#[async_trait]
pub trait InputHalf: Send + 'static {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    fn classify(&self, error: &io::Error) -> IoDisposition {
        classify_io_error(error)
    }
}

#[async_trait]
pub trait OutputHalf: Send + 'static {
    async fn drain(&mut self, segments: &[Bytes]) -> io::Result<usize>;

    async fn close(&mut self) -> io::Result<()>;

    /// 该输出半部期望的写路径模式。
    fn write_mode(&self, _options: &ConnectionOptions) -> WriteMode {
        WriteMode::Piped
    }

    fn classify(&self, error: &io::Error) -> IoDisposition {
        classify_io_error(error)
    }
}

/// 可被拆分为输入/输出半部的传输。
pub trait Transport: Send + 'static {
    type Input: InputHalf;
    type Output: OutputHalf;

    fn endpoints(&self) -> Endpoints;

    fn into_halves(self) -> (Self::Input, Self::Output);
}

#![deny(unsafe_code)]
#![warn(missing_docs)]

//! `conduit-codec-frames` 提供基于 `conduit-core` 过滤器契约的参考分帧实现。
//!
//! # 教案背景（Why）
//! - 引擎本身不理解任何帧格式；本 crate 演示如何在**不修改核心 crate** 的前提下，
//!   以外部过滤器与编码器接入最常见的三类分帧方式；
//! - 这些实现同时作为协议切换图中的节点，便于会话层组合“判别字节 + 具体帧格式”的协议。
//!
//! # 使用概览（How）
//! - 入站：[`TerminatorFilter`]（分隔符）、[`FixedSizeFilter`]（定长）、[`FixedHeaderFilter`]（定长头 + 变长体）；
//! - 出站：[`LineEncoder`] 与 [`LengthPrefixEncoder`] 分别与分隔符、长度前缀格式对称；
//! - [`LengthField`] 同时实现 [`HeaderDecoder`]，长度前缀的编解码两端共享同一描述。
//!
//! # 合约说明（What）
//! - 所有过滤器只通过 `FilterCursor` 消费字节，帧未完整前不推进游标；
//! - 包长上限统一由引擎的 `max_package_length` 守卫，定长头过滤器额外在读到头部后立即拒绝超限声明。
//!
//! # 风险提示（Trade-offs）
//! - 产出的包是独立的 `Bytes` 拷贝，换取与引擎缓冲解耦；对超大帧的零拷贝需求应自定义过滤器。

mod encode;
mod fixed;
mod length;
mod terminator;

pub use crate::encode::{LengthPrefixEncoder, LineEncoder};
pub use crate::fixed::{FixedHeaderFilter, FixedSizeFilter, HeaderDecoder, HeaderFrame};
pub use crate::length::LengthField;
pub use crate::terminator::TerminatorFilter;

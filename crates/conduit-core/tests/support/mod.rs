//! 集成测试共用的过滤器与辅助函数。
#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use conduit_core::{
    ConnectionError, ConnectionOptions, Endpoints, FilterCursor, FilterError, FilterGraph,
    FilterId, InputHalf, OutputHalf, PackageStream, PipelineFilter, Transport, WriteMode,
};

/// `\r\n` 分隔的文本行过滤器。
#[derive(Debug, Default)]
pub struct CrlfLines;

impl PipelineFilter for CrlfLines {
    type Package = String;

    fn filter(&mut self, cursor: &mut FilterCursor<'_>) -> Result<Option<String>, FilterError> {
        let Some(offset) = cursor.find(b"\r\n") else {
            return Ok(None);
        };
        let line = cursor
            .read_exact(offset)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
        cursor.advance(2);
        Ok(line)
    }

    fn reset(&mut self) {}
}

/// 任何输入都判定为协议违规。
#[derive(Debug, Default)]
pub struct Rejecting;

impl PipelineFilter for Rejecting {
    type Package = String;

    fn filter(&mut self, _: &mut FilterCursor<'_>) -> Result<Option<String>, FilterError> {
        Err(FilterError::protocol("unexpected byte"))
    }

    fn reset(&mut self) {}
}

/// 协议切换测试中的包：记录由哪个过滤器解析。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tagged {
    Fixed(String),
    Prefixed(String),
}

/// 统计每个过滤器被 `reset` 的次数。
#[derive(Debug, Default)]
pub struct ResetCounters {
    pub switch: AtomicUsize,
    pub fixed: AtomicUsize,
    pub prefixed: AtomicUsize,
}

/// 首字节判别：`$` 切到定长过滤器，`*` 切到长度前缀过滤器。
pub struct Switch {
    fixed: FilterId,
    prefixed: FilterId,
    next: Option<FilterId>,
    counters: Arc<ResetCounters>,
}

impl PipelineFilter for Switch {
    type Package = Tagged;

    fn filter(&mut self, cursor: &mut FilterCursor<'_>) -> Result<Option<Tagged>, FilterError> {
        match cursor.read_u8() {
            None => Ok(None),
            Some(b'$') => {
                self.next = Some(self.fixed);
                Ok(None)
            }
            Some(b'*') => {
                self.next = Some(self.prefixed);
                Ok(None)
            }
            Some(other) => Err(FilterError::protocol(format!("unknown discriminator {other:#04x}"))),
        }
    }

    fn reset(&mut self) {
        self.next = None;
        self.counters.switch.fetch_add(1, Ordering::SeqCst);
    }

    fn take_next_filter(&mut self) -> Option<FilterId> {
        self.next.take()
    }
}

pub const FIXED_BODY: usize = 36;

/// 定长 36 字节包体，解析后切回判别过滤器。
pub struct Fixed {
    back: FilterId,
    next: Option<FilterId>,
    dirty: bool,
    counters: Arc<ResetCounters>,
}

impl PipelineFilter for Fixed {
    type Package = Tagged;

    fn filter(&mut self, cursor: &mut FilterCursor<'_>) -> Result<Option<Tagged>, FilterError> {
        if self.dirty {
            return Err(FilterError::protocol("fixed filter reused without reset"));
        }
        let Some(body) = cursor.read_exact(FIXED_BODY) else {
            return Ok(None);
        };
        self.dirty = true;
        self.next = Some(self.back);
        Ok(Some(Tagged::Fixed(String::from_utf8_lossy(body).into_owned())))
    }

    fn reset(&mut self) {
        self.dirty = false;
        self.next = None;
        self.counters.fixed.fetch_add(1, Ordering::SeqCst);
    }

    fn take_next_filter(&mut self) -> Option<FilterId> {
        self.next.take()
    }
}

/// 4 位十进制 ASCII 长度头 + 包体，解析后切回判别过滤器。
pub struct Prefixed {
    back: FilterId,
    next: Option<FilterId>,
    body_len: Option<usize>,
    dirty: bool,
    counters: Arc<ResetCounters>,
}

impl PipelineFilter for Prefixed {
    type Package = Tagged;

    fn filter(&mut self, cursor: &mut FilterCursor<'_>) -> Result<Option<Tagged>, FilterError> {
        if self.dirty {
            return Err(FilterError::protocol("prefixed filter reused without reset"));
        }
        let body_len = match self.body_len {
            Some(len) => len,
            None => {
                let Some(header) = cursor.read_exact(4) else {
                    return Ok(None);
                };
                let len = std::str::from_utf8(header)
                    .ok()
                    .and_then(|text| text.parse::<usize>().ok())
                    .ok_or_else(|| FilterError::protocol("malformed length header"))?;
                self.body_len = Some(len);
                len
            }
        };
        let Some(body) = cursor.read_exact(body_len) else {
            return Ok(None);
        };
        self.dirty = true;
        self.next = Some(self.back);
        Ok(Some(Tagged::Prefixed(String::from_utf8_lossy(body).into_owned())))
    }

    fn reset(&mut self) {
        self.body_len = None;
        self.dirty = false;
        self.next = None;
        self.counters.prefixed.fetch_add(1, Ordering::SeqCst);
    }

    fn take_next_filter(&mut self) -> Option<FilterId> {
        self.next.take()
    }
}

/// 构造 `$`/`*` 协议切换图：0 号为判别过滤器。
pub fn switching_graph(counters: &Arc<ResetCounters>) -> FilterGraph<Tagged> {
    let mut graph = FilterGraph::new();
    let switch = FilterId::new(0);
    let fixed = FilterId::new(1);
    let prefixed = FilterId::new(2);
    graph.push(Switch {
        fixed,
        prefixed,
        next: None,
        counters: Arc::clone(counters),
    });
    graph.push(Fixed {
        back: switch,
        next: None,
        dirty: false,
        counters: Arc::clone(counters),
    });
    graph.push(Prefixed {
        back: switch,
        next: None,
        body_len: None,
        dirty: false,
        counters: Arc::clone(counters),
    });
    graph
}

/// 带超时地读取下一个包。
pub async fn next_package<P>(stream: &mut PackageStream<P>) -> Result<P> {
    let item = tokio::time::timeout(Duration::from_secs(5), stream.read())
        .await
        .context("等待包超时")?
        .ok_or_else(|| anyhow!("包序列提前结束"))?;
    item.map_err(|error: ConnectionError| anyhow!("包序列返回错误: {error}"))
}

/// 读取直到序列结束，收集全部包与可能出现的错误。
pub async fn drain_stream<P>(stream: &mut PackageStream<P>) -> Result<(Vec<P>, Option<ConnectionError>)> {
    let mut packages = Vec::new();
    let mut fault = None;
    loop {
        let item = tokio::time::timeout(Duration::from_secs(5), stream.read())
            .await
            .context("等待包序列结束超时")?;
        match item {
            Some(Ok(package)) => packages.push(package),
            Some(Err(error)) => fault = Some(error),
            None => return Ok((packages, fault)),
        }
    }
}

/// 永远没有输入的输入半部。
pub struct Silent;

#[async_trait]
impl InputHalf for Silent {
    async fn fill(&mut self, _buf: &mut BytesMut) -> io::Result<usize> {
        std::future::pending().await
    }
}

/// 输出半部的 `drain` 行为。
#[derive(Clone, Copy, Debug)]
pub enum DrainScript {
    /// 永不完成，如同对端停止读取且内核缓冲已满。
    Stall,
    /// 以指定类别的错误失败。
    Fail(io::ErrorKind),
}

/// 按脚本失败或阻塞的输出半部，并统计 `drain` 与 `close` 的调用次数。
pub struct ScriptedOutput {
    pub script: DrainScript,
    pub mode: WriteMode,
    pub close_error: Option<io::ErrorKind>,
    pub drains: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl ScriptedOutput {
    pub fn new(script: DrainScript, mode: WriteMode) -> Self {
        Self {
            script,
            mode,
            close_error: None,
            drains: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl OutputHalf for ScriptedOutput {
    async fn drain(&mut self, _segments: &[Bytes]) -> io::Result<usize> {
        self.drains.fetch_add(1, Ordering::SeqCst);
        match self.script {
            DrainScript::Stall => std::future::pending().await,
            DrainScript::Fail(kind) => Err(io::Error::new(kind, "scripted drain failure")),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match self.close_error {
            Some(kind) => Err(io::Error::new(kind, "scripted close failure")),
            None => Ok(()),
        }
    }

    fn write_mode(&self, _options: &ConnectionOptions) -> WriteMode {
        self.mode
    }
}

/// 静默输入 + 脚本化输出的传输。
pub struct ScriptedTransport {
    pub output: ScriptedOutput,
}

impl Transport for ScriptedTransport {
    type Input = Silent;
    type Output = ScriptedOutput;

    fn endpoints(&self) -> Endpoints {
        Endpoints::default()
    }

    fn into_halves(self) -> (Silent, ScriptedOutput) {
        (Silent, self.output)
    }
}

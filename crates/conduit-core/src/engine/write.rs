use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::close::CloseReason;
use crate::encoder::PackageEncoder;
use crate::error::{ConnectionError, DRAIN};
use crate::transport::{InputHalf, OutputHalf};

use super::Shared;

/// 写出任务通道容量（以写入单元计，一次冲刷为一个单元）。
const PIPE_CAPACITY: usize = 64;
/// 写出任务聚合到该分段数后停止再取新单元；单元本身从不拆分。
const MAX_BATCH: usize = 64;

/// 一次失败的物理发送及其应记录的关闭原因。
pub(crate) struct DrainFailure {
    pub(crate) error: ConnectionError,
    pub(crate) reason: CloseReason,
}

/// 带可选超时的 `drain`，并按输出半部的分类器映射故障。
async fn drain_segments<O: OutputHalf>(
    output: &mut O,
    segments: &[Bytes],
    timeout: Option<Duration>,
) -> Result<usize, DrainFailure> {
    let result = match timeout {
        Some(after) => match tokio::time::timeout(after, output.drain(segments)).await {
            Ok(result) => result,
            Err(_) => {
                return Err(DrainFailure {
                    error: ConnectionError::Timeout { op: DRAIN, after },
                    reason: CloseReason::TimeOut,
                });
            }
        },
        None => output.drain(segments).await,
    };
    result.map_err(|source| {
        let reason = output.classify(&source).close_reason();
        DrainFailure {
            error: ConnectionError::io(DRAIN, source),
            reason,
        }
    })
}

/// 与取消信号竞争的 `drain`；返回 `None` 表示进行中的发送已被丢弃。
///
/// # 契约（What）
/// - 发送总是先被轮询：取消后仍允许无需等待即可完成的发送（关闭前的最后一批分段依赖这一点）；
/// - 一旦发送需要等待（对端停止读取、内核缓冲已满），取消信号立即胜出，调用方不再阻塞。
///
/// # 风险（Trade-offs）
/// - 被丢弃的发送可能已写出部分字节，线路上的帧不再完整；这只发生在连接关闭或分离的过程中。
pub(crate) async fn drain_until_cancelled<O: OutputHalf>(
    output: &mut O,
    segments: &[Bytes],
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Option<Result<usize, DrainFailure>> {
    tokio::select! {
        biased;
        result = drain_segments(output, segments, timeout) => Some(result),
        _ = cancel.cancelled() => None,
    }
}

/// 输出半部当前的归属。
pub(crate) enum Outlet<O> {
    /// 互斥区内直接持有输出半部，冲刷即同步发送。
    Inline(O),
    /// 输出半部已移交写出任务，冲刷即投递到通道。
    Piped {
        tx: mpsc::Sender<Vec<Bytes>>,
        task: JoinHandle<O>,
    },
    /// 已在关闭或分离时回收。
    Released,
}

/// 写路径互斥区守护的全部状态。
///
/// # 契约（What）
/// - 只能在持有引擎写锁时访问，任何冲刷都不会交错；
/// - `staging` 是编码器与写回调使用的暂存区，编码失败时回滚到进入前的长度；
/// - `segments` 收集本次待冲刷的分段，原始字节零拷贝入列。
pub(crate) struct WriteSlot<O> {
    staging: BytesMut,
    segments: Vec<Bytes>,
    send_buffer_size: usize,
    pub(crate) outlet: Outlet<O>,
}

impl<O: OutputHalf> WriteSlot<O> {
    pub(crate) fn new(output: O, send_buffer_size: usize) -> Self {
        Self {
            staging: BytesMut::with_capacity(send_buffer_size),
            segments: Vec::new(),
            send_buffer_size,
            outlet: Outlet::Inline(output),
        }
    }

    pub(crate) fn stage(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.segments.push(data);
        }
    }

    pub(crate) fn stage_encoded<P: ?Sized, E: PackageEncoder<P> + ?Sized>(
        &mut self,
        encoder: &E,
        package: &P,
    ) -> Result<(), ConnectionError> {
        let mark = self.staging.len();
        self.staging.reserve(self.send_buffer_size);
        if let Err(error) = encoder.encode(&mut self.staging, package) {
            self.staging.truncate(mark);
            return Err(error.into());
        }
        self.commit_staging();
        Ok(())
    }

    pub(crate) fn stage_with<F: FnOnce(&mut BytesMut)>(&mut self, write: F) {
        self.staging.reserve(self.send_buffer_size);
        write(&mut self.staging);
        self.commit_staging();
    }

    fn commit_staging(&mut self) {
        if !self.staging.is_empty() {
            let chunk = self.staging.split().freeze();
            self.segments.push(chunk);
        }
    }

    /// 丢弃尚未冲刷的分段，用于失败后的清理。
    pub(crate) fn discard(&mut self) {
        self.segments.clear();
        self.staging.clear();
    }

    /// 把已暂存的分段交给输出侧。
    ///
    /// 内联发送与管道投递都与取消信号竞争，关闭或分离时持锁的发送者不会无限期阻塞。
    pub(crate) async fn flush(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), FlushError> {
        if self.segments.is_empty() {
            return Ok(());
        }
        match &mut self.outlet {
            Outlet::Inline(output) => {
                let result = drain_until_cancelled(output, &self.segments, timeout, cancel).await;
                self.segments.clear();
                match result {
                    Some(Ok(_)) => Ok(()),
                    Some(Err(failure)) => Err(FlushError::Drain(failure)),
                    None => Err(FlushError::Aborted),
                }
            }
            Outlet::Piped { tx, .. } => {
                // 同一次冲刷的分段作为一个单元入列，保证它们落在同一次 `drain` 中。
                let unit = std::mem::take(&mut self.segments);
                tokio::select! {
                    biased;
                    sent = tx.send(unit) => sent.map_err(|_| FlushError::Aborted),
                    _ = cancel.cancelled() => Err(FlushError::Aborted),
                }
            }
            Outlet::Released => {
                self.segments.clear();
                Err(FlushError::Aborted)
            }
        }
    }
}

pub(crate) enum FlushError {
    Drain(DrainFailure),
    /// 输出侧已回收，或发送被取消信号中止。
    Aborted,
}

/// 把内联输出半部移交给写出任务。
pub(crate) fn start_pipe<I, O>(shared: &Arc<Shared<I, O>>, slot: &mut WriteSlot<O>)
where
    I: InputHalf,
    O: OutputHalf,
{
    let Outlet::Inline(_) = slot.outlet else {
        return;
    };
    let Outlet::Inline(output) = std::mem::replace(&mut slot.outlet, Outlet::Released) else {
        return;
    };
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    let task = tokio::spawn(
        drain_pipe(Arc::clone(shared), output, rx).instrument(shared.span.clone()),
    );
    slot.outlet = Outlet::Piped { tx, task };
}

/// 写出任务：聚合通道中的分段，以一次分散写发送。
///
/// # 逻辑（How）
/// 1. 优先消费通道，其次观察取消信号；取到首个单元后非阻塞地继续取，直到分段数达到 `MAX_BATCH`；
/// 2. 发送失败时记录原因并触发取消，由生命周期收尾负责关闭；
/// 3. 取消或通道关闭后，尽力冲刷通道中剩余的单元，再交还输出半部。
///
/// # 风险（Trade-offs）
/// - 每次 `drain` 都与取消信号竞争：取消后只有无需等待即可完成的发送会落到线路上，
///   对端停止读取时剩余分段被丢弃，输出半部照常交还。
async fn drain_pipe<I, O>(shared: Arc<Shared<I, O>>, mut output: O, mut rx: mpsc::Receiver<Vec<Bytes>>) -> O
where
    I: InputHalf,
    O: OutputHalf,
{
    let timeout = shared.options.send_timeout();
    let mut batch = Vec::with_capacity(MAX_BATCH);
    loop {
        let first = tokio::select! {
            biased;
            unit = rx.recv() => unit,
            _ = shared.cancel.cancelled() => None,
        };
        let Some(first) = first else {
            break;
        };
        batch.extend(first);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(unit) => batch.extend(unit),
                Err(_) => break,
            }
        }
        let result = drain_until_cancelled(&mut output, &batch, timeout, &shared.cancel).await;
        let segments = batch.len();
        batch.clear();
        match result {
            Some(Ok(_)) => shared.activity.touch(),
            Some(Err(failure)) => {
                shared.report_failure("drain", &failure.error, failure.reason);
                return output;
            }
            None => {
                tracing::debug!(segments, "in-flight drain dropped on cancellation");
                return output;
            }
        }
    }

    rx.close();
    while let Ok(unit) = rx.try_recv() {
        batch.extend(unit);
    }
    if !batch.is_empty() {
        match drain_until_cancelled(&mut output, &batch, timeout, &shared.cancel).await {
            Some(Ok(_)) => shared.activity.touch(),
            Some(Err(failure)) => shared.report_failure("drain", &failure.error, failure.reason),
            None => tracing::debug!(segments = batch.len(), "pending segments dropped on cancellation"),
        }
    }
    output
}

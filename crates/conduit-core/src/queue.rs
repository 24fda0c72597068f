//! 包队列：解析循环（生产者）与包序列消费者之间的单生产者/单消费者异步交接区。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 解析循环运行在引擎内部任务上，消费者在会话层按自己的节奏迭代，二者不能互相无限阻塞；
//! - 慢消费者场景需要可选的“按需”策略，限制内存随积压增长。
//!
//! ## 逻辑（How）
//! - 底层为无界 `mpsc` 通道，槽位为“包 / 故障 / 终止标记”三态；
//! - 深度由原子计数维护：写入加一，读出减一；深度归零时通过 `Notify` 唤醒等待需求的生产者；
//! - [`QueueStrategy::DemandGated`] 下，生产者在下一次填充输入前调用 [`PackageWriter::demand`]，
//!   直到上一个包被消费才返回；[`QueueStrategy::Eager`] 下该调用立即返回。
//!
//! ## 契约（What）
//! - 终止标记只写入一次，其后读取恒返回 `None`；
//! - 消费者被丢弃后写入返回 [`QueueClosed`]，引擎据此以本端关闭结束连接；
//! - 队列不支持多消费者扇出。

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use futures::Stream;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

use crate::error::ConnectionError;

/// 队列填充策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueStrategy {
    /// 生产者可任意超前于消费者。
    #[default]
    Eager,
    /// 上一个包被消费后才重新武装输入填充。
    DemandGated,
}

impl QueueStrategy {
    pub fn from_read_as_demand(read_as_demand: bool) -> Self {
        if read_as_demand {
            QueueStrategy::DemandGated
        } else {
            QueueStrategy::Eager
        }
    }
}

/// 消费者已不存在。
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("package consumer has been dropped")]
pub struct QueueClosed;

enum Slot<P> {
    Package(P),
    Fault(ConnectionError),
    End,
}

struct QueueState {
    strategy: QueueStrategy,
    depth: AtomicUsize,
    ended: AtomicBool,
    drained: Notify,
}

/// 创建一对生产端/消费端。
pub fn package_queue<P>(strategy: QueueStrategy) -> (PackageWriter<P>, PackageStream<P>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(QueueState {
        strategy,
        depth: AtomicUsize::new(0),
        ended: AtomicBool::new(false),
        drained: Notify::new(),
    });
    (
        PackageWriter {
            tx,
            state: Arc::clone(&state),
        },
        PackageStream {
            rx,
            state,
            finished: false,
        },
    )
}

/// 生产端，仅由解析循环与生命周期收尾逻辑持有。
pub struct PackageWriter<P> {
    tx: mpsc::UnboundedSender<Slot<P>>,
    state: Arc<QueueState>,
}

impl<P> Clone for PackageWriter<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<P> PackageWriter<P> {
    /// 入队一个包，返回入队后的深度。
    pub fn write(&self, package: P) -> Result<usize, QueueClosed> {
        let depth = self.state.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(Slot::Package(package)).is_err() {
            self.state.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(QueueClosed);
        }
        Ok(depth)
    }

    /// 入队一个终止性故障，消费者将以 `Err` 观察到它。
    pub fn write_fault(&self, error: ConnectionError) -> Result<(), QueueClosed> {
        self.tx.send(Slot::Fault(error)).map_err(|_| QueueClosed)
    }

    /// 写入终止标记；仅首次调用生效并返回 `true`。
    pub fn write_end(&self) -> bool {
        if self.state.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(Slot::End);
        true
    }

    /// 按需策略下等待上一个包被消费；消费者消失时立即返回。
    pub async fn demand(&self) {
        if self.state.strategy == QueueStrategy::Eager {
            return;
        }
        loop {
            if self.state.depth.load(Ordering::Acquire) == 0 || self.tx.is_closed() {
                return;
            }
            self.state.drained.notified().await;
        }
    }

    pub fn depth(&self) -> usize {
        self.state.depth.load(Ordering::Acquire)
    }

    pub fn strategy(&self) -> QueueStrategy {
        self.state.strategy
    }

    pub fn is_consumer_gone(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 惰性、单遍、不可重启的包序列。
///
/// 每一项为 `Ok(包)` 或终止性的 `Err`；序列结束后恒返回 `None`。
pub struct PackageStream<P> {
    rx: mpsc::UnboundedReceiver<Slot<P>>,
    state: Arc<QueueState>,
    finished: bool,
}

impl<P> std::fmt::Debug for PackageStream<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageStream")
            .field("depth", &self.depth())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<P> PackageStream<P> {
    /// 等待下一项，或在终止标记后返回 `None`。
    pub async fn read(&mut self) -> Option<Result<P, ConnectionError>> {
        poll_fn(|cx| self.poll_read(cx)).await
    }

    pub fn depth(&self) -> usize {
        self.state.depth.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<P, ConnectionError>>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(Slot::Package(package)) => {
                if self.state.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.state.drained.notify_one();
                }
                Poll::Ready(Some(Ok(package)))
            }
            Some(Slot::Fault(error)) => Poll::Ready(Some(Err(error))),
            Some(Slot::End) | None => {
                self.finished = true;
                self.rx.close();
                Poll::Ready(None)
            }
        }
    }
}

impl<P> Stream for PackageStream<P> {
    type Item = Result<P, ConnectionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_read(cx)
    }
}

impl<P> Drop for PackageStream<P> {
    fn drop(&mut self) {
        self.rx.close();
        self.state.drained.notify_one();
    }
}

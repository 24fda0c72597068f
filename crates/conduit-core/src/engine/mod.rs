//! 连接引擎：读取 → 解析 → 入队，以及写入 → 串行化 → 冲刷的通用编排。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 传输与协议都是可插拔的，引擎只负责三件事：驱动过滤器图、串行化写路径、管理生命周期；
//! - 生命周期必须同时支持“关闭”（通知会话层、释放传输）与“分离”（保留传输、移交新引擎）。
//!
//! ## 逻辑（How）
//! - `run` 启动两个任务：读取循环（独占输入半部与过滤器图）和监督任务（等待读取循环结束后收尾）；
//! - 每条连接只有一个 [`CancellationToken`]，关闭与分离都先触发它，再等待监督任务报告完成；
//!   写出任务共享同一个信号；
//! - 写路径由单个异步互斥锁守护，所有发送重载都经过它；
//! - 状态迁移通过 CAS 完成，`closed` 通知只会在 `Closing → Closed` 迁移成功时触发一次。
//!
//! ## 契约（What）
//! - 过滤器失败时，关闭先完成（状态为 `Closed`、通知已触发），随后消费者才会读到错误项，最后是终止标记；
//! - 分离成功后引擎进入 `Detached`，永不触发 `closed`，后续操作返回 [`ConnectionError::Detached`]。

mod parse;
mod read;
mod write;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::close::CloseReason;
use crate::connection::{Connection, ConnectionId};
use crate::encoder::PackageEncoder;
use crate::endpoint::{Endpoint, Endpoints};
use crate::error::{ConnectionError, IoDisposition, SHUTDOWN};
use crate::filter::{FilterError, FilterGraph};
use crate::options::ConnectionOptions;
use crate::queue::{PackageStream, PackageWriter, QueueStrategy, package_queue};
use crate::state::{ActivityClock, CloseReasonCell, ConnectionState, StateCell};
use crate::transport::{InputHalf, OutputHalf, Transport, WriteMode};

use self::parse::Parser;
use self::read::{LoopExit, Outcome, error_reason, read_loop};
use self::write::{FlushError, Outlet, WriteSlot, start_pipe};

type ClosedHandler = Box<dyn FnOnce(CloseReason) + Send>;

/// 分离后交还的传输资源，可装入新的引擎实例继续工作。
pub struct DetachedParts<I, O> {
    pub input: I,
    pub output: O,
    pub endpoints: Endpoints,
    /// 已读入但尚未被过滤器消费的字节。
    pub pending: BytesMut,
}

impl<I: InputHalf, O: OutputHalf> DetachedParts<I, O> {
    /// 以新配置构造接管该传输的引擎；首轮解析先处理 `pending`。
    pub fn attach(self, options: ConnectionOptions) -> PipeConnection<I, O> {
        PipeConnection::from_parts(
            self.input,
            self.output,
            self.endpoints,
            self.pending,
            options,
        )
    }
}

impl<I, O> fmt::Debug for DetachedParts<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedParts")
            .field("endpoints", &self.endpoints)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

pub(crate) struct Shared<I, O> {
    pub(crate) id: ConnectionId,
    pub(crate) options: ConnectionOptions,
    pub(crate) span: tracing::Span,
    endpoints: Endpoints,
    write_mode: WriteMode,
    state: StateCell,
    reason: CloseReasonCell,
    pub(crate) activity: ActivityClock,
    pub(crate) cancel: CancellationToken,
    detaching: AtomicBool,
    writer: AsyncMutex<WriteSlot<O>>,
    idle_input: Mutex<Option<(I, BytesMut)>>,
    detached: Mutex<Option<DetachedParts<I, O>>>,
    handlers: Mutex<Vec<ClosedHandler>>,
    closed_tx: watch::Sender<Option<CloseReason>>,
    finished_tx: watch::Sender<bool>,
}

impl<I: InputHalf, O: OutputHalf> Shared<I, O> {
    /// 记录故障日志；可忽略的断连类故障保持静默。
    pub(crate) fn log_fault(&self, stage: &'static str, error: &ConnectionError, reason: CloseReason) {
        match reason {
            CloseReason::RemoteClosing | CloseReason::LocalClosing => {}
            CloseReason::ProtocolError | CloseReason::TimeOut => tracing::warn!(
                parent: &self.span,
                stage,
                code = error.code(),
                reason = %reason,
                error = %error,
                "connection fault"
            ),
            _ => tracing::error!(
                parent: &self.span,
                stage,
                code = error.code(),
                reason = %reason,
                error = %error,
                "connection fault"
            ),
        }
    }

    /// 记录故障并触发取消，由监督任务完成关闭。
    pub(crate) fn report_failure(&self, stage: &'static str, error: &ConnectionError, reason: CloseReason) {
        self.log_fault(stage, error, reason);
        self.reason.record(reason);
        self.cancel.cancel();
    }

    fn ensure_writable(&self) -> Result<(), ConnectionError> {
        match self.state.get() {
            ConnectionState::NotStarted | ConnectionState::Running => Ok(()),
            ConnectionState::Detached => Err(ConnectionError::Detached),
            ConnectionState::Closing | ConnectionState::Closed => Err(self.closed_error()),
        }
    }

    /// 发送被关闭或分离中止时返回给调用方的错误。
    fn aborted_error(&self) -> ConnectionError {
        if self.detaching.load(Ordering::SeqCst) || self.state.get() == ConnectionState::Detached {
            ConnectionError::Detached
        } else {
            self.closed_error()
        }
    }

    fn closed_error(&self) -> ConnectionError {
        ConnectionError::Closed {
            reason: self.reason.get_or_unknown(),
        }
    }

    /// 回收输出半部：内联模式直接取出，管道模式关闭通道并等待写出任务交还。
    async fn release_output(&self) -> Option<O> {
        let mut slot = self.writer.lock().await;
        slot.discard();
        match std::mem::replace(&mut slot.outlet, Outlet::Released) {
            Outlet::Inline(output) => Some(output),
            Outlet::Piped { tx, task } => {
                drop(tx);
                match task.await {
                    Ok(output) => Some(output),
                    Err(error) => {
                        tracing::error!(parent: &self.span, error = %error, "drain task aborted");
                        None
                    }
                }
            }
            Outlet::Released => None,
        }
    }

    async fn shutdown_output(&self, output: Option<O>) {
        let Some(mut output) = output else {
            return;
        };
        if let Err(source) = output.close().await {
            if output.classify(&source) != IoDisposition::Ignorable {
                let error = ConnectionError::io(SHUTDOWN, source);
                tracing::warn!(
                    parent: &self.span,
                    code = error.code(),
                    error = %error,
                    "transport shutdown failed"
                );
            }
        }
    }

    /// `Closing → Closed`，成功者负责触发通知与回调。
    fn fire_closed(&self) {
        if !self.state.transition(ConnectionState::Closing, ConnectionState::Closed) {
            return;
        }
        let reason = self.reason.get_or_unknown();
        tracing::debug!(parent: &self.span, reason = %reason, "connection closed");
        self.closed_tx.send_replace(Some(reason));
        let handlers = std::mem::take(&mut *self.handlers.lock());
        for handler in handlers {
            handler(reason);
        }
    }

    fn mark_finished(&self) {
        self.finished_tx.send_replace(true);
    }

    async fn wait_finished(&self) {
        let mut finished = self.finished_tx.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    fn take_detached(&self) -> Result<DetachedParts<I, O>, ConnectionError> {
        self.detached.lock().take().ok_or_else(|| self.closed_error())
    }
}

/// 传输无关的连接引擎。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“字节 ↔ 包”的全部编排集中在一个类型上，四类传输适配器只需提供输入/输出半部；
/// - 句柄可廉价克隆，读取循环、写出任务与会话层共享同一份内部状态。
///
/// ## 契约（What）
/// - [`run`](PipeConnection::run) 只能调用一次，返回惰性、单遍的包序列；
/// - 三种发送重载都经过同一把写锁；关闭或分离后发送立即失败；
/// - [`close`](PipeConnection::close) 与 [`detach`](PipeConnection::detach) 都会等待循环完全退出；
///   阻塞中的发送（对端停止读取）随取消信号中止，分别返回 `Closed` 与 `Detached`。
///
/// ## 风险（Trade-offs）
/// - 发送在启动前也被允许，此时在写锁内直接调用 `drain`；
/// - 管道模式下发送返回仅表示已投递到写出任务，而非已写入内核。
pub struct PipeConnection<I, O> {
    shared: Arc<Shared<I, O>>,
}

impl<I, O> Clone for PipeConnection<I, O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<I: InputHalf, O: OutputHalf> PipeConnection<I, O> {
    pub fn new<T>(transport: T, options: ConnectionOptions) -> Self
    where
        T: Transport<Input = I, Output = O>,
    {
        let endpoints = transport.endpoints();
        let (input, output) = transport.into_halves();
        Self::from_parts(input, output, endpoints, BytesMut::new(), options)
    }

    pub fn from_parts(
        input: I,
        output: O,
        endpoints: Endpoints,
        pending: BytesMut,
        options: ConnectionOptions,
    ) -> Self {
        let options = options.normalized();
        let id = ConnectionId::next();
        let remote = display_endpoint(endpoints.remote.as_ref());
        let local = display_endpoint(endpoints.local.as_ref());
        let span = match &options.span {
            Some(parent) => tracing::debug_span!(parent: parent, "connection", %id, %remote, %local),
            None => tracing::debug_span!("connection", %id, %remote, %local),
        };
        let write_mode = output.write_mode(&options);
        let writer = WriteSlot::new(output, options.send_buffer_size);
        let (closed_tx, _) = watch::channel(None);
        let (finished_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                id,
                options,
                span,
                endpoints,
                write_mode,
                state: StateCell::new(),
                reason: CloseReasonCell::default(),
                activity: ActivityClock::new(),
                cancel: CancellationToken::new(),
                detaching: AtomicBool::new(false),
                writer: AsyncMutex::new(writer),
                idle_input: Mutex::new(Some((input, pending))),
                detached: Mutex::new(None),
                handlers: Mutex::new(Vec::new()),
                closed_tx,
                finished_tx,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.shared.endpoints
    }

    pub fn remote_endpoint(&self) -> Option<&Endpoint> {
        self.shared.endpoints.remote.as_ref()
    }

    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.shared.endpoints.local.as_ref()
    }

    pub fn last_active_time(&self) -> SystemTime {
        self.shared.activity.get()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.get()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    pub fn write_mode(&self) -> WriteMode {
        self.shared.write_mode
    }

    /// 启动读取-解析循环，返回包序列。
    ///
    /// # 逻辑（How）
    /// 1. 校验入口过滤器已登记，取出空闲的输入半部并 CAS 进入 `Running`；
    /// 2. 管道模式下把输出半部移交写出任务；
    /// 3. 按 `read_as_demand` 选择队列策略，派生读取循环与监督任务。
    pub async fn run<P>(
        &self,
        filters: impl Into<FilterGraph<P>>,
    ) -> Result<PackageStream<P>, ConnectionError>
    where
        P: Send + 'static,
    {
        let graph = filters.into();
        if !graph.contains(graph.current()) {
            return Err(FilterError::UnknownFilter(graph.current()).into());
        }
        let shared = &self.shared;
        match shared.state.get() {
            ConnectionState::NotStarted => {}
            ConnectionState::Running => return Err(ConnectionError::AlreadyStarted),
            ConnectionState::Detached => return Err(ConnectionError::Detached),
            ConnectionState::Closing | ConnectionState::Closed => return Err(shared.closed_error()),
        }

        let mut slot = shared.writer.lock().await;
        let Some((input, pending)) = shared.idle_input.lock().take() else {
            return Err(ConnectionError::AlreadyStarted);
        };
        if !shared
            .state
            .transition(ConnectionState::NotStarted, ConnectionState::Running)
        {
            *shared.idle_input.lock() = Some((input, pending));
            return Err(match shared.state.get() {
                ConnectionState::Detached => ConnectionError::Detached,
                ConnectionState::Running => ConnectionError::AlreadyStarted,
                _ => shared.closed_error(),
            });
        }
        if shared.write_mode == WriteMode::Piped {
            start_pipe(shared, &mut slot);
        }
        drop(slot);

        let strategy = QueueStrategy::from_read_as_demand(shared.options.read_as_demand);
        let (writer, stream) = package_queue(strategy);
        let parser = Parser::new(graph, shared.options.max_package_length);
        tracing::debug!(parent: &shared.span, ?strategy, write_mode = ?shared.write_mode, "connection started");

        let reader = tokio::spawn(
            read_loop(Arc::clone(shared), input, pending, parser, writer.clone())
                .instrument(shared.span.clone()),
        );
        tokio::spawn(supervise(Arc::clone(shared), reader, writer).instrument(shared.span.clone()));
        Ok(stream)
    }

    /// 发送原始字节。
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), ConnectionError> {
        let data = data.into();
        self.write(move |slot| {
            slot.stage(data);
            Ok(())
        })
        .await
    }

    /// 在一次加锁内发送多个缓冲，按顺序冲刷。
    pub async fn send_all<B>(&self, buffers: impl IntoIterator<Item = B>) -> Result<(), ConnectionError>
    where
        B: Into<Bytes>,
    {
        let buffers: Vec<Bytes> = buffers.into_iter().map(Into::into).collect();
        self.write(move |slot| {
            for buffer in buffers {
                slot.stage(buffer);
            }
            Ok(())
        })
        .await
    }

    /// 以编码器编码结构化包后发送；编码失败只影响本次调用。
    pub async fn send_package<P, E>(&self, encoder: &E, package: &P) -> Result<(), ConnectionError>
    where
        P: ?Sized + Sync,
        E: PackageEncoder<P> + ?Sized,
    {
        self.write(|slot| slot.stage_encoded(encoder, package)).await
    }

    /// 在写锁内直接向出站暂存区写入。
    pub async fn send_with<F>(&self, write: F) -> Result<(), ConnectionError>
    where
        F: FnOnce(&mut BytesMut) + Send,
    {
        self.write(move |slot| {
            slot.stage_with(write);
            Ok(())
        })
        .await
    }

    async fn write<F>(&self, stage: F) -> Result<(), ConnectionError>
    where
        F: FnOnce(&mut WriteSlot<O>) -> Result<(), ConnectionError> + Send,
    {
        let shared = &self.shared;
        shared.ensure_writable()?;
        let mut slot = shared.writer.lock().await;
        shared.ensure_writable()?;
        stage(&mut slot)?;
        let result = slot
            .flush(shared.options.send_timeout(), &shared.cancel)
            .await;
        if result.is_err() {
            slot.discard();
        }
        drop(slot);

        match result {
            Ok(()) => {
                if shared.write_mode == WriteMode::Direct || self.state() == ConnectionState::NotStarted {
                    shared.activity.touch();
                }
                Ok(())
            }
            Err(FlushError::Aborted) => Err(shared.aborted_error()),
            Err(FlushError::Drain(failure)) => {
                if self.state() == ConnectionState::NotStarted {
                    shared.log_fault("drain", &failure.error, failure.reason);
                    let _ = self.close(failure.reason).await;
                } else {
                    shared.report_failure("drain", &failure.error, failure.reason);
                }
                Err(failure.error)
            }
        }
    }

    /// 以指定原因关闭连接，等待循环完全退出后返回；重复调用是幂等的。
    pub async fn close(&self, reason: CloseReason) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        loop {
            match shared.state.get() {
                ConnectionState::NotStarted => {
                    if !shared
                        .state
                        .transition(ConnectionState::NotStarted, ConnectionState::Closing)
                    {
                        continue;
                    }
                    shared.reason.record(reason);
                    shared.cancel.cancel();
                    let input = shared.idle_input.lock().take();
                    let output = shared.release_output().await;
                    shared.shutdown_output(output).await;
                    drop(input);
                    shared.fire_closed();
                    shared.mark_finished();
                    return Ok(());
                }
                ConnectionState::Running => {
                    if !shared
                        .state
                        .transition(ConnectionState::Running, ConnectionState::Closing)
                    {
                        continue;
                    }
                    shared.reason.record(reason);
                    shared.cancel.cancel();
                    shared.wait_finished().await;
                    return Ok(());
                }
                ConnectionState::Closing | ConnectionState::Closed => {
                    shared.wait_finished().await;
                    return match shared.state.get() {
                        ConnectionState::Detached => Err(ConnectionError::Detached),
                        _ => Ok(()),
                    };
                }
                ConnectionState::Detached => return Err(ConnectionError::Detached),
            }
        }
    }

    /// 取消循环但保持传输打开，交还传输资源。
    ///
    /// # 契约（What）
    /// - 返回后本引擎不再对传输做任何 IO，也不会触发 `closed`；
    /// - 若循环已因其他原因结束（输入结束、故障），返回 [`ConnectionError::Closed`]。
    pub async fn detach(&self) -> Result<DetachedParts<I, O>, ConnectionError> {
        let shared = &self.shared;
        loop {
            match shared.state.get() {
                ConnectionState::NotStarted => {
                    if !shared
                        .state
                        .transition(ConnectionState::NotStarted, ConnectionState::Detached)
                    {
                        continue;
                    }
                    let idle = shared.idle_input.lock().take();
                    let output = shared.release_output().await;
                    shared.mark_finished();
                    return match (idle, output) {
                        (Some((input, pending)), Some(output)) => Ok(DetachedParts {
                            input,
                            output,
                            endpoints: shared.endpoints.clone(),
                            pending,
                        }),
                        _ => Err(shared.closed_error()),
                    };
                }
                ConnectionState::Running => {
                    if !shared
                        .state
                        .transition(ConnectionState::Running, ConnectionState::Closing)
                    {
                        continue;
                    }
                    shared.detaching.store(true, Ordering::SeqCst);
                    shared.cancel.cancel();
                    shared.wait_finished().await;
                    return shared.take_detached();
                }
                ConnectionState::Detached => return Err(ConnectionError::Detached),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(shared.closed_error());
                }
            }
        }
    }

    /// 等待 `closed` 通知；已分离的连接永不完成。
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.shared.closed_tx.subscribe();
        match closed.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or_default(),
            Err(_) => self.shared.reason.get_or_unknown(),
        }
    }

    /// 注册一次性关闭回调；若连接已关闭则立即以当前原因调用。
    pub fn on_closed<F>(&self, handler: F)
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        let mut handlers = self.shared.handlers.lock();
        if self.state() == ConnectionState::Closed {
            drop(handlers);
            handler(self.shared.reason.get_or_unknown());
            return;
        }
        handlers.push(Box::new(handler));
    }
}

impl<I, O> fmt::Debug for PipeConnection<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeConnection")
            .field("id", &self.shared.id)
            .field("endpoints", &self.shared.endpoints)
            .field("write_mode", &self.shared.write_mode)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<I: InputHalf, O: OutputHalf> Connection for PipeConnection<I, O> {
    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    fn remote_endpoint(&self) -> Option<&Endpoint> {
        self.shared.endpoints.remote.as_ref()
    }

    fn local_endpoint(&self) -> Option<&Endpoint> {
        self.shared.endpoints.local.as_ref()
    }

    fn last_active_time(&self) -> SystemTime {
        self.shared.activity.get()
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.get()
    }

    async fn send(&self, data: Bytes) -> Result<(), ConnectionError> {
        PipeConnection::send(self, data).await
    }

    async fn close(&self, reason: CloseReason) -> Result<(), ConnectionError> {
        PipeConnection::close(self, reason).await
    }

    async fn closed(&self) -> CloseReason {
        PipeConnection::closed(self).await
    }
}

/// 监督任务：等待读取循环结束，按“分离”或“关闭”两条路径收尾。
///
/// # 逻辑（How）
/// - 分离路径：仅当分离请求触发了取消且输入半部完好时进入，回收输出半部并保存交接资源，
///   不关闭传输、不触发 `closed`；
/// - 关闭路径：记录原因 → 停止写出任务 → 回收并关闭输出半部 → 触发 `closed` →
///   推送故障项（若有）→ 推送终止标记。
async fn supervise<I, O, P>(
    shared: Arc<Shared<I, O>>,
    reader: JoinHandle<LoopExit<I>>,
    writer: PackageWriter<P>,
) where
    I: InputHalf,
    O: OutputHalf,
    P: Send + 'static,
{
    let (input, pending, outcome) = match reader.await {
        Ok(exit) => (Some(exit.input), exit.pending, exit.outcome),
        Err(error) => {
            let error = ConnectionError::Internal(format!("read loop aborted: {error}"));
            shared.log_fault("read", &error, CloseReason::InternalError);
            (None, BytesMut::new(), Outcome::Failed(error))
        }
    };

    if shared.detaching.load(Ordering::SeqCst) && matches!(outcome, Outcome::Cancelled) {
        if let Some(input) = input {
            let output = shared.release_output().await;
            match output {
                Some(output) => {
                    *shared.detached.lock() = Some(DetachedParts {
                        input,
                        output,
                        endpoints: shared.endpoints.clone(),
                        pending,
                    });
                    shared
                        .state
                        .transition(ConnectionState::Closing, ConnectionState::Detached);
                    tracing::debug!("connection detached");
                }
                None => {
                    shared.reason.record(CloseReason::InternalError);
                    shared.fire_closed();
                }
            }
            writer.write_end();
            shared.mark_finished();
            return;
        }
    }

    let fault = match outcome {
        Outcome::Cancelled => None,
        Outcome::Ended(reason) => {
            shared.reason.record(reason);
            None
        }
        Outcome::Failed(error) => {
            let reason = match &input {
                Some(input) => error_reason(input, &error),
                None => error.close_reason(),
            };
            shared.reason.record(reason);
            Some(error)
        }
    };
    shared
        .state
        .transition(ConnectionState::Running, ConnectionState::Closing);
    shared.cancel.cancel();
    let output = shared.release_output().await;
    shared.shutdown_output(output).await;
    drop(input);
    shared.fire_closed();

    if let Some(error) = fault {
        let _ = writer.write_fault(error);
    }
    writer.write_end();
    shared.mark_finished();
}

fn display_endpoint(endpoint: Option<&Endpoint>) -> String {
    endpoint.map_or_else(|| "-".to_owned(), ToString::to_string)
}

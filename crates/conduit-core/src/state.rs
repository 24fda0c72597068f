use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::close::CloseReason;

/// 连接生命周期状态。
///
/// `NotStarted → Running → Closing → Closed`；`Detached` 是分离成功后的另一终态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    NotStarted = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
    Detached = 4,
}

impl ConnectionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::NotStarted,
            1 => ConnectionState::Running,
            2 => ConnectionState::Closing,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Detached,
        }
    }

    /// 判断状态迁移是否合法。
    ///
    /// # 逻辑（How）
    /// - 只允许向前推进，终态（`Closed`/`Detached`）不可再迁移；
    /// - `NotStarted` 可直接进入 `Closing`（启动前关闭）或 `Detached`（启动前分离）；
    /// - `Closing` 可进入 `Detached`：分离请求同样先标记为关闭中，以阻断新的发送。
    pub const fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (NotStarted, Closing)
                | (NotStarted, Detached)
                | (Running, Closing)
                | (Closing, Closed)
                | (Closing, Detached)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Detached)
    }
}

/// 以原子 CAS 守护的状态单元。
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::NotStarted as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// 仅当当前状态为 `from` 且迁移合法时切换，返回是否成功。
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        from.can_transition_to(to)
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

/// 先写者胜出的关闭原因。
#[derive(Debug, Default)]
pub(crate) struct CloseReasonCell(OnceLock<CloseReason>);

impl CloseReasonCell {
    /// 记录原因；已有记录时保持原值并返回 `false`。
    pub(crate) fn record(&self, reason: CloseReason) -> bool {
        self.0.set(reason).is_ok()
    }

    pub(crate) fn get(&self) -> Option<CloseReason> {
        self.0.get().copied()
    }

    pub(crate) fn get_or_unknown(&self) -> CloseReason {
        self.get().unwrap_or_default()
    }
}

/// 最近一次成功 IO 的时间戳（自 UNIX 纪元起的毫秒数）。
#[derive(Debug)]
pub(crate) struct ActivityClock(AtomicU64);

impl ActivityClock {
    pub(crate) fn new() -> Self {
        let clock = Self(AtomicU64::new(0));
        clock.touch();
        clock
    }

    pub(crate) fn touch(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        self.0.store(now, Ordering::Release);
    }

    pub(crate) fn get(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.0.load(Ordering::Acquire))
    }
}

//! 握手状态机。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 把“当前状态 + 后端单步结果 → 下一状态”写成纯函数，会话的 I/O 编排与状态规则分离，
//!   状态规则可以脱离套接字单独做属性测试；
//! - 以带标签的返回值（[`HandshakeStatus::Progress`]）表达“需要等待哪个方向”，而不是异常或内部阻塞。
//!
//! ## 契约（What）
//! - `NotStarted → {WantRead, WantWrite}* → Established | Failed`；
//! - `Established` 与 `Failed` 为终态，终态上再次推进返回 [`TransitionError`]；
//! - 已建立的会话在读写中遇到故障时由会话层直接置为 `Failed`，不经过 `advance`；
//! - `WantRead`/`WantWrite` 上可以重复推进（幂等），直到得到终态。

use std::fmt;

use thiserror::Error;

use crate::transport::Interest;

/// 握手状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// 尚未推进过。
    #[default]
    NotStarted,
    /// 等待可读后重试。
    WantRead,
    /// 等待可写后重试。
    WantWrite,
    /// 握手完成，可以读写。
    Established,
    /// 握手失败，只能关闭。
    Failed,
}

/// 后端单步推进的结果，作为状态转换的输入。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// 需要等待指定方向。
    Blocked(Interest),
    /// 握手完成。
    Done,
    /// 后端报告致命错误。
    Error,
}

/// 在终态上继续推进握手。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("handshake already resolved as {state}")]
pub struct TransitionError {
    /// 推进时所处的终态。
    pub state: HandshakeState,
}

impl HandshakeState {
    /// 是否为终态。
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }

    /// 纯状态转换。
    ///
    /// `Blocked(ReadWrite)` 归入 `WantRead`：握手期间的双向等待总是由读方向解除，
    /// 写方向的积压会在下一次推进开头被优先排空。
    pub const fn advance(self, outcome: StepOutcome) -> Result<Self, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError { state: self });
        }
        Ok(match outcome {
            StepOutcome::Blocked(Interest::Write) => Self::WantWrite,
            StepOutcome::Blocked(_) => Self::WantRead,
            StepOutcome::Done => Self::Established,
            StepOutcome::Error => Self::Failed,
        })
    }

    /// 需要等待的方向；非等待状态返回 `None`。
    pub const fn interest(self) -> Option<Interest> {
        match self {
            Self::WantRead => Some(Interest::Read),
            Self::WantWrite => Some(Interest::Write),
            _ => None,
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not-started",
            Self::WantRead => "want-read",
            Self::WantWrite => "want-write",
            Self::Established => "established",
            Self::Failed => "failed",
        })
    }
}

/// 单次握手推进对调用方的返回值；失败通过 `Err(TlsError)` 表达。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// 尚未完成，等待指定方向就绪后再次调用。
    Progress(Interest),
    /// 握手完成。
    Established,
}

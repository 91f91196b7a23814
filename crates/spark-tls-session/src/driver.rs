//! 基于 Tokio `AsyncFd` 的会话驱动。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话本身只提供非阻塞原语与就绪方向；在 Tokio 运行时中，把就绪等待交给 reactor，
//!   避免在异步任务里调用阻塞的 `poll`；
//! - 驱动只是会话的外壳，状态机、ALPN 与信任决策仍完全由 [`Session`] 负责。
//!
//! ## 契约（What）
//! - 字节流必须已处于非阻塞模式；会话整体交给 `AsyncFd` 持有，注册期间文件描述符不会被替换或关闭；
//! - `handshake` 受 `handshake_timeout` 约束，超时返回 `TimedOut` 类 I/O 错误；
//! - 读写语义与阻塞版一致：`Exact` 凑满或遇到关闭为止，`write_all` 写完并冲刷。
//!
//! ## 风险与权衡（Trade-offs）
//! - 信任策略在握手推进中同步执行，交互式策略会占用当前工作线程，应放到 `spawn_blocking` 中驱动。

use std::os::fd::AsRawFd;

use tokio::io::{Interest as TokioInterest, unix::AsyncFd};

use crate::{
    error::TlsError,
    handshake::HandshakeStatus,
    session::{ReadMode, Session},
    transport::{Interest, Transport},
};

/// 异步会话驱动。
pub struct AsyncDriver<S: Transport + AsRawFd> {
    session: AsyncFd<Session<S>>,
}

impl<S: Transport + AsRawFd> AsyncDriver<S> {
    /// 把会话的文件描述符注册到当前 Tokio reactor。
    pub fn new(session: Session<S>) -> Result<Self, TlsError> {
        // SAFETY: 会话独占字节流且不提供替换入口，文件描述符在 `AsyncFd` 释放或
        // `into_inner` 之前保持打开并指向同一连接；驱动也不暴露会话的可变引用。
        let session = unsafe { AsyncFd::register(session) }
            .map_err(|err| TlsError::Io(err.into()))?;
        Ok(Self { session })
    }

    pub fn session(&self) -> &Session<S> {
        self.session.get_ref()
    }

    /// 取走协商结果的所有权，见 [`Session::take_alpn_protocol`]。
    pub fn take_alpn_protocol(&mut self) -> Option<String> {
        self.session.get_mut().take_alpn_protocol()
    }

    /// 注销 reactor 并取回会话。
    pub fn into_session(self) -> Session<S> {
        self.session.into_inner()
    }

    async fn ready(&self, interest: Interest) -> Result<(), TlsError> {
        let interest = match interest {
            Interest::Read => TokioInterest::READABLE,
            Interest::Write => TokioInterest::WRITABLE,
            Interest::ReadWrite => TokioInterest::READABLE | TokioInterest::WRITABLE,
        };
        let mut guard = self.session.ready(interest).await?;
        guard.clear_ready();
        Ok(())
    }

    /// 驱动握手直至完成。
    pub async fn handshake(&mut self) -> Result<(), TlsError> {
        let limit = self.session.get_ref().settings().handshake_timeout();
        match tokio::time::timeout(limit, self.drive_handshake()).await {
            Ok(result) => result,
            Err(_) => Err(TlsError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "tls handshake timed out",
            ))),
        }
    }

    async fn drive_handshake(&mut self) -> Result<(), TlsError> {
        loop {
            match self.session.get_mut().handshake()? {
                HandshakeStatus::Established => return Ok(()),
                HandshakeStatus::Progress(interest) => self.ready(interest).await?,
            }
        }
    }

    /// 读取明文；`Available` 模式会等待至少一个字节或关闭。
    pub async fn read(&mut self, buf: &mut [u8], mode: ReadMode) -> Result<usize, TlsError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.session.get_mut().read(&mut buf[filled..], ReadMode::Available) {
                Ok(0) => break,
                Ok(read) => {
                    filled += read;
                    if mode == ReadMode::Available {
                        break;
                    }
                }
                Err(err) if err.is_would_block() => {
                    let interest = self.session.get_ref().read_interest();
                    self.ready(interest).await?;
                }
                Err(err) if filled > 0 => {
                    tracing::debug!(error = %err, filled, "tls read stopped after partial data");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    /// 写出全部数据并冲刷。
    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), TlsError> {
        while !buf.is_empty() {
            match self.session.get_mut().write(buf) {
                Ok(written) => buf = &buf[written..],
                Err(err) if err.is_would_block() => self.ready(Interest::Write).await?,
                Err(err) => return Err(err),
            }
        }
        self.flush().await
    }

    /// 冲刷排队的密文。
    pub async fn flush(&mut self) -> Result<(), TlsError> {
        loop {
            match self.session.get_mut().try_flush() {
                Err(err) if err.is_would_block() => self.ready(Interest::Write).await?,
                other => return other,
            }
        }
    }
}

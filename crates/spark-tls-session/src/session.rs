//! 单连接会话：握手编排、就绪语义与拥塞感知读写。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话独占一条原始字节流与一个后端上下文，把后端的“暂未就绪”翻译为调用方可见的就绪方向；
//! - 读分两种模式（[`ReadMode`]）：`Exact` 在会话内部等待直到凑满或终止，`Available` 立即返回；
//! - 写永不阻塞：发送缓冲达到上限时返回部分计数，这是约定的背压信号而非错误。
//!
//! ## 契约（What）
//! - 握手完成前调用读写或关闭返回 [`TlsError::Misuse`]；
//! - `read` 返回 `Ok(0)` 表示对端已发送 `close_notify`，不会再有数据，属于正常终态；
//! - 本端 `shutdown` 之后继续写返回 [`TlsError::ConnectionClosed`]；
//! - 握手完成后后端报告的任何非 `WouldBlock` 错误都会把会话标记为 [`HandshakeState::Failed`]，
//!   之后的读写与关闭返回 [`TlsError::Misuse`]，只能 `close`；
//! - 协商得到的 ALPN 在握手完成时写入一次，此后只读，可通过 [`Session::take_alpn_protocol`] 转移所有权。
//!
//! ## 风险与权衡（Trade-offs）
//! - `Exact` 读在出错前已读到部分数据时返回部分计数，错误保留到下一次读写或关闭时原样返回；
//! - 会话不是线程安全的共享对象，同一会话上的操作必须顺序发起。

use std::{
    fmt, io,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rustls::{Error as RustlsError, pki_types::CertificateDer};
use tracing::{debug, info, trace, trace_span};

use crate::{
    config::SessionSettings,
    engine::{Engine, EngineStatus},
    error::{self, TlsError, alert_is_trust_related},
    handshake::{HandshakeState, HandshakeStatus, StepOutcome},
    transport::{Interest, Transport},
    trust::PeerTrust,
};

/// 读取模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// 等待直到填满缓冲区，或对端关闭，或出错。
    Exact,
    /// 只返回当前可用的数据；没有数据时返回 `WouldBlock`。
    Available,
}

/// 会话角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
        })
    }
}

/// 绑定到一条字节流的 TLS 会话。
pub struct Session<S> {
    stream: S,
    engine: Box<dyn Engine>,
    role: Role,
    state: HandshakeState,
    settings: SessionSettings,
    alpn: Option<String>,
    trust_slot: Option<Arc<Mutex<Option<PeerTrust>>>>,
    peer_trust: Option<PeerTrust>,
    read_closed: bool,
    write_closed: bool,
    // `Exact` 读返回部分计数时暂存的错误。
    deferred: Option<TlsError>,
}

impl<S: Transport> Session<S> {
    pub(crate) fn new(
        stream: S,
        engine: Box<dyn Engine>,
        role: Role,
        settings: SessionSettings,
        trust_slot: Option<Arc<Mutex<Option<PeerTrust>>>>,
    ) -> Self {
        Self {
            stream,
            engine,
            role,
            state: HandshakeState::NotStarted,
            settings,
            alpn: None,
            trust_slot,
            peer_trust: None,
            read_closed: false,
            write_closed: false,
            deferred: None,
        }
    }

    /// 以自定义后端绑定会话。
    pub fn with_engine(
        stream: S,
        engine: Box<dyn Engine>,
        role: Role,
        settings: SessionSettings,
    ) -> Self {
        Self::new(stream, engine, role, settings, None)
    }

    /// 推进握手一次，绝不阻塞。
    ///
    /// 返回 `Progress(interest)` 时，调用方等待对应方向就绪后再次调用；
    /// 返回 `Err` 即握手失败，会话进入 [`HandshakeState::Failed`]，只能关闭。
    pub fn handshake(&mut self) -> Result<HandshakeStatus, TlsError> {
        if self.state.is_terminal() {
            return Err(TlsError::Misuse("handshake already resolved"));
        }
        let _span = trace_span!("tls.handshake", role = %self.role).entered();

        let (outcome, result) = match self.engine.handshake(&mut self.stream) {
            Ok(EngineStatus::Blocked(interest)) => (
                StepOutcome::Blocked(interest),
                Ok(HandshakeStatus::Progress(interest)),
            ),
            Ok(EngineStatus::Ready) => (StepOutcome::Done, Ok(HandshakeStatus::Established)),
            Err(err) => (StepOutcome::Error, Err(err)),
        };
        self.state = self
            .state
            .advance(outcome)
            .map_err(|_| TlsError::Misuse("handshake already resolved"))?;
        trace!(state = %self.state, "tls handshake step");

        match &result {
            Ok(HandshakeStatus::Established) => {
                if let Err(err) = self.on_established() {
                    self.state = HandshakeState::Failed;
                    self.on_failed(&err);
                    return Err(err);
                }
            }
            Err(err) => self.on_failed(err),
            Ok(HandshakeStatus::Progress(_)) => {}
        }
        result
    }

    /// 阻塞驱动握手直至完成，总时长受 `handshake_timeout` 约束。
    pub fn complete_handshake(&mut self) -> Result<(), TlsError> {
        if self.state == HandshakeState::Established {
            return Ok(());
        }
        let deadline = Instant::now() + self.settings.handshake_timeout();
        loop {
            let interest = match self.handshake()? {
                HandshakeStatus::Established => return Ok(()),
                HandshakeStatus::Progress(interest) => interest,
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ready = if remaining.is_zero() {
                false
            } else {
                match self.stream.wait(interest, Some(remaining)) {
                    Ok(ready) => ready,
                    Err(err) => {
                        self.state = HandshakeState::Failed;
                        return Err(err.into());
                    }
                }
            };
            if !ready {
                self.state = HandshakeState::Failed;
                debug!(role = %self.role, "tls handshake timed out");
                return Err(TlsError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "tls handshake timed out",
                )));
            }
        }
    }

    fn on_established(&mut self) -> Result<(), TlsError> {
        // 客户端会话关闭了会话恢复，校验器必然给出结论；空槽位说明后端跳过了证书校验。
        if let Some(slot) = &self.trust_slot {
            let trust = slot.lock().take().ok_or_else(|| {
                TlsError::protocol(
                    error::HANDSHAKE,
                    "handshake completed without a peer trust verdict",
                )
            })?;
            self.peer_trust = Some(trust);
        }
        self.alpn = self
            .engine
            .alpn_protocol()
            .map(|protocol| String::from_utf8_lossy(protocol).into_owned());
        debug!(
            role = %self.role,
            alpn = ?self.alpn,
            peer_trust = ?self.peer_trust,
            "tls session established"
        );
        Ok(())
    }

    /// 记录已建立会话上的故障；`WouldBlock` 不算故障。
    fn fault(&mut self, err: TlsError) -> TlsError {
        if !err.is_would_block() && self.state == HandshakeState::Established {
            self.state = HandshakeState::Failed;
            debug!(role = %self.role, code = err.code(), error = %err, "tls session failed");
        }
        err
    }

    fn on_failed(&mut self, err: &TlsError) {
        if let Some(slot) = &self.trust_slot {
            self.peer_trust = slot.lock().take();
        }
        if let TlsError::Protocol {
            source: Some(RustlsError::AlertReceived(alert)),
            ..
        } = err
            && alert_is_trust_related(alert)
        {
            info!(role = %self.role, ?alert, "peer refused our certificate");
        }
        debug!(role = %self.role, code = err.code(), error = %err, "tls handshake failed");
    }

    /// 读取明文。空缓冲区直接返回 `Ok(0)`。
    pub fn read(&mut self, buf: &mut [u8], mode: ReadMode) -> Result<usize, TlsError> {
        self.ensure_established()?;
        if buf.is_empty() {
            return Ok(0);
        }
        match mode {
            ReadMode::Available => self.read_available(buf),
            ReadMode::Exact => self.read_exact(buf),
        }
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        if self.read_closed {
            return Ok(0);
        }
        if let Err(err) = self.engine.flush(&mut self.stream) {
            trace!(error = %err, "deferred flush failed while reading");
        }
        let read = self
            .engine
            .recv(&mut self.stream, buf)
            .map_err(|err| self.fault(err))?;
        if read == 0 {
            self.read_closed = true;
            debug!(role = %self.role, "peer sent close_notify");
        }
        Ok(read)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_available(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(err) if err.is_would_block() => {
                    let interest = self.read_interest();
                    if !self.stream.wait(interest, self.settings.io_timeout())? {
                        if filled > 0 {
                            break;
                        }
                        return Err(timed_out("tls read timed out"));
                    }
                }
                Err(err) if filled > 0 => {
                    debug!(error = %err, filled, "tls read stopped after partial data");
                    self.deferred = Some(err);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    /// 加密并发送，返回被接受的字节数；一个字节都无法接受时返回 `WouldBlock`。
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, TlsError> {
        self.ensure_established()?;
        if self.write_closed {
            return Err(TlsError::ConnectionClosed("local side already shut down"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let accepted = self
            .engine
            .send(&mut self.stream, buf)
            .map_err(|err| self.fault(err))?;
        match accepted {
            0 => Err(TlsError::WouldBlock),
            accepted => {
                if accepted < buf.len() {
                    trace!(accepted, requested = buf.len(), "tls write congested");
                }
                Ok(accepted)
            }
        }
    }

    /// 阻塞写出全部数据并冲刷。
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<(), TlsError> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(written) => buf = &buf[written..],
                Err(err) if err.is_would_block() => self.wait_ready(Interest::Write)?,
                Err(err) => return Err(err),
            }
        }
        self.flush()
    }

    /// 尝试写出已排队的密文；仍有积压时返回 `WouldBlock`。
    pub fn try_flush(&mut self) -> Result<(), TlsError> {
        let status = self
            .engine
            .flush(&mut self.stream)
            .map_err(|err| self.fault(err))?;
        match status {
            EngineStatus::Ready => Ok(()),
            EngineStatus::Blocked(_) => Err(TlsError::WouldBlock),
        }
    }

    /// 阻塞直到排队的密文全部写出。
    pub fn flush(&mut self) -> Result<(), TlsError> {
        loop {
            match self.try_flush() {
                Err(err) if err.is_would_block() => self.wait_ready(Interest::Write)?,
                other => return other,
            }
        }
    }

    /// 发送 `close_notify`；`bidirectional` 时继续读取并丢弃数据，直到收到对端的 `close_notify`。
    pub fn shutdown(&mut self, bidirectional: bool) -> Result<(), TlsError> {
        self.ensure_established()?;
        if !self.write_closed {
            self.engine.close_notify();
            self.write_closed = true;
        }
        self.flush()?;
        debug!(role = %self.role, bidirectional, "tls close_notify sent");

        if bidirectional {
            let mut scratch = [0u8; 4096];
            while !self.read_closed {
                match self.read_available(&mut scratch) {
                    Ok(_) => {}
                    Err(err) if err.is_would_block() => self.wait_ready(self.read_interest())?,
                    Err(err) => return Err(err),
                }
            }
            debug!(role = %self.role, "tls shutdown reciprocated");
        }
        Ok(())
    }

    /// 释放后端上下文与字节流；任何状态下都可以调用。
    pub fn close(self) {
        debug!(role = %self.role, state = %self.state, "tls session closed");
    }

    /// 等待字节流就绪；`Ok(false)` 表示超时。
    pub fn wait(&self, interest: Interest, timeout: Option<Duration>) -> Result<bool, TlsError> {
        Ok(self.stream.wait(interest, timeout)?)
    }

    /// `Available` 读返回 `WouldBlock` 后应等待的方向；仍有密文积压时需要同时等待可写。
    pub fn read_interest(&self) -> Interest {
        if self.engine.wants_write() {
            Interest::Read.union(Interest::Write)
        } else {
            Interest::Read
        }
    }

    fn wait_ready(&self, interest: Interest) -> Result<(), TlsError> {
        if self.stream.wait(interest, self.settings.io_timeout())? {
            Ok(())
        } else {
            Err(timed_out("tls i/o timed out"))
        }
    }

    fn ensure_established(&mut self) -> Result<(), TlsError> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        match self.state {
            HandshakeState::Established => Ok(()),
            HandshakeState::Failed => Err(TlsError::Misuse("session has failed")),
            _ => Err(TlsError::Misuse("session is not established")),
        }
    }
}

impl<S> Session<S> {
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// 协商得到的应用层协议。
    pub fn alpn_protocol(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    /// 取走协商结果的所有权；之后 [`Session::alpn_protocol`] 返回 `None`。
    pub fn take_alpn_protocol(&mut self) -> Option<String> {
        self.alpn.take()
    }

    /// 客户端会话的对端校验结论；服务端会话恒为 `None`。
    pub fn peer_trust(&self) -> Option<PeerTrust> {
        self.peer_trust
    }

    /// 对端证书链（叶子在前）。
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.engine.peer_certificates()
    }

    /// 底层字节流。
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// 对端是否已发送 `close_notify`。
    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }
}

impl<S: Transport> io::Read for Session<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Session::read(self, buf, ReadMode::Available).map_err(io::Error::from)
    }
}

impl<S: Transport> io::Write for Session<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Session::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Session::flush(self).map_err(io::Error::from)
    }
}

#[cfg(unix)]
impl<S: std::os::fd::AsRawFd> std::os::fd::AsRawFd for Session<S> {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.stream.as_raw_fd()
    }
}

impl<S> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("alpn", &self.alpn)
            .field("peer_trust", &self.peer_trust)
            .finish_non_exhaustive()
    }
}

fn timed_out(message: &'static str) -> TlsError {
    TlsError::Io(io::Error::new(io::ErrorKind::TimedOut, message))
}

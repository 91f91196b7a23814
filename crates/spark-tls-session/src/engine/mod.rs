//! 加密后端（Backend Engine）契约。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话层只负责握手编排、就绪语义与拥塞处理；证书解析、密钥交换与记录层加解密全部委托给后端；
//! - 以 trait 表达后端，`Session` 不依赖任何具体 TLS 实现，默认实现见 [`RustlsEngine`]。
//!
//! ## 契约（What）
//! - 所有触达线路的原语都接收 `&mut dyn Wire`，并以 [`TlsError::WouldBlock`](crate::TlsError::WouldBlock)
//!   或 [`EngineStatus::Blocked`] 表达“暂未就绪”；原语自身绝不阻塞；
//! - [`Engine::recv`] 返回 `Ok(0)` 仅表示对端发送了 `close_notify`；
//! - [`Engine::send`] 可能只接受部分明文（发送缓冲达到上限），调用方负责重试剩余部分。

use std::io::{Read, Write};

use ::rustls::pki_types::CertificateDer;

use crate::{error::TlsError, transport::Interest};

mod rustls_engine;

pub use self::rustls_engine::RustlsEngine;

/// 后端可见的线路视图。
pub trait Wire: Read + Write {}

impl<T: Read + Write + ?Sized> Wire for T {}

/// 单次非阻塞推进的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    /// 本轮工作已完成。
    Ready,
    /// 需要等待指定方向就绪后再次调用。
    Blocked(Interest),
}

/// TLS 记录层后端。
pub trait Engine: Send {
    /// 推进握手一次；握手完成且握手报文全部写出后返回 [`EngineStatus::Ready`]。
    fn handshake(&mut self, wire: &mut dyn Wire) -> Result<EngineStatus, TlsError>;

    /// 读取解密后的明文。
    fn recv(&mut self, wire: &mut dyn Wire, buf: &mut [u8]) -> Result<usize, TlsError>;

    /// 加密并排队发送明文，返回被接受的字节数。
    fn send(&mut self, wire: &mut dyn Wire, buf: &[u8]) -> Result<usize, TlsError>;

    /// 尽力写出已排队的密文。
    fn flush(&mut self, wire: &mut dyn Wire) -> Result<EngineStatus, TlsError>;

    /// 排队 `close_notify`；随后需要 [`Engine::flush`] 才会真正写出。
    fn close_notify(&mut self);

    /// 是否仍有待写出的密文。
    fn wants_write(&self) -> bool;

    /// 协商得到的应用层协议。
    fn alpn_protocol(&self) -> Option<&[u8]>;

    /// 对端证书链（叶子在前）。
    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]>;
}

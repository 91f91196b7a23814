use std::{io, io::Read as _, io::Write as _, sync::Arc};

use rustls::{
    ClientConfig, ClientConnection, Connection, ServerConfig,
    pki_types::{CertificateDer, ServerName},
    server::Acceptor,
};
use tracing::trace;

use super::{Engine, EngineStatus, Wire};
use crate::{
    alpn,
    error::{self, OperationKind, TlsError},
    transport::Interest,
};

/// 基于 `rustls` 的默认后端。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 复用 `rustls` 的非阻塞状态机（`read_tls`/`process_new_packets`/`write_tls`），
///   会话层只需把 `WouldBlock` 翻译为就绪方向；
/// - 服务端先以 [`Acceptor`] 读取 ClientHello，再按客户端偏好算出唯一的 ALPN 结果写回配置，
///   这样协商结果与 [`alpn::negotiate`] 保持一致，而不是 `rustls` 默认的服务端偏好。
///
/// ## 逻辑（How）
/// - `Phase::Accepting`：仅服务端存在，持有 `Acceptor`、基础配置与服务端报价；
/// - `Phase::Connected`：握手剩余部分与后续读写都在 [`rustls::Connection`] 上进行；
/// - 所有写路径都先调用 `write_pending` 尽力排空密文队列，发送缓冲上限由 `send_buffer_limit` 控制。
///
/// ## 风险与权衡（Trade-offs）
/// - 每个服务端会话克隆一次 `ServerConfig` 以写入协商结果，换取与客户端偏好一致的语义；
/// - 处理失败时只尽力写出告警（alert），写不出去也不会覆盖原始错误。
pub struct RustlsEngine {
    phase: Phase,
    send_buffer_limit: Option<usize>,
    /// 客户端会话的校验名称，用于把证书失败归类为信任失败。
    server_name: Option<String>,
}

enum Phase {
    Accepting {
        acceptor: Box<Acceptor>,
        config: Arc<ServerConfig>,
        offer: Vec<Vec<u8>>,
    },
    Connected(Connection),
}

impl RustlsEngine {
    /// 构造服务端后端；不产生任何 I/O。
    pub fn server(
        config: Arc<ServerConfig>,
        alpn_offer: &[impl AsRef<str>],
        send_buffer_limit: Option<usize>,
    ) -> Self {
        Self {
            phase: Phase::Accepting {
                acceptor: Box::default(),
                config,
                offer: alpn::to_wire(alpn_offer),
            },
            send_buffer_limit,
            server_name: None,
        }
    }

    /// 构造客户端后端；ClientHello 会被排队，首次握手推进时写出。
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        send_buffer_limit: Option<usize>,
    ) -> Result<Self, TlsError> {
        let label = server_name.to_str().into_owned();
        let mut connection = Connection::Client(
            ClientConnection::new(config, server_name)
                .map_err(|err| TlsError::from_rustls(error::HANDSHAKE, err, Some(label.as_str())))?,
        );
        connection.set_buffer_limit(send_buffer_limit);
        Ok(Self {
            phase: Phase::Connected(connection),
            send_buffer_limit,
            server_name: Some(label),
        })
    }

    /// 读取 ClientHello 并切换到 `Connected`；返回 `Some` 表示仍需等待。
    fn accept(&mut self, wire: &mut dyn Wire) -> Result<Option<EngineStatus>, TlsError> {
        let Phase::Accepting {
            acceptor,
            config,
            offer,
        } = &mut self.phase
        else {
            return Ok(None);
        };

        loop {
            match acceptor.read_tls(&mut *wire) {
                Ok(0) => {
                    return Err(TlsError::ConnectionClosed(
                        "peer closed the transport before sending ClientHello",
                    ));
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return blocked_or(error::HANDSHAKE, err, Interest::Read).map(Some),
            }

            let accepted = match acceptor.accept() {
                Ok(None) => continue,
                Ok(Some(accepted)) => accepted,
                Err((err, mut alert)) => {
                    let _ = alert.write_all(wire);
                    return Err(TlsError::from_rustls(error::HANDSHAKE, err, None));
                }
            };

            let selected = {
                let hello = accepted.client_hello();
                let client_offer: Vec<&[u8]> = hello
                    .alpn()
                    .map(|protocols| protocols.collect())
                    .unwrap_or_default();
                alpn::negotiate(&client_offer, offer.as_slice()).map(|protocol| protocol.to_vec())
            };
            trace!(
                selected = ?selected.as_deref().map(String::from_utf8_lossy),
                "tls server read ClientHello"
            );

            let mut session_config = ServerConfig::clone(&**config);
            session_config.alpn_protocols = selected.into_iter().collect();

            match accepted.into_connection(Arc::new(session_config)) {
                Ok(server) => {
                    let mut connection = Connection::Server(server);
                    connection.set_buffer_limit(self.send_buffer_limit);
                    self.phase = Phase::Connected(connection);
                    return Ok(None);
                }
                Err((err, mut alert)) => {
                    let _ = alert.write_all(wire);
                    return Err(TlsError::from_rustls(error::HANDSHAKE, err, None));
                }
            }
        }
    }

    fn connection(&mut self) -> Result<&mut Connection, TlsError> {
        match &mut self.phase {
            Phase::Connected(connection) => Ok(connection),
            Phase::Accepting { .. } => Err(TlsError::Misuse("tls handshake has not started")),
        }
    }
}

impl Engine for RustlsEngine {
    fn handshake(&mut self, wire: &mut dyn Wire) -> Result<EngineStatus, TlsError> {
        if let Some(status) = self.accept(wire)? {
            return Ok(status);
        }
        let server_name = self.server_name.clone();
        let connection = self.connection()?;

        loop {
            if let EngineStatus::Blocked(interest) =
                write_pending(connection, wire, error::HANDSHAKE)?
            {
                return Ok(EngineStatus::Blocked(interest));
            }
            if !connection.is_handshaking() {
                return Ok(EngineStatus::Ready);
            }

            match connection.read_tls(wire) {
                Ok(0) => {
                    return Err(TlsError::ConnectionClosed(
                        "peer closed the transport during the handshake",
                    ));
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return blocked_or(error::HANDSHAKE, err, Interest::Read),
            }

            if let Err(err) = connection.process_new_packets() {
                let _ = write_pending(connection, wire, error::HANDSHAKE);
                return Err(TlsError::from_rustls(
                    error::HANDSHAKE,
                    err,
                    server_name.as_deref(),
                ));
            }
        }
    }

    fn recv(&mut self, wire: &mut dyn Wire, buf: &mut [u8]) -> Result<usize, TlsError> {
        let server_name = self.server_name.clone();
        let connection = self.connection()?;

        loop {
            match connection.reader().read(buf) {
                Ok(read) => return Ok(read),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(TlsError::from_io(error::READ, err)),
            }

            // `Ok(0)` 时 rustls 记下 EOF，下一轮 `reader()` 会给出 close_notify 或截断结论。
            match connection.read_tls(wire) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TlsError::from_io(error::READ, err)),
            }

            if let Err(err) = connection.process_new_packets() {
                let _ = write_pending(connection, wire, error::READ);
                return Err(TlsError::from_rustls(
                    error::READ,
                    err,
                    server_name.as_deref(),
                ));
            }
        }
    }

    fn send(&mut self, wire: &mut dyn Wire, buf: &[u8]) -> Result<usize, TlsError> {
        let connection = self.connection()?;
        write_pending(connection, wire, error::WRITE)?;
        let accepted = connection
            .writer()
            .write(buf)
            .map_err(|err| TlsError::from_io(error::WRITE, err))?;
        write_pending(connection, wire, error::WRITE)?;
        Ok(accepted)
    }

    fn flush(&mut self, wire: &mut dyn Wire) -> Result<EngineStatus, TlsError> {
        match &mut self.phase {
            Phase::Connected(connection) => write_pending(connection, wire, error::WRITE),
            Phase::Accepting { .. } => Ok(EngineStatus::Ready),
        }
    }

    fn close_notify(&mut self) {
        if let Phase::Connected(connection) = &mut self.phase {
            connection.send_close_notify();
        }
    }

    fn wants_write(&self) -> bool {
        match &self.phase {
            Phase::Connected(connection) => connection.wants_write(),
            Phase::Accepting { .. } => false,
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match &self.phase {
            Phase::Connected(connection) => connection.alpn_protocol(),
            Phase::Accepting { .. } => None,
        }
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match &self.phase {
            Phase::Connected(connection) => connection.peer_certificates(),
            Phase::Accepting { .. } => None,
        }
    }
}

/// 尽力排空密文队列；套接字写满时返回 `Blocked(Write)`。
fn write_pending(
    connection: &mut Connection,
    wire: &mut dyn Wire,
    kind: OperationKind,
) -> Result<EngineStatus, TlsError> {
    while connection.wants_write() {
        match connection.write_tls(wire) {
            Ok(0) => return Err(TlsError::Io(io::ErrorKind::WriteZero.into())),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return blocked_or(kind, err, Interest::Write),
        }
    }
    Ok(EngineStatus::Ready)
}

fn blocked_or(
    kind: OperationKind,
    err: io::Error,
    interest: Interest,
) -> Result<EngineStatus, TlsError> {
    match TlsError::from_io(kind, err) {
        TlsError::WouldBlock => Ok(EngineStatus::Blocked(interest)),
        other => Err(other),
    }
}

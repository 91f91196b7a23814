//! 集成测试共用夹具：自签名证书、非阻塞套接字对与回显服务端。
//!
//! - 证书由 `rcgen` 在运行时生成并写入临时目录，测试之间互不共享；
//! - 回显服务端运行在独立线程，以 256 字节为单位读取并阻塞写回，读到关闭后单向关闭并返回协商出的 ALPN；
//! - “消失”的服务端完成握手后直接丢弃连接，用于覆盖截断路径。

#![allow(dead_code)]

use std::{
    fs,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
};

use anyhow::Context as _;
use spark_tls_session::{
    ClientCredentials, ReadMode, ServerCredentials, Session, SessionSettings, TlsError,
    TrustPolicy,
};
use tempfile::TempDir;

pub const SERVER_NAME: &str = "localhost";

/// 临时目录中的证书材料。
pub struct Material {
    pub dir: TempDir,
    pub cert: PathBuf,
    pub key: PathBuf,
    /// 证书与私钥拼接在同一文件。
    pub combined: PathBuf,
}

pub fn material() -> anyhow::Result<Material> {
    let dir = tempfile::tempdir()?;
    let generated = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_owned()])?;
    let cert_pem = generated.cert.pem();
    let key_pem = generated.key_pair.serialize_pem();

    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    let combined = dir.path().join("combined.pem");
    fs::write(&cert, &cert_pem)?;
    fs::write(&key, &key_pem)?;
    fs::write(&combined, format!("{cert_pem}{key_pem}"))?;
    Ok(Material {
        dir,
        cert,
        key,
        combined,
    })
}

pub fn server_credentials(material: &Material) -> anyhow::Result<ServerCredentials> {
    ServerCredentials::from_pem_files(&material.cert, Some(material.key.as_path()))
        .context("server credentials")
}

pub fn client_credentials(trust_dir: &Path) -> anyhow::Result<ClientCredentials> {
    ClientCredentials::builder()
        .trust_dir(trust_dir)
        .build()
        .context("client credentials")
}

pub fn client_credentials_with(
    trust_dir: &Path,
    settings: SessionSettings,
) -> anyhow::Result<ClientCredentials> {
    ClientCredentials::builder()
        .trust_dir(trust_dir)
        .settings(settings)
        .build()
        .context("client credentials")
}

/// 两端均为非阻塞模式的套接字对。
pub fn socket_pair() -> anyhow::Result<(UnixStream, UnixStream)> {
    let (left, right) = UnixStream::pair()?;
    left.set_nonblocking(true)?;
    right.set_nonblocking(true)?;
    Ok((left, right))
}

/// 启动回显服务端。
pub fn spawn_echo_server(
    credentials: ServerCredentials,
    stream: UnixStream,
    alpn_offer: &'static [&'static str],
) -> JoinHandle<Result<Option<String>, TlsError>> {
    thread::spawn(move || {
        let mut session = credentials.session(stream, alpn_offer);
        session.complete_handshake()?;
        let negotiated = session.take_alpn_protocol();
        echo(&mut session)?;
        session.shutdown(false)?;
        session.close();
        Ok(negotiated)
    })
}

/// 启动握手后不发送 `close_notify` 就直接释放连接的服务端。
pub fn spawn_vanishing_server(
    credentials: ServerCredentials,
    stream: UnixStream,
) -> JoinHandle<Result<(), TlsError>> {
    thread::spawn(move || {
        let mut session = credentials.session(stream, &[]);
        session.complete_handshake()?;
        drop(session);
        Ok(())
    })
}

fn echo(session: &mut Session<UnixStream>) -> Result<(), TlsError> {
    let mut buf = [0u8; 256];
    loop {
        match session.read(&mut buf, ReadMode::Available) {
            Ok(0) => return Ok(()),
            Ok(read) => session.write_all(&buf[..read])?,
            Err(err) if err.is_would_block() => {
                session.wait(session.read_interest(), None)?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// 建立客户端会话并完成握手。
pub fn connect(
    credentials: &ClientCredentials,
    stream: UnixStream,
    alpn_offer: &[&str],
    policy: Arc<dyn TrustPolicy>,
) -> Result<Session<UnixStream>, TlsError> {
    let mut session =
        credentials.session(stream, SERVER_NAME, Some("spark-test"), alpn_offer, policy)?;
    session.complete_handshake()?;
    Ok(session)
}

/// 读到对端 `close_notify` 为止，返回期间收到的字节数。
pub fn drain_until_closed(session: &mut Session<UnixStream>) -> Result<usize, TlsError> {
    let mut buf = [0u8; 1024];
    let mut total = 0;
    loop {
        match session.read(&mut buf, ReadMode::Available) {
            Ok(0) => return Ok(total),
            Ok(read) => total += read,
            Err(err) if err.is_would_block() => {
                session.wait(session.read_interest(), None)?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// 可复现的伪随机载荷。
pub fn payload(len: usize, mut seed: u32) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed >> 24) as u8
        })
        .collect()
}

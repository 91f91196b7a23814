#![doc = r#"
# spark-tls-session

## 设计动机（Why）
- **与后端解耦**：把任意双工字节流（套接字）变成经过认证、加密并协商好应用协议的通道，
  会话层只负责握手编排、就绪语义与拥塞处理，记录层工作委托给可替换的 [`Engine`]；
- **非阻塞优先**：握手以可恢复的状态机推进，每一步都以带标签的返回值告知调用方“等可读”还是“等可写”，
  与具体事件循环无关；
- **信任可编排**：未知证书是否放行由创建会话时注入的 [`TrustPolicy`] 决定，而非硬编码。

## 核心契约（What）
- [`ServerCredentials`] / [`ClientCredentials`]：构造期完成证书、私钥与根证书的解析，失败即 `InvalidMaterial`；
- [`Session`]：`handshake` 单步推进，`read`（[`ReadMode::Exact`] / [`ReadMode::Available`]）、
  `write`（部分计数）、`shutdown`（单向/双向）、`close`；
- [`alpn::negotiate`]：客户端顺序决定结果，服务端列表只做成员过滤；
- [`TlsError`]：`InvalidMaterial`、`UntrustedPeer`、`ProtocolFailure`、`WouldBlock`、`ConnectionClosed`、`IoFault` 六类语义，
  附稳定错误码 `spark.tls.*`。

## 实现策略（How）
- 默认后端 [`RustlsEngine`] 基于 `rustls`（`aws_lc_rs` 提供者），服务端先读 ClientHello 再决定 ALPN；
- [`Transport`] 以 `nix::poll` 为 Unix 套接字提供就绪等待；启用 `runtime-tokio` 时可改用 [`AsyncDriver`]；
- 证书例外存储 [`KnownPeers`] 借助 `ArcSwap` 做 RCU 式共享，落盘为纯文本。

## 风险与考量（Trade-offs）
- 单个会话不可跨线程并发操作，多个会话之间只共享只读凭据；
- 发送缓冲上限即拥塞阈值，调小可以更早获得背压信号，但会增加系统调用次数；
- 本 crate 只输出 `tracing` 事件，不安装任何订阅者。
"#]

pub mod alpn;
mod config;
mod credentials;
#[cfg(all(unix, feature = "runtime-tokio"))]
mod driver;
mod engine;
mod error;
mod handshake;
mod session;
mod transport;
mod trust;

pub use config::{SessionSettings, TRUST_DIR_ENV, resolve_trust_dir};
pub use credentials::{ClientCredentials, ClientCredentialsBuilder, ServerCredentials};
#[cfg(all(unix, feature = "runtime-tokio"))]
pub use driver::AsyncDriver;
pub use engine::{Engine, EngineStatus, RustlsEngine, Wire};
pub use error::{ErrorKind, TlsError};
pub use handshake::{HandshakeState, HandshakeStatus, StepOutcome, TransitionError};
pub use session::{ReadMode, Role, Session};
pub use transport::{Interest, Transport};
pub use trust::{
    AcceptAll, KNOWN_PEERS_FILE, KnownPeer, KnownPeers, PeerTrust, RejectUnknown, TrustDecision,
    TrustPolicy, TrustQuery, fingerprint,
};

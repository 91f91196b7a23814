use std::{borrow::Cow, io, path::PathBuf};

use rustls::{AlertDescription, Error as RustlsError};
use thiserror::Error;

/// TLS 会话错误分类与映射模块。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 `rustls`/IO 层形形色色的失败收敛为六类稳定语义：`InvalidMaterial`、`UntrustedPeer`、
///   `ProtocolFailure`、`WouldBlock`、`ConnectionClosed`、`IoFault`，宿主只需按类别决定“丢弃连接”
///   还是“等待就绪后重试”；
/// - 提供稳定错误码（`spark.tls.*`），日志与告警脚本无需解析底层库的文案。
///
/// ## 逻辑（How）
/// - [`OperationKind`] 描述一类操作（握手/读/写）的默认文案，用于拼装上下文；
/// - [`TlsError::from_rustls`] 借助 `classify_rustls_error` 把 `rustls::Error` 细分为信任失败或协议失败；
/// - `alert_is_trust_related` 针对收到的 TLS Alert 做进一步细化。
///
/// ## 契约（What）
/// - 构造期错误（证书/私钥）全部落在 [`ErrorKind::InvalidMaterial`]，不会延迟到握手阶段；
/// - [`ErrorKind::WouldBlock`] 只表示“暂未就绪”，调用方等待就绪后重试即可，不应作为应用错误上报；
/// - [`ErrorKind::ConnectionClosed`] 表示对端已有序关闭，属于正常终态。
///
/// ## 风险与权衡（Trade-offs）
/// - 未穷举的 `rustls::Error` 默认归入协议失败，避免把未知情况误报为信任事件；
/// - `Misuse` 用于暴露调用顺序错误（例如握手未完成就读写），它是编程错误而非运行期故障。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub message: &'static str,
}

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    message: "tls handshake",
};

pub(crate) const READ: OperationKind = OperationKind { message: "tls read" };

pub(crate) const WRITE: OperationKind = OperationKind {
    message: "tls write",
};

/// 错误类别，对应会话层对外承诺的分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 证书、私钥路径或内容无效；构造期致命错误，不可重试。
    InvalidMaterial,
    /// 握手期间对端证书未被信任（策略拒绝）；仅影响当前会话。
    UntrustedPeer,
    /// 握手报文畸形、套件不匹配等协议级失败；仅影响当前会话。
    ProtocolFailure,
    /// 暂时无法推进，等待就绪后重试。
    WouldBlock,
    /// 对端或本端已有序关闭。
    ConnectionClosed,
    /// 底层字节流故障。
    IoFault,
    /// 配置值非法。
    Configuration,
    /// 调用顺序违反会话契约。
    Misuse,
}

impl ErrorKind {
    /// 稳定错误码，供日志与告警聚合。
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidMaterial => "spark.tls.invalid_material",
            Self::UntrustedPeer => "spark.tls.untrusted_peer",
            Self::ProtocolFailure => "spark.tls.protocol_failure",
            Self::WouldBlock => "spark.tls.would_block",
            Self::ConnectionClosed => "spark.tls.connection_closed",
            Self::IoFault => "spark.tls.io_fault",
            Self::Configuration => "spark.tls.configuration",
            Self::Misuse => "spark.tls.misuse",
        }
    }

    /// 是否只需等待就绪后重试。
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

/// 会话层统一错误类型。
#[derive(Debug, Error)]
pub enum TlsError {
    /// 证书或私钥不可用。
    #[error("invalid TLS material{}: {detail}", path_suffix(.path))]
    InvalidMaterial {
        /// 出错的文件路径（若与文件相关）。
        path: Option<PathBuf>,
        /// 人类可读的原因。
        detail: Cow<'static, str>,
    },

    /// 对端证书被信任策略拒绝，或链校验失败且没有可用的放行记录。
    #[error("untrusted peer `{server_name}`: {detail}")]
    UntrustedPeer {
        /// 客户端校验时使用的服务器名称。
        server_name: String,
        /// 拒绝原因。
        detail: Cow<'static, str>,
    },

    /// TLS 协议失败。
    #[error("{operation} failed: {detail}")]
    Protocol {
        /// 失败所在的操作。
        operation: &'static str,
        /// 失败原因。
        detail: Cow<'static, str>,
        /// 原始 `rustls` 错误（若有）。
        #[source]
        source: Option<RustlsError>,
    },

    /// 暂未就绪。
    #[error("operation would block")]
    WouldBlock,

    /// 连接已有序关闭。
    #[error("connection closed: {0}")]
    ConnectionClosed(&'static str),

    /// 底层字节流错误。
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// 配置解析或校验失败。
    #[error("invalid TLS session configuration: {0}")]
    Configuration(Cow<'static, str>),

    /// 调用顺序违反会话契约。
    #[error("session misuse: {0}")]
    Misuse(&'static str),
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" `{}`", path.display()),
        None => String::new(),
    }
}

impl TlsError {
    /// 返回错误类别。
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMaterial { .. } => ErrorKind::InvalidMaterial,
            Self::UntrustedPeer { .. } => ErrorKind::UntrustedPeer,
            Self::Protocol { .. } => ErrorKind::ProtocolFailure,
            Self::WouldBlock => ErrorKind::WouldBlock,
            Self::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
            Self::Io(err) if err.kind() == io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
            Self::Io(_) => ErrorKind::IoFault,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Misuse(_) => ErrorKind::Misuse,
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// 是否为“暂未就绪”。
    pub fn is_would_block(&self) -> bool {
        self.kind().is_transient()
    }

    pub(crate) fn material(path: Option<PathBuf>, detail: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidMaterial {
            path,
            detail: detail.into(),
        }
    }

    pub(crate) fn protocol(kind: OperationKind, detail: impl Into<Cow<'static, str>>) -> Self {
        Self::Protocol {
            operation: kind.message,
            detail: detail.into(),
            source: None,
        }
    }

    /// 将 `rustls` 错误映射为会话错误。
    ///
    /// `server_name` 仅在客户端会话中提供，用于把证书类失败归入 [`ErrorKind::UntrustedPeer`]。
    pub(crate) fn from_rustls(
        kind: OperationKind,
        error: RustlsError,
        server_name: Option<&str>,
    ) -> Self {
        match (classify_rustls_error(&error), server_name) {
            (ErrorKind::UntrustedPeer, Some(name)) => Self::UntrustedPeer {
                server_name: name.to_owned(),
                detail: Cow::Owned(error.to_string()),
            },
            _ => Self::Protocol {
                operation: kind.message,
                detail: Cow::Owned(error.to_string()),
                source: Some(error),
            },
        }
    }

    /// 将底层读写错误映射为会话错误，`WouldBlock` 保持为瞬时信号。
    pub(crate) fn from_io(kind: OperationKind, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::UnexpectedEof => Self::protocol(
                kind,
                "peer closed the transport without sending close_notify",
            ),
            _ => Self::Io(error),
        }
    }
}

impl From<TlsError> for io::Error {
    fn from(error: TlsError) -> Self {
        match error {
            TlsError::Io(err) => err,
            TlsError::WouldBlock => io::Error::from(io::ErrorKind::WouldBlock),
            other => {
                let kind = match other.kind() {
                    ErrorKind::ConnectionClosed => io::ErrorKind::NotConnected,
                    ErrorKind::UntrustedPeer => io::ErrorKind::PermissionDenied,
                    ErrorKind::InvalidMaterial | ErrorKind::Configuration => {
                        io::ErrorKind::InvalidInput
                    }
                    _ => io::ErrorKind::InvalidData,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

pub(crate) fn classify_rustls_error(error: &RustlsError) -> ErrorKind {
    use RustlsError::*;
    match error {
        NoCertificatesPresented | InvalidCertificate(_) | UnsupportedNameType => {
            ErrorKind::UntrustedPeer
        }
        FailedToGetCurrentTime | FailedToGetRandomBytes | InconsistentKeys(_) => {
            ErrorKind::InvalidMaterial
        }
        _ => ErrorKind::ProtocolFailure,
    }
}

/// 对端以证书类 Alert 终止握手，说明是对端拒绝了本端身份。
pub(crate) fn alert_is_trust_related(alert: &AlertDescription) -> bool {
    use AlertDescription::*;
    matches!(
        alert,
        BadCertificate
            | UnsupportedCertificate
            | CertificateRevoked
            | CertificateExpired
            | CertificateUnknown
            | UnknownCA
            | NoCertificate
            | CertificateUnobtainable
            | CertificateRequired
            | AccessDenied
    )
}

//! 信任决策策略、证书例外存储与客户端校验器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 对端证书无法由根证书链证明时，是否继续握手属于宿主的产品决策（交互确认、固定指纹、直接拒绝），
//!   因此以 [`TrustPolicy`] 能力对象在创建客户端会话时显式注入，不依赖任何进程级注册表；
//! - 宿主选择“永久接受”后，例外记录写入 [`KnownPeers`]，后续会话无需再次询问。
//!
//! ## 逻辑（How）
//! - 校验顺序：WebPKI 链与主机名校验 → 已知例外（名称、服务标签、SHA-256 指纹三者匹配）→ 询问策略；
//! - 校验器在握手线程内同步调用策略，策略返回前握手不会继续；
//! - 每个会话拥有独立的结果槽位，握手完成后由会话取走并以 [`PeerTrust`] 暴露。
//!
//! ## 风险与权衡（Trade-offs）
//! - 拒绝不会被记录，下一次遇到同一证书仍会询问策略；是否缓存拒绝由策略实现自行决定；
//! - 例外只绑定证书指纹，不校验有效期与主机名，这正是“例外”的含义，使用方需理解其安全后果。

use std::{
    collections::HashSet,
    fmt, fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustls::{
    CertificateError, DigitallySignedStruct, Error as RustlsError, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::TlsError;

/// 例外存储的文件名。
pub const KNOWN_PEERS_FILE: &str = "known_peers";

/// 无服务标签时在文件中的占位符。
const NO_SERVICE: &str = "-";

/// 策略的答复。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrustDecision {
    /// 拒绝，本次握手以 `UntrustedPeer` 失败。
    Reject,
    /// 仅对本次会话放行。
    AcceptOnce,
    /// 放行并写入例外存储。
    AcceptPermanently,
}

/// 交给策略的询问。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustQuery {
    /// 用于主机名校验的服务器名称。
    pub server_name: String,
    /// 例外记录使用的服务标签（例如 `https`）。
    pub service: Option<String>,
    /// 叶子证书 DER 的 SHA-256 指纹（小写十六进制）。
    pub fingerprint: String,
    /// 链校验失败的原因。
    pub reason: String,
    /// 建议答复，固定为 [`TrustDecision::Reject`]。
    pub suggested: TrustDecision,
}

/// 信任决策能力。
pub trait TrustPolicy: Send + Sync {
    fn decide(&self, query: &TrustQuery) -> TrustDecision;
}

impl<F> TrustPolicy for F
where
    F: Fn(&TrustQuery) -> TrustDecision + Send + Sync,
{
    fn decide(&self, query: &TrustQuery) -> TrustDecision {
        self(query)
    }
}

/// 总是拒绝未知证书。
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectUnknown;

impl TrustPolicy for RejectUnknown {
    fn decide(&self, _query: &TrustQuery) -> TrustDecision {
        TrustDecision::Reject
    }
}

/// 对未知证书一律单次放行；仅用于测试或封闭实验环境。
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl TrustPolicy for AcceptAll {
    fn decide(&self, _query: &TrustQuery) -> TrustDecision {
        TrustDecision::AcceptOnce
    }
}

/// 客户端会话的对端校验结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerTrust {
    /// 证书链与主机名由根证书证明。
    Verified,
    /// 命中已知例外。
    KnownException,
    /// 策略放行；`permanent` 表示已写入例外存储。
    AcceptedByPolicy { permanent: bool },
    /// 策略拒绝。
    Rejected,
}

/// 计算证书指纹。
pub fn fingerprint(certificate: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(certificate.as_ref()))
}

/// 一条例外记录。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KnownPeer {
    pub name: String,
    pub service: Option<String>,
    pub fingerprint: String,
}

impl KnownPeer {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        let service = fields.next()?;
        let fingerprint = fields.next()?;
        if fields.next().is_some() || hex::decode(fingerprint).map_or(true, |raw| raw.len() != 32)
        {
            return None;
        }
        Some(Self {
            name: name.to_owned(),
            service: (service != NO_SERVICE).then(|| service.to_owned()),
            fingerprint: fingerprint.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for KnownPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.name,
            self.service.as_deref().unwrap_or(NO_SERVICE),
            self.fingerprint
        )
    }
}

/// 证书例外存储。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手线程只读、偶发写入，沿用工作区 TLS 热更容器的 RCU 模式：
///   读路径通过 `ArcSwap::load` 无锁取得快照，写路径 `rcu` 原子替换整张表。
///
/// ## 契约（What）
/// - 文件格式为每行 `name service fingerprint`，`#` 开头为注释，无法解析的行会被跳过并告警；
/// - `remember` 先更新内存快照再落盘，落盘失败返回错误但内存中的例外仍然生效；
/// - `path` 为 `None` 时仅保存在内存中。
///
/// ## 风险与权衡（Trade-offs）
/// - 多个进程共享同一目录时采用“写临时文件再改名”，后写者覆盖先写者，不做合并。
pub struct KnownPeers {
    path: Option<PathBuf>,
    entries: ArcSwap<HashSet<KnownPeer>>,
    persist: Mutex<()>,
}

impl KnownPeers {
    /// 仅驻留内存的存储。
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: ArcSwap::from_pointee(HashSet::new()),
            persist: Mutex::new(()),
        }
    }

    /// 从信任目录加载；文件不存在视为空表。
    pub fn load(dir: &Path) -> Result<Self, TlsError> {
        let path = dir.join(KNOWN_PEERS_FILE);
        let mut entries = HashSet::new();
        match fs::read_to_string(&path) {
            Ok(text) => {
                for (index, line) in text.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    match KnownPeer::parse(line) {
                        Some(peer) => {
                            entries.insert(peer);
                        }
                        None => warn!(
                            path = %path.display(),
                            line = index + 1,
                            "skipping malformed known peer entry"
                        ),
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(TlsError::material(
                    Some(path),
                    format!("cannot read known peers: {err}"),
                ));
            }
        }
        Ok(Self {
            path: Some(path),
            entries: ArcSwap::from_pointee(entries),
            persist: Mutex::new(()),
        })
    }

    /// 存储文件路径。
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 当前快照。
    pub fn snapshot(&self) -> Arc<HashSet<KnownPeer>> {
        self.entries.load_full()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// 是否存在匹配的例外。
    pub fn contains(&self, name: &str, service: Option<&str>, fingerprint: &str) -> bool {
        self.entries.load().iter().any(|peer| {
            peer.name == name
                && peer.service.as_deref() == service
                && peer.fingerprint.eq_ignore_ascii_case(fingerprint)
        })
    }

    /// 记录例外并落盘。
    pub fn remember(&self, peer: KnownPeer) -> Result<(), TlsError> {
        let _guard = self.persist.lock();
        self.entries.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(peer.clone());
            next
        });
        match &self.path {
            Some(path) => self.write_file(path),
            None => Ok(()),
        }
    }

    fn write_file(&self, path: &Path) -> Result<(), TlsError> {
        let snapshot = self.entries.load_full();
        let mut lines: Vec<String> = snapshot.iter().map(ToString::to_string).collect();
        lines.sort_unstable();

        let write = || -> io::Result<()> {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let staging = path.with_extension("tmp");
            let mut file = fs::File::create(&staging)?;
            for line in &lines {
                writeln!(file, "{line}")?;
            }
            file.sync_all()?;
            fs::rename(&staging, path)
        };
        write().map_err(|err| {
            TlsError::material(
                Some(path.to_path_buf()),
                format!("cannot persist known peers: {err}"),
            )
        })
    }
}

impl fmt::Debug for KnownPeers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnownPeers")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish()
    }
}

/// 客户端校验器：根证书 → 已知例外 → 策略。
pub(crate) struct TrustingVerifier {
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    known: Arc<KnownPeers>,
    policy: Arc<dyn TrustPolicy>,
    service: Option<String>,
    outcome: Arc<Mutex<Option<PeerTrust>>>,
}

impl TrustingVerifier {
    pub(crate) fn new(
        webpki: Option<Arc<WebPkiServerVerifier>>,
        provider: Arc<CryptoProvider>,
        known: Arc<KnownPeers>,
        policy: Arc<dyn TrustPolicy>,
        service: Option<String>,
    ) -> Self {
        Self {
            webpki,
            provider,
            known,
            policy,
            service,
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    /// 结果槽位，握手完成后由会话读取。
    pub(crate) fn outcome(&self) -> Arc<Mutex<Option<PeerTrust>>> {
        Arc::clone(&self.outcome)
    }

    fn record(&self, trust: PeerTrust) {
        *self.outcome.lock() = Some(trust);
    }
}

impl fmt::Debug for TrustingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustingVerifier")
            .field("webpki", &self.webpki.is_some())
            .field("known", &self.known)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for TrustingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let reason = match &self.webpki {
            Some(webpki) => match webpki.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Ok(verified) => {
                    self.record(PeerTrust::Verified);
                    return Ok(verified);
                }
                Err(err) => err.to_string(),
            },
            None => "no trust anchors configured".to_owned(),
        };

        let name = server_name.to_str();
        let fingerprint = fingerprint(end_entity);
        if self
            .known
            .contains(&name, self.service.as_deref(), &fingerprint)
        {
            info!(server = %name, %fingerprint, "peer certificate matches a known exception");
            self.record(PeerTrust::KnownException);
            return Ok(ServerCertVerified::assertion());
        }

        let query = TrustQuery {
            server_name: name.clone().into_owned(),
            service: self.service.clone(),
            fingerprint,
            reason,
            suggested: TrustDecision::Reject,
        };
        let decision = self.policy.decide(&query);
        info!(
            server = %query.server_name,
            fingerprint = %query.fingerprint,
            reason = %query.reason,
            ?decision,
            "trust policy answered"
        );

        match decision {
            TrustDecision::Reject => {
                self.record(PeerTrust::Rejected);
                Err(RustlsError::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
            TrustDecision::AcceptOnce => {
                self.record(PeerTrust::AcceptedByPolicy { permanent: false });
                Ok(ServerCertVerified::assertion())
            }
            TrustDecision::AcceptPermanently => {
                let peer = KnownPeer {
                    name: query.server_name,
                    service: query.service,
                    fingerprint: query.fingerprint,
                };
                if let Err(err) = self.known.remember(peer) {
                    warn!(error = %err, "failed to persist accepted certificate");
                }
                self.record(PeerTrust::AcceptedByPolicy { permanent: true });
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

//! 服务端与客户端凭据，以及绑定字节流的会话工厂。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 凭据一次构造、被大量会话共享只读使用：证书与私钥在构造期解析完毕，任何缺失或畸形都在此处以
//!   [`TlsError::InvalidMaterial`] 失败，绝不延迟到握手阶段；
//! - 会话通过 `Arc` 持有 `rustls` 配置，凭据句柄可以先于会话被丢弃，销毁顺序由所有权保证。
//!
//! ## 契约（What）
//! - [`ServerCredentials::from_pem_files`]：证书文件必须存在且至少包含一个 `CERTIFICATE` 块；
//!   给出私钥路径时从该文件读取私钥，否则从证书文件本身读取；私钥与证书不匹配同样视为材料无效；
//! - [`ClientCredentials::new`]：内置 Mozilla 根证书 + 信任目录中的例外记录；
//!   信任目录不可读时仍然成功，只是例外存储退化为内存模式。
//!
//! ## 风险与权衡（Trade-offs）
//! - 客户端每个会话会构造一份独立的 `ClientConfig`（携带各自的校验器、策略与 ALPN 报价）；
//!   `rustls` 只在校验器为同一个 `Arc` 时才恢复会话，因此这里显式关闭会话恢复，
//!   每次握手都完整校验对端证书，信任结论总是由本次握手得出。

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    client::{Resumption, WebPkiServerVerifier},
    crypto::{CryptoProvider, aws_lc_rs},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
};
use rustls_pki_types::pem::PemObject;
use tracing::{debug, warn};

use crate::{
    alpn,
    config::{SessionSettings, resolve_trust_dir},
    engine::RustlsEngine,
    error::{self, TlsError},
    session::{Role, Session},
    transport::Transport,
    trust::{KnownPeers, TrustPolicy, TrustingVerifier},
};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

/// 服务端凭据：证书链 + 私钥。
#[derive(Clone)]
pub struct ServerCredentials {
    config: Arc<ServerConfig>,
    settings: SessionSettings,
}

impl ServerCredentials {
    /// 从 PEM 文件加载证书链与私钥。
    pub fn from_pem_files(
        certificate: impl AsRef<Path>,
        key: Option<&Path>,
    ) -> Result<Self, TlsError> {
        let certificate = certificate.as_ref();
        let cert_pem = read_material(certificate, "certificate")?;
        let chain = CertificateDer::pem_slice_iter(&cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                TlsError::material(
                    Some(certificate.to_path_buf()),
                    format!("malformed PEM: {err}"),
                )
            })?;
        if chain.is_empty() {
            return Err(TlsError::material(
                Some(certificate.to_path_buf()),
                "no CERTIFICATE block found",
            ));
        }

        let (key_path, key_pem) = match key {
            Some(path) => (path, read_material(path, "private key")?),
            None => (certificate, cert_pem),
        };
        let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(|err| {
            TlsError::material(
                Some(key_path.to_path_buf()),
                format!("no usable private key: {err}"),
            )
        })?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|err| TlsError::material(None, err.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|err| {
                TlsError::material(
                    Some(certificate.to_path_buf()),
                    format!("certificate rejected: {err}"),
                )
            })?;

        debug!(certificate = %certificate.display(), "tls server credentials loaded");
        Ok(Self {
            config: Arc::new(config),
            settings: SessionSettings::default(),
        })
    }

    /// 替换会话参数。
    pub fn with_settings(mut self, settings: SessionSettings) -> Result<Self, TlsError> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// 绑定服务端会话；不产生任何 I/O。空报价表示不参与 ALPN。
    pub fn session<S: Transport>(&self, stream: S, alpn_offer: &[&str]) -> Session<S> {
        let engine = RustlsEngine::server(
            Arc::clone(&self.config),
            alpn_offer,
            Some(self.settings.send_buffer_limit),
        );
        Session::new(stream, Box::new(engine), Role::Server, self.settings.clone(), None)
    }
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// 客户端凭据：根证书与例外存储。
#[derive(Clone)]
pub struct ClientCredentials {
    provider: Arc<CryptoProvider>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    known: Arc<KnownPeers>,
    settings: SessionSettings,
}

impl ClientCredentials {
    /// 默认客户端凭据。
    pub fn new() -> Result<Self, TlsError> {
        Self::builder().build()
    }

    pub fn builder() -> ClientCredentialsBuilder {
        ClientCredentialsBuilder::default()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// 证书例外存储。
    pub fn known_peers(&self) -> &Arc<KnownPeers> {
        &self.known
    }

    /// 绑定客户端会话；ClientHello 在第一次推进握手时写出。
    ///
    /// - `server_name` 用于主机名校验与 SNI；
    /// - `service` 为例外记录中的服务标签；
    /// - `policy` 在证书不被根证书或例外记录证明时同步询问。
    pub fn session<S: Transport>(
        &self,
        stream: S,
        server_name: &str,
        service: Option<&str>,
        alpn_offer: &[&str],
        policy: Arc<dyn TrustPolicy>,
    ) -> Result<Session<S>, TlsError> {
        let name = ServerName::try_from(server_name.to_owned()).map_err(|_| {
            TlsError::Configuration(format!("invalid server name `{server_name}`").into())
        })?;

        let verifier = TrustingVerifier::new(
            self.webpki.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.known),
            policy,
            service.map(str::to_owned),
        );
        let outcome = verifier.outcome();

        let mut config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|err| TlsError::protocol(error::HANDSHAKE, err.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        config.alpn_protocols = alpn::to_wire(alpn_offer);
        config.resumption = Resumption::disabled();

        let engine = RustlsEngine::client(
            Arc::new(config),
            name,
            Some(self.settings.send_buffer_limit),
        )?;
        Ok(Session::new(
            stream,
            Box::new(engine),
            Role::Client,
            self.settings.clone(),
            Some(outcome),
        ))
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("webpki", &self.webpki.is_some())
            .field("known", &self.known)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// [`ClientCredentials`] 构造器。
#[derive(Debug)]
pub struct ClientCredentialsBuilder {
    trust_dir: Option<PathBuf>,
    extra_roots: Vec<PathBuf>,
    bundled_roots: bool,
    settings: SessionSettings,
}

impl Default for ClientCredentialsBuilder {
    fn default() -> Self {
        Self {
            trust_dir: None,
            extra_roots: Vec::new(),
            bundled_roots: true,
            settings: SessionSettings::default(),
        }
    }
}

impl ClientCredentialsBuilder {
    /// 覆盖信任目录。
    pub fn trust_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trust_dir = Some(dir.into());
        self
    }

    /// 追加 PEM 格式的根证书文件。
    pub fn add_root_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_roots.push(path.into());
        self
    }

    /// 是否加载内置的 Mozilla 根证书。
    pub fn bundled_roots(mut self, enabled: bool) -> Self {
        self.bundled_roots = enabled;
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<ClientCredentials, TlsError> {
        self.settings.validate()?;
        let provider = provider();

        let mut roots = RootCertStore::empty();
        if self.bundled_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        for path in &self.extra_roots {
            let pem = read_material(path, "root certificate")?;
            let mut found = false;
            for cert in CertificateDer::pem_slice_iter(&pem) {
                let cert = cert.map_err(|err| {
                    TlsError::material(Some(path.clone()), format!("malformed PEM: {err}"))
                })?;
                roots.add(cert).map_err(|err| {
                    TlsError::material(Some(path.clone()), format!("unusable root: {err}"))
                })?;
                found = true;
            }
            if !found {
                return Err(TlsError::material(
                    Some(path.clone()),
                    "no CERTIFICATE block found",
                ));
            }
        }

        let webpki = if roots.is_empty() {
            None
        } else {
            Some(
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                    .build()
                    .map_err(|err| TlsError::material(None, err.to_string()))?,
            )
        };

        let explicit = self.trust_dir.as_deref().or(self.settings.trust_store_dir.as_deref());
        let known = match resolve_trust_dir(explicit) {
            Some(dir) => KnownPeers::load(&dir).unwrap_or_else(|err| {
                warn!(error = %err, "known peers unavailable, exceptions stay in memory");
                KnownPeers::in_memory()
            }),
            None => KnownPeers::in_memory(),
        };
        debug!(
            roots = webpki.is_some(),
            known_peers = known.len(),
            store = ?known.path(),
            "tls client credentials ready"
        );

        Ok(ClientCredentials {
            provider,
            webpki,
            known: Arc::new(known),
            settings: self.settings,
        })
    }
}

fn read_material(path: &Path, what: &str) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|err| {
        TlsError::material(Some(path.to_path_buf()), format!("cannot read {what}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_is_invalid_material() {
        let err = ServerCredentials::from_pem_files("/nonexistent/cert.pem", None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidMaterial);
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn client_without_roots_still_builds() {
        let dir = tempfile::tempdir().unwrap();
        let creds = ClientCredentials::builder()
            .bundled_roots(false)
            .trust_dir(dir.path())
            .build()
            .unwrap();
        assert!(creds.webpki.is_none());
        assert_eq!(
            creds.known_peers().path(),
            Some(dir.path().join(crate::trust::KNOWN_PEERS_FILE).as_path())
        );
    }

    #[test]
    fn invalid_settings_are_rejected_by_the_builder() {
        let settings = SessionSettings {
            send_buffer_limit: 0,
            ..SessionSettings::default()
        };
        let err = ClientCredentials::builder()
            .settings(settings)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}

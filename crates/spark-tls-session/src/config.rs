//! 会话配置与信任目录解析。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 握手超时、阻塞读写超时与发送缓冲上限属于部署参数，宿主通常从 TOML 配置文件读取，
//!   因此以 `serde` 强类型结构承载，并在解析时完成取值校验；
//! - 信任目录（持久化的证书例外记录所在位置）需要“实例覆盖 > 进程环境 > 平台默认”三级解析，
//!   集中在 [`resolve_trust_dir`]，客户端凭据与测试共用同一规则。
//!
//! ## 契约（What）
//! - 缺省值：握手 30 秒超时，阻塞读写不设超时，发送缓冲 64 KiB；
//! - 任何非正的超时或缓冲上限都会被拒绝，返回 [`TlsError::Configuration`]。
//!
//! ## 风险与权衡（Trade-offs）
//! - 发送缓冲上限同时是拥塞阈值：值越小，`write` 越早返回部分计数。

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::TlsError;

/// 覆盖默认信任目录的环境变量。
pub const TRUST_DIR_ENV: &str = "SPARK_TLS_TRUST_DIR";

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SEND_BUFFER_LIMIT: usize = 64 * 1024;

/// 会话参数。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSettings {
    /// 阻塞式握手驱动的总超时（毫秒）。
    pub handshake_timeout_ms: u64,
    /// 阻塞式读写单次等待的超时（毫秒）；缺省表示无限等待。
    pub io_timeout_ms: Option<u64>,
    /// 后端排队密文的上限（字节），达到后 `write` 返回部分计数。
    pub send_buffer_limit: usize,
    /// 信任目录覆盖，仅对客户端凭据生效。
    pub trust_store_dir: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            io_timeout_ms: None,
            send_buffer_limit: DEFAULT_SEND_BUFFER_LIMIT,
            trust_store_dir: None,
        }
    }
}

impl SessionSettings {
    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, TlsError> {
        let settings: Self = toml::from_str(text)
            .map_err(|err| TlsError::Configuration(err.to_string().into()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<(), TlsError> {
        if self.handshake_timeout_ms == 0 {
            return Err(TlsError::Configuration(
                "handshake_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.io_timeout_ms == Some(0) {
            return Err(TlsError::Configuration(
                "io_timeout_ms must be greater than zero when set".into(),
            ));
        }
        if self.send_buffer_limit == 0 {
            return Err(TlsError::Configuration(
                "send_buffer_limit must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }
}

/// 解析信任目录：显式覆盖 > [`TRUST_DIR_ENV`] > `dirs::data_dir()/spark/tls`。
///
/// 平台没有数据目录且未提供覆盖时返回 `None`，此时客户端只使用内置根证书，例外记录不落盘。
pub fn resolve_trust_dir(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir.to_path_buf());
    }
    if let Some(dir) = std::env::var_os(TRUST_DIR_ENV).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    dirs::data_dir().map(|base| base.join("spark").join("tls"))
}

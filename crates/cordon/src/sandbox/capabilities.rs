//! 沙箱能力探测
//!
//! 探测主机上可用的隔离机制，生成进程级缓存的 Capabilities 快照。
//! 快照惰性计算，只有显式调用 `invalidate` 才会重新探测，
//! 不会自动过期。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::config::SandboxMethod;

/// Landlock 特性开关在 procfs 中的位置
const LANDLOCK_PROC_PATH: &str = "/proc/sys/kernel/unprivileged_landlock_restrict";

/// 沙箱能力快照
///
/// 一经计算即视为不可变；并发读取无需加锁保护快照本身。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Landlock 可用 (Linux >= 5.13)
    pub landlock: bool,
    /// Bubblewrap 可用
    pub bubblewrap: bool,
    /// Docker 可用
    pub docker: bool,
    /// Firejail 可用
    pub firejail: bool,
    /// Seatbelt 可用 (macOS)
    pub seatbelt: bool,
    /// 推荐的沙箱方式
    pub recommended: SandboxMethod,
}

impl Capabilities {
    /// 探测当前主机
    pub fn detect() -> Self {
        let landlock = cfg!(target_os = "linux") && landlock_supported();
        let bubblewrap = cfg!(target_os = "linux") && tool_available("bwrap");
        let firejail = cfg!(target_os = "linux") && tool_available("firejail");
        let seatbelt = cfg!(target_os = "macos") && tool_available("sandbox-exec");
        let docker = tool_available("docker");

        let mut caps = Self {
            landlock,
            bubblewrap,
            docker,
            firejail,
            seatbelt,
            recommended: SandboxMethod::None,
        };
        caps.recommended = recommend(&caps);
        debug!(?caps, "detected sandbox capabilities");
        caps
    }

    /// 指定方式是否可用
    pub fn supports(&self, method: SandboxMethod) -> bool {
        match method {
            SandboxMethod::Landlock => self.landlock,
            SandboxMethod::Bubblewrap => self.bubblewrap,
            SandboxMethod::Docker => self.docker,
            SandboxMethod::Firejail => self.firejail,
            SandboxMethod::Seatbelt => self.seatbelt,
            SandboxMethod::None => true,
        }
    }
}

/// 推荐方式选择
///
/// 固定优先级：Linux 上 landlock > bubblewrap > firejail > none；
/// macOS 上 seatbelt > none。本层不提供配置项。
fn recommend(caps: &Capabilities) -> SandboxMethod {
    if cfg!(target_os = "macos") {
        if caps.seatbelt {
            return SandboxMethod::Seatbelt;
        }
        return SandboxMethod::None;
    }
    if cfg!(target_os = "linux") {
        if caps.landlock {
            return SandboxMethod::Landlock;
        }
        if caps.bubblewrap {
            return SandboxMethod::Bubblewrap;
        }
        if caps.firejail {
            return SandboxMethod::Firejail;
        }
    }
    SandboxMethod::None
}

/// Landlock 是否可用
///
/// procfs 开关存在即认为可用；探测失败时回退到内核版本判断。
fn landlock_supported() -> bool {
    if Path::new(LANDLOCK_PROC_PATH).exists() {
        return true;
    }
    kernel_release()
        .map(|release| landlock_version_supported(&release))
        .unwrap_or(false)
}

/// 读取内核版本串
fn kernel_release() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .ok()
        .map(|s| s.trim().to_string())
}

/// 内核版本是否支持 Landlock（5.13 起）
///
/// 主版本大于 5 一律支持；无法解析的版本串视为不支持。
pub fn landlock_version_supported(release: &str) -> bool {
    let mut parts = release.split('.');
    let major: u32 = match parts.next().and_then(|s| s.trim().parse().ok()) {
        Some(m) => m,
        None => return false,
    };
    if major > 5 {
        return true;
    }
    if major < 5 {
        return false;
    }
    let minor: u32 = match parts
        .next()
        .map(|s| s.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|s| s.parse().ok())
    {
        Some(m) => m,
        None => return false,
    };
    minor >= 13
}

/// 探测可执行工具是否存在
///
/// 通过 `which <tool>` 的退出码判断；无法启动 which 视为不可用。
fn tool_available(tool: &str) -> bool {
    std::process::Command::new("which")
        .arg(tool)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// 进程级能力缓存
///
/// 显式的缓存对象，由需要能力信息的组件按引用持有；
/// 惰性计算、手动失效。
#[derive(Default)]
pub struct CapabilityCache {
    inner: RwLock<Option<Capabilities>>,
}

impl CapabilityCache {
    /// 创建空缓存
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取能力快照（首次调用时探测）
    pub fn get(&self) -> Capabilities {
        if let Some(caps) = *self.inner.read() {
            return caps;
        }
        let caps = Capabilities::detect();
        *self.inner.write() = Some(caps);
        caps
    }

    /// 失效缓存，下次 `get` 重新探测
    pub fn invalidate(&self) {
        *self.inner.write() = None;
    }

    /// 直接写入快照
    ///
    /// 用于嵌入方固定一份已知的能力视图（探测被策略禁止的环境、
    /// 确定性测试等）。
    pub fn set(&self, caps: Capabilities) {
        *self.inner.write() = Some(caps);
    }

    /// 缓存是否已填充
    pub fn is_populated(&self) -> bool {
        self.inner.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_none() -> Capabilities {
        Capabilities {
            landlock: false,
            bubblewrap: false,
            docker: false,
            firejail: false,
            seatbelt: false,
            recommended: SandboxMethod::None,
        }
    }

    #[test]
    fn test_kernel_version_gate_supported() {
        assert!(landlock_version_supported("5.13.0-x"));
        assert!(landlock_version_supported("5.15.0"));
        assert!(landlock_version_supported("6.1.0"));
        assert!(landlock_version_supported("6.8.0-45-generic"));
    }

    #[test]
    fn test_kernel_version_gate_unsupported() {
        assert!(!landlock_version_supported("5.10.0"));
        assert!(!landlock_version_supported("4.19.0"));
        assert!(!landlock_version_supported("5.12.19"));
    }

    #[test]
    fn test_kernel_version_gate_unparsable() {
        assert!(!landlock_version_supported(""));
        assert!(!landlock_version_supported("garbage"));
        assert!(!landlock_version_supported("five.thirteen"));
        assert!(!landlock_version_supported("5"));
    }

    #[test]
    fn test_kernel_version_minor_with_suffix() {
        // 次版本号后跟非数字后缀时仍可解析
        assert!(landlock_version_supported("5.13-rc1"));
        assert!(!landlock_version_supported("5.1x"));
    }

    #[test]
    fn test_supports_none_always_true() {
        let caps = caps_none();
        assert!(caps.supports(SandboxMethod::None));
        assert!(!caps.supports(SandboxMethod::Landlock));
        assert!(!caps.supports(SandboxMethod::Bubblewrap));
        assert!(!caps.supports(SandboxMethod::Docker));
    }

    #[test]
    fn test_recommend_priority_on_linux() {
        if !cfg!(target_os = "linux") {
            return;
        }
        let mut caps = caps_none();
        caps.landlock = true;
        caps.bubblewrap = true;
        caps.firejail = true;
        assert_eq!(recommend(&caps), SandboxMethod::Landlock);

        caps.landlock = false;
        assert_eq!(recommend(&caps), SandboxMethod::Bubblewrap);

        caps.bubblewrap = false;
        assert_eq!(recommend(&caps), SandboxMethod::Firejail);

        caps.firejail = false;
        assert_eq!(recommend(&caps), SandboxMethod::None);
    }

    #[test]
    fn test_cache_returns_set_value() {
        let cache = CapabilityCache::new();
        assert!(!cache.is_populated());

        let mut caps = caps_none();
        caps.bubblewrap = true;
        caps.recommended = SandboxMethod::Bubblewrap;
        cache.set(caps);

        assert!(cache.is_populated());
        assert_eq!(cache.get(), caps);
        // 缓存命中时不重新探测
        assert_eq!(cache.get(), caps);
    }

    #[test]
    fn test_cache_invalidate_clears() {
        let cache = CapabilityCache::new();
        cache.set(caps_none());
        assert!(cache.is_populated());
        cache.invalidate();
        assert!(!cache.is_populated());
    }

    #[test]
    fn test_detect_populates_cache_lazily() {
        let cache = CapabilityCache::new();
        let first = cache.get();
        assert!(cache.is_populated());
        let second = cache.get();
        assert_eq!(first, second);
    }

    #[test]
    fn test_tool_available_for_missing_tool() {
        assert!(!tool_available("definitely-not-a-real-tool-7f3a"));
    }
}

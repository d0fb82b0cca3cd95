//! 沙箱配置
//!
//! 提供沙箱配置管理、预设、路径检查功能

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// 沙箱方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMethod {
    /// Landlock + seccomp (Linux)
    Landlock,
    /// Bubblewrap (Linux)
    Bubblewrap,
    /// Docker 容器
    Docker,
    /// Firejail (Linux)
    Firejail,
    /// Seatbelt (macOS)
    Seatbelt,
    /// 无沙箱
    #[default]
    None,
}

impl SandboxMethod {
    /// 获取方式名称
    pub fn name(&self) -> &str {
        match self {
            Self::Landlock => "landlock",
            Self::Bubblewrap => "bubblewrap",
            Self::Docker => "docker",
            Self::Firejail => "firejail",
            Self::Seatbelt => "seatbelt",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for SandboxMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 沙箱配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// 请求的沙箱方式（实际生效的方式见执行结果的 backend 字段）
    pub method: SandboxMethod,
    /// 允许读写的路径
    pub allowed_paths: Vec<PathBuf>,
    /// 禁止访问的路径（优先级最高）
    pub blocked_paths: Vec<PathBuf>,
    /// 只读路径
    pub read_only_paths: Vec<PathBuf>,
    /// 是否允许网络访问
    pub network_enabled: bool,
    /// 允许的域名（由外部 DNS/代理层强制，这里仅透传）
    pub allowed_domains: Vec<String>,
    /// 超时时间（毫秒）
    pub timeout_ms: u64,
    /// stdout/stderr 各自的最大捕获字节数
    pub max_output_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            method: SandboxMethod::None,
            allowed_paths: vec![PathBuf::from("/tmp")],
            blocked_paths: default_blocked_paths(),
            read_only_paths: vec![
                PathBuf::from("/usr"),
                PathBuf::from("/lib"),
                PathBuf::from("/lib64"),
                PathBuf::from("/bin"),
                PathBuf::from("/sbin"),
                PathBuf::from("/etc"),
            ],
            network_enabled: false,
            allowed_domains: Vec::new(),
            timeout_ms: 120_000,
            max_output_size: 1024 * 1024,
        }
    }
}

/// 默认禁止访问的敏感路径
///
/// 覆盖常见的凭据与历史记录位置。
pub fn default_blocked_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        for rel in [
            ".ssh",
            ".aws",
            ".docker",
            ".kube",
            ".gnupg",
            ".bash_history",
            ".zsh_history",
        ] {
            paths.push(home.join(rel));
        }
    }
    paths.push(PathBuf::from("/etc/passwd"));
    paths.push(PathBuf::from("/etc/shadow"));
    paths.push(PathBuf::from("/etc/sudoers"));
    paths
}

/// 沙箱预设类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxPreset {
    /// 严格隔离
    Strict,
    /// 开发环境
    Development,
    /// 无限制
    Unrestricted,
}

/// 预设配置集合
pub static SANDBOX_PRESETS: Lazy<HashMap<SandboxPreset, SandboxConfig>> = Lazy::new(|| {
    let mut presets = HashMap::new();

    // 严格隔离预设
    presets.insert(
        SandboxPreset::Strict,
        SandboxConfig {
            method: SandboxMethod::Landlock,
            allowed_paths: vec![PathBuf::from("/tmp")],
            network_enabled: false,
            timeout_ms: 60_000,
            max_output_size: 256 * 1024,
            ..Default::default()
        },
    );

    // 开发环境预设
    presets.insert(
        SandboxPreset::Development,
        SandboxConfig {
            method: SandboxMethod::Bubblewrap,
            network_enabled: true,
            timeout_ms: 300_000,
            ..Default::default()
        },
    );

    // 无限制预设
    presets.insert(
        SandboxPreset::Unrestricted,
        SandboxConfig {
            method: SandboxMethod::None,
            network_enabled: true,
            blocked_paths: Vec::new(),
            ..Default::default()
        },
    );

    presets
});

/// 默认配置文件路径：`~/.cordon/sandbox.json`
fn default_config_file() -> (PathBuf, PathBuf) {
    let config_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join(".cordon");
    let config_file = config_dir.join("sandbox.json");
    (config_dir, config_file)
}

/// 沙箱配置管理器
pub struct SandboxConfigManager {
    /// 配置目录
    config_dir: PathBuf,
    /// 配置文件路径
    config_file: PathBuf,
    /// 当前配置
    current_config: Arc<RwLock<SandboxConfig>>,
}

impl SandboxConfigManager {
    /// 创建新的配置管理器
    pub fn new(config_dir: Option<PathBuf>) -> Self {
        let (config_dir, config_file) = match config_dir {
            Some(dir) => {
                let file = dir.join("sandbox.json");
                (dir, file)
            }
            None => default_config_file(),
        };
        let current_config = Arc::new(RwLock::new(SandboxConfig::default()));

        let mut manager = Self {
            config_dir,
            config_file,
            current_config,
        };
        manager.load_config_sync();
        manager
    }

    /// 同步加载配置
    fn load_config_sync(&mut self) {
        if let Ok(content) = std::fs::read_to_string(&self.config_file) {
            if let Ok(config) = serde_json::from_str::<SandboxConfig>(&content) {
                if let Ok(mut current) = self.current_config.write() {
                    *current = config;
                }
            }
        }
    }

    /// 异步加载配置
    pub async fn load_config(&self) -> anyhow::Result<SandboxConfig> {
        let content = tokio::fs::read_to_string(&self.config_file).await?;
        let config: SandboxConfig = serde_json::from_str(&content)?;
        if let Ok(mut current) = self.current_config.write() {
            *current = config.clone();
        }
        Ok(config)
    }

    /// 获取当前配置
    pub fn get_config(&self) -> SandboxConfig {
        self.current_config
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// 更新配置（唯一的变更入口）
    pub async fn update_config(&self, config: SandboxConfig) -> anyhow::Result<()> {
        if let Ok(mut current) = self.current_config.write() {
            *current = config;
        }
        self.save_config().await
    }

    /// 保存配置到文件
    pub async fn save_config(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let config = self.get_config();
        let content = serde_json::to_string_pretty(&config)?;
        tokio::fs::write(&self.config_file, content).await?;
        Ok(())
    }

    /// 重置为默认配置
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.update_config(SandboxConfig::default()).await
    }

    /// 获取预设配置
    pub fn get_preset(&self, preset: SandboxPreset) -> Option<SandboxConfig> {
        SANDBOX_PRESETS.get(&preset).cloned()
    }

    /// 检查路径是否被禁止
    pub fn is_path_blocked(&self, target_path: &Path) -> bool {
        let config = self.get_config();
        config
            .blocked_paths
            .iter()
            .any(|blocked| target_path.starts_with(blocked))
    }

    /// 检查路径是否允许访问
    pub fn is_path_allowed(&self, target_path: &Path) -> bool {
        let config = self.get_config();

        // 禁止路径优先
        if self.is_path_blocked(target_path) {
            return false;
        }

        if config.allowed_paths.is_empty() {
            return true;
        }

        config
            .allowed_paths
            .iter()
            .chain(config.read_only_paths.iter())
            .any(|allowed| target_path.starts_with(allowed))
    }
}

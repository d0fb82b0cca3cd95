//! 文件系统路径检查
//!
//! 在子进程启动前对命令引用的路径做校验：解析 `..` 与 `~`，
//! 与禁止路径列表比对；同时为各沙箱后端生成挂载参数。

use std::path::{Component, Path, PathBuf};

use super::config::SandboxConfig;

/// 词法规范化路径（不访问文件系统）
///
/// 逐组件处理 `.` 与 `..`，使 `/a/b/../c` 变为 `/a/c`；
/// 比较前必须先规范化，避免用 `../` 绕过禁止列表。
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// 展开 `~` 前缀并规范化
pub fn expand_and_normalize(raw: &str) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    normalize_path(Path::new(expanded.as_ref()))
}

/// 参数是否形如路径
fn looks_like_path(arg: &str) -> bool {
    arg.starts_with('/')
        || arg.starts_with("~/")
        || arg.starts_with("./")
        || arg.starts_with("../")
        || arg == "~"
}

/// 从命令参数中提取疑似路径
pub fn extract_paths(args: &[String]) -> Vec<PathBuf> {
    args.iter()
        .filter(|arg| looks_like_path(arg))
        .map(|arg| expand_and_normalize(arg))
        .collect()
}

/// 校验命令参数引用的路径
///
/// 命中禁止路径时返回该路径；允许/只读列表只影响后端的
/// 挂载参数，不在这里拦截。
pub fn check_blocked_paths(args: &[String], config: &SandboxConfig) -> Result<(), PathBuf> {
    for path in extract_paths(args) {
        for blocked in &config.blocked_paths {
            if path.starts_with(blocked) {
                return Err(path);
            }
        }
    }
    Ok(())
}

/// 为 bubblewrap 生成绑定参数
pub fn bwrap_bind_args(config: &SandboxConfig) -> Vec<String> {
    let mut args = Vec::new();
    for path in &config.read_only_paths {
        let p = path.to_string_lossy().to_string();
        args.push("--ro-bind-try".to_string());
        args.push(p.clone());
        args.push(p);
    }
    for path in &config.allowed_paths {
        let p = path.to_string_lossy().to_string();
        args.push("--bind-try".to_string());
        args.push(p.clone());
        args.push(p);
    }
    args
}

/// 为 firejail 生成路径参数
pub fn firejail_path_args(config: &SandboxConfig) -> Vec<String> {
    let mut args = Vec::new();
    for path in &config.read_only_paths {
        args.push(format!("--read-only={}", path.display()));
    }
    for path in &config.blocked_paths {
        args.push(format!("--blacklist={}", path.display()));
    }
    args
}

//! 沙箱执行器
//!
//! 提供统一的沙箱执行接口：先咨询策略引擎，再根据能力快照选择
//! 后端执行。后端降级链是显式的有序列表，每次降级都会更新结果中
//! 上报的 backend 字段——调用方看到的 `sandboxed: true` 一定对应
//! 实际生效的隔离。

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::policy::{PolicyAction, PolicyEngine, PolicyEvaluation};

use super::capabilities::{Capabilities, CapabilityCache};
use super::config::{SandboxConfig, SandboxMethod};
use super::filesystem;
use super::seccomp::{default_blocked_syscalls, SeccompError, SeccompProgram};

/// Docker 后端使用的默认镜像
const DEFAULT_DOCKER_IMAGE: &str = "alpine:latest";

/// 传给 bwrap `--seccomp` 的子进程 fd 编号
#[cfg(unix)]
const SECCOMP_CHILD_FD: i32 = 10;

/// 进程无法启动时的合成退出码
const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// 沙箱错误
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// 后端不可用（本地降级处理，不上抛）
    #[error("sandbox backend {0} unavailable")]
    BackendUnavailable(SandboxMethod),
    /// seccomp 过滤器编译或写入失败
    #[error("seccomp filter: {0}")]
    Seccomp(#[from] SeccompError),
    /// 命令引用了禁止路径
    #[error("blocked path referenced: {0}")]
    BlockedPath(PathBuf),
    /// 进程启动失败
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    /// IO 错误
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 执行选项
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// 命令
    pub command: String,
    /// 参数
    pub args: Vec<String>,
    /// 环境变量
    pub env: HashMap<String, String>,
    /// 工作目录
    pub working_dir: Option<PathBuf>,
}

impl ExecutorOptions {
    /// 创建执行选项
    pub fn new(command: impl Into<String>, args: &[String]) -> Self {
        Self {
            command: command.into(),
            args: args.to_vec(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    /// 设置环境变量
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// 设置工作目录
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// 执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// 标准输出（按配置截断）
    pub stdout: String,
    /// 标准错误（按配置截断）
    pub stderr: String,
    /// 退出码
    pub exit_code: i32,
    /// 是否超时被杀
    pub timed_out: bool,
    /// 是否在沙箱中执行（只在隔离实际生效时为 true）
    pub sandboxed: bool,
    /// 实际使用的后端
    pub backend: SandboxMethod,
    /// 执行时长（毫秒）
    pub duration_ms: Option<u64>,
}

impl ExecutionResult {
    /// 策略拒绝时的结果（未启动任何进程）
    fn denied(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason.into(),
            exit_code: 1,
            timed_out: false,
            sandboxed: false,
            backend: SandboxMethod::None,
            duration_ms: None,
        }
    }

    /// 进程启动失败时的结果
    fn spawn_failed(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            timed_out: false,
            sandboxed: false,
            backend: SandboxMethod::None,
            duration_ms: None,
        }
    }
}

/// 子进程原始输出
struct RawOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
    timed_out: bool,
}

/// 构建降级链
///
/// 请求的方式在前，可用的弱化方式随后，`None` 永远兜底。
/// Landlock 通过 bwrap 注入 seccomp 过滤器，因此同时要求
/// bubblewrap 可用；缺 bwrap 时直接落到 `None`。
pub fn select_chain(requested: SandboxMethod, caps: &Capabilities) -> Vec<SandboxMethod> {
    let mut chain = Vec::new();
    match requested {
        SandboxMethod::Landlock => {
            if caps.landlock && caps.bubblewrap {
                chain.push(SandboxMethod::Landlock);
            }
            if caps.bubblewrap {
                chain.push(SandboxMethod::Bubblewrap);
            }
        }
        SandboxMethod::Bubblewrap => {
            if caps.bubblewrap {
                chain.push(SandboxMethod::Bubblewrap);
            }
        }
        SandboxMethod::Docker => {
            if caps.docker {
                chain.push(SandboxMethod::Docker);
            }
        }
        SandboxMethod::Firejail => {
            if caps.firejail {
                chain.push(SandboxMethod::Firejail);
            }
        }
        SandboxMethod::Seatbelt => {
            if caps.seatbelt {
                chain.push(SandboxMethod::Seatbelt);
            }
        }
        SandboxMethod::None => {}
    }
    chain.push(SandboxMethod::None);
    chain
}

/// 沙箱执行器
///
/// 每次 `execute` 调用独立持有自己的临时过滤器文件与定时器，
/// 并发调用之间不共享可变状态；共享的只有能力缓存与策略引擎
/// （后者用互斥锁包裹）。
pub struct SandboxExecutor {
    policy: Mutex<PolicyEngine>,
    capabilities: Arc<CapabilityCache>,
}

impl SandboxExecutor {
    /// 创建执行器
    pub fn new(policy: PolicyEngine, capabilities: Arc<CapabilityCache>) -> Self {
        Self {
            policy: Mutex::new(policy),
            capabilities,
        }
    }

    /// 能力缓存
    pub fn capabilities(&self) -> &Arc<CapabilityCache> {
        &self.capabilities
    }

    /// 访问策略引擎
    pub fn with_policy<T>(&self, f: impl FnOnce(&mut PolicyEngine) -> T) -> T {
        f(&mut self.policy.lock())
    }

    /// 执行命令
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        config: &SandboxConfig,
    ) -> anyhow::Result<ExecutionResult> {
        self.execute_with_options(ExecutorOptions::new(command, args), config)
            .await
    }

    /// 带选项执行命令
    ///
    /// 流程：策略评估 → 路径校验 → 能力检查 → 后端选择 →
    /// 执行（失败则沿降级链继续）。Deny 短路返回，不启动进程；
    /// Ask 的确认流程由调用方负责，这里按已确认处理。
    pub async fn execute_with_options(
        &self,
        opts: ExecutorOptions,
        config: &SandboxConfig,
    ) -> anyhow::Result<ExecutionResult> {
        let start = Instant::now();

        let work_dir = opts
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        // 1. 策略评估
        let evaluation: PolicyEvaluation =
            self.policy
                .lock()
                .evaluate(&opts.command, &opts.args, &work_dir);
        if evaluation.action == PolicyAction::Deny {
            debug!(command = %opts.command, reason = %evaluation.reason, "execution denied by policy");
            return Ok(ExecutionResult::denied(format!(
                "Denied by policy: {}",
                evaluation.reason
            )));
        }

        // 2. 路径校验：禁止路径直接拒绝
        if let Err(path) = filesystem::check_blocked_paths(&opts.args, config) {
            return Ok(ExecutionResult::denied(format!(
                "Blocked path referenced: {}",
                path.display()
            )));
        }

        // 3. 能力检查与方式选择
        let caps = self.capabilities.get();
        let mut requested = config.method;
        if requested == SandboxMethod::None && evaluation.requires_sandbox() {
            // 策略要求沙箱时升级到推荐方式
            requested = caps.recommended;
        }

        // 规则约束可以收紧超时与网络
        let timeout_ms = evaluation
            .constraints
            .as_ref()
            .and_then(|c| c.max_timeout_ms)
            .map_or(config.timeout_ms, |m| m.min(config.timeout_ms));
        let network_enabled = config.network_enabled
            && evaluation
                .constraints
                .as_ref()
                .and_then(|c| c.allow_network)
                .unwrap_or(true);
        let mut effective = config.clone();
        effective.network_enabled = network_enabled;

        // 4. 沿降级链执行
        let chain = select_chain(requested, &caps);
        debug!(requested = %requested, ?chain, "selected backend chain");

        let mut last_error: Option<SandboxError> = None;
        for method in chain {
            match self.try_execute(method, &opts, &effective, timeout_ms).await {
                Ok(raw) => {
                    let sandboxed = method != SandboxMethod::None;
                    if method != requested {
                        warn!(
                            requested = %requested,
                            actual = %method,
                            "sandbox degraded to weaker backend"
                        );
                    }
                    return Ok(ExecutionResult {
                        stdout: raw.stdout,
                        stderr: raw.stderr,
                        exit_code: raw.exit_code,
                        timed_out: raw.timed_out,
                        sandboxed,
                        backend: method,
                        duration_ms: Some(start.elapsed().as_millis() as u64),
                    });
                }
                Err(e) => {
                    warn!(backend = %method, error = %e, "backend failed, degrading");
                    last_error = Some(e);
                }
            }
        }

        // 链以 None 结尾，到这里说明连本机直接执行都没能启动进程
        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no usable sandbox backend".to_string());
        Ok(ExecutionResult {
            duration_ms: Some(start.elapsed().as_millis() as u64),
            ..ExecutionResult::spawn_failed(message)
        })
    }

    /// 用指定后端执行一次
    async fn try_execute(
        &self,
        method: SandboxMethod,
        opts: &ExecutorOptions,
        config: &SandboxConfig,
        timeout_ms: u64,
    ) -> Result<RawOutput, SandboxError> {
        match method {
            SandboxMethod::None => {
                let cmd = build_native(opts);
                run_child(cmd, timeout_ms, config.max_output_size).await
            }
            SandboxMethod::Bubblewrap => {
                let cmd = build_bubblewrap(opts, config, None);
                run_child(cmd, timeout_ms, config.max_output_size).await
            }
            SandboxMethod::Landlock => self.try_execute_landlock(opts, config, timeout_ms).await,
            SandboxMethod::Docker => {
                let cmd = build_docker(opts, config);
                run_child(cmd, timeout_ms, config.max_output_size).await
            }
            SandboxMethod::Firejail => {
                let cmd = build_firejail(opts, config);
                run_child(cmd, timeout_ms, config.max_output_size).await
            }
            SandboxMethod::Seatbelt => {
                let cmd = build_seatbelt(opts, config);
                run_child(cmd, timeout_ms, config.max_output_size).await
            }
        }
    }

    /// Landlock + seccomp 执行
    ///
    /// 过滤器写入独立命名的临时文件，句柄在本函数作用域内存活，
    /// 子进程结束后随作用域退出删除——包括所有失败路径。
    #[cfg(unix)]
    async fn try_execute_landlock(
        &self,
        opts: &ExecutorOptions,
        config: &SandboxConfig,
        timeout_ms: u64,
    ) -> Result<RawOutput, SandboxError> {
        let program = SeccompProgram::compile(&default_blocked_syscalls())?;
        let filter_file = program.write_filter_file()?;

        let mut cmd = build_bubblewrap(opts, config, Some(SECCOMP_CHILD_FD));
        let parent_fd = install_seccomp_fd(&mut cmd, filter_file.path())?;

        let result = run_child(cmd, timeout_ms, config.max_output_size).await;

        // 关闭父进程持有的 fd；子进程已有自己的副本
        unsafe { libc::close(parent_fd) };
        drop(filter_file);
        result
    }

    #[cfg(not(unix))]
    async fn try_execute_landlock(
        &self,
        _opts: &ExecutorOptions,
        _config: &SandboxConfig,
        _timeout_ms: u64,
    ) -> Result<RawOutput, SandboxError> {
        Err(SandboxError::BackendUnavailable(SandboxMethod::Landlock))
    }
}

/// 把 seccomp 过滤器 fd 接到子进程
///
/// 在 pre_exec 中把过滤器文件 dup 到固定编号，bwrap 通过
/// `--seccomp <fd>` 读取。返回父进程侧需要关闭的 fd。
#[cfg(unix)]
fn install_seccomp_fd(
    cmd: &mut Command,
    filter_path: &std::path::Path,
) -> Result<i32, SandboxError> {
    use std::os::unix::io::IntoRawFd;

    let file = std::fs::File::open(filter_path)?;
    let fd = file.into_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            // dup2 产生的 fd 不带 CLOEXEC，能活过 exec
            if libc::dup2(fd, SECCOMP_CHILD_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(fd)
}

// =============================================================================
// 后端命令构建
// =============================================================================

/// 无沙箱执行
fn build_native(opts: &ExecutorOptions) -> Command {
    let mut cmd = Command::new(&opts.command);
    cmd.args(&opts.args);
    apply_common(&mut cmd, opts);
    cmd
}

/// Bubblewrap 沙箱 (Linux)
///
/// `seccomp_fd` 有值时追加 `--seccomp` 标志（Landlock 模式）。
fn build_bubblewrap(
    opts: &ExecutorOptions,
    config: &SandboxConfig,
    seccomp_fd: Option<i32>,
) -> Command {
    let mut bwrap_args: Vec<String> = vec![
        "--die-with-parent".to_string(),
        "--new-session".to_string(),
        "--unshare-pid".to_string(),
        "--unshare-ipc".to_string(),
        "--unshare-uts".to_string(),
    ];

    // 网络隔离：只在禁用网络时加 unshare 标志
    if !config.network_enabled {
        bwrap_args.push("--unshare-net".to_string());
    }

    if let Some(fd) = seccomp_fd {
        bwrap_args.push("--seccomp".to_string());
        bwrap_args.push(fd.to_string());
    }

    bwrap_args.extend(filesystem::bwrap_bind_args(config));
    bwrap_args.push("--dev".to_string());
    bwrap_args.push("/dev".to_string());
    bwrap_args.push("--proc".to_string());
    bwrap_args.push("/proc".to_string());

    let mut cmd = Command::new("bwrap");
    cmd.args(&bwrap_args);
    cmd.arg("--");
    cmd.arg(&opts.command);
    cmd.args(&opts.args);
    apply_common(&mut cmd, opts);
    cmd
}

/// Docker 沙箱
fn build_docker(opts: &ExecutorOptions, config: &SandboxConfig) -> Command {
    let mut docker_args: Vec<String> = vec!["run".to_string(), "--rm".to_string()];

    if !config.network_enabled {
        docker_args.push("--network=none".to_string());
    }

    for path in &config.allowed_paths {
        docker_args.push("-v".to_string());
        docker_args.push(format!("{}:{}", path.display(), path.display()));
    }
    for path in &config.read_only_paths {
        docker_args.push("-v".to_string());
        docker_args.push(format!("{}:{}:ro", path.display(), path.display()));
    }

    docker_args.push(DEFAULT_DOCKER_IMAGE.to_string());
    docker_args.push(opts.command.clone());
    docker_args.extend(opts.args.iter().cloned());

    let mut cmd = Command::new("docker");
    cmd.args(&docker_args);
    apply_common(&mut cmd, opts);
    cmd
}

/// Firejail 沙箱 (Linux)
fn build_firejail(opts: &ExecutorOptions, config: &SandboxConfig) -> Command {
    let mut firejail_args: Vec<String> =
        vec!["--quiet".to_string(), "--private-tmp".to_string()];

    if !config.network_enabled {
        firejail_args.push("--net=none".to_string());
    }

    firejail_args.extend(filesystem::firejail_path_args(config));
    firejail_args.push("--".to_string());
    firejail_args.push(opts.command.clone());
    firejail_args.extend(opts.args.iter().cloned());

    let mut cmd = Command::new("firejail");
    cmd.args(&firejail_args);
    apply_common(&mut cmd, opts);
    cmd
}

/// Seatbelt 沙箱 (macOS)
fn build_seatbelt(opts: &ExecutorOptions, config: &SandboxConfig) -> Command {
    // 构建 sandbox profile
    let mut profile = String::from("(version 1)\n(deny default)\n(allow process-exec)\n");
    for path in &config.read_only_paths {
        profile.push_str(&format!(
            "(allow file-read* (subpath \"{}\"))\n",
            path.display()
        ));
    }
    for path in &config.allowed_paths {
        profile.push_str(&format!(
            "(allow file-write* (subpath \"{}\"))\n",
            path.display()
        ));
    }
    if config.network_enabled {
        profile.push_str("(allow network*)\n");
    }

    let mut cmd = Command::new("sandbox-exec");
    cmd.arg("-p").arg(&profile).arg(&opts.command);
    cmd.args(&opts.args);
    apply_common(&mut cmd, opts);
    cmd
}

/// 应用通用选项：环境变量与工作目录
fn apply_common(cmd: &mut Command, opts: &ExecutorOptions) {
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }
    if let Some(ref dir) = opts.working_dir {
        cmd.current_dir(dir);
    }
}

// =============================================================================
// 子进程运行
// =============================================================================

/// 启动子进程并等待结束
///
/// 定时器与子进程退出事件竞争；超时发送 SIGKILL 并保留
/// 已捕获的部分输出。stdout/stderr 各自按上限硬截断。
async fn run_child(
    mut cmd: Command,
    timeout_ms: u64,
    max_output_size: usize,
) -> Result<RawOutput, SandboxError> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn(e.to_string()))?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(read_capped(stdout_pipe, max_output_size));
    let stderr_task = tokio::spawn(read_capped(stderr_pipe, max_output_size));

    let timeout = Duration::from_millis(timeout_ms);
    let (timed_out, exit_code) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (false, status.code().unwrap_or(-1)),
        Ok(Err(e)) => return Err(SandboxError::Io(e)),
        Err(_) => {
            // 超时：强制终止，随后收尸
            let _ = child.start_kill();
            let _ = child.wait().await;
            (true, -1)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(RawOutput {
        stdout,
        stderr,
        exit_code,
        timed_out,
    })
}

/// 读取管道并按上限截断
///
/// 超出上限后继续排空管道但不再保留，避免子进程因管道
/// 写满而阻塞。
async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut captured: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if captured.len() < cap {
                    let remaining = cap - captured.len();
                    captured.extend_from_slice(&buf[..n.min(remaining)]);
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

// =============================================================================
// 单元测试
// =============================================================================

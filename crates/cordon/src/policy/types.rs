//! 命令策略系统核心类型定义
//!
//! 本模块定义了命令策略系统的所有基础类型，包括：
//! - PolicyAction: 策略动作枚举
//! - RuleConstraints: 规则约束条件
//! - PolicyRule: 单条策略规则
//! - PolicyEvaluation: 策略评估结果
//! - PolicyError: 错误类型
//!
//! # Requirements
//!
//! - 1.1: 规则按优先级降序排列
//! - 1.2: 首个结构与约束均匹配的规则生效

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// PolicyAction 枚举
// =============================================================================

/// 策略动作
///
/// 定义命令评估后的四种处置方式：
/// - Allow: 直接放行
/// - Deny: 拒绝执行
/// - Ask: 交由调用方向用户确认
/// - Sandbox: 在沙箱中执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// 直接放行
    Allow,
    /// 拒绝执行
    Deny,
    /// 交由调用方确认（确认流程在本层之外）
    #[default]
    Ask,
    /// 在沙箱中执行
    Sandbox,
}

impl PolicyAction {
    /// 获取动作名称
    pub fn name(&self) -> &str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
            Self::Sandbox => "sandbox",
        }
    }
}

// =============================================================================
// RuleConstraints 结构体
// =============================================================================

/// 规则约束条件
///
/// 命令结构匹配之后的附加检查：
/// - `allowed_args`/`denied_args`: 对拼接后的参数串做正则匹配
/// - `allowed_dirs`/`denied_dirs`: 对工作目录做前缀匹配
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RuleConstraints {
    /// 允许的参数模式（正则列表；存在该列表且参数非空时必须命中其一）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_args: Option<Vec<String>>,
    /// 禁止的参数模式（正则列表；命中任意一条即不匹配）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_args: Option<Vec<String>>,
    /// 允许的工作目录（前缀匹配）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_dirs: Option<Vec<String>>,
    /// 禁止的工作目录（前缀匹配）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_dirs: Option<Vec<String>>,
    /// 最大超时时间（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_ms: Option<u64>,
    /// 是否必须在沙箱中执行
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_sandbox: Option<bool>,
    /// 是否允许网络访问
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_network: Option<bool>,
}

impl RuleConstraints {
    /// 创建空约束
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置允许的参数模式
    pub fn with_allowed_args(mut self, patterns: Vec<String>) -> Self {
        self.allowed_args = Some(patterns);
        self
    }

    /// 设置禁止的参数模式
    pub fn with_denied_args(mut self, patterns: Vec<String>) -> Self {
        self.denied_args = Some(patterns);
        self
    }

    /// 设置允许的工作目录
    pub fn with_allowed_dirs(mut self, dirs: Vec<String>) -> Self {
        self.allowed_dirs = Some(dirs);
        self
    }

    /// 设置禁止的工作目录
    pub fn with_denied_dirs(mut self, dirs: Vec<String>) -> Self {
        self.denied_dirs = Some(dirs);
        self
    }

    /// 设置必须沙箱执行
    pub fn with_require_sandbox(mut self, required: bool) -> Self {
        self.require_sandbox = Some(required);
        self
    }
}

// =============================================================================
// PolicyRule 结构体
// =============================================================================

/// 内置规则标签
pub const BUILTIN_TAG: &str = "builtin";

/// 单条策略规则
///
/// `pattern` 匹配命令名本身；`is_regex` 为 false 时按通配符模式
/// （`*`/`?`）处理。内置规则带有 `builtin` 标签，不可修改或删除。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// 规则 ID
    pub id: String,
    /// 规则名称
    pub name: String,
    /// 命令匹配模式
    pub pattern: String,
    /// 是否为正则表达式（否则按通配符处理）
    #[serde(default)]
    pub is_regex: bool,
    /// 匹配后的动作
    pub action: PolicyAction,
    /// 附加约束
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<RuleConstraints>,
    /// 优先级（数值越大越先检查）
    #[serde(default)]
    pub priority: i32,
    /// 是否启用
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 标签
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl PolicyRule {
    /// 创建新规则（生成随机 ID）
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, action: PolicyAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            pattern: pattern.into(),
            is_regex: false,
            action,
            constraints: None,
            priority: 0,
            enabled: true,
            tags: Vec::new(),
        }
    }

    /// 设置规则 ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 标记模式为正则表达式
    pub fn with_regex(mut self, is_regex: bool) -> Self {
        self.is_regex = is_regex;
        self
    }

    /// 设置约束
    pub fn with_constraints(mut self, constraints: RuleConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// 设置优先级
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 设置标签
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// 是否为内置规则
    pub fn is_builtin(&self) -> bool {
        self.tags.iter().any(|t| t == BUILTIN_TAG)
    }
}

// =============================================================================
// PolicyEvaluation 结构体
// =============================================================================

/// 策略评估结果
///
/// 每次 `evaluate` 调用都会生成一条评估结果，并在启用审计时
/// 追加到审计日志中。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    /// 被评估的命令
    pub command: String,
    /// 命令参数
    pub args: Vec<String>,
    /// 工作目录
    pub work_dir: PathBuf,
    /// 命中的规则（无命中时为 None）
    pub matched_rule: Option<PolicyRule>,
    /// 最终动作
    pub action: PolicyAction,
    /// 决策原因
    pub reason: String,
    /// 命中规则携带的约束
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<RuleConstraints>,
    /// Unix 时间戳（毫秒）
    pub timestamp: i64,
}

impl PolicyEvaluation {
    /// 创建新的评估结果
    pub fn new(
        command: impl Into<String>,
        args: &[String],
        work_dir: impl Into<PathBuf>,
        action: PolicyAction,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            args: args.to_vec(),
            work_dir: work_dir.into(),
            matched_rule: None,
            action,
            reason: reason.into(),
            constraints: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 附加命中的规则
    pub fn with_matched_rule(mut self, rule: PolicyRule) -> Self {
        self.constraints = rule.constraints.clone();
        self.matched_rule = Some(rule);
        self
    }

    /// 是否要求沙箱执行
    pub fn requires_sandbox(&self) -> bool {
        self.action == PolicyAction::Sandbox
            || self
                .constraints
                .as_ref()
                .and_then(|c| c.require_sandbox)
                .unwrap_or(false)
    }
}

// =============================================================================
// PolicyError 错误类型
// =============================================================================

/// 命令策略系统错误类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// 规则模式无效
    InvalidPattern { id: String, message: String },
    /// 规则不存在
    RuleNotFound(String),
    /// 内置规则不可变更
    BuiltinImmutable(String),
    /// 规则文件读取失败
    RulesFileRead(String),
    /// JSON 解析失败
    JsonParse(String),
    /// IO 错误
    Io(String),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPattern { id, message } => {
                write!(f, "Invalid pattern in rule '{}': {}", id, message)
            }
            Self::RuleNotFound(id) => write!(f, "Rule not found: {}", id),
            Self::BuiltinImmutable(id) => write!(f, "Built-in rule cannot be modified: {}", id),
            Self::RulesFileRead(msg) => write!(f, "Failed to read rules file: {}", msg),
            Self::JsonParse(msg) => write!(f, "Failed to parse JSON: {}", msg),
            Self::Io(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for PolicyError {}

impl From<std::io::Error> for PolicyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonParse(err.to_string())
    }
}

// =============================================================================
// 单元测试
// =============================================================================

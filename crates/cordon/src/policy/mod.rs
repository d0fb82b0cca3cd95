//! 命令策略模块
//!
//! 决定一条命令能否执行：危险模式扫描、优先级规则匹配、
//! 审计日志与规则文件持久化。

mod builtin;
mod dangerous;
mod engine;
mod pattern;
mod types;

pub use builtin::builtin_rules;
pub use dangerous::{DangerousPattern, DangerousScanner, Severity};
pub use engine::{default_rules_file, PolicyEngine, PolicyEngineConfig, PolicyObserver};
pub use pattern::{glob_to_regex, CompiledPattern};
pub use types::{
    PolicyAction, PolicyError, PolicyEvaluation, PolicyRule, RuleConstraints, BUILTIN_TAG,
};

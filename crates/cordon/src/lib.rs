//! Cordon - Command Authorization and Sandboxing
//!
//! This crate decides whether a host command requested by an autonomous
//! agent may run at all, and enforces OS-level isolation when it does.

// Allow dead code for now as some code is reserved for future use
#![allow(dead_code)]

pub mod policy;
pub mod sandbox;

pub use policy::{
    DangerousPattern, DangerousScanner, PolicyAction, PolicyEngine, PolicyEngineConfig,
    PolicyError, PolicyEvaluation, PolicyObserver, PolicyRule, RuleConstraints,
};
pub use sandbox::{
    Capabilities, CapabilityCache, ExecutionResult, ExecutorOptions, SandboxConfig,
    SandboxConfigManager, SandboxError, SandboxExecutor, SandboxMethod, SandboxPreset,
    SeccompProgram, SANDBOX_PRESETS,
};

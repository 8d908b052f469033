//! Permission escalation suggestions
//!
//! Turns access-denied task errors into a request for a higher permission
//! level. Process execution and native code access are never escalated
//! through this path.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Permission level a task runs under. Levels are cumulative: each level
/// grants everything the lower ones do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Minimal,
    Readonly,
    Filesystem,
    Network,
    Environment,
    ProcessExecution,
    NativeCode,
}

impl PermissionLevel {
    /// Levels that can never be granted by escalation
    pub fn is_security_critical(self) -> bool {
        matches!(self, Self::ProcessExecution | Self::NativeCode)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Readonly => "readonly",
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Environment => "environment",
            Self::ProcessExecution => "process_execution",
            Self::NativeCode => "native_code",
        }
    }
}

impl Default for PermissionLevel {
    fn default() -> Self {
        Self::Minimal
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of access a task was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    Net,
    Env,
    Run,
    Ffi,
}

impl Capability {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "net" => Some(Self::Net),
            "env" => Some(Self::Env),
            "run" => Some(Self::Run),
            "ffi" => Some(Self::Ffi),
            _ => None,
        }
    }

    /// Lowest level granting this capability
    pub fn required_level(self) -> PermissionLevel {
        match self {
            Self::Read => PermissionLevel::Readonly,
            Self::Write => PermissionLevel::Filesystem,
            Self::Net => PermissionLevel::Network,
            Self::Env => PermissionLevel::Environment,
            Self::Run => PermissionLevel::ProcessExecution,
            Self::Ffi => PermissionLevel::NativeCode,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Net => "net",
            Self::Env => "env",
            Self::Run => "run",
            Self::Ffi => "ffi",
        };
        f.write_str(s)
    }
}

/// An access denial recognized in an error message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDenial {
    pub capability: Capability,
    /// Resource named in the message, if any
    pub resource: Option<String>,
}

impl AccessDenial {
    pub fn is_security_critical(&self) -> bool {
        self.capability.required_level().is_security_critical()
    }
}

/// Suggested escalation for a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionEscalationRequest {
    pub current_level: PermissionLevel,
    pub requested_level: PermissionLevel,
    pub reason: String,
    pub detected_operation: Capability,
    pub resource: Option<String>,
    pub confidence: f64,
}

/// Confidence for a denial naming one concrete resource
pub const EXACT_RESOURCE_CONFIDENCE: f64 = 0.9;
/// Confidence for a denial without a resource
pub const UNSPECIFIED_RESOURCE_CONFIDENCE: f64 = 0.7;
/// Confidence for a denial naming a wildcard resource
pub const WILDCARD_RESOURCE_CONFIDENCE: f64 = 0.5;

lazy_static! {
    static ref REQUIRES_ACCESS: Regex =
        Regex::new(r#"(?i)requires\s+(read|write|net|env|run|ffi)\s+access(?:\s+to\s+"([^"]*)")?"#)
            .expect("valid regex");
    static ref ALLOW_FLAG: Regex =
        Regex::new(r"(?i)--allow-(read|write|net|env|run|ffi)(?:=(\S+))?").expect("valid regex");
    static ref GENERIC_DENIAL: Regex =
        Regex::new(r"(?i)(permission\s*denied|notcapable|access\s+denied|EACCES)")
            .expect("valid regex");
}

/// Recognizes the closed set of access-denial message shapes.
pub fn detect_access_denial(error_message: &str) -> Option<AccessDenial> {
    let captures = REQUIRES_ACCESS
        .captures(error_message)
        .or_else(|| ALLOW_FLAG.captures(error_message))?;

    let capability = Capability::parse(captures.get(1)?.as_str())?;
    let resource = captures
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .filter(|r| !r.is_empty());

    Some(AccessDenial {
        capability,
        resource,
    })
}

/// True when the message looks like any permission/capability failure,
/// including ones no escalation can fix.
pub fn is_permission_error(error_message: &str) -> bool {
    detect_access_denial(error_message).is_some() || GENERIC_DENIAL.is_match(error_message)
}

/// Suggests a higher permission level for an access-denied failure.
///
/// Returns `None` when the message is not a recognized denial, when the
/// required level is security critical, or when the current level already
/// covers it.
pub fn suggest_escalation(
    error_message: &str,
    current_level: PermissionLevel,
) -> Option<PermissionEscalationRequest> {
    let denial = detect_access_denial(error_message)?;
    let requested_level = denial.capability.required_level();

    if requested_level.is_security_critical() || requested_level <= current_level {
        return None;
    }

    let confidence = match denial.resource.as_deref() {
        Some(r) if r.contains('*') => WILDCARD_RESOURCE_CONFIDENCE,
        Some(_) => EXACT_RESOURCE_CONFIDENCE,
        None => UNSPECIFIED_RESOURCE_CONFIDENCE,
    };

    let reason = match &denial.resource {
        Some(resource) => format!(
            "Task requires {} access to \"{}\"",
            denial.capability, resource
        ),
        None => format!("Task requires {} access", denial.capability),
    };

    Some(PermissionEscalationRequest {
        current_level,
        requested_level,
        reason,
        detected_operation: denial.capability,
        resource: denial.resource,
        confidence,
    })
}

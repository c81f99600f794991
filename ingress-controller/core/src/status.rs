use crate::key::{ObjectKey, ObjectKind};
use std::fmt;

/// The description reported for any object with at least one error.
pub const ERRORS_SUMMARY: &str = "at least one error present, see Errors for details";

/// The validity of a root configuration object after a graph build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusResult {
    pub key: ObjectKey,
    /// The object generation the result was computed from.
    pub generation: Option<i64>,
    pub current: CurrentStatus,
    pub description: String,
    pub errors: Vec<SubCondition>,
    pub warnings: Vec<SubCondition>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CurrentStatus {
    Valid,
    Invalid,
    Orphaned,
}

/// One validation failure or warning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubCondition {
    pub condition_type: ConditionType,
    pub reason: String,
    pub message: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Spec,
    VirtualHost,
    RootNamespace,
    Include,
    Route,
    Service,
    Tls,
    Auth,
    TcpProxy,
    PathRewrite,
    ExtensionService,
    Orphaned,
}

/// Receives the statuses computed by each graph build.
pub trait StatusSink: Send + Sync {
    /// Replaces the recorded status of every object in `results`.
    fn overwrite(&self, results: Vec<StatusResult>);
}

// === impl StatusResult ===

impl StatusResult {
    pub fn new(key: ObjectKey, generation: Option<i64>) -> Self {
        let description = format!("Valid {}", key.kind);
        Self {
            key,
            generation,
            current: CurrentStatus::Valid,
            description,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Records an error, marking the object invalid.
    ///
    /// Errors with the same type and reason are folded into one condition.
    pub fn add_error(
        &mut self,
        condition_type: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        if self.current != CurrentStatus::Orphaned {
            self.current = CurrentStatus::Invalid;
            self.description = ERRORS_SUMMARY.to_string();
        }
        push_condition(&mut self.errors, condition_type, reason.into(), message.into());
    }

    pub fn add_warning(
        &mut self,
        condition_type: ConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        push_condition(&mut self.warnings, condition_type, reason.into(), message.into());
    }

    /// Marks an object that is not reachable from any root.
    pub fn set_orphaned(&mut self) {
        self.current = CurrentStatus::Orphaned;
        self.description = match self.key.kind {
            ObjectKind::HttpProxy => {
                "this HTTPProxy is not part of a delegation chain from a root HTTPProxy".to_string()
            }
            kind => format!("this {kind} is not referenced by any root object"),
        };
        push_condition(
            &mut self.errors,
            ConditionType::Orphaned,
            "Orphaned".to_string(),
            self.description.clone(),
        );
    }

    pub fn is_valid(&self) -> bool {
        self.current == CurrentStatus::Valid
    }

    /// Returns the first error of the given type.
    pub fn error(&self, condition_type: ConditionType) -> Option<&SubCondition> {
        self.errors
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn has_error(&self, condition_type: ConditionType, reason: &str) -> bool {
        self.errors
            .iter()
            .any(|c| c.condition_type == condition_type && c.reason == reason)
    }
}

fn push_condition(
    conditions: &mut Vec<SubCondition>,
    condition_type: ConditionType,
    reason: String,
    message: String,
) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type && c.reason == reason)
    {
        if !existing.message.split(", ").any(|m| m == message) {
            existing.message.push_str(", ");
            existing.message.push_str(&message);
        }
        return;
    }
    conditions.push(SubCondition {
        condition_type,
        reason,
        message,
    });
}

// === impl CurrentStatus ===

impl fmt::Display for CurrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Orphaned => "orphaned",
        })
    }
}

// === impl ConditionType ===

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Spec => "SpecError",
            Self::VirtualHost => "VirtualHostError",
            Self::RootNamespace => "RootNamespaceError",
            Self::Include => "IncludeError",
            Self::Route => "RouteError",
            Self::Service => "ServiceError",
            Self::Tls => "TLSError",
            Self::Auth => "AuthError",
            Self::TcpProxy => "TCPProxyError",
            Self::PathRewrite => "PathRewriteError",
            Self::ExtensionService => "ExtensionServiceError",
            Self::Orphaned => "Orphaned",
        })
    }
}

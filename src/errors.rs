use crate::model::NodeId;
use thiserror::Error;
use tracing::{error, warn};

/// Raised when the user dismisses a prompt or a cancellation signal fires.
/// Classified as benign: never logged as an error, never shown.
#[derive(Debug, Clone, Copy, Error)]
#[error("operation cancelled")]
pub struct UserCancelled;

/// Remote error codes the classifier recognizes. Anything the gateway
/// reports outside this set is treated as unexpected.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum RemoteCode {
    QuotaExceeded,
    AuthorizationFailed,
    AuthenticationExpired,
    ResourceNotFound,
    Throttled,
    Conflict,
    ProvisioningFailed,
}

impl RemoteCode {
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "QuotaExceeded" | "OperationNotAllowed" => Some(Self::QuotaExceeded),
            "AuthorizationFailed" | "Forbidden" => Some(Self::AuthorizationFailed),
            "ExpiredAuthenticationToken" | "AuthenticationFailed" => {
                Some(Self::AuthenticationExpired)
            }
            "ResourceNotFound" | "NotFound" | "ResourceGroupNotFound" => {
                Some(Self::ResourceNotFound)
            }
            "TooManyRequests" | "Throttled" => Some(Self::Throttled),
            "Conflict" | "AnotherOperationInProgress" => Some(Self::Conflict),
            "ProvisioningFailed" | "VMStartTimedOut" => Some(Self::ProvisioningFailed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuotaExceeded => "QuotaExceeded",
            Self::AuthorizationFailed => "AuthorizationFailed",
            Self::AuthenticationExpired => "AuthenticationExpired",
            Self::ResourceNotFound => "ResourceNotFound",
            Self::Throttled => "Throttled",
            Self::Conflict => "Conflict",
            Self::ProvisioningFailed => "ProvisioningFailed",
        }
    }

    /// Short hint appended to the user-visible notification.
    pub fn remediation(self) -> &'static str {
        match self {
            Self::QuotaExceeded => "request a quota increase or pick another region",
            Self::AuthorizationFailed => "check your role assignments for this subscription",
            Self::AuthenticationExpired => "sign in again to refresh credentials",
            Self::ResourceNotFound => "refresh the tree, the resource may have been deleted",
            Self::Throttled => "wait a moment and retry",
            Self::Conflict => "wait for the in-progress operation to finish",
            Self::ProvisioningFailed => "inspect the resource in the portal for details",
        }
    }
}

impl std::fmt::Display for RemoteCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failures surfaced by the remote resource API.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("{code}: {message}")]
    Remote { code: RemoteCode, message: String },

    #[error("remote error {code}: {message}")]
    UnrecognizedRemote { code: String, message: String },

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("malformed response: {message}")]
    Malformed { message: String },
}

impl GatewayError {
    /// Maps an error payload `{code, message}` to the typed taxonomy.
    pub fn from_remote(code: &str, message: impl Into<String>) -> Self {
        match RemoteCode::parse(code) {
            Some(code) => Self::Remote {
                code,
                message: message.into(),
            },
            None => Self::UnrecognizedRemote {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

/// A condition a handler recognizes and wants surfaced as a warning with
/// an optional hint, without the report-issue treatment.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct KnownFailure {
    pub message: String,
    pub remediation: Option<String>,
}

impl KnownFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            remediation: None,
        }
    }

    pub fn with_remediation(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            remediation: Some(remediation.into()),
        }
    }
}

/// A page fetch failed mid-pagination. The tree cache wraps the gateway
/// failure so the classifier can attach a retry hint; the node's cache
/// state is left untouched by the failed fetch.
#[derive(Debug, Error)]
#[error("failed to fetch children of {node}")]
pub struct FetchInconsistency {
    pub node: NodeId,
    #[source]
    pub source: GatewayError,
}

/// Outcome of classifying one raised failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    UserCancelled,
    Known {
        message: String,
        remediation: Option<String>,
    },
    Unexpected {
        message: String,
    },
}

impl Classification {
    /// Telemetry outcome tag for this classification.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::UserCancelled => "cancelled",
            Self::Known { .. } | Self::Unexpected { .. } => "error",
        }
    }

    pub fn is_benign(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }

    /// Logs the failure at the level the taxonomy prescribes. Cancellation
    /// is not an error and stays out of the log.
    pub fn log(&self, command_id: &str, detail: &anyhow::Error) {
        match self {
            Self::UserCancelled => {}
            Self::Known { message, .. } => {
                warn!(command = command_id, "{message}");
            }
            Self::Unexpected { .. } => {
                error!(command = command_id, "unexpected failure: {detail:#}");
            }
        }
    }
}

/// Walks the error chain and buckets the failure. Checked leaf-first so a
/// wrapped cancellation stays benign regardless of added context.
pub fn classify(error: &anyhow::Error) -> Classification {
    for cause in error.chain() {
        if cause.downcast_ref::<UserCancelled>().is_some() {
            return Classification::UserCancelled;
        }
        if let Some(known) = cause.downcast_ref::<KnownFailure>() {
            return Classification::Known {
                message: known.message.clone(),
                remediation: known.remediation.clone(),
            };
        }
        if let Some(fetch) = cause.downcast_ref::<FetchInconsistency>() {
            return Classification::Known {
                message: format!("{fetch}: {}", fetch.source),
                remediation: Some("retry to re-attempt the same page".to_string()),
            };
        }
        if let Some(gateway) = cause.downcast_ref::<GatewayError>() {
            if let GatewayError::Remote { code, message } = gateway {
                return Classification::Known {
                    message: format!("{code}: {message}"),
                    remediation: Some(code.remediation().to_string()),
                };
            }
        }
    }

    Classification::Unexpected {
        message: format!("{error:#}"),
    }
}

/// User-visible, non-blocking notification produced by the reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
    pub remediation: Option<String>,
    pub offer_report_issue: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Classification {
    /// Renders the classification into a notification, or `None` when the
    /// failure should stay silent.
    pub fn notification(&self, suppress_report_issue: bool) -> Option<Notification> {
        match self {
            Self::UserCancelled => None,
            Self::Known {
                message,
                remediation,
            } => Some(Notification {
                severity: Severity::Warning,
                message: message.clone(),
                remediation: remediation.clone(),
                offer_report_issue: false,
            }),
            Self::Unexpected { message } => Some(Notification {
                severity: Severity::Error,
                message: message.clone(),
                remediation: None,
                offer_report_issue: !suppress_report_issue,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Classification, FetchInconsistency, GatewayError, RemoteCode, Severity, UserCancelled,
        classify,
    };
    use crate::model::NodeId;
    use anyhow::Context;

    #[test]
    fn quota_exceeded_is_known_with_remediation() {
        let error = anyhow::Error::from(GatewayError::from_remote(
            "QuotaExceeded",
            "cores quota exhausted in westeurope",
        ));
        let classification = classify(&error);
        match &classification {
            Classification::Known {
                message,
                remediation,
            } => {
                assert!(message.contains("QuotaExceeded"));
                assert!(remediation.as_deref().unwrap().contains("quota"));
            }
            other => panic!("expected Known, got {other:?}"),
        }
        assert_eq!(classification.outcome(), "error");

        let notification = classification.notification(true).unwrap();
        assert_eq!(notification.severity, Severity::Warning);
        assert!(!notification.offer_report_issue);
    }

    #[test]
    fn cancellation_survives_added_context() {
        let error = anyhow::Error::from(UserCancelled)
            .context("prompting for confirmation")
            .context("deleting virtual machine");
        let classification = classify(&error);
        assert_eq!(classification, Classification::UserCancelled);
        assert_eq!(classification.outcome(), "cancelled");
        assert!(classification.notification(true).is_none());
    }

    #[test]
    fn fetch_inconsistency_is_known_with_retry_hint() {
        let error = anyhow::Error::from(FetchInconsistency {
            node: NodeId::new("/subscriptions/abc"),
            source: GatewayError::Transport {
                message: "connection reset".to_string(),
            },
        });
        match classify(&error) {
            Classification::Known { remediation, .. } => {
                assert!(remediation.unwrap().contains("retry"));
            }
            other => panic!("expected Known, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_remote_code_is_unexpected() {
        let error = anyhow::Error::from(GatewayError::from_remote(
            "SomethingNovel",
            "never seen before",
        ));
        let classification = classify(&error);
        assert!(matches!(classification, Classification::Unexpected { .. }));

        let shown = classification.notification(false).unwrap();
        assert_eq!(shown.severity, Severity::Error);
        assert!(shown.offer_report_issue);

        let suppressed = classification.notification(true).unwrap();
        assert!(!suppressed.offer_report_issue);
    }

    #[test]
    fn remote_code_aliases_parse() {
        assert_eq!(
            RemoteCode::parse("TooManyRequests"),
            Some(RemoteCode::Throttled)
        );
        assert_eq!(
            RemoteCode::parse("ExpiredAuthenticationToken"),
            Some(RemoteCode::AuthenticationExpired)
        );
        assert_eq!(RemoteCode::parse("Nope"), None);
    }
}

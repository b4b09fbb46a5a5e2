use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalidJson,
    ConfigInvalidValue,
    ConfigPlaintextSecret,

    ValidationMissingArgument,
    ValidationInvalidArgument,
    ValidationInvalidJson,

    TargetNotFound,
    RunNotFound,
    ReleaseNotFound,

    CredentialUnavailable,
    SshAuthFailed,
    SshUnreachable,
    SshTimeout,

    RemoteCommandFailed,
    RemoteCommandTimeout,
    RemoteCopyFailed,

    StepActionFailed,
    RunCancelled,

    ReleaseConflict,
    ReleaseNoPrior,
    ReleaseInvalidTransition,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::ConfigPlaintextSecret => "config.plaintext_secret",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationInvalidJson => "validation.invalid_json",

            ErrorCode::TargetNotFound => "target.not_found",
            ErrorCode::RunNotFound => "run.not_found",
            ErrorCode::ReleaseNotFound => "release.not_found",

            ErrorCode::CredentialUnavailable => "credential.unavailable",
            ErrorCode::SshAuthFailed => "ssh.auth_failed",
            ErrorCode::SshUnreachable => "ssh.unreachable",
            ErrorCode::SshTimeout => "ssh.timeout",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteCommandTimeout => "remote.command_timeout",
            ErrorCode::RemoteCopyFailed => "remote.copy_failed",

            ErrorCode::StepActionFailed => "step.action_failed",
            ErrorCode::RunCancelled => "run.cancelled",

            ErrorCode::ReleaseConflict => "release.conflict",
            ErrorCode::ReleaseNoPrior => "release.no_prior",
            ErrorCode::ReleaseInvalidTransition => "release.invalid_transition",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    pub const ALL: [ErrorCode; 24] = [
        ErrorCode::ConfigInvalidJson,
        ErrorCode::ConfigInvalidValue,
        ErrorCode::ConfigPlaintextSecret,
        ErrorCode::ValidationMissingArgument,
        ErrorCode::ValidationInvalidArgument,
        ErrorCode::ValidationInvalidJson,
        ErrorCode::TargetNotFound,
        ErrorCode::RunNotFound,
        ErrorCode::ReleaseNotFound,
        ErrorCode::CredentialUnavailable,
        ErrorCode::SshAuthFailed,
        ErrorCode::SshUnreachable,
        ErrorCode::SshTimeout,
        ErrorCode::RemoteCommandFailed,
        ErrorCode::RemoteCommandTimeout,
        ErrorCode::RemoteCopyFailed,
        ErrorCode::StepActionFailed,
        ErrorCode::RunCancelled,
        ErrorCode::ReleaseConflict,
        ErrorCode::ReleaseNoPrior,
        ErrorCode::ReleaseInvalidTransition,
        ErrorCode::InternalIoError,
        ErrorCode::InternalJsonError,
        ErrorCode::InternalUnexpected,
    ];

    /// Inverse of `as_str`, for codes read back from run records.
    pub fn from_code_str(code: &str) -> Option<ErrorCode> {
        Self::ALL.iter().copied().find(|c| c.as_str() == code)
    }

    /// Connection failures worth another attempt. Authentication never is,
    /// and neither is anything that happened after a command started.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCode::SshUnreachable | ErrorCode::SshTimeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportFailureDetails {
    pub target: TargetDetails,
    pub attempts: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub target: TargetDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepActionFailedDetails {
    pub step_id: String,
    pub step_index: usize,
    pub completed_steps: Vec<String>,
    pub cause_code: String,
    pub cause: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseConflictDetails {
    pub target_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ValidationMissingArgument,
            "Missing required argument",
            serde_json::json!({ "args": args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            id,
            tried,
        });
        Self::new(ErrorCode::ValidationInvalidArgument, problem, details)
    }

    pub fn validation_invalid_json(err: serde_json::Error, context: Option<String>) -> Self {
        let details = serde_json::json!({
            "error": err.to_string(),
            "context": context,
        });

        Self::new(ErrorCode::ValidationInvalidJson, "Invalid JSON", details)
    }

    pub fn target_not_found(id: impl Into<String>, suggestions: Vec<String>) -> Self {
        let err = Self::new(
            ErrorCode::TargetNotFound,
            "Target not found",
            to_details(NotFoundDetails {
                id: id.into(),
                suggestions: suggestions.clone(),
            }),
        );
        match suggestions.first() {
            Some(first) => err.with_hint(format!("Did you mean '{}'?", first)),
            None => err.with_hint("Run 'rollout target list' to see registered targets"),
        }
    }

    pub fn run_not_found(id: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::RunNotFound,
            "Deployment run not found",
            to_details(NotFoundDetails {
                id: id.into(),
                suggestions: Vec::new(),
            }),
        )
        .with_hint("Run 'rollout runs list' to see recorded runs")
    }

    pub fn release_not_found(target_id: &str, revision: &str) -> Self {
        Self::new(
            ErrorCode::ReleaseNotFound,
            format!("Release '{}' not found on target '{}'", revision, target_id),
            serde_json::json!({ "targetId": target_id, "revision": revision }),
        )
        .with_hint(format!("Run 'rollout release list {}'", target_id))
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in configuration",
            serde_json::json!({ "path": path.into(), "error": err.to_string() }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.into(),
        });

        Self::new(
            ErrorCode::ConfigInvalidValue,
            "Invalid configuration value",
            details,
        )
    }

    /// The value itself is never echoed back.
    pub fn config_plaintext_secret(key: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ConfigPlaintextSecret,
            "Plaintext secrets are not accepted in configuration",
            serde_json::json!({ "key": key.into() }),
        )
        .with_hint("Use an identity file, ssh-agent, or a keychain credential reference")
        .with_hint("Run 'rollout target credential <id> --identity-file <path>'")
    }

    pub fn credential_unavailable(target_id: impl Into<String>, problem: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::CredentialUnavailable,
            "Credential could not be resolved",
            serde_json::json!({ "targetId": target_id.into(), "problem": problem.into() }),
        )
    }

    pub fn ssh_auth_failed(target: TargetDetails, stderr: impl Into<String>) -> Self {
        let mut err = Self::new(
            ErrorCode::SshAuthFailed,
            "SSH authentication failed",
            to_details(TransportFailureDetails {
                target,
                attempts: 1,
                stderr: stderr.into(),
            }),
        )
        .with_hint("Check the target credential with 'rollout target show <id>'");
        err.retryable = Some(false);
        err
    }

    pub fn ssh_unreachable(target: TargetDetails, attempts: u32, stderr: impl Into<String>) -> Self {
        let mut err = Self::new(
            ErrorCode::SshUnreachable,
            "Target is unreachable",
            to_details(TransportFailureDetails {
                target,
                attempts,
                stderr: stderr.into(),
            }),
        );
        err.retryable = Some(true);
        err
    }

    pub fn ssh_timeout(target: TargetDetails, attempts: u32) -> Self {
        let mut err = Self::new(
            ErrorCode::SshTimeout,
            "Timed out connecting to target",
            to_details(TransportFailureDetails {
                target,
                attempts,
                stderr: String::new(),
            }),
        );
        err.retryable = Some(true);
        err
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        Self::new(
            ErrorCode::RemoteCommandFailed,
            "Remote command failed",
            to_details(details),
        )
    }

    pub fn remote_command_timeout(command: &str, timeout_secs: u64, target: TargetDetails) -> Self {
        let mut err = Self::new(
            ErrorCode::RemoteCommandTimeout,
            format!("Remote command exceeded {}s timeout", timeout_secs),
            serde_json::json!({
                "command": command,
                "timeoutSecs": timeout_secs,
                "target": target,
            }),
        );
        err.retryable = Some(false);
        err
    }

    pub fn remote_copy_failed(local_path: &str, remote_path: &str, stderr: &str) -> Self {
        Self::new(
            ErrorCode::RemoteCopyFailed,
            "File transfer failed",
            serde_json::json!({
                "localPath": local_path,
                "remotePath": remote_path,
                "stderr": stderr,
            }),
        )
    }

    /// Wraps the underlying failure with the step that produced it.
    pub fn step_action_failed(
        step_id: &str,
        step_index: usize,
        completed_steps: Vec<String>,
        cause: &Error,
    ) -> Self {
        let details = to_details(StepActionFailedDetails {
            step_id: step_id.to_string(),
            step_index,
            completed_steps,
            cause_code: cause.code.as_str().to_string(),
            cause: cause.message.clone(),
        });
        let mut err = Self::new(
            ErrorCode::StepActionFailed,
            format!("Step '{}' failed: {}", step_id, cause.message),
            details,
        );
        err.hints = cause.hints.clone();
        err
    }

    pub fn run_cancelled(target_id: &str, completed_steps: Vec<String>) -> Self {
        let mut err = Self::new(
            ErrorCode::RunCancelled,
            format!("Deployment to '{}' was cancelled before activation", target_id),
            serde_json::json!({
                "targetId": target_id,
                "completedSteps": completed_steps,
            }),
        );
        err.retryable = Some(true);
        err
    }

    pub fn release_conflict(target_id: impl Into<String>, holder: Option<String>) -> Self {
        let target_id = target_id.into();
        let mut err = Self::new(
            ErrorCode::ReleaseConflict,
            format!("Another activation is in flight for target '{}'", target_id),
            to_details(ReleaseConflictDetails {
                target_id: target_id.clone(),
                holder,
            }),
        )
        .with_hint("Wait for the running deployment to finish, or raise locks.waitSecs");
        err.retryable = Some(true);
        err
    }

    pub fn release_no_prior(target_id: impl Into<String>) -> Self {
        let target_id = target_id.into();
        Self::new(
            ErrorCode::ReleaseNoPrior,
            format!("No prior release to roll back to on target '{}'", target_id),
            serde_json::json!({ "targetId": target_id }),
        )
    }

    pub fn release_invalid_transition(from: &str, to: &str) -> Self {
        Self::new(
            ErrorCode::ReleaseInvalidTransition,
            format!("Invalid state transition: {} -> {}", from, to),
            serde_json::json!({ "from": from, "to": to }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalIoErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            serde_json::json!({ "error": error.into(), "context": context }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_strings() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code_str(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::from_code_str("nope"), None);
    }

    #[test]
    fn auth_failure_is_not_retryable() {
        let err = Error::ssh_auth_failed(TargetDetails::default(), "Permission denied (publickey)");
        assert_eq!(err.retryable, Some(false));
        assert!(!err.is_transient());
    }

    #[test]
    fn unreachable_and_timeout_are_transient() {
        assert!(Error::ssh_unreachable(TargetDetails::default(), 3, "").is_transient());
        assert!(Error::ssh_timeout(TargetDetails::default(), 3).is_transient());
    }

    #[test]
    fn command_timeout_is_never_retried() {
        let err = Error::remote_command_timeout("make", 5, TargetDetails::default());
        assert!(!err.is_transient());
        assert_eq!(err.retryable, Some(false));
    }

    #[test]
    fn step_failure_keeps_cause_code_and_completed_steps() {
        let cause = Error::remote_command_failed(RemoteCommandFailedDetails {
            command: "composer install".to_string(),
            exit_code: 2,
            stdout: String::new(),
            stderr: "boom".to_string(),
            target: TargetDetails::default(),
        });
        let err = Error::step_action_failed("deps", 1, vec!["fetch".to_string()], &cause);

        assert_eq!(err.code, ErrorCode::StepActionFailed);
        assert_eq!(err.details["causeCode"], "remote.command_failed");
        assert_eq!(err.details["completedSteps"][0], "fetch");
        assert_eq!(err.details["stepIndex"], 1);
    }

    #[test]
    fn not_found_suggests_closest_id() {
        let err = Error::target_not_found("prdo", vec!["prod".to_string()]);
        assert_eq!(err.hints[0].message, "Did you mean 'prod'?");
    }
}

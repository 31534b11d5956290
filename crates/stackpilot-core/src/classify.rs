//! Engine output classification
//!
//! String heuristics over the engine's human-readable output. They track the
//! engine's message wording, so every rule lives here and is covered by the
//! tests at the bottom of this file.

use crate::progress::{Channel, ProgressEvent, ResourceAction};
use regex::Regex;
use std::sync::OnceLock;

fn resource_action_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<resource>[A-Za-z0-9_\-\.\[\]\x22]+?)(?::| is) (?P<action>Creating|Modifying|Destroying)\.\.\.")
            .expect("resource action pattern is valid")
    })
}

/// Extract `(resource, action)` from a line like
/// `module.app.google_service_account.tvm: Creating...`
pub fn parse_resource_action(line: &str) -> Option<(String, ResourceAction)> {
    let caps = resource_action_pattern().captures(line.trim())?;
    let action = match &caps["action"] {
        "Creating" => ResourceAction::Creating,
        "Modifying" => ResourceAction::Modifying,
        _ => ResourceAction::Destroying,
    };
    Some((caps["resource"].to_string(), action))
}

/// Turn an engine stdout line into a progress event
pub fn classify_stdout_line(line: &str) -> ProgressEvent {
    match parse_resource_action(line) {
        Some((resource, action)) => ProgressEvent::ResourceAction { resource, action },
        None => ProgressEvent::stream(Channel::Stdout, line),
    }
}

/// Engine log chatter on stderr that must not be mistaken for a failure
pub fn is_suppressed_stderr(line: &str) -> bool {
    line.contains("[INFO]") || line.contains("[DEBUG]")
}

/// Whether a stderr line reads like an error
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("error:") || lower.contains("failed")
}

/// Failure message for a non-zero exit: the error-like stderr lines, or the
/// exit code when none of them look like an error
pub fn synthesize_failure(stderr_lines: &[String], exit_code: Option<i32>) -> String {
    let errors: Vec<&str> = stderr_lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| is_error_line(l))
        .collect();
    if !errors.is_empty() {
        return errors.join("\n");
    }
    match exit_code {
        Some(code) => format!("exit code {}", code),
        None => "process terminated by signal".to_string(),
    }
}

/// Whether an error reports a resource that is already provisioned
pub fn is_already_exists(text: &str) -> bool {
    text.to_lowercase().contains("already exists")
}

/// Failures caused by the provider backend rather than the configuration
const TRANSIENT_ERRORS: &[&str] = &[
    "error waiting for creating",
    "googleapi: error 503",
    "googleapi: error 429",
    "timeout while waiting",
    "connection reset by peer",
];

/// Whether an error is likely to clear up on its own, given some time
pub fn is_transient_error(text: &str) -> bool {
    let text = text.to_lowercase();
    TRANSIENT_ERRORS.iter().any(|pattern| text.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_action_colon_form() {
        let (resource, action) =
            parse_resource_action("module.anava.google_service_account.tvm: Creating...").unwrap();
        assert_eq!(resource, "module.anava.google_service_account.tvm");
        assert_eq!(action, ResourceAction::Creating);
    }

    #[test]
    fn test_resource_action_is_form() {
        let (resource, action) =
            parse_resource_action("google_api_gateway_gateway.gateway is Destroying...").unwrap();
        assert_eq!(resource, "google_api_gateway_gateway.gateway");
        assert_eq!(action, ResourceAction::Destroying);
    }

    #[test]
    fn test_resource_action_indexed_address() {
        let (resource, action) = parse_resource_action(
            r#"google_project_service.apis["run.googleapis.com"]: Modifying... [id=demo/run.googleapis.com]"#,
        )
        .unwrap();
        assert_eq!(resource, r#"google_project_service.apis["run.googleapis.com"]"#);
        assert_eq!(action, ResourceAction::Modifying);
    }

    #[test]
    fn test_other_lines_are_raw_stream() {
        assert!(parse_resource_action("google_service_account.tvm: Still creating... [10s elapsed]").is_none());
        assert!(parse_resource_action("Apply complete! Resources: 3 added").is_none());
        assert_eq!(
            classify_stdout_line("Plan: 3 to add"),
            ProgressEvent::stream(Channel::Stdout, "Plan: 3 to add")
        );
    }

    #[test]
    fn test_suppressed_stderr() {
        assert!(is_suppressed_stderr("2024-01-01T00:00:00 [INFO] provider started"));
        assert!(is_suppressed_stderr("[DEBUG] failed to read cache"));
        assert!(!is_suppressed_stderr("Error: boom"));
    }

    #[test]
    fn test_error_lines_case_insensitive() {
        assert!(is_error_line("Error: creating service account"));
        assert!(is_error_line("ERROR: quota"));
        assert!(is_error_line("request FAILED"));
        assert!(!is_error_line("│ with module.anava.google_service_account.tvm,"));
    }

    #[test]
    fn test_synthesize_failure() {
        let lines = vec![
            "│ Error: Error creating Gateway: googleapi: Error 409: already exists".to_string(),
            "│   on main.tf line 3".to_string(),
            "deployment failed".to_string(),
        ];
        assert_eq!(
            synthesize_failure(&lines, Some(1)),
            "│ Error: Error creating Gateway: googleapi: Error 409: already exists\ndeployment failed"
        );
        assert_eq!(synthesize_failure(&["noise".to_string()], Some(2)), "exit code 2");
        assert_eq!(synthesize_failure(&[], None), "process terminated by signal");
    }

    #[test]
    fn test_already_exists() {
        assert!(is_already_exists("Error 409: Resource Already Exists"));
        assert!(!is_already_exists("Error 403: permission denied"));
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(
            "Error: Error creating Api: googleapi: Error 503: The service is currently unavailable."
        ));
        assert!(is_transient_error("Error: googleapi: Error 429: Quota exceeded for quota metric"));
        assert!(is_transient_error("Error: Error waiting for Creating Gateway: timeout"));
        assert!(is_transient_error("read tcp 10.0.0.1:443: connection reset by peer"));
        assert!(!is_transient_error("Error: googleapi: Error 403: Permission denied on resource"));
        assert!(!is_transient_error("Error: Invalid provider configuration"));
    }
}

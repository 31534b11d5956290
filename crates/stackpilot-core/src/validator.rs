//! Output validation
//!
//! Checks an `OutputSet` against the fixed table of outputs every deployment
//! must produce. Validation is pure: it never touches the input and returns a
//! fresh `ValidationResult` each call.

use crate::outputs::OutputSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_GATEWAY_URL: &str = "api_gateway_url";
pub const API_KEY: &str = "api_key";
pub const FIREBASE_CONFIG: &str = "firebase_config";
pub const WORKLOAD_IDENTITY_PROVIDER: &str = "workload_identity_provider";
pub const DEVICE_AUTH_SERVICE_ACCOUNT: &str = "device_auth_service_account";
pub const TVM_SERVICE_ACCOUNT: &str = "tvm_service_account";
pub const VERTEX_AI_SERVICE_ACCOUNT: &str = "vertex_ai_service_account";

/// Domain fragments a healthy gateway hostname contains
const GATEWAY_DOMAINS: [&str; 2] = ["gateway.dev", "apigateway"];

/// Shape of a required output value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Url,
    Secret,
    Object,
    ResourcePath,
    Email,
}

/// One row of the required-output table
#[derive(Debug, Clone, Copy)]
pub struct RequiredField {
    pub name: &'static str,
    pub kind: FieldKind,
    pub validate: fn(&Value) -> bool,
    pub error_message: &'static str,
}

pub const REQUIRED_FIELDS: &[RequiredField] = &[
    RequiredField {
        name: API_GATEWAY_URL,
        kind: FieldKind::Url,
        validate: is_https_url,
        error_message: "API Gateway URL must be an https:// URL with a hostname",
    },
    RequiredField {
        name: API_KEY,
        kind: FieldKind::Secret,
        validate: is_api_key,
        error_message: "API key must be a non-empty token without whitespace",
    },
    RequiredField {
        name: FIREBASE_CONFIG,
        kind: FieldKind::Object,
        validate: is_firebase_config,
        error_message: "Firebase config must be an object with apiKey and projectId",
    },
    RequiredField {
        name: WORKLOAD_IDENTITY_PROVIDER,
        kind: FieldKind::ResourcePath,
        validate: is_workload_identity_path,
        error_message: "Workload identity provider must be a full projects/.../providers/... path",
    },
    RequiredField {
        name: DEVICE_AUTH_SERVICE_ACCOUNT,
        kind: FieldKind::Email,
        validate: is_service_account_email,
        error_message: "Device auth service account must be an iam.gserviceaccount.com email",
    },
    RequiredField {
        name: TVM_SERVICE_ACCOUNT,
        kind: FieldKind::Email,
        validate: is_service_account_email,
        error_message: "TVM service account must be an iam.gserviceaccount.com email",
    },
    RequiredField {
        name: VERTEX_AI_SERVICE_ACCOUNT,
        kind: FieldKind::Email,
        validate: is_service_account_email,
        error_message: "Vertex AI service account must be an iam.gserviceaccount.com email",
    },
];

fn is_https_url(value: &Value) -> bool {
    value
        .as_str()
        .and_then(|s| s.strip_prefix("https://"))
        .is_some_and(|host| !host.is_empty() && !host.contains(char::is_whitespace))
}

fn is_api_key(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| !s.is_empty() && !s.contains(char::is_whitespace))
}

fn is_firebase_config(value: &Value) -> bool {
    let has_keys = |v: &Value| {
        ["apiKey", "projectId"]
            .iter()
            .all(|k| v.get(k).and_then(Value::as_str).is_some_and(|s| !s.is_empty()))
    };
    match value {
        Value::Object(_) => has_keys(value),
        // Some module versions emit the config as a JSON string
        Value::String(s) => serde_json::from_str::<Value>(s).is_ok_and(|v| has_keys(&v)),
        _ => false,
    }
}

fn is_workload_identity_path(value: &Value) -> bool {
    value.as_str().is_some_and(|s| {
        s.starts_with("projects/")
            && s.contains("/workloadIdentityPools/")
            && s.contains("/providers/")
    })
}

fn is_service_account_email(value: &Value) -> bool {
    value.as_str().is_some_and(|s| {
        s.split_once('@')
            .is_some_and(|(name, domain)| !name.is_empty() && domain.ends_with(".iam.gserviceaccount.com"))
    })
}

/// Outcome of validating an output set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub missing_fields: Vec<String>,
    pub invalid_fields: Vec<String>,
}

impl ValidationResult {
    /// Required fields that are missing or invalid, in table order
    pub fn failed_fields(&self) -> impl Iterator<Item = &str> {
        REQUIRED_FIELDS
            .iter()
            .map(|f| f.name)
            .filter(|name| {
                self.missing_fields.iter().any(|m| m == name)
                    || self.invalid_fields.iter().any(|i| i == name)
            })
    }
}

pub fn validate_outputs(outputs: &OutputSet) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut missing_fields = Vec::new();
    let mut invalid_fields = Vec::new();

    for field in REQUIRED_FIELDS {
        let Some(output) = outputs.get(field.name).filter(|_| outputs.has_value(field.name))
        else {
            missing_fields.push(field.name.to_string());
            errors.push(format!("Missing required output: {}", field.name));
            continue;
        };

        if !(field.validate)(output.resolved()) {
            invalid_fields.push(field.name.to_string());
            errors.push(format!("{}: {}", field.name, field.error_message));
        }
    }

    if let Some(url) = outputs.get(API_GATEWAY_URL).and_then(|v| v.as_str()) {
        if !GATEWAY_DOMAINS.iter().any(|d| url.contains(d)) {
            warnings.push(format!(
                "API Gateway URL '{}' does not look like a gateway hostname (expected {})",
                url,
                GATEWAY_DOMAINS.join(" or ")
            ));
        }
    }

    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        missing_fields,
        invalid_fields,
    }
}

/// Render a validation result as a multi-section text report
pub fn format_validation_report(result: &ValidationResult) -> String {
    let mut out = String::new();
    out.push_str("Output validation: ");
    out.push_str(if result.is_valid { "PASSED" } else { "FAILED" });
    out.push('\n');

    let sections: [(&str, &[String]); 3] = [
        ("Missing fields", &result.missing_fields),
        ("Errors", &result.errors),
        ("Warnings", &result.warnings),
    ];
    for (title, items) in sections {
        if items.is_empty() {
            continue;
        }
        out.push('\n');
        out.push_str(&format!("{} ({}):\n", title, items.len()));
        for item in items {
            out.push_str(&format!("  - {}\n", item));
        }
    }
    out
}

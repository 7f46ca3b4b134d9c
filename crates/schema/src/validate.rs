//! JSON Schema validation of `x-komp` maps.
//!
//! Only the first error is reported. A missing required field is the most
//! actionable, then any plain error, then composite (`anyOf`/`oneOf`) failures
//! whose messages say little about the cause.

use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, JSONSchema, ValidationError};
use komp_core::Extensions;
use once_cell::sync::Lazy;
use serde_json::{json, Value as Json};

use crate::SchemaError;

const QUANTITY: &str = r"^[+-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)([KMGTPE]i|[numkMGTPE]|[eE][+-]?[0-9]+)?$";
const DURATION: &str = r"^([0-9]+(\.[0-9]+)?(ns|us|µs|ms|s|m|h))+$";

fn probe_schema() -> Json {
    let duration = json!({ "type": "string", "pattern": DURATION });
    let port = json!({ "type": "integer", "minimum": 1, "maximum": 65535 });
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["type"],
        "properties": {
            "type": { "enum": ["exec", "http", "tcp", "none"] },
            "exec": {
                "type": "object",
                "additionalProperties": false,
                "required": ["command"],
                "properties": { "command": { "type": "array", "items": { "type": "string" }, "minItems": 1 } }
            },
            "http": {
                "type": "object",
                "additionalProperties": false,
                "required": ["port"],
                "properties": { "port": port, "path": { "type": "string" } }
            },
            "tcp": {
                "type": "object",
                "additionalProperties": false,
                "required": ["port"],
                "properties": { "port": port }
            },
            "initialDelay": duration,
            "period": duration,
            "timeout": duration,
            "failureThreshold": { "type": "integer", "minimum": 1 },
            "successThreshold": { "type": "integer", "minimum": 1 }
        },
        "anyOf": [
            { "properties": { "type": { "const": "exec" } }, "required": ["exec"] },
            { "properties": { "type": { "const": "http" } }, "required": ["http"] },
            { "properties": { "type": { "const": "tcp" } }, "required": ["tcp"] },
            { "properties": { "type": { "const": "none" } } }
        ]
    })
}

static SERVICE_SCHEMA_JSON: Lazy<Json> = Lazy::new(|| {
    let quantity = json!({ "type": "string", "pattern": QUANTITY });
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "workload": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "type": { "enum": ["Deployment", "StatefulSet", "DaemonSet", "Job"] },
                    "replicas": { "type": "integer", "minimum": 0 },
                    "restartPolicy": { "enum": ["Always", "OnFailure", "Never"] },
                    "serviceAccountName": { "type": "string" },
                    "rollingUpdateMaxSurge": {
                        "oneOf": [
                            { "type": "integer", "minimum": 0 },
                            { "type": "string", "pattern": "^[0-9]+%$" }
                        ]
                    },
                    "imagePull": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "policy": { "enum": ["IfNotPresent", "Always", "Never"] },
                            "secret": { "type": "string" }
                        }
                    },
                    "livenessProbe": probe_schema(),
                    "readinessProbe": probe_schema(),
                    "resource": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "cpu": quantity, "maxCpu": quantity,
                            "memory": quantity, "maxMemory": quantity,
                            "storage": quantity, "maxStorage": quantity
                        }
                    },
                    "autoscale": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "maxReplicas": { "type": "integer", "minimum": 0 },
                            "cpuThreshold": { "type": "integer", "minimum": 0, "maximum": 100 },
                            "memThreshold": { "type": "integer", "minimum": 0, "maximum": 100 }
                        }
                    }
                }
            },
            "service": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "type": { "enum": ["None", "Headless", "ClusterIP", "NodePort", "LoadBalancer"] },
                    "nodePort": { "type": "integer", "minimum": 1, "maximum": 65535 },
                    "expose": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "domain": { "type": "string" },
                            "tlsSecret": { "type": "string" },
                            "ingressAnnotations": { "type": "object", "additionalProperties": { "type": "string" } }
                        }
                    }
                }
            }
        }
    })
});

static VOLUME_SCHEMA_JSON: Lazy<Json> = Lazy::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "size": { "type": "string", "pattern": QUANTITY },
            "storageClass": { "type": "string", "minLength": 1 },
            "selector": { "type": "string" }
        }
    })
});

fn compile(schema: &'static Json) -> Result<JSONSchema, String> {
    JSONSchema::options().with_draft(Draft::Draft7).compile(schema).map_err(|e| e.to_string())
}

static SERVICE_SCHEMA: Lazy<Result<JSONSchema, String>> = Lazy::new(|| compile(&SERVICE_SCHEMA_JSON));
static VOLUME_SCHEMA: Lazy<Result<JSONSchema, String>> = Lazy::new(|| compile(&VOLUME_SCHEMA_JSON));

fn is_composite(kind: &ValidationErrorKind) -> bool {
    matches!(
        kind,
        ValidationErrorKind::AnyOf { .. } | ValidationErrorKind::OneOfNotValid { .. } | ValidationErrorKind::OneOfMultipleValid { .. }
    )
}

/// `/workload/livenessProbe/type` -> `workload.livenessProbe.type`
fn dotted(pointer: &str) -> String {
    pointer.trim_start_matches('/').replace('/', ".")
}

fn pick<'a>(errors: Vec<ValidationError<'a>>) -> Option<ValidationError<'a>> {
    let required = errors.iter().position(|e| matches!(e.kind, ValidationErrorKind::Required { .. }));
    let plain = errors.iter().position(|e| !is_composite(&e.kind));
    let idx = required.or(plain).unwrap_or(0);
    errors.into_iter().nth(idx)
}

fn check(schema: &Lazy<Result<JSONSchema, String>>, ext: &Extensions) -> Result<(), SchemaError> {
    let compiled = match Lazy::force(schema) {
        Ok(c) => c,
        Err(e) => return Err(SchemaError::Invalid { path: String::new(), message: format!("schema failed to compile: {}", e) }),
    };
    let instance = Json::Object(ext.clone());
    let outcome = match compiled.validate(&instance) {
        Ok(()) => Ok(()),
        Err(errors) => match pick(errors.collect()) {
            Some(err) => Err(SchemaError::Invalid { path: dotted(&err.instance_path.to_string()), message: err.to_string() }),
            None => Ok(()),
        },
    };
    if let Err(e) = &outcome {
        tracing::debug!(error = %e, "extension rejected");
    }
    outcome
}

/// Validate a service's `x-komp` map.
pub fn validate_service(ext: &Extensions) -> Result<(), SchemaError> { check(&SERVICE_SCHEMA, ext) }

/// Validate a volume's `x-komp` map.
pub fn validate_volume(ext: &Extensions) -> Result<(), SchemaError> { check(&VOLUME_SCHEMA, ext) }

use jsonschema::Validator;
use serde_json::{json, Value};

/// JSON Schema every catalog document must satisfy before it is deserialized.
pub fn catalog_schema() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "required": [
                "id", "title", "group", "commandTemplate",
                "timeout", "privilegeLevel", "riskClass"
            ],
            "properties": {
                "id": { "type": "string", "minLength": 1 },
                "title": { "type": "string", "minLength": 1 },
                "description": { "type": "string" },
                "group": { "type": "string", "minLength": 1 },
                "commandTemplate": { "type": "string" },
                "workingDirectory": { "type": ["string", "null"] },
                "timeout": { "type": "integer", "minimum": 1 },
                "privilegeLevel": {
                    "enum": ["user", "elevated", "automation", "fullDiskAccess"]
                },
                "riskClass": { "enum": ["safe", "moderate", "destructive"] },
                "outputParser": {
                    "enum": [
                        "text", "json", "regex", "table",
                        "memoryPressure", "diskUsage", "processTable"
                    ]
                },
                "parserPattern": { "type": ["string", "null"] },
                "preflightChecks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["type", "target", "failureMessage"],
                        "properties": {
                            "type": {
                                "enum": [
                                    "pathExists", "pathWritable", "appRunning",
                                    "appNotRunning", "diskSpaceAvailable",
                                    "integrityProtectionStatus", "automationPermission"
                                ]
                            },
                            "target": { "type": "string" },
                            "failureMessage": { "type": "string" }
                        }
                    }
                },
                "requiredPaths": { "type": "array", "items": { "type": "string" } },
                "requiredApps": { "type": "array", "items": { "type": "string" } }
            }
        }
    })
}

/// Validate a JSON value against a JSON Schema.
/// Returns Ok(()) if valid, Err with a human-readable error message if invalid.
pub fn validate_document(schema: &Value, document: &Value) -> Result<(), String> {
    let validator = Validator::new(schema)
        .map_err(|e| format!("Invalid schema: {}", e))?;

    validator
        .validate(document)
        .map_err(|e| e.to_string())
}

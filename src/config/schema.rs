use serde_json::{json, Value};
use std::sync::LazyLock;

pub static CONFIG_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "sandbox": {
                "type": "object",
                "properties": {
                    "backend": { "type": "string", "enum": ["docker", "local"] },
                    "image_template": { "type": "string" },
                    "workdir": { "type": "string" },
                    "patch_path": { "type": "string" },
                    "max_sandboxes": { "type": "integer", "minimum": 1 },
                    "local_root": { "type": "string" },
                    "scratch_dir": { "type": "string" },
                    "keep_sandboxes": { "type": "boolean" }
                }
            },
            "run": {
                "type": "object",
                "properties": {
                    "max_workers": { "type": "integer", "minimum": 1 },
                    "force_rerun": { "type": "boolean" },
                    "cancel_in_flight": { "type": "boolean" },
                    "job_timeout_secs": { "type": "integer", "minimum": 1 },
                    "max_requeues": { "type": "integer", "minimum": 0 },
                    "reset_attempts": { "type": "integer", "minimum": 1 },
                    "skip_functional_when_vulnerable": { "type": "boolean" }
                }
            },
            "timeouts": {
                "type": "object",
                "properties": {
                    "reset_secs": { "type": "integer", "minimum": 1 },
                    "apply_secs": { "type": "integer", "minimum": 1 },
                    "check_secs": { "type": "integer", "minimum": 1 }
                }
            },
            "capture": {
                "type": "object",
                "properties": {
                    "max_output_bytes": { "type": "integer", "minimum": 1 }
                }
            },
            "patching": {
                "type": "object",
                "properties": {
                    "fallback": { "type": "boolean" },
                    "fuzzy_threshold": { "type": "number", "exclusiveMinimum": 0, "maximum": 1 }
                }
            },
            "checks": {
                "type": "object",
                "properties": {
                    "reset": { "type": "string" },
                    "exploit": { "type": "string" },
                    "exploit_command_polarity": { "type": "string", "enum": ["nonzero_blocks", "zero_blocks"] },
                    "functional": { "type": ["string", "null"] },
                    "exploit_polarity": { "type": "string", "enum": ["nonzero_blocks", "zero_blocks"] }
                }
            },
            "store": {
                "type": "object",
                "properties": {
                    "backend": { "type": "string", "enum": ["jsonl", "sqlite"] }
                }
            },
            "output": {
                "type": "object",
                "properties": {
                    "directory": { "type": "string" }
                }
            }
        }
    })
});

use crate::error::{Result, SpecflowError};
use serde_json::{Map, Value};
use std::fmt;

pub const CURRENT_SCHEMA_VERSION: SchemaVersion = SchemaVersion { major: 2, minor: 0 };

/// `major.minor` version of the state document. A bare `"2"` reads as `2.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().splitn(2, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(m) => m.parse().ok()?,
            None => 0,
        };
        Some(Self { major, minor })
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Bring a raw state document up to [`CURRENT_SCHEMA_VERSION`].
///
/// Each step rewrites the JSON tree for exactly one version bump so a
/// document from any supported version walks the whole chain.
pub fn migrate_state(mut doc: Map<String, Value>, from: SchemaVersion) -> Result<Map<String, Value>> {
    if from > CURRENT_SCHEMA_VERSION {
        return Err(SpecflowError::UnsupportedSchemaVersion {
            found: from.to_string(),
            supported: CURRENT_SCHEMA_VERSION.to_string(),
        });
    }
    let mut version = from;
    while version.major < CURRENT_SCHEMA_VERSION.major {
        doc = match version.major {
            0 | 1 => migrate_v1_to_v2(doc)?,
            _ => unreachable!("loop bound is the current major version"),
        };
        version = SchemaVersion {
            major: version.major.max(1) + 1,
            minor: 0,
        };
        tracing::info!(to = %version, "migrated state document");
    }
    doc.insert(
        "schemaVersion".to_string(),
        Value::String(CURRENT_SCHEMA_VERSION.to_string()),
    );
    Ok(doc)
}

/// v1 nested the active phase as `orchestration.phase { number, name, branch }`;
/// v2 keeps those as flat `orchestration.phaseNumber` / `phaseName` / `branch` fields.
fn migrate_v1_to_v2(mut doc: Map<String, Value>) -> Result<Map<String, Value>> {
    let Some(Value::Object(orch)) = doc.get_mut("orchestration") else {
        return Ok(doc);
    };
    if let Some(phase) = orch.remove("phase") {
        let Value::Object(phase) = phase else {
            return Err(SpecflowError::Schema {
                reason: "v1 orchestration.phase is not an object".to_string(),
            });
        };
        for (from, to) in [("number", "phaseNumber"), ("name", "phaseName"), ("branch", "branch")] {
            if let Some(v) = phase.get(from) {
                let v = match v {
                    // v1 allowed numeric phase identifiers; v2 stores zero-padded strings
                    Value::Number(n) if from == "number" => Value::String(format!("{:03}", n.as_u64().unwrap_or(0))),
                    other => other.clone(),
                };
                orch.entry(to.to_string()).or_insert(v);
            }
        }
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn parse_versions() {
        assert_eq!(SchemaVersion::parse("2.0"), Some(SchemaVersion { major: 2, minor: 0 }));
        assert_eq!(SchemaVersion::parse("1"), Some(SchemaVersion { major: 1, minor: 0 }));
        assert_eq!(SchemaVersion::parse("1.3"), Some(SchemaVersion { major: 1, minor: 3 }));
        assert!(SchemaVersion::parse("two").is_none());
        assert!(SchemaVersion::parse("").is_none());
    }

    #[test]
    fn v1_phase_is_flattened() {
        let doc = obj(json!({
            "schemaVersion": "1.0",
            "orchestration": {
                "phase": { "number": "042", "name": "Core", "branch": "042-core" },
                "status": "in_progress"
            }
        }));
        let out = migrate_state(doc, SchemaVersion::parse("1.0").unwrap()).unwrap();
        assert_eq!(out["schemaVersion"], "2.0");
        assert_eq!(out["orchestration"]["phaseNumber"], "042");
        assert_eq!(out["orchestration"]["phaseName"], "Core");
        assert_eq!(out["orchestration"]["branch"], "042-core");
        assert!(out["orchestration"].get("phase").is_none());
    }

    #[test]
    fn v1_numeric_phase_is_padded() {
        let doc = obj(json!({ "orchestration": { "phase": { "number": 7 } } }));
        let out = migrate_state(doc, SchemaVersion::parse("1").unwrap()).unwrap();
        assert_eq!(out["orchestration"]["phaseNumber"], "007");
    }

    #[test]
    fn current_version_untouched() {
        let doc = obj(json!({ "schemaVersion": "2.0", "custom": 1 }));
        let out = migrate_state(doc, CURRENT_SCHEMA_VERSION).unwrap();
        assert_eq!(out["custom"], 1);
    }

    #[test]
    fn newer_version_refused() {
        let doc = obj(json!({ "schemaVersion": "3.0" }));
        let err = migrate_state(doc, SchemaVersion::parse("3.0").unwrap()).unwrap_err();
        assert!(matches!(err, SpecflowError::UnsupportedSchemaVersion { .. }));
    }
}

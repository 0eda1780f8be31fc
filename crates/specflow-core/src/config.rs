use crate::error::Result;
use crate::gate::GateKind;
use crate::inspector::SectionCheck;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SectionSpec / GateOverride
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    pub name: String,
    pub pattern: String,
}

impl SectionSpec {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }

    pub fn compile(&self) -> Result<SectionCheck> {
        SectionCheck::new(self.name.clone(), &self.pattern)
    }
}

/// Per-gate adjustments. Unset fields keep the built-in behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateOverride {
    /// Replaces the gate's required section list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<SectionSpec>>,
    /// Enables or disables the placeholder scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholders: Option<bool>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

/// Optional `.specify/specflow.yaml`. Every field has a default, so an absent
/// file and an empty file behave the same.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Escalate warnings to failures for every gate run.
    #[serde(default)]
    pub strict: bool,
    /// Overrides test-runner detection for the implement gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    /// `0` means no timeout.
    #[serde(default = "default_test_timeout")]
    pub test_timeout_seconds: u32,
    /// Skip running tests from the implement gate entirely.
    #[serde(default)]
    pub skip_tests: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gates: BTreeMap<String, GateOverride>,
}

fn default_version() -> u32 {
    1
}

fn default_test_timeout() -> u32 {
    600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            strict: false,
            test_command: None,
            test_timeout_seconds: default_test_timeout(),
            skip_tests: false,
            gates: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn gate_override(&self, gate: GateKind) -> Option<&GateOverride> {
        self.gates.get(gate.as_str())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for (key, gate) in &self.gates {
            if GateKind::from_name(key).is_none() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "unknown gate '{key}' in gates (expected specify, plan, tasks or implement)"
                    ),
                });
            }
            for section in gate.sections.iter().flatten() {
                if let Err(e) = section.compile() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!("gate '{key}' section '{}': {e}", section.name),
                    });
                }
                if section.name.trim().is_empty() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Warning,
                        message: format!("gate '{key}' has a section with an empty name"),
                    });
                }
            }
        }

        if let Some(cmd) = &self.test_command {
            if cmd.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: "test_command is empty; test detection will be used instead"
                        .to_string(),
                });
            }
        }

        if self.skip_tests && self.test_command.is_some() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "test_command is set but skip_tests disables it".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

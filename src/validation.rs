use crate::formats::{Defect, DefectKind, inspect, sniff};
use crate::types::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    #[default]
    Permissive,
    Strict,
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub strictness: Strictness,
    pub allowed_formats: Vec<ImageFormat>,
    pub repairable: Vec<DefectKind>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            strictness: Strictness::Permissive,
            allowed_formats: ImageFormat::ALL.to_vec(),
            repairable: DefectKind::ALL.to_vec(),
        }
    }
}

impl ValidationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn with_allowed_formats(mut self, formats: impl Into<Vec<ImageFormat>>) -> Self {
        self.allowed_formats = formats.into();
        self
    }

    pub fn with_repairable(mut self, kinds: impl Into<Vec<DefectKind>>) -> Self {
        self.repairable = kinds.into();
        self
    }

    fn is_repairable(&self, defect: &Defect) -> bool {
        self.strictness == Strictness::Permissive && self.repairable.contains(&defect.kind())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    RepairableCorruption { reason: Vec<Defect> },
    Invalid { reason: String },
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Valid => "valid",
            Verdict::RepairableCorruption { .. } => "repairable",
            Verdict::Invalid { .. } => "invalid",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Valid => f.write_str("valid"),
            Verdict::RepairableCorruption { reason } => {
                f.write_str("repairable: ")?;
                for (i, defect) in reason.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{defect}")?;
                }
                Ok(())
            }
            Verdict::Invalid { reason } => write!(f, "invalid: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub verdict: Verdict,
    /// `None` when no supported container was recognised.
    pub format: Option<ImageFormat>,
    pub confidence: f32,
    pub dimensions: Option<(u32, u32)>,
}

impl Validation {
    fn invalid(format: Option<ImageFormat>, reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            verdict: Verdict::Invalid {
                reason: reason.into(),
            },
            format,
            confidence,
            dimensions: None,
        }
    }

    pub fn format_name(&self) -> &'static str {
        self.format.map_or("unknown", |f| f.name())
    }
}

pub struct ImageValidator {
    config: ValidationConfig,
}

impl ImageValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ValidationConfig::default())
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn validate(&self, data: &[u8]) -> Validation {
        let Some(format) = sniff(data) else {
            return Validation::invalid(None, "unknown format", 0.0);
        };
        if !self.config.allowed_formats.contains(&format) {
            return Validation::invalid(Some(format), format!("{format} not allowed"), 0.0);
        }

        let structure = inspect(format, data);
        let confidence = structure.confidence();

        if let Some(reason) = structure.fatal {
            return Validation::invalid(Some(format), reason, confidence);
        }

        let verdict = if structure.defects.is_empty() {
            Verdict::Valid
        } else if let Some(blocking) = structure
            .defects
            .iter()
            .find(|d| !self.config.is_repairable(d))
        {
            Verdict::Invalid {
                reason: blocking.to_string(),
            }
        } else {
            Verdict::RepairableCorruption {
                reason: structure.defects,
            }
        };

        Validation {
            verdict,
            format: Some(format),
            confidence,
            dimensions: structure.dimensions,
        }
    }
}

impl Default for ImageValidator {
    fn default() -> Self {
        Self::with_defaults()
    }
}

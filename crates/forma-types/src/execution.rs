use serde::{Deserialize, Serialize};

/// The three export formats produced for every successful run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// Primary model format served to the viewer (.3mf).
    Model,
    /// Triangle mesh for printing/preview (.stl).
    Mesh,
    /// Interchange solid for downstream CAD tools (.step).
    Interchange,
}

impl ArtifactFormat {
    pub const ALL: [ArtifactFormat; 3] = [
        ArtifactFormat::Model,
        ArtifactFormat::Mesh,
        ArtifactFormat::Interchange,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::Model => "3mf",
            ArtifactFormat::Mesh => "stl",
            ArtifactFormat::Interchange => "step",
        }
    }
}

/// Outcome of one interpreter run.
///
/// `artifact_url` is `Some` exactly when the model file exists on disk
/// after the process exits; the exit code does not factor in. A script may
/// export a valid solid and still die on an unrelated exception.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionResult {
    #[serde(rename = "artifactUrl")]
    pub artifact_url: Option<String>,
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    #[serde(rename = "timedOut", default)]
    pub timed_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_extensions_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for format in ArtifactFormat::ALL {
            assert!(seen.insert(format.extension()));
        }
    }
}

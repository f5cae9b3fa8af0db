use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use forma_types::ArtifactFormat;

/// The three export paths derived from one artifact slot.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub model: PathBuf,
    pub mesh: PathBuf,
    pub interchange: PathBuf,
}

impl ArtifactPaths {
    pub fn all(&self) -> [&Path; 3] {
        [&self.model, &self.mesh, &self.interchange]
    }
}

/// Owns the generated-files directory. Each session gets one slot, reused
/// across re-runs, so repeated execution overwrites rather than
/// accumulates files.
#[derive(Clone)]
pub struct ArtifactStore {
    output_dir: PathBuf,
}

impl ArtifactStore {
    pub async fn new(output_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir).await?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Timestamp-based slot name, unique even for slots minted within the
    /// same millisecond.
    pub fn new_slot(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
    }

    pub fn file_name(&self, slot: &str, format: ArtifactFormat) -> String {
        format!("{slot}.{}", format.extension())
    }

    pub fn path_for(&self, slot: &str, format: ArtifactFormat) -> PathBuf {
        self.output_dir.join(self.file_name(slot, format))
    }

    pub fn paths_for(&self, slot: &str) -> ArtifactPaths {
        ArtifactPaths {
            model: self.path_for(slot, ArtifactFormat::Model),
            mesh: self.path_for(slot, ArtifactFormat::Mesh),
            interchange: self.path_for(slot, ArtifactFormat::Interchange),
        }
    }

    /// Artifact presence is a filesystem fact, never an inference from the
    /// interpreter's exit status.
    pub async fn resolve_artifact(&self, slot: &str) -> Option<String> {
        let model = self.path_for(slot, ArtifactFormat::Model);
        match fs::try_exists(&model).await {
            Ok(true) => Some(self.file_name(slot, ArtifactFormat::Model)),
            _ => None,
        }
    }

    /// Remove every export for a slot. Files that are already gone are
    /// fine; nothing here is surfaced to the user.
    pub async fn delete_slot(&self, slot: &str) {
        for format in ArtifactFormat::ALL {
            let path = self.path_for(slot, format);
            match fs::remove_file(&path).await {
                Ok(()) => tracing::debug!("deleted artifact {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("artifact already absent: {}", path.display());
                }
                Err(err) => {
                    tracing::warn!("failed to delete artifact {}: {}", path.display(), err);
                }
            }
        }
    }
}

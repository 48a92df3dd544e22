//! Template compilation
//!
//! A builder turns a template source into an artifact file. Artifacts are
//! written to a temporary sibling and renamed into place, so readers on any
//! host only ever observe complete files.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use super::TemplateError;

/// On-disk artifact format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledArtifact {
    /// Template name
    pub name: String,
    /// Fingerprint of `source`
    pub fingerprint: String,
    /// When the artifact was produced
    pub compiled_at: DateTime<Utc>,
    /// Validated template source
    pub source: String,
}

/// Compiles one template source into an artifact at `dest`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateBuilder: Send + Sync {
    /// Compile `source` and write the artifact to `dest`
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::BuildFailed` for invalid sources and
    /// `TemplateError::Io` if the artifact cannot be written
    async fn build(
        &self,
        name: &str,
        source: &str,
        fingerprint: &str,
        dest: &Path,
    ) -> Result<(), TemplateError>;
}

/// Builder validating sources with minijinja
#[derive(Debug, Clone, Copy, Default)]
pub struct MiniJinjaBuilder;

impl MiniJinjaBuilder {
    /// Create a builder
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn compile(name: &str, source: &str) -> Result<(), TemplateError> {
        let env = minijinja::Environment::new();
        env.template_from_named_str(name, source)
            .map(|_| ())
            .map_err(|e| TemplateError::BuildFailed {
                name: name.to_string(),
                message: match e.line() {
                    Some(line) => format!("line {line}: {e}"),
                    None => e.to_string(),
                },
            })
    }
}

#[async_trait]
impl TemplateBuilder for MiniJinjaBuilder {
    async fn build(
        &self,
        name: &str,
        source: &str,
        fingerprint: &str,
        dest: &Path,
    ) -> Result<(), TemplateError> {
        Self::compile(name, source)?;

        let artifact = CompiledArtifact {
            name: name.to_string(),
            fingerprint: fingerprint.to_string(),
            compiled_at: Utc::now(),
            source: source.to_string(),
        };
        let bytes = serde_json::to_vec(&artifact).map_err(|e| TemplateError::BuildFailed {
            name: name.to_string(),
            message: e.to_string(),
        })?;

        write_atomically(dest, &bytes).await?;
        info!(template = %name, fingerprint = %fingerprint, path = %dest.display(), "Template compiled");
        Ok(())
    }
}

async fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<(), TemplateError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TemplateError::io(parent, e))?;
    }

    let tmp = dest.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| TemplateError::io(&tmp, e))?;

    if let Err(e) = tokio::fs::rename(&tmp, dest).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(TemplateError::io(dest, e));
    }

    debug!(path = %dest.display(), "Artifact written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("auth/reset.0011223344556677.json");

        MiniJinjaBuilder::new()
            .build("auth/reset", "<a href=\"{{ link }}\">Reset</a>", "0011223344556677", &dest)
            .await
            .unwrap();

        let artifact: CompiledArtifact =
            serde_json::from_slice(&std::fs::read(&dest).unwrap()).unwrap();
        assert_eq!(artifact.name, "auth/reset");
        assert_eq!(artifact.fingerprint, "0011223344556677");
        assert!(artifact.source.contains("{{ link }}"));

        // No temporary files are left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("auth"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_build_rejects_syntax_errors() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("broken.ffff.json");

        let err = MiniJinjaBuilder::new()
            .build("broken", "Hello {% if name %}", "ffff", &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, TemplateError::BuildFailed { ref name, .. } if name == "broken"));
        assert!(!dest.exists());
    }
}

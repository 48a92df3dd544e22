//! Just-in-time template compilation and rendering
//!
//! Template sources live under a source directory. The first time a template
//! is needed its source is compiled into an artifact on shared storage; the
//! artifact name carries a fingerprint of the source so an edited template is
//! rebuilt automatically and a stale artifact is never served. Compilation is
//! guarded by the distributed lock `compile:<name>` so that concurrent workers
//! on any number of hosts build each artifact once.
//!
//! Rendering runs on the blocking pool under a hard timeout.

mod builder;
mod cache;
mod renderer;

pub use builder::{CompiledArtifact, MiniJinjaBuilder, TemplateBuilder};
#[cfg(test)]
pub use builder::MockTemplateBuilder;
pub use cache::ArtifactCache;
pub use renderer::{EnvironmentHook, Renderer};

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::config::TemplateSettings;
use crate::lock::{DistributedLock, LockError};

/// Errors raised while resolving or rendering templates
#[derive(Debug, Error)]
pub enum TemplateError {
    /// No source exists for the template
    #[error("template not found: {name}")]
    NotFound {
        /// Template name
        name: String,
    },

    /// Template name could escape the source directory or is malformed
    #[error("invalid template name '{name}': {reason}")]
    InvalidName {
        /// Template name
        name: String,
        /// What is wrong with it
        reason: &'static str,
    },

    /// The source failed to compile
    #[error("failed to build template '{name}': {message}")]
    BuildFailed {
        /// Template name
        name: String,
        /// Compiler diagnostic
        message: String,
    },

    /// Rendering exceeded its time bound
    #[error("rendering '{name}' exceeded {timeout:?}")]
    RenderTimeout {
        /// Template name
        name: String,
        /// Bound that was exceeded
        timeout: Duration,
    },

    /// Rendering failed (undefined filter, type error, ...)
    #[error("failed to render template '{name}': {message}")]
    RenderFailed {
        /// Template name
        name: String,
        /// Engine diagnostic
        message: String,
    },

    /// An artifact on disk could not be decoded
    #[error("corrupt artifact {path}: {message}")]
    CorruptArtifact {
        /// Artifact path
        path: PathBuf,
        /// Decode error
        message: String,
    },

    /// Lock acquisition or release failed
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Filesystem error
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl TemplateError {
    /// Whether a later attempt may succeed
    ///
    /// Lock contention, render timeouts and I/O are transient. Missing
    /// templates, compile errors and render errors are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Lock(_) | Self::RenderTimeout { .. } | Self::Io { .. } | Self::CorruptArtifact { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A compiled artifact ready to render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    name: String,
    fingerprint: String,
    path: PathBuf,
}

impl ArtifactHandle {
    /// Template name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source fingerprint the artifact was built from
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Artifact location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Where sources are read from and artifacts written to
#[derive(Debug, Clone)]
pub struct TemplateLayout {
    source_dir: PathBuf,
    artifact_dir: PathBuf,
    extension: String,
}

impl TemplateLayout {
    /// Create a layout
    #[must_use]
    pub fn new(
        source_dir: impl Into<PathBuf>,
        artifact_dir: impl Into<PathBuf>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            artifact_dir: artifact_dir.into(),
            extension: extension.into(),
        }
    }

    /// Layout described by configuration
    #[must_use]
    pub fn from_settings(settings: &TemplateSettings) -> Self {
        Self::new(
            settings.source_dir.clone(),
            settings.artifact_dir.clone(),
            settings.extension.clone(),
        )
    }

    /// Source file for `name`
    #[must_use]
    pub fn source_path(&self, name: &str) -> PathBuf {
        self.source_dir.join(format!("{name}.{}", self.extension))
    }

    /// Artifact file for `name` built from a source with `fingerprint`
    #[must_use]
    pub fn artifact_path(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.artifact_dir.join(format!("{name}.{fingerprint}.json"))
    }

    /// Names of every template under the source directory
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::Io` if a directory cannot be listed
    pub async fn discover(&self) -> Result<Vec<String>, TemplateError> {
        let suffix = format!(".{}", self.extension);
        let mut names = Vec::new();
        let mut pending = vec![self.source_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| TemplateError::io(&dir, e))?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| TemplateError::io(&dir, e))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| TemplateError::io(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.source_dir) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                if let Some(name) = relative.strip_suffix(&suffix) {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Reject names that are empty, absolute or contain `.`/`..` segments
///
/// Nested names such as `auth/reset-password` are allowed.
///
/// # Errors
///
/// Returns `TemplateError::InvalidName` describing the first problem found
pub fn validate_name(name: &str) -> Result<(), TemplateError> {
    let invalid = |reason| {
        Err(TemplateError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.starts_with('/') || name.contains('\\') {
        return invalid("name must be a relative path using '/'");
    }
    for segment in name.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return invalid("name contains an empty or relative segment");
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return invalid("name may only contain ASCII letters, digits, '-', '_' and '.'");
        }
    }
    Ok(())
}

/// Short content fingerprint of a template source
#[must_use]
pub fn fingerprint(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    hex::encode(&digest[..8])
}

/// Resolve-then-render facade used by the delivery pipeline
#[derive(Debug)]
pub struct TemplateEngine {
    cache: ArtifactCache,
    renderer: Renderer,
    render_timeout: Duration,
}

impl TemplateEngine {
    /// Assemble an engine from its parts
    #[must_use]
    pub const fn new(cache: ArtifactCache, renderer: Renderer, render_timeout: Duration) -> Self {
        Self {
            cache,
            renderer,
            render_timeout,
        }
    }

    /// Engine using the minijinja builder and configured directories
    #[must_use]
    pub fn from_settings(settings: &TemplateSettings, lock: DistributedLock) -> Self {
        let cache = ArtifactCache::new(
            TemplateLayout::from_settings(settings),
            lock,
            std::sync::Arc::new(MiniJinjaBuilder::new()),
            settings.build_lock_ttl(),
        );
        Self::new(cache, Renderer::new(), settings.render_timeout())
    }

    /// Artifact cache
    #[must_use]
    pub const fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Resolve and render `name` with the default timeout
    ///
    /// # Errors
    ///
    /// Any [`TemplateError`] from resolution or rendering
    pub async fn render(&self, name: &str, props: &Value) -> Result<String, TemplateError> {
        self.render_with_timeout(name, props, self.render_timeout).await
    }

    /// Resolve and render `name`, bounding the render by `timeout`
    ///
    /// # Errors
    ///
    /// Any [`TemplateError`] from resolution or rendering
    pub async fn render_with_timeout(
        &self,
        name: &str,
        props: &Value,
        timeout: Duration,
    ) -> Result<String, TemplateError> {
        let handle = self.cache.resolve(name).await?;
        self.renderer.render(&handle, props, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("welcome").is_ok());
        assert!(validate_name("auth/reset-password").is_ok());
        assert!(validate_name("receipts/order_v2").is_ok());

        for bad in ["", "/etc/passwd", "../secret", "a//b", "a/./b", "a\\b", "we lcome"] {
            assert!(
                matches!(validate_name(bad), Err(TemplateError::InvalidName { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = fingerprint("<p>Hello {{ name }}</p>");
        let b = fingerprint("<p>Hello {{ name }}</p>");
        let c = fingerprint("<p>Hi {{ name }}</p>");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_layout_paths() {
        let layout = TemplateLayout::new("/srv/templates", "/srv/dist", "html");
        assert_eq!(layout.source_path("auth/reset"), PathBuf::from("/srv/templates/auth/reset.html"));
        assert_eq!(
            layout.artifact_path("auth/reset", "abcd"),
            PathBuf::from("/srv/dist/auth/reset.abcd.json")
        );
    }

    #[tokio::test]
    async fn test_discover_lists_nested_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("auth")).unwrap();
        std::fs::write(dir.path().join("welcome.html"), "hi").unwrap();
        std::fs::write(dir.path().join("auth/reset.html"), "reset").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip").unwrap();

        let layout = TemplateLayout::new(dir.path(), dir.path().join("dist"), "html");
        assert_eq!(layout.discover().await.unwrap(), vec!["auth/reset", "welcome"]);
    }

    #[test]
    fn test_retryable_classification() {
        let timeout = TemplateError::RenderTimeout {
            name: "welcome".into(),
            timeout: Duration::from_millis(200),
        };
        let missing = TemplateError::NotFound { name: "welcome".into() };
        let broken = TemplateError::BuildFailed {
            name: "welcome".into(),
            message: "unexpected end of input".into(),
        };
        let lock = TemplateError::Lock(LockError::Timeout {
            key: "lock:compile:welcome".into(),
            waited: Duration::from_secs(5),
        });

        assert!(timeout.is_retryable());
        assert!(lock.is_retryable());
        assert!(!missing.is_retryable());
        assert!(!broken.is_retryable());
    }
}

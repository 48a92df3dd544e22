//! Compile-once artifact cache
//!
//! `resolve` is a double-checked build: an artifact that already exists is
//! returned without touching the lock; otherwise the caller takes
//! `compile:<name>`, checks again, and only then builds.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{fingerprint, validate_name, ArtifactHandle, TemplateBuilder, TemplateError, TemplateLayout};
use crate::lock::DistributedLock;

/// Resolves template names to compiled artifacts
pub struct ArtifactCache {
    layout: TemplateLayout,
    lock: DistributedLock,
    builder: Arc<dyn TemplateBuilder>,
    build_lock_ttl: Duration,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("layout", &self.layout)
            .field("lock", &self.lock)
            .field("build_lock_ttl", &self.build_lock_ttl)
            .finish_non_exhaustive()
    }
}

impl ArtifactCache {
    /// Create a cache
    ///
    /// `build_lock_ttl` must exceed the slowest expected build.
    #[must_use]
    pub fn new(
        layout: TemplateLayout,
        lock: DistributedLock,
        builder: Arc<dyn TemplateBuilder>,
        build_lock_ttl: Duration,
    ) -> Self {
        Self {
            layout,
            lock,
            builder,
            build_lock_ttl,
        }
    }

    /// Directory layout
    #[must_use]
    pub const fn layout(&self) -> &TemplateLayout {
        &self.layout
    }

    /// Return the artifact for `name`, compiling it if needed
    ///
    /// # Errors
    ///
    /// - `TemplateError::InvalidName` / `TemplateError::NotFound` before any locking
    /// - `TemplateError::Lock` when `compile:<name>` cannot be acquired in time
    /// - `TemplateError::BuildFailed` when the source does not compile
    #[instrument(skip(self), fields(template = %name))]
    pub async fn resolve(&self, name: &str) -> Result<ArtifactHandle, TemplateError> {
        validate_name(name)?;

        let source_path = self.layout.source_path(name);
        let source = match tokio::fs::read_to_string(&source_path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(TemplateError::io(source_path, e)),
        };

        let fingerprint = fingerprint(&source);
        let handle = ArtifactHandle {
            name: name.to_string(),
            path: self.layout.artifact_path(name, &fingerprint),
            fingerprint,
        };

        if artifact_exists(&handle.path).await? {
            debug!(fingerprint = %handle.fingerprint, "Artifact cache hit");
            return Ok(handle);
        }

        let resource = format!("compile:{name}");
        self.lock
            .with_lock(&resource, self.build_lock_ttl, || async {
                // Another worker may have finished the build while we waited.
                if artifact_exists(&handle.path).await? {
                    debug!(fingerprint = %handle.fingerprint, "Artifact built by another worker");
                    return Ok(());
                }

                info!(fingerprint = %handle.fingerprint, "Artifact missing, compiling");
                self.builder
                    .build(name, &source, &handle.fingerprint, &handle.path)
                    .await
            })
            .await?;

        Ok(handle)
    }
}

async fn artifact_exists(path: &Path) -> Result<bool, TemplateError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| TemplateError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{InMemoryLockBackend, LockError};
    use crate::template::{MiniJinjaBuilder, MockTemplateBuilder};
    use crate::testing::CountingBuilder;

    fn cache_with(dir: &Path, builder: Arc<dyn TemplateBuilder>) -> ArtifactCache {
        ArtifactCache::new(
            TemplateLayout::new(dir.join("src"), dir.join("dist"), "html"),
            DistributedLock::new(Arc::new(InMemoryLockBackend::new())),
            builder,
            Duration::from_secs(30),
        )
    }

    fn write_source(dir: &Path, name: &str, body: &str) {
        let path = dir.join("src").join(format!("{name}.html"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_locking() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = MockTemplateBuilder::new();
        builder.expect_build().never();

        let err = cache_with(dir.path(), Arc::new(builder)).resolve("nope").await.unwrap_err();
        assert!(matches!(err, TemplateError::NotFound { ref name } if name == "nope"));
    }

    #[tokio::test]
    async fn test_second_resolve_is_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "welcome", "Hello {{ name }}");

        let builder = Arc::new(CountingBuilder::new());
        let cache = cache_with(dir.path(), builder.clone());
        let first = cache.resolve("welcome").await.unwrap();
        let second = cache.resolve("welcome").await.unwrap();

        assert_eq!(first, second);
        assert!(first.path().exists());
        assert_eq!(builder.builds(), 1);
    }

    #[tokio::test]
    async fn test_edited_source_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "welcome", "Hello {{ name }}");
        let cache = cache_with(dir.path(), Arc::new(MiniJinjaBuilder::new()));

        let before = cache.resolve("welcome").await.unwrap();
        write_source(dir.path(), "welcome", "Welcome aboard, {{ name }}");
        let after = cache.resolve("welcome").await.unwrap();

        assert_ne!(before.fingerprint(), after.fingerprint());
        assert!(after.path().exists());
    }

    #[tokio::test]
    async fn test_build_failure_propagates_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "broken", "{% for x in %}");
        let cache = cache_with(dir.path(), Arc::new(MiniJinjaBuilder::new()));

        let err = cache.resolve("broken").await.unwrap_err();
        assert!(matches!(err, TemplateError::BuildFailed { .. }));

        // The lock was released, so a retry fails the same way instead of timing out.
        let err = cache.resolve("broken").await.unwrap_err();
        assert!(matches!(err, TemplateError::BuildFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_lock_surfaces_timeout() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path(), "welcome", "Hello");
        let backend = Arc::new(InMemoryLockBackend::new());
        let lock = DistributedLock::new(backend);
        let _held = lock.acquire("compile:welcome", Duration::from_secs(60)).await.unwrap();

        let cache = ArtifactCache::new(
            TemplateLayout::new(dir.path().join("src"), dir.path().join("dist"), "html"),
            lock,
            Arc::new(MiniJinjaBuilder::new()),
            Duration::from_secs(30),
        );

        let err = cache.resolve("welcome").await.unwrap_err();
        assert!(matches!(err, TemplateError::Lock(LockError::Timeout { .. })));
        assert!(err.is_retryable());
    }
}

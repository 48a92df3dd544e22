//! Time-bounded rendering of compiled artifacts
//!
//! Loaded artifacts are memoized per template name, one entry each. The entry
//! remembers its artifact path, which embeds the source fingerprint, so a new
//! fingerprint misses and replaces the older environment.
//!
//! A render runs on the blocking pool. When it outlives its timeout the caller
//! gets [`TemplateError::RenderTimeout`] right away; the abandoned render is
//! left to finish in the background and its output is discarded.

use minijinja::{AutoEscape, Environment};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ArtifactHandle, CompiledArtifact, TemplateError};

/// Customizes every environment before its template is added
///
/// Use it to register filters and functions shared by all templates.
pub type EnvironmentHook = Arc<dyn Fn(&mut Environment<'static>) + Send + Sync>;

struct Loaded {
    path: PathBuf,
    env: Arc<Environment<'static>>,
}

/// Renders artifacts produced by the artifact cache
#[derive(Default)]
pub struct Renderer {
    loaded: RwLock<HashMap<String, Loaded>>,
    hook: Option<EnvironmentHook>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("loaded", &self.loaded.read().len())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl Renderer {
    /// Create a renderer with no extra filters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a renderer that applies `hook` to each environment
    #[must_use]
    pub fn with_hook(hook: EnvironmentHook) -> Self {
        Self {
            loaded: RwLock::default(),
            hook: Some(hook),
        }
    }

    /// Render `handle` with `props`, giving up after `timeout`
    ///
    /// # Errors
    ///
    /// - `TemplateError::RenderTimeout` if the render does not finish in time
    /// - `TemplateError::RenderFailed` for engine errors
    /// - `TemplateError::Io` / `TemplateError::CorruptArtifact` if the artifact cannot be loaded
    pub async fn render(
        &self,
        handle: &ArtifactHandle,
        props: &Value,
        timeout: Duration,
    ) -> Result<String, TemplateError> {
        let env = self.environment(handle).await?;
        let name = handle.name().to_string();
        let props = props.clone();

        let task = tokio::task::spawn_blocking(move || {
            env.get_template(&name).and_then(|template| template.render(props))
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(html))) => Ok(html),
            Ok(Ok(Err(e))) => Err(TemplateError::RenderFailed {
                name: handle.name().to_string(),
                message: format!("{e:#}"),
            }),
            Ok(Err(join_error)) => Err(TemplateError::RenderFailed {
                name: handle.name().to_string(),
                message: join_error.to_string(),
            }),
            Err(_) => {
                warn!(template = %handle.name(), timeout_ms = timeout.as_millis(), "Render timed out");
                Err(TemplateError::RenderTimeout {
                    name: handle.name().to_string(),
                    timeout,
                })
            }
        }
    }

    async fn environment(&self, handle: &ArtifactHandle) -> Result<Arc<Environment<'static>>, TemplateError> {
        if let Some(env) = self.memoized(handle.name(), handle.path()) {
            return Ok(env);
        }

        let bytes = tokio::fs::read(handle.path())
            .await
            .map_err(|e| TemplateError::io(handle.path(), e))?;
        let artifact: CompiledArtifact =
            serde_json::from_slice(&bytes).map_err(|e| TemplateError::CorruptArtifact {
                path: handle.path().to_path_buf(),
                message: e.to_string(),
            })?;

        let mut env = Environment::new();
        // Every template is an email body.
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        if let Some(hook) = &self.hook {
            hook(&mut env);
        }
        env.add_template_owned(artifact.name, artifact.source)
            .map_err(|e| TemplateError::CorruptArtifact {
                path: handle.path().to_path_buf(),
                message: e.to_string(),
            })?;

        let env = Arc::new(env);
        debug!(template = %handle.name(), path = %handle.path().display(), "Artifact loaded");
        let replaced = self.loaded.write().insert(
            handle.name().to_string(),
            Loaded {
                path: handle.path().to_path_buf(),
                env: env.clone(),
            },
        );
        if let Some(old) = replaced.filter(|old| old.path != handle.path()) {
            debug!(template = %handle.name(), path = %old.path.display(), "Older artifact evicted");
        }
        Ok(env)
    }

    fn memoized(&self, name: &str, path: &Path) -> Option<Arc<Environment<'static>>> {
        self.loaded
            .read()
            .get(name)
            .filter(|loaded| loaded.path == path)
            .map(|loaded| loaded.env.clone())
    }
}

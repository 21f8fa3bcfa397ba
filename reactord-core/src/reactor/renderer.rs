//! Renders reaction files into declarations. A reaction reference may be a
//! filesystem glob or a virtual `salt://` path that is first resolved to a
//! local file through the file cache. Each matched file is rendered as a
//! Jinja template with the event's `tag` and `data` bound, and the output is
//! parsed as a YAML mapping of declaration names to declaration bodies.

use crate::reactor::Declaration;
use anyhow::Context;
use indexmap::IndexMap;
use minijinja::{context, Environment};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

/// Prefix marking a reaction reference as a virtual path that must be
/// resolved through the file cache before it can be globbed.
pub const VIRTUAL_PATH_PREFIX: &str = "salt://";

/// Resolves virtual file references to local paths, fetching the file into a
/// local cache if the backing store is remote.
pub trait FileCache: Send + Sync {
    /// Returns the local path for a virtual reference, or `None` if the
    /// reference cannot be resolved. The returned path is not required to
    /// exist; a missing file simply globs to nothing.
    fn cache_file(&self, reference: &str) -> Option<PathBuf>;
}

/// A file cache serving virtual references from a local directory.
pub struct LocalFileCache {
    root: PathBuf,
}

impl LocalFileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFileCache { root: root.into() }
    }
}

impl FileCache for LocalFileCache {
    fn cache_file(&self, reference: &str) -> Option<PathBuf> {
        let relative = reference.strip_prefix(VIRTUAL_PATH_PREFIX)?;
        let relative = relative.trim_start_matches('/');

        // A reference must stay inside the cache root.
        let has_parent_component = Path::new(relative)
            .components()
            .any(|component| matches!(component, Component::ParentDir));
        if has_parent_component {
            warn!(
                reference = %reference,
                "Refusing to resolve reference '{}' outside the cache root", reference,
            );

            return None;
        }

        Some(self.root.join(relative))
    }
}

/// Renders a single reaction file against an event.
pub trait ReactionRenderer: Send + Sync {
    fn render(
        &self,
        path: &Path,
        tag: &str,
        data: &Value,
    ) -> anyhow::Result<IndexMap<String, Declaration>>;
}

/// The default renderer: the file is a Jinja template producing YAML, with
/// exactly `tag` and `data` bound in the template context.
pub struct JinjaYamlRenderer;

impl ReactionRenderer for JinjaYamlRenderer {
    fn render(
        &self,
        path: &Path,
        tag: &str,
        data: &Value,
    ) -> anyhow::Result<IndexMap<String, Declaration>> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read '{}'", path.display()))?;

        let environment = Environment::new();
        let rendered = environment
            .render_str(&source, context! { tag => tag, data => data })
            .with_context(|| format!("failed to render '{}'", path.display()))?;

        if rendered.trim().is_empty() {
            return Ok(IndexMap::new());
        }

        serde_yaml::from_str(&rendered)
            .with_context(|| format!("failed to parse rendered '{}'", path.display()))
    }
}

/// The pair of collaborators reaction rendering runs through.
pub struct ReactionSources {
    file_cache: Arc<dyn FileCache>,
    renderer: Arc<dyn ReactionRenderer>,
}

impl ReactionSources {
    pub fn new(file_cache: Arc<dyn FileCache>, renderer: Arc<dyn ReactionRenderer>) -> Self {
        ReactionSources {
            file_cache,
            renderer,
        }
    }

    /// Renders every file matched by a reaction reference and returns the
    /// merged declarations. Later files silently overwrite earlier ones on
    /// name collision. A file that fails to render is logged and dropped
    /// without affecting its siblings, so a total failure yields an empty
    /// mapping rather than an error.
    pub fn render_reaction(
        &self,
        glob_ref: &str,
        tag: &str,
        data: &Value,
    ) -> IndexMap<String, Declaration> {
        let mut react = IndexMap::new();

        let glob_ref = if glob_ref.starts_with(VIRTUAL_PATH_PREFIX) {
            match self.file_cache.cache_file(glob_ref) {
                Some(path) => path.to_string_lossy().into_owned(),
                None => {
                    warn!(
                        reference = %glob_ref,
                        "Could not resolve reaction reference '{}'", glob_ref,
                    );

                    return react;
                }
            }
        } else {
            glob_ref.to_string()
        };

        let paths = match glob::glob(&glob_ref) {
            Ok(paths) => paths,
            Err(error) => {
                error!(
                    reference = %glob_ref,
                    "Invalid reaction file glob '{}': {}", glob_ref, error,
                );

                return react;
            }
        };

        let mut files: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
        files.sort();

        for file in files {
            match self.renderer.render(&file, tag, data) {
                Ok(mut declarations) => {
                    // Attribute every declaration to the file it came from,
                    // overwriting any provenance the file set itself, so
                    // validation errors always name the right file.
                    for declaration in declarations.values_mut() {
                        declaration.source = Some(file.clone());
                    }

                    react.extend(declarations);
                }

                Err(error) => {
                    error!(
                        file = %file.display(),
                        "Failed to render '{}': {:#}", file.display(), error,
                    );
                }
            }
        }

        react
    }
}

//! Extension → source loader registry.
//!
//! A [`LanguageRegistry`] answers two questions for the partition watcher:
//! should this path be ignored, and what text does this file contribute. The
//! extension set is recomputed on every `register`/`unregister`, so both
//! queries are pure lookups.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::error::{language_io_err, LanguageError};

/// Capability that turns a file on disk into source text.
pub trait SourceLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<String, LanguageError>;
}

/// Reads the file as-is (lossy UTF-8).
#[derive(Debug, Clone, Copy, Default)]
pub struct RawLoader;

impl SourceLoader for RawLoader {
    fn load(&self, path: &Path) -> Result<String, LanguageError> {
        let bytes = std::fs::read(path).map_err(|e| language_io_err(path, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Runs an external compiler and uses its stdout as the source.
///
/// The file path is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CommandLoader {
    language: String,
    program: String,
    args: Vec<String>,
}

impl CommandLoader {
    pub fn new(language: impl Into<String>, program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            language: language.into(),
            program: program.into(),
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
        }
    }
}

impl SourceLoader for CommandLoader {
    fn load(&self, path: &Path) -> Result<String, LanguageError> {
        tracing::debug!(language = %self.language, program = %self.program, path = %path.display(), "running external loader");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .output()
            .map_err(|err| LanguageError::Transform {
                language: self.language.clone(),
                path: path.to_path_buf(),
                message: format!("failed to run {}: {err}", self.program),
            })?;

        if !output.status.success() {
            return Err(LanguageError::Transform {
                language: self.language.clone(),
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// A registered language: a name, one extension (with leading dot), a loader.
#[derive(Clone)]
pub struct Language {
    pub name: String,
    pub extension: String,
    loader: Arc<dyn SourceLoader>,
}

impl Language {
    pub fn matches(&self, extension: &str) -> bool {
        self.extension == extension
    }

    pub fn load(&self, path: &Path) -> Result<String, LanguageError> {
        self.loader.load(path)
    }
}

impl fmt::Debug for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Language")
            .field("name", &self.name)
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct LanguageRegistry {
    languages: Vec<Language>,
    extensions: BTreeSet<String>,
}

impl LanguageRegistry {
    /// An empty registry: every path is ignored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lua (raw) and MoonScript (compiled through `moonc -p`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert("Lua", ".lua", Arc::new(RawLoader));
        registry.insert(
            "MoonScript",
            ".moon",
            Arc::new(CommandLoader::new("MoonScript", "moonc", &["-p"])),
        );
        registry
    }

    /// Register a language. `loader: None` means "read the file as-is".
    ///
    /// Fails with `DuplicateDefinition` if the name or extension is taken.
    pub fn register(
        &mut self,
        name: &str,
        extension: &str,
        loader: Option<Arc<dyn SourceLoader>>,
    ) -> Result<(), LanguageError> {
        let extension = normalize_extension(extension);
        if self
            .languages
            .iter()
            .any(|lang| lang.name == name || lang.extension == extension)
        {
            return Err(LanguageError::DuplicateDefinition {
                name: name.to_string(),
                extension,
            });
        }
        self.insert(name, &extension, loader.unwrap_or_else(|| Arc::new(RawLoader)));
        tracing::debug!(language = name, extension = %extension, "registered language");
        Ok(())
    }

    /// Remove a language by name. Returns whether it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.languages.len();
        self.languages.retain(|lang| lang.name != name);
        let removed = self.languages.len() != before;
        if removed {
            self.recompute();
        }
        removed
    }

    /// Registered extensions, each with a leading dot.
    pub fn extensions(&self) -> &BTreeSet<String> {
        &self.extensions
    }

    /// True if the path's extension is not registered.
    pub fn ignore(&self, path: &Path) -> bool {
        match extension_of(path) {
            Some(ext) => !self.extensions.contains(&ext),
            None => true,
        }
    }

    /// Load the file through the loader registered for its extension.
    pub fn load(&self, path: &Path) -> Result<String, LanguageError> {
        let language = extension_of(path)
            .and_then(|ext| self.languages.iter().find(|lang| lang.matches(&ext)))
            .ok_or_else(|| LanguageError::NoApplicableLoader {
                path: PathBuf::from(path),
            })?;
        language.load(path)
    }

    fn insert(&mut self, name: &str, extension: &str, loader: Arc<dyn SourceLoader>) {
        self.languages.push(Language {
            name: name.to_string(),
            extension: normalize_extension(extension),
            loader,
        });
        self.recompute();
    }

    fn recompute(&mut self) {
        self.extensions = self
            .languages
            .iter()
            .map(|lang| lang.extension.clone())
            .collect();
    }
}

fn normalize_extension(extension: &str) -> String {
    if extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    }
}

/// `a.server.lua` → `.lua`. Dotfiles without a further extension have none.
fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
}

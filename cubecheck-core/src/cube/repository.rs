//! Directory of cube definition files.
//!
//! # Security
//! Definitions are only read from the configured directory. Cube names must
//! be plain identifiers, and the resolved file must stay inside the
//! directory after symlinks are followed.

use super::definition::CubeDefinition;
use crate::{DiagnosticError, Result};
use std::path::{Path, PathBuf};

/// File extension of cube definitions
pub const DEFINITION_EXTENSION: &str = "json";

/// Whether `name` is usable as a cube name
pub fn is_valid_cube_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Read-only access to `<root>/<Cube>.json` files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubeRepository {
    root: PathBuf,
}

impl CubeRepository {
    /// Creates a repository rooted at `root`. Nothing is read yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the definitions
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of all definitions, sorted.
    ///
    /// Files whose stem is not a valid cube name are skipped.
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be read.
    pub fn list_cubes(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            DiagnosticError::io(
                format!("Failed to read cube directory {}", self.root.display()),
                e,
            )
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                DiagnosticError::io(
                    format!("Failed to read cube directory {}", self.root.display()),
                    e,
                )
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DEFINITION_EXTENSION) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if is_valid_cube_name(stem) => names.push(stem.to_string()),
                _ => tracing::debug!("Skipping non-cube file {}", path.display()),
            }
        }
        names.sort();
        Ok(names)
    }

    /// Whether a definition file exists for `cube`
    pub fn exists(&self, cube: &str) -> bool {
        self.resolve(cube).is_ok()
    }

    /// Reads and parses one definition.
    ///
    /// # Errors
    /// - `Definition` if the name is invalid, the file escapes the directory,
    ///   or the JSON does not describe a cube
    /// - `DefinitionNotFound` if no file exists
    /// - `Io` if the file cannot be read
    pub fn load(&self, cube: &str) -> Result<CubeDefinition> {
        let path = self.resolve(cube)?;
        let content = std::fs::read_to_string(&path).map_err(|e| {
            DiagnosticError::io(format!("Failed to read cube file {}", path.display()), e)
        })?;
        serde_json::from_str(&content).map_err(|e| {
            DiagnosticError::definition(cube, format!("Failed to parse cube definition: {}", e))
        })
    }

    fn resolve(&self, cube: &str) -> Result<PathBuf> {
        if !is_valid_cube_name(cube) {
            return Err(DiagnosticError::definition(
                cube,
                "Cube names must be plain identifiers",
            ));
        }

        let path = self
            .root
            .join(format!("{}.{}", cube, DEFINITION_EXTENSION));
        if !path.is_file() {
            return Err(DiagnosticError::DefinitionNotFound {
                cube: cube.to_string(),
            });
        }

        let root = self.root.canonicalize().map_err(|e| {
            DiagnosticError::io(
                format!("Failed to resolve cube directory {}", self.root.display()),
                e,
            )
        })?;
        let resolved = path.canonicalize().map_err(|e| {
            DiagnosticError::io(format!("Failed to resolve cube file {}", path.display()), e)
        })?;
        if !resolved.starts_with(&root) {
            return Err(DiagnosticError::definition(
                cube,
                "Definition resolves outside the cube directory",
            ));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_cube_name_rules() {
        assert!(is_valid_cube_name("Members"));
        assert!(is_valid_cube_name("_private2"));
        assert!(!is_valid_cube_name("../etc/passwd"));
        assert!(!is_valid_cube_name("9lives"));
        assert!(!is_valid_cube_name(""));
    }

    #[test]
    fn test_list_and_load() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Members.json", r#"{"sql_table": "mv_members"}"#);
        write(dir.path(), "Activities.json", r#"{"sql_table": "mv_activities"}"#);
        write(dir.path(), "README.md", "docs");
        write(dir.path(), "bad name.json", "{}");

        let repository = CubeRepository::new(dir.path());
        assert_eq!(repository.list_cubes().unwrap(), vec!["Activities", "Members"]);
        assert!(repository.exists("Members"));
        assert!(!repository.exists("Organizations"));

        let definition = repository.load("Members").unwrap();
        assert_eq!(definition.table_name().as_deref(), Some("mv_members"));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Broken.json", "{ not json");
        let repository = CubeRepository::new(dir.path());

        assert!(matches!(
            repository.load("Missing"),
            Err(DiagnosticError::DefinitionNotFound { .. })
        ));
        assert!(matches!(
            repository.load("Broken"),
            Err(DiagnosticError::Definition { .. })
        ));
        assert!(matches!(
            repository.load("../Broken"),
            Err(DiagnosticError::Definition { .. })
        ));
    }

    #[test]
    fn test_missing_directory() {
        let repository = CubeRepository::new("/nonexistent/cubecheck/cubes");
        assert!(matches!(
            repository.list_cubes(),
            Err(DiagnosticError::Io { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        write(outside.path(), "Secret.json", "{}");
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("Secret.json"), dir.path().join("Secret.json"))
            .unwrap();

        let repository = CubeRepository::new(dir.path());
        let error = repository.load("Secret").unwrap_err();
        assert!(error.to_string().contains("outside the cube directory"));
    }
}

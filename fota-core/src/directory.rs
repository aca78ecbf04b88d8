//! Artifact directory: artifact name → file path, read once from the repository manifest.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Manifest file name inside the repository root.
pub const MANIFEST_FILE_NAME: &str = "repository.repo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub name: String,
    pub path: PathBuf,
}

/// Immutable after construction. Lookup order is manifest order.
#[derive(Debug, Clone, Default)]
pub struct ArtifactDirectory {
    entries: Vec<ArtifactEntry>,
}

impl ArtifactDirectory {
    /// Read `<root>/repository.repo`.
    pub fn load(root: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let root = root.as_ref();
        let manifest = root.join(MANIFEST_FILE_NAME);
        let text = std::fs::read_to_string(&manifest).map_err(|source| DirectoryError::Manifest {
            path: manifest.clone(),
            source,
        })?;
        Ok(Self::parse(root, &text))
    }

    /// Parse manifest lines `"<name> <relative-file>"`. The first occurrence of a name wins.
    pub fn parse(root: &Path, manifest: &str) -> Self {
        let mut entries: Vec<ArtifactEntry> = Vec::new();
        for (lineno, line) in manifest.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let Some((name, file)) = line.split_once(' ') else {
                warn!(line = lineno + 1, "manifest line has no file name, skipped");
                continue;
            };
            if name.is_empty() || file.is_empty() {
                warn!(line = lineno + 1, "manifest line has an empty field, skipped");
                continue;
            }
            if entries.iter().any(|e| e.name == name) {
                debug!(artifact = name, "duplicate manifest entry ignored");
                continue;
            }
            entries.push(ArtifactEntry {
                name: name.to_string(),
                path: root.join(file),
            });
        }
        Self { entries }
    }

    /// Exact-match lookup.
    pub fn resolve(&self, name: &str) -> Option<&Path> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.path.as_path())
    }

    pub fn entries(&self) -> &[ArtifactEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("cannot read manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_to_root() {
        let dir = ArtifactDirectory::parse(Path::new("/srv/fw"), "alpha a.bin\nbeta b.bin\n");
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.resolve("alpha"), Some(Path::new("/srv/fw/a.bin")));
        assert_eq!(dir.resolve("beta"), Some(Path::new("/srv/fw/b.bin")));
        assert_eq!(dir.resolve("gamma"), None);
        assert_eq!(dir.resolve("alph"), None);
    }

    #[test]
    fn first_occurrence_wins() {
        let dir = ArtifactDirectory::parse(Path::new("r"), "x first.bin\nx second.bin\n");
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.resolve("x"), Some(Path::new("r/first.bin")));
    }

    #[test]
    fn skips_blank_and_broken_lines() {
        let dir = ArtifactDirectory::parse(
            Path::new("r"),
            "\nlonely\r\nok ok.bin\r\n \n name-missing.bin\n",
        );
        assert_eq!(dir.entries().len(), 1);
        assert_eq!(dir.resolve("ok"), Some(Path::new("r/ok.bin")));
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let root = std::env::temp_dir().join(format!("fota-missing-{}", uuid::Uuid::new_v4()));
        assert!(matches!(
            ArtifactDirectory::load(&root),
            Err(DirectoryError::Manifest { .. })
        ));
    }
}

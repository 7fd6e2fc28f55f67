use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use tracing::debug;

use super::LoadError;

/// Where a family's resources live and how names map to files.
#[mockall::automock]
pub trait ResourceCatalog: Send + Sync {
    /// Candidate resource file names, lexicographically sorted.
    fn scan(&self) -> Result<Vec<String>, LoadError>;

    /// Maps a bare name or an absolute path to the file to load.
    fn resolve(&self, name_or_path: &str) -> Result<PathBuf, LoadError>;

    /// Human-readable description of the discovery convention.
    fn convention(&self) -> String;
}

/// Flat directory of files sharing one canonical extension.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dir: PathBuf,
    extension: String,
}

impl DirectoryCatalog {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
    }
}

impl ResourceCatalog for DirectoryCatalog {
    fn scan(&self) -> Result<Vec<String>, LoadError> {
        let io_error = |source: io::Error| LoadError::Io {
            path: self.dir.clone(),
            source,
        };

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "resource directory does not exist");
                return Ok(vec![]);
            }
            Err(e) => return Err(io_error(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_error)?.path();
            if !path.is_file() || !self.has_extension(&path) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn resolve(&self, name_or_path: &str) -> Result<PathBuf, LoadError> {
        let candidate = Path::new(name_or_path);
        if candidate.is_absolute() {
            return Ok(candidate.to_path_buf());
        }

        // Bare names only: no separators, no `..`.
        let mut components = candidate.components();
        let single_normal = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if name_or_path.trim().is_empty() || !single_normal {
            return Err(LoadError::InvalidName(name_or_path.to_string()));
        }

        let file_name = if self.has_extension(candidate) {
            name_or_path.to_string()
        } else {
            format!("{}.{}", name_or_path, self.extension)
        };
        Ok(self.dir.join(file_name))
    }

    fn convention(&self) -> String {
        format!("a *.{} file in {}", self.extension, self.dir.display())
    }
}

//! Reading and writing revision files.
//!
//! One TOML file per revision. Files are read in name order; the graph, not
//! the file order, decides execution order.

use super::unit::RevisionUnit;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extension of revision files.
pub const REVISION_EXTENSION: &str = "toml";

/// Errors reading or writing revision files.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Filesystem error.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not a valid revision.
    #[error("invalid revision file {path}: {source}")]
    Parse {
        /// File involved.
        path: PathBuf,
        /// Parser error.
        source: toml::de::Error,
    },

    /// The revision could not be rendered.
    #[error("cannot render revision {id}: {source}")]
    Render {
        /// Revision id.
        id: String,
        /// Serializer error.
        source: toml::ser::Error,
    },

    /// A file for this revision already exists.
    #[error("revision file {0} already exists")]
    AlreadyExists(PathBuf),
}

/// Parse a single revision from TOML text.
pub fn parse_revision(text: &str, path: &Path) -> Result<RevisionUnit, LoadError> {
    toml::from_str(text).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load every revision file in a directory.
pub fn load_dir(dir: &Path) -> Result<Vec<RevisionUnit>, LoadError> {
    let io = |source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io)?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext == REVISION_EXTENSION)
                    .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut units = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;
        units.push(parse_revision(&text, &path)?);
    }

    tracing::debug!(dir = %dir.display(), count = units.len(), "loaded revision files");
    Ok(units)
}

/// File name used for a revision.
pub fn revision_file_name(unit: &RevisionUnit) -> String {
    let slug: String = unit
        .message
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|part| !part.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("_");

    if slug.is_empty() {
        format!("{}.{}", unit.id, REVISION_EXTENSION)
    } else {
        format!("{}_{}.{}", unit.id, slug, REVISION_EXTENSION)
    }
}

/// Write a revision into `dir`, refusing to overwrite an existing file.
pub fn write_revision(dir: &Path, unit: &RevisionUnit) -> Result<PathBuf, LoadError> {
    let text = toml::to_string_pretty(unit).map_err(|source| LoadError::Render {
        id: unit.id.clone(),
        source,
    })?;

    std::fs::create_dir_all(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(revision_file_name(unit));
    if path.exists() {
        return Err(LoadError::AlreadyExists(path));
    }
    std::fs::write(&path, text).map_err(|source| LoadError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

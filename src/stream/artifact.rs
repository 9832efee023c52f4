//! On-disk stream artifacts
//!
//! Each artifact is one proxy configuration file for one allocated address.
//! The file starts with two marker lines that name the owning address and
//! service; everything after them is opaque payload:
//!
//! ```text
//! #flipbit realip <address>
//! #flipbit service <service key>
//! <payload>
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Marker prefix of the first line
pub const REALIP_MARKER: &str = "#flipbit realip ";

/// Marker prefix of the second line
pub const SERVICE_MARKER: &str = "#flipbit service ";

/// Extension of artifact files
pub const ARTIFACT_EXTENSION: &str = "conf";

/// Why a file is not a well-formed artifact
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("missing '{}' line", REALIP_MARKER.trim_end())]
    MissingAddress,

    #[error("missing '{}' line", SERVICE_MARKER.trim_end())]
    MissingService,

    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}

/// Errors reading or writing artifacts
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to list artifact directory {}: {source}", .dir.display())]
    List {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on artifact '{id}': {source}")]
    Io {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("Artifact '{id}' is not valid UTF-8")]
    NotUtf8 { id: String },
}

/// The two marker lines of an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub address: IpAddr,
    pub service: String,
}

impl ArtifactHeader {
    /// Parse the marker lines at the top of `content`
    pub fn parse(content: &str) -> Result<Self, HeaderError> {
        let mut lines = content.lines();

        let address = lines
            .next()
            .and_then(|line| marker_value(line, REALIP_MARKER))
            .ok_or(HeaderError::MissingAddress)?;
        let service = lines
            .next()
            .and_then(|line| marker_value(line, SERVICE_MARKER))
            .ok_or(HeaderError::MissingService)?;

        let address = address
            .parse()
            .map_err(|_| HeaderError::InvalidAddress(address.to_string()))?;

        Ok(Self {
            address,
            service: service.to_string(),
        })
    }
}

impl fmt::Display for ArtifactHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}{}", REALIP_MARKER, self.address)?;
        writeln!(f, "{}{}", SERVICE_MARKER, self.service)
    }
}

fn marker_value<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.strip_prefix(marker)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Check that a service key is safe to use as a file name and marker value
pub fn validate_service_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("service key is empty".to_string());
    }
    if key.starts_with('.') {
        return Err(format!("service key '{}' starts with '.'", key));
    }
    if let Some(c) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(format!("service key '{}' contains '{}'", key, c.escape_default()));
    }
    Ok(())
}

/// Artifact identifier (file name) for a newly allocated service
pub fn artifact_id(service_key: &str) -> String {
    format!("{}.{}", service_key, ARTIFACT_EXTENSION)
}

/// Storage for artifacts, addressed by identifier
pub trait ArtifactStore: Send + Sync {
    /// Identifiers of every stored artifact, sorted
    fn list(&self) -> Result<Vec<String>, ArtifactError>;

    fn read(&self, id: &str) -> Result<String, ArtifactError>;

    /// Create or replace an artifact
    fn write(&self, id: &str, content: &str) -> Result<(), ArtifactError>;

    /// Remove an artifact; removing a missing artifact succeeds
    fn remove(&self, id: &str) -> Result<(), ArtifactError>;
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over the artifact directory
// ============================================================================

/// Artifacts stored as files in one directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn io_error(id: &str, source: io::Error) -> ArtifactError {
        ArtifactError::Io {
            id: id.to_string(),
            source,
        }
    }
}

impl ArtifactStore for DirectoryStore {
    fn list(&self) -> Result<Vec<String>, ArtifactError> {
        let list_error = |source| ArtifactError::List {
            dir: self.dir.clone(),
            source,
        };

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(list_error)? {
            let entry = entry.map_err(list_error)?;
            if !entry.file_type().map_err(list_error)?.is_file() {
                continue;
            }
            // Hidden files are in-flight writes or not ours.
            match entry.file_name().into_string() {
                Ok(name) if !name.starts_with('.') => ids.push(name),
                Ok(_) => {}
                Err(name) => debug!(file = ?name, "Ignoring non UTF-8 file name"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read(&self, id: &str) -> Result<String, ArtifactError> {
        let bytes = fs::read(self.path(id)).map_err(|e| Self::io_error(id, e))?;
        String::from_utf8(bytes).map_err(|_| ArtifactError::NotUtf8 { id: id.to_string() })
    }

    fn write(&self, id: &str, content: &str) -> Result<(), ArtifactError> {
        let staging = self.path(&format!(".{}.tmp", id));
        let result = fs::write(&staging, content).and_then(|_| fs::rename(&staging, self.path(id)));
        if result.is_err() {
            let _ = fs::remove_file(&staging);
        }
        result.map_err(|e| Self::io_error(id, e))
    }

    fn remove(&self, id: &str) -> Result<(), ArtifactError> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(id, e)),
        }
    }
}

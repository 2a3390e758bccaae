use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolbeltError>;

#[derive(Error, Debug)]
pub enum ToolbeltError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed archive: {source}")]
    MalformedArchive {
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported entry type '{kind}' in file {path}")]
    UnsupportedEntry { kind: char, path: String },

    #[error("Unsafe path in archive: {path}")]
    UnsafePath { path: String },

    #[error("Download failed: {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to set up the HTTP client: {source}")]
    HttpClient {
        #[source]
        source: reqwest::Error,
    },

    #[error("Download interrupted: {url}: {source}")]
    Transfer {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}")]
    Exit {
        command: String,
        status: ExitStatus,
        output: Option<String>,
    },

    #[error("Failed to kill '{command}': {source}")]
    Kill {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolbeltError {
    /// Returns a mapper that tags an I/O error with the path it happened on.
    pub fn filesystem(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| ToolbeltError::Filesystem {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn malformed(source: std::io::Error) -> Self {
        ToolbeltError::MalformedArchive { source }
    }

    pub fn spawn<S: Into<String>>(command: S) -> impl FnOnce(std::io::Error) -> Self {
        let command = command.into();
        move |source| ToolbeltError::Spawn { command, source }
    }

    /// Captured output of a failed `run_captured` call.
    pub fn output(&self) -> Option<&str> {
        match self {
            ToolbeltError::Exit {
                output: Some(output),
                ..
            } => Some(output),
            _ => None,
        }
    }

    /// Exit status of a process that ran to completion but failed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            ToolbeltError::Exit { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_entry_message() {
        let err = ToolbeltError::UnsupportedEntry {
            kind: '2',
            path: "link".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported entry type '2' in file link"
        );
    }

    #[test]
    fn test_filesystem_mapper_keeps_path() {
        let path = Path::new("/nonexistent/file");
        let err = ToolbeltError::filesystem(path)(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        ));
        match err {
            ToolbeltError::Filesystem { path: p, source } => {
                assert_eq!(p, PathBuf::from("/nonexistent/file"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(ToolbeltError::malformed(std::io::Error::other("bad"))
            .output()
            .is_none());
    }
}

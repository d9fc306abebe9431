//! Artifact resolution for components with a `storage_uri`.

use std::path::PathBuf;

use crate::dispatch::ComponentFailure;

/// Turns a storage URI into a local path.
pub trait ArtifactSource: Send + Sync {
    fn download(&self, uri: &str) -> Result<PathBuf, ComponentFailure>;
}

/// Resolves `file://` URIs and plain paths. Remote schemes are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalArtifacts;

impl ArtifactSource for LocalArtifacts {
    fn download(&self, uri: &str) -> Result<PathBuf, ComponentFailure> {
        let path = match uri.split_once("://") {
            Some(("file", rest)) => PathBuf::from(rest),
            Some((scheme, _)) => {
                return Err(ComponentFailure::new(format!(
                    "unsupported storage scheme '{scheme}' in '{uri}'"
                )));
            }
            None => PathBuf::from(uri),
        };
        if path.exists() {
            Ok(path)
        } else {
            Err(ComponentFailure::new(format!(
                "artifact not found: {}",
                path.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("state.json");
        std::fs::write(&file, "[]").unwrap();

        let plain = file.to_str().unwrap();
        assert_eq!(LocalArtifacts.download(plain).unwrap(), file);
        assert_eq!(LocalArtifacts.download(&format!("file://{plain}")).unwrap(), file);
    }

    #[test]
    fn test_remote_and_missing_rejected() {
        let err = LocalArtifacts.download("s3://bucket/model").unwrap_err();
        assert!(err.message.contains("s3"));
        assert!(LocalArtifacts.download("/definitely/not/here").is_err());
    }
}

//! File deployment and removal against a remote filesystem.
//!
//! Both operations act and then verify: a deploy is only reported as done
//! once every written file is visible on the target, a removal once none of
//! the named files is.

use std::io;

use relay_core::model::FileEntry;
use serde::Serialize;
use thiserror::Error;

/// The handful of remote filesystem calls the executor needs.
pub trait RemoteFs {
    /// `mkdir -p`.
    fn ensure_dir(&mut self, path: &str) -> io::Result<()>;

    /// Creates or truncates `path`.
    fn write_file(&mut self, path: &str, content: &[u8]) -> io::Result<()>;

    fn exists(&mut self, path: &str) -> io::Result<bool>;

    /// Returns `false` when there was nothing to delete.
    fn remove_file(&mut self, path: &str) -> io::Result<bool>;
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
    #[error("cannot create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot delete {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot verify {path}: {source}")]
    Verify {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("files missing after deploy: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("files still present after removal: {}", .0.join(", "))]
    StillPresent(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub target_path: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveReport {
    pub target_path: String,
    pub removed: Vec<String>,
    pub already_absent: Vec<String>,
}

/// A bare file name: no separators, not `.` or `..`.
pub fn validate_file_name(name: &str) -> Result<(), DeployError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(DeployError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

/// `<target_path><file_name>`, inserting the `/` when the target lacks one.
pub fn remote_path(target_path: &str, file_name: &str) -> String {
    if target_path.is_empty() || target_path.ends_with('/') {
        format!("{target_path}{file_name}")
    } else {
        format!("{target_path}/{file_name}")
    }
}

pub fn deploy_files(
    fs: &mut dyn RemoteFs,
    target_path: &str,
    files: &[FileEntry],
) -> Result<DeployReport, DeployError> {
    for f in files {
        validate_file_name(&f.name)?;
    }

    fs.ensure_dir(target_path).map_err(|source| DeployError::CreateDir {
        path: target_path.to_string(),
        source,
    })?;

    for f in files {
        let path = remote_path(target_path, &f.name);
        tracing::debug!(path = %path, bytes = f.content.len(), "writing file");
        fs.write_file(&path, f.content.as_bytes())
            .map_err(|source| DeployError::Write { path, source })?;
    }

    let mut missing = Vec::new();
    for f in files {
        let path = remote_path(target_path, &f.name);
        match fs.exists(&path) {
            Ok(true) => {}
            Ok(false) => missing.push(path),
            Err(source) => return Err(DeployError::Verify { path, source }),
        }
    }
    if !missing.is_empty() {
        return Err(DeployError::Missing(missing));
    }

    Ok(DeployReport {
        target_path: target_path.to_string(),
        files: files.iter().map(|f| f.name.clone()).collect(),
    })
}

pub fn remove_files(
    fs: &mut dyn RemoteFs,
    target_path: &str,
    file_names: &[String],
) -> Result<RemoveReport, DeployError> {
    for name in file_names {
        validate_file_name(name)?;
    }

    let mut removed = Vec::new();
    let mut already_absent = Vec::new();
    for name in file_names {
        let path = remote_path(target_path, name);
        match fs.remove_file(&path) {
            Ok(true) => removed.push(name.clone()),
            Ok(false) => already_absent.push(name.clone()),
            Err(source) => return Err(DeployError::Remove { path, source }),
        }
    }

    let mut still_present = Vec::new();
    for name in file_names {
        let path = remote_path(target_path, name);
        match fs.exists(&path) {
            Ok(false) => {}
            Ok(true) => still_present.push(path),
            Err(source) => return Err(DeployError::Verify { path, source }),
        }
    }
    if !still_present.is_empty() {
        return Err(DeployError::StillPresent(still_present));
    }

    Ok(RemoveReport {
        target_path: target_path.to_string(),
        removed,
        already_absent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    /// In-memory filesystem with switchable faults.
    #[derive(Default)]
    struct FakeFs {
        dirs: BTreeSet<String>,
        files: BTreeMap<String, Vec<u8>>,
        fail_write: Option<String>,
        drop_writes: bool,
        sticky: bool,
        ops: Vec<String>,
    }

    impl RemoteFs for FakeFs {
        fn ensure_dir(&mut self, path: &str) -> io::Result<()> {
            self.ops.push(format!("mkdir {path}"));
            self.dirs.insert(path.trim_end_matches('/').to_string());
            Ok(())
        }

        fn write_file(&mut self, path: &str, content: &[u8]) -> io::Result<()> {
            self.ops.push(format!("write {path}"));
            if self.fail_write.as_deref() == Some(path) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"));
            }
            if !self.drop_writes {
                self.files.insert(path.to_string(), content.to_vec());
            }
            Ok(())
        }

        fn exists(&mut self, path: &str) -> io::Result<bool> {
            Ok(self.files.contains_key(path))
        }

        fn remove_file(&mut self, path: &str) -> io::Result<bool> {
            self.ops.push(format!("rm {path}"));
            if self.sticky {
                return Ok(self.files.contains_key(path));
            }
            Ok(self.files.remove(path).is_some())
        }
    }

    fn file(name: &str, content: &str) -> FileEntry {
        FileEntry {
            name: name.into(),
            content: content.into(),
        }
    }

    #[test]
    fn test_remote_path_inserts_separator() {
        assert_eq!(remote_path("/etc/asterisk/", "a.conf"), "/etc/asterisk/a.conf");
        assert_eq!(remote_path("/etc/asterisk", "a.conf"), "/etc/asterisk/a.conf");
    }

    #[test]
    fn test_file_names_must_stay_in_target_dir() {
        for bad in ["", ".", "..", "../passwd", "a/b", "a\\b"] {
            assert!(
                matches!(validate_file_name(bad), Err(DeployError::InvalidFileName(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_file_name("extensions_custom.conf").is_ok());
        assert!(validate_file_name(".hidden").is_ok());
    }

    #[test]
    fn test_deploy_creates_dir_writes_and_verifies() {
        let mut fs = FakeFs::default();
        let report = deploy_files(
            &mut fs,
            "/etc/asterisk",
            &[file("a.conf", "[a]"), file("b.conf", "[b]")],
        )
        .unwrap();

        assert_eq!(report.files, vec!["a.conf", "b.conf"]);
        assert!(fs.dirs.contains("/etc/asterisk"));
        assert_eq!(fs.files["/etc/asterisk/a.conf"], b"[a]");
        assert_eq!(fs.ops[0], "mkdir /etc/asterisk");
    }

    #[test]
    fn test_deploy_aborts_on_first_write_failure() {
        let mut fs = FakeFs {
            fail_write: Some("/srv/a.conf".into()),
            ..Default::default()
        };
        let err = deploy_files(&mut fs, "/srv/", &[file("a.conf", "x"), file("b.conf", "y")]).unwrap_err();
        assert!(matches!(err, DeployError::Write { ref path, .. } if path == "/srv/a.conf"));
        assert!(!fs.ops.contains(&"write /srv/b.conf".to_string()));
    }

    #[test]
    fn test_deploy_reports_files_missing_after_write() {
        let mut fs = FakeFs {
            drop_writes: true,
            ..Default::default()
        };
        let err = deploy_files(&mut fs, "/srv/", &[file("a.conf", "x")]).unwrap_err();
        assert!(matches!(err, DeployError::Missing(ref p) if p == &["/srv/a.conf".to_string()]));
    }

    #[test]
    fn test_invalid_name_rejected_before_any_io() {
        let mut fs = FakeFs::default();
        let err = deploy_files(&mut fs, "/srv/", &[file("ok.conf", "x"), file("../evil", "y")]).unwrap_err();
        assert!(matches!(err, DeployError::InvalidFileName(_)));
        assert!(fs.ops.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut fs = FakeFs::default();
        fs.files.insert("/srv/a.conf".into(), b"x".to_vec());

        let report = remove_files(&mut fs, "/srv", &["a.conf".into(), "gone.conf".into()]).unwrap();
        assert_eq!(report.removed, vec!["a.conf"]);
        assert_eq!(report.already_absent, vec!["gone.conf"]);

        let again = remove_files(&mut fs, "/srv", &["a.conf".into()]).unwrap();
        assert!(again.removed.is_empty());
        assert_eq!(again.already_absent, vec!["a.conf"]);
    }

    #[test]
    fn test_remove_fails_when_file_survives() {
        let mut fs = FakeFs {
            sticky: true,
            ..Default::default()
        };
        fs.files.insert("/srv/a.conf".into(), b"x".to_vec());
        let err = remove_files(&mut fs, "/srv/", &["a.conf".into()]).unwrap_err();
        assert!(matches!(err, DeployError::StillPresent(_)));
    }
}

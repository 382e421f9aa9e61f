use std::{
    borrow::Cow,
    io::{self, Write},
    path::Path,
    process,
};

/// Publishes the current PID at `path`, atomically.
///
/// The decimal PID is written to a temporary file next to the target, then
/// renamed over it, so a reader never observes a partial write. A bare file
/// name is resolved against `fallback_dir` (the initial working directory)
/// rather than whatever the process has since chdir'd to; the temp file
/// lands in the same directory either way, keeping the rename on one
/// filesystem. The temp file is removed if anything fails.
pub(crate) fn write_pid_file(path: &Path, fallback_dir: &Path) -> io::Result<()> {
    let target: Cow<'_, Path> = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Cow::Borrowed(path),
        _ => Cow::Owned(fallback_dir.join(path)),
    };
    let dir = target.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "pid file path has no directory")
    })?;

    let tmp = tempfile::Builder::new().tempfile_in(dir)?;
    tmp.as_file()
        .write_all(process::id().to_string().as_bytes())?;
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn publishes_the_decimal_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        write_pid_file(&path, dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            process::id().to_string()
        );
    }

    #[test]
    fn replaces_previous_content_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        fs::write(&path, "99999999").unwrap();

        write_pid_file(&path, dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            process::id().to_string()
        );
    }

    #[test]
    fn bare_names_resolve_against_the_fallback_dir() {
        let dir = tempfile::tempdir().unwrap();

        write_pid_file(Path::new("daemon.pid"), dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("daemon.pid")).unwrap(),
            process::id().to_string()
        );
    }

    #[test]
    fn leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        write_pid_file(&path, dir.path()).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Makes `path` absolute against `base` unless it already is.
pub fn resolve_path(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Path of `path` relative to `base`, or `path` unchanged when it lies
/// outside `base`.
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Creates an empty work directory, removing whatever a previous run left.
pub fn prepare_work_dir(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}

/// Creates `path` (and parents) as an empty file unless it already exists.
pub fn touch(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Directory name safe for a sample id: path separators and whitespace
/// become underscores.
pub fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_to() {
        let base = Path::new("/out");
        assert_eq!(relative_to(Path::new("/out/S1/fastqc"), base), PathBuf::from("S1/fastqc"));
        assert_eq!(relative_to(Path::new("/elsewhere/x"), base), PathBuf::from("/elsewhere/x"));
    }

    #[test]
    fn test_prepare_work_dir_clears() -> io::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("job");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("stale.txt"), b"old")?;
        prepare_work_dir(&dir)?;
        assert!(dir.is_dir());
        assert!(!dir.join("stale.txt").exists());
        Ok(())
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("a b/c"), "a_b_c");
    }
}

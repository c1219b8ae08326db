use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use anyhow::{Context, Result, bail};

/// Resolve a repo-relative path from configuration and make sure it names an
/// existing file that stays inside `root`, symlinks included.
pub fn existing_file_under_root(root: &Utf8Path, candidate: &Utf8Path) -> Result<Utf8PathBuf> {
    if candidate.is_absolute() {
        bail!("absolute paths are not allowed: {candidate}");
    }
    if candidate
        .components()
        .any(|c| matches!(c, Utf8Component::ParentDir))
    {
        bail!("path must not contain `..`: {candidate}");
    }

    let canon_root = root
        .canonicalize_utf8()
        .with_context(|| format!("failed to canonicalize {root}"))?;
    let joined = canon_root.join(candidate);
    let canon = joined
        .canonicalize_utf8()
        .with_context(|| format!("{joined} does not exist"))?;
    if !canon.starts_with(&canon_root) {
        bail!("path escapes root ({canon_root}): {canon}");
    }
    if !canon.is_file() {
        bail!("{canon} is not a file");
    }
    Ok(canon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    #[test]
    fn accepts_files_inside_root() {
        let temp = tempdir().unwrap();
        let root = utf8(temp.path());
        fs::create_dir_all(root.join("infra/modules")).unwrap();
        fs::write(root.join("infra/modules/main.tf"), "").unwrap();

        let resolved =
            existing_file_under_root(&root, Utf8Path::new("infra/modules/main.tf")).unwrap();
        assert!(resolved.ends_with("infra/modules/main.tf"));
    }

    #[test]
    fn rejects_escapes_and_missing_files() {
        let temp = tempdir().unwrap();
        let root = utf8(temp.path());
        fs::create_dir_all(root.join("dir")).unwrap();

        assert!(existing_file_under_root(&root, Utf8Path::new("/etc/passwd")).is_err());
        assert!(existing_file_under_root(&root, Utf8Path::new("../outside.tf")).is_err());
        assert!(existing_file_under_root(&root, Utf8Path::new("missing.tf")).is_err());
        assert!(existing_file_under_root(&root, Utf8Path::new("dir")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinks_leaving_root() {
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.tf"), "").unwrap();
        let temp = tempdir().unwrap();
        let root = utf8(temp.path());
        std::os::unix::fs::symlink(outside.path().join("secret.tf"), root.join("link.tf"))
            .unwrap();

        assert!(existing_file_under_root(&root, Utf8Path::new("link.tf")).is_err());
    }
}

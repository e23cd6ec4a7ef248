use crate::manifest::ManifestError;
use std::path::{Component, Path};

/// Package names must be 1-64 characters of `[a-z0-9._+-]`, starting alphanumeric.
pub fn validate_package_name(name: &str) -> Result<(), ManifestError> {
    if name.is_empty() {
        return Err(ManifestError::EmptyName);
    }
    let starts_ok = name
        .bytes()
        .next()
        .is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let chars_ok = name.bytes().all(|b| {
        b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.' | b'+')
    });
    if name.len() > 64 || !starts_ok || !chars_ok {
        return Err(ManifestError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// An install source must stay inside the extracted archive.
pub(crate) fn validate_source_path(index: usize, path: &str) -> Result<(), ManifestError> {
    let unsafe_path = || ManifestError::UnsafeSourcePath {
        index,
        path: path.to_owned(),
    };
    if path.trim().is_empty() {
        return Err(unsafe_path());
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path());
            }
        }
    }
    Ok(())
}

/// A rename target is a bare file name.
pub(crate) fn validate_rename(index: usize, rename: &str) -> Result<(), ManifestError> {
    if rename.is_empty() || rename == "." || rename == ".." || rename.contains(['/', '\\']) {
        return Err(ManifestError::InvalidRename {
            index,
            rename: rename.to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_formula_style_names() {
        for name in ["git-web", "git-repos", "python3.12", "gtk+3", "a"] {
            assert!(validate_package_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_bad_names() {
        assert!(matches!(
            validate_package_name(""),
            Err(ManifestError::EmptyName)
        ));
        let long = "x".repeat(65);
        let bad = ["Git-Web", "-lead", "has space", "a/b", "foo@1", "../evil"];
        for name in bad.into_iter().chain([long.as_str()]) {
            assert!(validate_package_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn source_paths_stay_relative() {
        assert!(validate_source_path(0, "git-repos").is_ok());
        assert!(validate_source_path(0, "./contrib/cr.sh").is_ok());
        assert!(validate_source_path(0, "../escape").is_err());
        assert!(validate_source_path(0, "a/../../b").is_err());
        assert!(validate_source_path(0, "/etc/passwd").is_err());
        assert!(validate_source_path(0, "  ").is_err());
    }

    #[test]
    fn rename_is_a_file_name() {
        assert!(validate_rename(0, "git-cr").is_ok());
        assert!(validate_rename(0, "bin/git-cr").is_err());
        assert!(validate_rename(0, "..").is_err());
        assert!(validate_rename(0, "").is_err());
    }
}

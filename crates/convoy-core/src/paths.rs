//! Path normalization and destination-naming rules.
//!
//! The external tool treats a trailing separator as "copy the directory's
//! contents", so every source/destination we hand it is normalized here and
//! nowhere else.

/// Ensure the path carries exactly one trailing separator.
pub fn normalize_folder_path(path: &str) -> String {
    let mut normalized = path.trim_end_matches('/').to_string();
    normalized.push('/');
    normalized
}

/// Strip any trailing separator. The filesystem root stays `/`.
pub fn strip_trailing_slash(path: &str) -> &str {
    let stripped = path.trim_end_matches('/');
    if stripped.is_empty() && path.starts_with('/') {
        "/"
    } else {
        stripped
    }
}

/// Last path component of `path`, ignoring a trailing separator.
pub fn folder_name(path: &str) -> &str {
    strip_trailing_slash(path).rsplit('/').next().unwrap_or("")
}

/// Compute the destination for mirroring a folder named `source_folder_name`
/// into `chosen_target`.
///
/// If the user already picked a directory with the same name as the source
/// folder, mirror into it directly; otherwise nest a new component under the
/// chosen target. Either way the result keeps the source folder from being
/// nested twice (`.../Photos/Photos/`).
pub fn folder_pair_destination(chosen_target: &str, source_folder_name: &str) -> String {
    let base = strip_trailing_slash(chosen_target);
    if folder_name(base) == source_folder_name {
        normalize_folder_path(base)
    } else if base == "/" {
        format!("/{source_folder_name}/")
    } else {
        format!("{base}/{source_folder_name}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_appends_single_separator() {
        assert_eq!(normalize_folder_path("/Volumes/Backup"), "/Volumes/Backup/");
        assert_eq!(normalize_folder_path("/Volumes/Backup/"), "/Volumes/Backup/");
        assert_eq!(normalize_folder_path("/Volumes/Backup//"), "/Volumes/Backup/");
    }

    #[test]
    fn strip_keeps_root() {
        assert_eq!(strip_trailing_slash("/Volumes/Backup/"), "/Volumes/Backup");
        assert_eq!(strip_trailing_slash("/"), "/");
    }

    #[test]
    fn destination_nests_under_parent_directory() {
        assert_eq!(
            folder_pair_destination("/Volumes/Backup", "Photos"),
            "/Volumes/Backup/Photos/"
        );
    }

    #[test]
    fn destination_reuses_matching_target() {
        assert_eq!(
            folder_pair_destination("/Volumes/Backup/Photos", "Photos"),
            "/Volumes/Backup/Photos/"
        );
        assert_eq!(
            folder_pair_destination("/Volumes/Backup/Photos/", "Photos"),
            "/Volumes/Backup/Photos/"
        );
    }

    #[test]
    fn destination_handles_root_target() {
        assert_eq!(folder_pair_destination("/", "Photos"), "/Photos/");
    }
}

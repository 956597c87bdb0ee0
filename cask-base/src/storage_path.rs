use std::path::{Path, PathBuf};

/// Suffix appended to a bundle's final path while it is being downloaded
pub const DOWNLOAD_TEMP_SUFFIX: &str = ".downloading";

/// Converts a bundle name to the file name used in storage and on the download server, always
/// with forward slashes. When `append_hash` is set the content hash is appended to the file stem.
/// Example: textures/ui.bundle -> textures/ui_5f2ca9d1.bundle
pub fn bundle_relative_file_name(
    bundle_name: &str,
    hash: &str,
    append_hash: bool,
) -> String {
    let bundle_name = bundle_name.replace('\\', "/");
    if !append_hash || hash.is_empty() {
        return bundle_name;
    }

    let (directory, file_name) = match bundle_name.rfind('/') {
        Some(split) => (&bundle_name[..=split], &bundle_name[split + 1..]),
        None => ("", bundle_name.as_str()),
    };

    match file_name.rfind('.') {
        Some(extension_begin) if extension_begin > 0 => format!(
            "{}{}_{}{}",
            directory,
            &file_name[..extension_begin],
            hash,
            &file_name[extension_begin..]
        ),
        _ => format!("{}{}_{}", directory, file_name, hash),
    }
}

/// Converts a bundle name to a path starting at the given root
/// Example: [root]/textures/ui.bundle
pub fn bundle_file_path(
    root: &Path,
    bundle_name: &str,
    hash: &str,
    append_hash: bool,
) -> PathBuf {
    let relative = bundle_relative_file_name(bundle_name, hash, append_hash);
    let mut path = root.to_path_buf();
    for segment in relative.split('/').filter(|x| !x.is_empty() && *x != ".") {
        path.push(segment);
    }
    path
}

/// The sibling temp file a download writes into before it is verified and published
/// Example: [root]/textures/ui.bundle.downloading
pub fn download_temp_path(final_path: &Path) -> PathBuf {
    let mut file_name = final_path
        .file_name()
        .map(|x| x.to_os_string())
        .unwrap_or_default();
    file_name.push(DOWNLOAD_TEMP_SUFFIX);
    final_path.with_file_name(file_name)
}

pub fn is_download_temp(path: &Path) -> bool {
    path.file_name()
        .map(|x| x.to_string_lossy().ends_with(DOWNLOAD_TEMP_SUFFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_appended_to_stem() {
        assert_eq!(
            bundle_relative_file_name("textures/ui.bundle", "abc", true),
            "textures/ui_abc.bundle"
        );
        assert_eq!(bundle_relative_file_name("shaders", "abc", true), "shaders_abc");
        assert_eq!(
            bundle_relative_file_name("textures/ui.bundle", "abc", false),
            "textures/ui.bundle"
        );
        assert_eq!(
            bundle_relative_file_name("maps\\level.scene", "", true),
            "maps/level.scene"
        );
    }

    #[test]
    fn file_path_is_rooted() {
        let root = Path::new("/data/rw");
        assert_eq!(
            bundle_file_path(root, "textures/ui.bundle", "abc", false),
            root.join("textures").join("ui.bundle")
        );
    }

    #[test]
    fn temp_path_is_sibling() {
        let path = Path::new("/data/rw/textures/ui.bundle");
        let temp = download_temp_path(path);
        assert_eq!(temp, Path::new("/data/rw/textures/ui.bundle.downloading"));
        assert!(is_download_temp(&temp));
        assert!(!is_download_temp(path));
    }
}

use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::ZipArchive;

pub fn extract_zip<R: Read + Seek>(data: R, dest: &Path) -> anyhow::Result<()> {
    let mut archive = ZipArchive::new(data)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;

        // Entries escaping the destination are skipped
        let file_path = match file.enclosed_name() {
            Some(path) => path.to_owned(),
            None => continue,
        };

        let outpath = dest.join(&file_path);

        if file.name().ends_with('/') {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = std::fs::File::create(&outpath)?;
            std::io::copy(&mut file, &mut outfile)?;
        }
    }

    Ok(())
}

/// Files under `dir` whose name ends with one of `extensions`
/// (case-insensitive), sorted by path.
pub fn find_source_files(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            extensions
                .iter()
                .any(|ext| name.ends_with(&ext.to_lowercase()))
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// `core` or `core.<pid>`
pub fn is_core_dump(name: &str) -> bool {
    match name.strip_prefix("core") {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('.')
            .is_some_and(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

/// First core dump in the top level of `dir`
pub fn find_core_dump(dir: &Path) -> Option<PathBuf> {
    let mut dumps: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| is_core_dump(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect();
    dumps.sort();
    dumps.into_iter().next()
}

/// Keeps valid UTF-8 and drops control characters other than tab and line breaks
pub fn clear_unicode(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.extend(
            chunk
                .valid()
                .chars()
                .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t')),
        );
    }
    text
}

/// Strips `<base>/` from every occurrence in `text`
pub fn remove_base_path(text: &str, base: &Path) -> String {
    let prefix = format!("{}/", base.display());
    text.replace(&prefix, "")
}

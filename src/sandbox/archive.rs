use crate::error::{KodoError, Result};
use std::path::Path;

/// A single-entry tar archive ready to be unpacked at `dest_dir`.
#[derive(Debug, Clone)]
pub struct PackedArchive {
    pub dest_dir: String,
    pub entry_name: String,
    pub bytes: Vec<u8>,
}

/// Split a destination path into its parent directory and final component.
pub fn split_destination(dest: &str) -> Result<(String, String)> {
    let path = Path::new(dest);
    let entry = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| KodoError::InvalidOption {
            option: "destination".to_string(),
            reason: format!("'{}' has no final path component", dest),
        })?;
    let parent = match path.parent().and_then(|p| p.to_str()) {
        Some("") | None => ".",
        Some(parent) => parent,
    };
    Ok((parent.to_string(), entry.to_string()))
}

/// Pack `src` (file or directory) in memory under the destination's base name.
pub fn pack(src: &Path, dest: &str) -> Result<PackedArchive> {
    let (dest_dir, entry_name) = split_destination(dest)?;

    let mut builder = tar::Builder::new(Vec::new());
    if src.is_dir() {
        builder.append_dir_all(&entry_name, src)?;
    } else {
        builder.append_path_with_name(src, &entry_name)?;
    }
    let bytes = builder.into_inner()?;

    Ok(PackedArchive {
        dest_dir,
        entry_name,
        bytes,
    })
}

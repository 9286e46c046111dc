//! Linking downloaded mod content into the server's search paths.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// How a mod ended up in a search path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMethod {
    Symlink,
    /// Linking unsupported, content copied
    Copy,
    /// Already in place, left untouched
    Existing,
}

/// Path of `target` as seen from the directory `from`.
///
/// Links must stay valid when the install dir is bind-mounted elsewhere, so
/// targets are relative whenever both paths share a root. Paths are compared
/// lexically; mixing absolute and relative inputs returns `target` as is.
pub fn relative_to(target: &Path, from: &Path) -> PathBuf {
    if target.is_absolute() != from.is_absolute() {
        return target.to_path_buf();
    }
    let target_parts: Vec<Component> = target.components().collect();
    let from_parts: Vec<Component> = from.components().collect();

    let common = target_parts
        .iter()
        .zip(from_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    // Different drives
    if target.is_absolute() && common == 0 {
        return target.to_path_buf();
    }

    let mut relative = PathBuf::new();
    for _ in &from_parts[common..] {
        relative.push("..");
    }
    for component in &target_parts[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

/// Symlink target for `link` pointing at `content`.
fn link_target(content: &Path, link: &Path) -> PathBuf {
    match link.parent() {
        Some(parent) => relative_to(content, parent),
        None => content.to_path_buf(),
    }
}

/// Whether `link` already provides `content`.
fn is_in_place(content: &Path, link: &Path) -> bool {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::read_link(link).is_ok_and(|target| target == link_target(content, link))
        }
        Ok(meta) => meta.is_dir(),
        Err(_) => false,
    }
}

fn remove_existing(link: &Path) -> io::Result<()> {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(link),
        Ok(_) => fs::remove_file(link),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink_dir(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks unsupported"))
}

/// Recursively copy a directory tree.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Place `content` at `link`, preferring a symlink and falling back to a copy.
///
/// Without `force`, a link that already provides the content is left alone.
pub fn link_mod(content: &Path, link: &Path, force: bool) -> io::Result<LinkMethod> {
    if !force && is_in_place(content, link) {
        return Ok(LinkMethod::Existing);
    }

    remove_existing(link)?;
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }

    let target = link_target(content, link);
    match symlink_dir(&target, link) {
        Ok(()) => {
            debug!("Linked {:?} -> {:?}", link, target);
            Ok(LinkMethod::Symlink)
        }
        Err(e) => {
            warn!("Symlink {:?} failed ({}), copying instead", link, e);
            copy_dir_all(content, link)?;
            Ok(LinkMethod::Copy)
        }
    }
}

/// Link one mod into every search directory. Returns the link paths.
pub fn link_into_search_paths(
    content: &Path,
    install_dir: &Path,
    search_dirs: &[PathBuf],
    mod_id: u64,
    force: bool,
) -> io::Result<Vec<(PathBuf, LinkMethod)>> {
    search_dirs
        .iter()
        .map(|dir| {
            let link = install_dir.join(dir).join(mod_id.to_string());
            link_mod(content, &link, force).map(|method| (link, method))
        })
        .collect()
}

/// Whether every search path already provides the mod.
pub fn is_fully_linked(
    content: &Path,
    install_dir: &Path,
    search_dirs: &[PathBuf],
    mod_id: u64,
) -> bool {
    search_dirs
        .iter()
        .all(|dir| is_in_place(content, &install_dir.join(dir).join(mod_id.to_string())))
}

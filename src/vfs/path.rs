//! Path strings and resolution of paths to vnodes.

use std::sync::Arc;

use libc::{ENAMETOOLONG, ENOENT, ENOTDIR};

use crate::{
    error::Result,
    vfs::{IoContext, NAME_MAX, PATH_MAX, Vnode},
};

/// Rejects empty paths and paths or components that are too long.
pub fn check_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(ENOENT);
    }
    if path.len() > PATH_MAX {
        return Err(ENAMETOOLONG);
    }
    if path.split('/').any(|name| name.len() > NAME_MAX) {
        return Err(ENAMETOOLONG);
    }
    Ok(())
}

/// Splits a path into its directory and last component.
///
/// Trailing slashes are ignored. A path without a slash lives in `.`.
pub fn split_dir_name(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.starts_with('/') { ("/", ".") } else { (".", ".") };
    }
    match trimmed.rfind('/') {
        Some(i) => {
            let dir = trimmed[..i].trim_end_matches('/');
            let dir = if dir.is_empty() { "/" } else { dir };
            (dir, &trimmed[i + 1..])
        }
        None => (".", trimmed),
    }
}

/// Joins `path` onto `base`. An absolute `path` replaces `base`.
pub fn paths_cat(base: &str, path: &str) -> String {
    if path.starts_with('/') || base.is_empty() {
        return path.to_owned();
    }
    if path.is_empty() {
        return base.to_owned();
    }
    let base = base.trim_end_matches('/');
    format!("{base}/{path}")
}

/// Normalises `.` and `..` components and repeated slashes of an absolute path.
///
/// `..` at the root stays at the root.
pub fn resolve_dotdirs(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for name in path.split('/') {
        match name {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(name),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Follows mounts stacked on `vnode` down to the root of the topmost one.
fn cross_mounts(mut vnode: Arc<Vnode>) -> Result<Arc<Vnode>> {
    while let Some(mount) = vnode.covered_by() {
        vnode = mount.root()?;
    }
    Ok(vnode)
}

/// Steps from `vnode` to its parent directory.
fn parent_of(vnode: Arc<Vnode>, root: &Arc<Vnode>) -> Result<Arc<Vnode>> {
    let mut cur = vnode;
    loop {
        if Arc::ptr_eq(&cur, root) {
            return Ok(cur);
        }
        if !cur.is_mount_root() {
            break;
        }
        match cur.mount().mount_point() {
            Some(mount_point) => cur = mount_point,
            None => return Ok(cur),
        }
    }
    cur.lookup("..")
}

/// Walks `path` from `start`, never climbing above `root`. A trailing `/` requires a directory.
fn walk(root: &Arc<Vnode>, start: Arc<Vnode>, path: &str) -> Result<Arc<Vnode>> {
    let mut cur = cross_mounts(start)?;
    for name in path.split('/').filter(|name| !name.is_empty()) {
        if !cur.mode().is_dir() {
            return Err(ENOTDIR);
        }
        cur = match name {
            "." => continue,
            ".." => parent_of(cur, root)?,
            _ => cur.lookup(name)?,
        };
        cur = cross_mounts(cur)?;
    }
    if path.ends_with('/') && !cur.mode().is_dir() {
        return Err(ENOTDIR);
    }
    Ok(cur)
}

impl IoContext {
    /// Resolves `path` to a vnode, starting at the root for absolute paths and at the working
    /// directory otherwise.
    pub fn path_to_vnode(&self, path: &str) -> Result<Arc<Vnode>> {
        check_path(path)?;
        let (root, cwd) = self.root_and_cwd()?;
        let start = if path.starts_with('/') { root.clone() } else { cwd };
        walk(&root, start, path)
    }

    /// Resolves the directory of `path`, returning it with the last path component.
    pub fn path_to_dir_vnode(&self, path: &str) -> Result<(Arc<Vnode>, String)> {
        check_path(path)?;
        let (dir, name) = split_dir_name(path);
        let vnode = self.path_to_vnode(dir)?;
        if !vnode.mode().is_dir() {
            return Err(ENOTDIR);
        }
        Ok((vnode, name.to_owned()))
    }
}

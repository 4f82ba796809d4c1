//! The filesystem interface the kernel consumes, plus an in-memory tree.
//!
//! The core never touches the host filesystem directly. Executable
//! resolution, archive pack/unpack, and chmod all go through the [`Vfs`]
//! trait; [`MemFs`] is the reference implementation used by boot and tests.
//! File `mode` is an opaque integer — the kernel plumbs it through archive
//! entries and `chmod` without interpreting it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::error::SysError;

/// What kind of node a path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
}

/// Metadata for a VFS node.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub kind: FileKind,
    /// Opaque permission bits (e.g. `0o755`).
    pub mode: u32,
    /// Content length in bytes (0 for directories).
    pub size: u64,
}

/// Hierarchical filesystem abstraction consumed by the kernel.
///
/// All paths handed to implementations are absolute and normalized (see
/// [`normalize`]). Callers resolve relative paths against a process CWD
/// before calling in.
pub trait Vfs: Send + Sync {
    fn metadata<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Metadata, SysError>>;
    fn read<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>, SysError>>;
    fn write<'a>(
        &'a self,
        path: &'a str,
        data: Vec<u8>,
        mode: u32,
    ) -> BoxFuture<'a, Result<(), SysError>>;
    fn read_dir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<String>, SysError>>;
    fn mkdir_all<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), SysError>>;
    fn chmod<'a>(&'a self, path: &'a str, mode: u32) -> BoxFuture<'a, Result<(), SysError>>;
}

/// Resolve `path` against `cwd` and collapse `.` / `..` components.
///
/// The result is always absolute. `..` at the root stays at the root.
pub fn normalize(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for comp in joined.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Last path component, or the whole path when it has none.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(path)
}

/// Parent directory of an absolute normalized path (`/` for top-level names).
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mode: u32 },
    Dir { mode: u32 },
}

/// In-memory filesystem keyed by normalized absolute path.
///
/// Directory listing is a prefix scan over the map — fine at the scale of a
/// boot image. The root directory always exists.
pub struct MemFs {
    nodes: RwLock<HashMap<String, Node>>,
}

impl MemFs {
    pub fn new() -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::Dir { mode: 0o755 });
        Arc::new(Self {
            nodes: RwLock::new(nodes),
        })
    }

    fn not_found(path: &str) -> SysError {
        SysError::Io(format!("no such file or directory: {path}"))
    }
}

impl Vfs for MemFs {
    fn metadata<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Metadata, SysError>> {
        Box::pin(async move {
            let nodes = self.nodes.read().await;
            match nodes.get(path) {
                Some(Node::File { data, mode }) => Ok(Metadata {
                    kind: FileKind::File,
                    mode: *mode,
                    size: data.len() as u64,
                }),
                Some(Node::Dir { mode }) => Ok(Metadata {
                    kind: FileKind::Dir,
                    mode: *mode,
                    size: 0,
                }),
                None => Err(Self::not_found(path)),
            }
        })
    }

    fn read<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>, SysError>> {
        Box::pin(async move {
            let nodes = self.nodes.read().await;
            match nodes.get(path) {
                Some(Node::File { data, .. }) => Ok(data.clone()),
                Some(Node::Dir { .. }) => Err(SysError::Io(format!("is a directory: {path}"))),
                None => Err(Self::not_found(path)),
            }
        })
    }

    fn write<'a>(
        &'a self,
        path: &'a str,
        data: Vec<u8>,
        mode: u32,
    ) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move {
            let mut nodes = self.nodes.write().await;
            if matches!(nodes.get(path), Some(Node::Dir { .. })) {
                return Err(SysError::Io(format!("is a directory: {path}")));
            }
            // Implicitly create parent directories, like extraction tools do.
            let mut dir = parent(path).to_string();
            while dir != "/" && !nodes.contains_key(&dir) {
                nodes.insert(dir.clone(), Node::Dir { mode: 0o755 });
                dir = parent(&dir).to_string();
            }
            nodes.insert(path.to_string(), Node::File { data, mode });
            Ok(())
        })
    }

    fn read_dir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<String>, SysError>> {
        Box::pin(async move {
            let nodes = self.nodes.read().await;
            match nodes.get(path) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File { .. }) => {
                    return Err(SysError::Io(format!("not a directory: {path}")))
                }
                None => return Err(Self::not_found(path)),
            }
            let prefix = if path == "/" {
                "/".to_string()
            } else {
                format!("{path}/")
            };
            let mut names: Vec<String> = nodes
                .keys()
                .filter_map(|k| {
                    let rest = k.strip_prefix(&prefix)?;
                    if rest.is_empty() || rest.contains('/') {
                        None
                    } else {
                        Some(rest.to_string())
                    }
                })
                .collect();
            names.sort();
            Ok(names)
        })
    }

    fn mkdir_all<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move {
            let mut nodes = self.nodes.write().await;
            let mut dir = path.to_string();
            loop {
                match nodes.get(&dir) {
                    Some(Node::File { .. }) => {
                        return Err(SysError::Io(format!("not a directory: {dir}")))
                    }
                    Some(Node::Dir { .. }) => break,
                    None => {
                        nodes.insert(dir.clone(), Node::Dir { mode: 0o755 });
                        if dir == "/" {
                            break;
                        }
                        dir = parent(&dir).to_string();
                    }
                }
            }
            Ok(())
        })
    }

    fn chmod<'a>(&'a self, path: &'a str, mode: u32) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move {
            let mut nodes = self.nodes.write().await;
            match nodes.get_mut(path) {
                Some(Node::File { mode: m, .. }) | Some(Node::Dir { mode: m }) => {
                    *m = mode;
                    Ok(())
                }
                None => Err(Self::not_found(path)),
            }
        })
    }
}

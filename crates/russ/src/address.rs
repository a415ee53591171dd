use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::Error;
use crate::Result;

/// Where a service address points: the socket to connect to and the
/// service path within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub socket_path: PathBuf,
    pub service_path: String,
}

fn expand_prefix(addr: &str, services_dir: &Path) -> PathBuf {
    match addr.strip_prefix("/+").or_else(|| addr.strip_prefix('+')) {
        Some(rest) => services_dir.join(rest.trim_start_matches('/')),
        None => PathBuf::from(addr),
    }
}

/// Resolves a service address into its socket and service path.
///
/// A leading `+` or `/+` stands for `services_dir`. Path components are
/// walked left to right until one names a socket file; whatever follows is
/// the service path, always rooted at `/`.
pub fn resolve_target(addr: &str, services_dir: &Path) -> Result<Target> {
    if addr.is_empty() {
        return Err(Error::ServiceNotFound(addr.to_string()));
    }
    let expanded = expand_prefix(addr, services_dir);
    let components: Vec<Component<'_>> = expanded.components().collect();

    let mut prefix = PathBuf::new();
    for (i, component) in components.iter().enumerate() {
        prefix.push(component);
        let meta = match fs::metadata(&prefix) {
            Ok(meta) => meta,
            Err(_) => break,
        };
        if meta.file_type().is_socket() {
            let rest: Vec<_> = components[i + 1..]
                .iter()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect();
            return Ok(Target {
                socket_path: prefix,
                service_path: format!("/{}", rest.join("/")),
            });
        }
        if !meta.is_dir() {
            break;
        }
    }
    Err(Error::ServiceNotFound(addr.to_string()))
}

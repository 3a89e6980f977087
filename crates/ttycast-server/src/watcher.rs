//! Directory watcher: discovers worker sockets created outside the broker.

use crate::session::EventSink;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use ttycast_core::{CastError, CastResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Created(PathBuf),
    Removed(PathBuf),
}

/// Split `<username>:<anything>.sock` into the username and the middle part.
pub fn parse_socket_name(file_name: &str) -> Option<(&str, &str)> {
    let stem = file_name.strip_suffix(".sock")?;
    let (user, rest) = stem.split_once(':')?;
    if user.is_empty() {
        return None;
    }
    Some((user, rest))
}

fn is_socket_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_socket_name)
        .is_some()
}

/// Keeps the OS watch alive; dropping it stops the notifications.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
    dirs: Vec<PathBuf>,
}

impl DirectoryWatcher {
    /// Watch `dirs` (non-recursively). Missing dirs are created.
    pub fn start(dirs: &[PathBuf], sink: EventSink<SocketEvent>) -> CastResult<Self> {
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for socket_event in translate(event) {
                        sink(socket_event);
                    }
                }
                Err(e) => warn!(error = %e, "socket dir watch error"),
            }
        })
        .map_err(|e| CastError::Other(format!("cannot create watcher: {e}")))?;

        let mut watched = Vec::new();
        for dir in dirs {
            std::fs::create_dir_all(dir)?;
            let dir = std::fs::canonicalize(dir)?;
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| CastError::Other(format!("cannot watch {}: {e}", dir.display())))?;
            debug!(path = %dir.display(), "watching socket dir");
            watched.push(dir);
        }

        Ok(Self {
            _watcher: watcher,
            dirs: watched,
        })
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Sockets already present in the watched dirs.
    pub fn existing_sockets(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for dir in &self.dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            found.extend(
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| is_socket_name(p)),
            );
        }
        found.sort();
        found
    }
}

fn translate(event: Event) -> Vec<SocketEvent> {
    let make: fn(PathBuf) -> SocketEvent = match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            SocketEvent::Created
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            SocketEvent::Removed
        }
        _ => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .filter(|p| is_socket_name(p))
        .map(make)
        .collect()
}

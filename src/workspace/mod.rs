//! Shared, reference-counted temp directory for rendered scripts.
//!
//! The directory exists exactly while at least one [`WorkspaceLease`] is
//! alive. The first lease creates it and writes the helper module; the last
//! lease to be released removes it recursively.

use std::{
    collections::BTreeSet,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use tracing::{debug, warn};

use crate::{
    error::{BridgeError, Result},
    process::python,
    token::TokenGenerator,
};

const MAX_NAME_ATTEMPTS: usize = 32;

static SHARED: OnceLock<Arc<Workspace>> = OnceLock::new();

/// `<temp>/pybridge-<pid>`, so concurrent host processes never share a directory.
pub fn default_root() -> PathBuf {
    std::env::temp_dir().join(format!("pybridge-{}", std::process::id()))
}

#[derive(Debug)]
pub struct Workspace {
    state: Mutex<Registry>,
    names: TokenGenerator,
}

#[derive(Debug)]
struct Registry {
    root: PathBuf,
    leases: BTreeSet<u64>,
    next_id: u64,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Registry { root: root.into(), leases: BTreeSet::new(), next_id: 0 }),
            names: TokenGenerator::new(),
        })
    }

    /// Process-wide workspace rooted at [`default_root`] until reconfigured.
    /// Bridges use it unless given their own.
    pub fn shared() -> Arc<Self> {
        Arc::clone(SHARED.get_or_init(|| Self::new(default_root())))
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn root(&self) -> PathBuf {
        self.registry().root.clone()
    }

    /// Number of live leases.
    pub fn active_count(&self) -> usize {
        self.registry().leases.len()
    }

    /// Point the workspace at a new root. Refused while leases are live,
    /// unless the path is unchanged.
    pub fn configure(&self, root: impl Into<PathBuf>) -> Result<()> {
        let requested = root.into();
        let mut reg = self.registry();
        if reg.root == requested {
            return Ok(());
        }
        if !reg.leases.is_empty() {
            return Err(BridgeError::Configuration { current: reg.root.clone(), requested });
        }
        reg.root = requested;
        Ok(())
    }

    /// Register a new lease, creating the directory and helper module if this
    /// is the first one.
    pub fn acquire(self: &Arc<Self>) -> Result<WorkspaceLease> {
        let mut reg = self.registry();
        if reg.leases.is_empty() {
            create_space(&reg.root)?;
        }
        let id = reg.next_id;
        reg.next_id += 1;
        reg.leases.insert(id);
        debug!(lease = id, active = reg.leases.len(), "workspace lease acquired");

        Ok(WorkspaceLease {
            workspace: Arc::clone(self),
            id,
            root: reg.root.clone(),
            files: Vec::new(),
            released: false,
        })
    }

    fn deregister(&self, id: u64) {
        let mut reg = self.registry();
        if !reg.leases.remove(&id) {
            return;
        }
        debug!(lease = id, active = reg.leases.len(), "workspace lease released");
        if reg.leases.is_empty() {
            clean_space(&reg.root);
        }
    }

    fn unique_file_name(&self) -> String {
        format!("{}.{}", self.names.unique_string(), python::SCRIPT_EXTENSION)
    }
}

fn create_space(root: &Path) -> Result<()> {
    fs::create_dir_all(root)
        .map_err(|e| BridgeError::io(format!("creating workspace {}", root.display()), e))?;
    let helper = root.join(python::helper_file_name());
    if let Err(e) = fs::write(&helper, python::HELPER_SOURCE) {
        clean_space(root);
        return Err(BridgeError::io(format!("writing helper module {}", helper.display()), e));
    }
    debug!(root = %root.display(), "workspace created");
    Ok(())
}

fn clean_space(root: &Path) {
    match fs::remove_dir_all(root) {
        Ok(()) => debug!(root = %root.display(), "workspace removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove workspace {}: {}", root.display(), e),
    }
}

/// One live reference to a [`Workspace`], owning the files it created.
///
/// Dropping a lease that was not explicitly released releases it and removes
/// its files.
#[derive(Debug)]
pub struct WorkspaceLease {
    workspace: Arc<Workspace>,
    id: u64,
    root: PathBuf,
    files: Vec<PathBuf>,
    released: bool,
}

impl WorkspaceLease {
    /// Directory the lease lives in; also where the helper module sits.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Write `contents` to a fresh file in the workspace and take ownership of it.
    pub fn create_temp_file(&mut self, contents: &str) -> Result<PathBuf> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = self.root.join(self.workspace.unique_file_name());
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(BridgeError::io(format!("creating temp file {}", path.display()), e))
                }
            };
            self.files.push(path.clone());
            file.write_all(contents.as_bytes())
                .and_then(|_| file.flush())
                .map_err(|e| BridgeError::io(format!("writing temp file {}", path.display()), e))?;
            return Ok(path);
        }
        Err(BridgeError::io(
            format!("creating temp file in {}", self.root.display()),
            io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"),
        ))
    }

    /// Give the lease back. With `force_remove_files` the lease's own files are
    /// deleted first; the directory itself goes away with the last lease.
    pub fn release(mut self, force_remove_files: bool) {
        self.release_inner(force_remove_files);
    }

    fn release_inner(&mut self, force_remove_files: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if force_remove_files {
            for file in self.files.drain(..) {
                match fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove temp file {}: {}", file.display(), e),
                }
            }
        }
        self.workspace.deregister(self.id);
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        self.release_inner(true);
    }
}

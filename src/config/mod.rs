use std::{
    collections::HashMap,
    env,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use directories::BaseDirs;

use crate::{process::python, workspace};

pub const RUNTIME_KEY: &str = "PYBRIDGE_RUNTIME";
pub const WORKSPACE_KEY: &str = "PYBRIDGE_WORKSPACE";
pub const TIMEOUT_KEY: &str = "PYBRIDGE_TIMEOUT_MS";

/// Settings layered as: built-in defaults, then `.pybridgerc`, then environment.
#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&default_config_path())
    }

    pub fn load_from(config_path: &Path) -> Self {
        let mut map = default_map();

        if let Ok(file) = fs::File::open(config_path) {
            let reader = BufReader::new(file);
            for line in reader.lines().map_while(Result::ok) {
                if let Some((k, v)) = parse_line(&line) {
                    map.insert(k, v);
                }
            }
        }

        // Environment takes precedence over the file
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path: config_path.to_path_buf() }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.inner.insert(key.to_string(), value.into());
    }

    pub fn runtime(&self) -> String {
        self.get(RUNTIME_KEY)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| python::DEFAULT_RUNTIME.to_string())
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.get(WORKSPACE_KEY)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(workspace::default_root)
    }

    /// `None` when unset, zero or unparsable.
    pub fn timeout(&self) -> Option<Duration> {
        self.get(TIMEOUT_KEY)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (k, v) = line.split_once('=')?;
    Some((k.trim().to_string(), v.trim().to_string()))
}

fn is_config_key(k: &str) -> bool {
    k.starts_with("PYBRIDGE_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("pybridge").join(".pybridgerc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert(RUNTIME_KEY.into(), python::DEFAULT_RUNTIME.into());
    m.insert(
        WORKSPACE_KEY.into(),
        workspace::default_root().to_string_lossy().into_owned(),
    );
    m.insert(TIMEOUT_KEY.into(), "0".into());
    m
}

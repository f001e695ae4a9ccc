//! Python specifics: the helper module shipped into the workspace, the scope
//! prologue/epilogue, and the environment a child interpreter runs with.

use std::{ffi::OsString, path::Path};

use tokio::process::Command;

/// Module name scripts import; also the filename stem written into the workspace.
pub const HELPER_MODULE: &str = "pybridge";

/// Interpreter used when none is configured.
pub const DEFAULT_RUNTIME: &str = if cfg!(windows) { "python" } else { "python3" };

pub const SCRIPT_EXTENSION: &str = "py";

/// Names bound by the generated prologue. Fragments must not redeclare them.
pub const RESERVED_IDENTIFIERS: [&str; 3] = ["input", "output", HELPER_MODULE];

pub(crate) const IMPORT_LINE: &str = "import pybridge";
pub(crate) const INIT_LINE: &str = "pybridge.init_environment()";
pub(crate) const INPUT_LINE: &str = "input = pybridge.get_input()";
pub(crate) const OUTPUT_LINE: &str = "pybridge.set_output(output)";

/// Interpreter-side half of the handshake.
///
/// `init_environment` reads the frame token from the first stdin line,
/// `get_input` parses the rest of stdin as one JSON value, `set_output` echoes
/// the token on its own line and then writes the JSON value. Each acts once;
/// later calls are no-ops, and using either before init raises.
pub(crate) const HELPER_SOURCE: &str = r#"import sys, json

_input_taken = False
_output_sent = False
_token = ""


def init_environment():
    global _token
    if _token == "":
        _token = sys.stdin.readline().rstrip("\r\n")


def get_input():
    global _input_taken
    if _token == "":
        raise Exception("pybridge environment has not been initialized.")
    if _input_taken or _output_sent:
        return None
    _input_taken = True
    return json.load(sys.stdin)


def set_output(obj):
    global _output_sent
    if _token == "":
        raise Exception("pybridge environment has not been initialized.")
    if _output_sent:
        return
    _output_sent = True
    try:
        text = json.dumps(obj)
    except (TypeError, ValueError):
        if hasattr(obj, "__dict__"):
            text = json.dumps(obj.__dict__)
        else:
            raise
    sys.stdout.write(_token + "\n")
    sys.stdout.write(text)
    sys.stdout.flush()
"#;

pub(crate) fn helper_file_name() -> String {
    format!("{}.{}", HELPER_MODULE, SCRIPT_EXTENSION)
}

/// Make the helper importable and keep the child's stdout unbuffered UTF-8.
pub(crate) fn prepare_env(cmd: &mut Command, helper_dir: &Path) {
    let mut python_path = OsString::from(helper_dir.as_os_str());
    if let Some(existing) = std::env::var_os("PYTHONPATH") {
        if !existing.is_empty() {
            python_path.push(if cfg!(windows) { ";" } else { ":" });
            python_path.push(existing);
        }
    }
    cmd.env("PYTHONPATH", python_path)
        .env("PYTHONUNBUFFERED", "1")
        .env("PYTHONIOENCODING", "utf-8");
}

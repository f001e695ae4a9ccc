//! Call Python scripts from Rust with one JSON value in and one JSON value out.
//!
//! Each call spawns the interpreter, writes a per-call frame token followed by
//! the JSON input to its stdin, and reads its stdout. Anything the script
//! prints before the helper module echoes the token is a diagnostic line and
//! goes to observers; what follows the token is the JSON result.
//!
//! ```no_run
//! # async fn demo() -> pybridge::Result<()> {
//! use pybridge::ExecutionBridge;
//!
//! let bridge = ExecutionBridge::from_source("output = sorted(input)");
//! let sorted: Vec<f64> = bridge.call_with(&[3.0, 1.0, 2.0]).await?;
//! assert_eq!(sorted, vec![1.0, 2.0, 3.0]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod process;
pub mod scope;
pub mod token;
pub mod workspace;

pub use config::Config;
pub use error::{BridgeError, Result};
pub use execution::{DiagnosticObserver, ExecutionBridge, ExecutionResult, Script};
pub use process::{is_runtime_valid, version};
pub use scope::ScriptScope;
pub use token::TokenGenerator;
pub use tokio_util::sync::CancellationToken;
pub use workspace::{Workspace, WorkspaceLease};

use clap::{ArgGroup, Parser};

#[derive(Parser, Debug, Clone)]
#[command(name = "pybridge", about = "Run a Python script with JSON in and JSON out", version)]
#[command(group(ArgGroup::new("source").args(["script", "code"]).multiple(false)))]
pub struct Cli {
    /// Script file that uses the `pybridge` helper module.
    #[arg(value_name = "SCRIPT")]
    pub script: Option<String>,

    /// Inline Python fragment. `input` holds the input, assign `output` to return a value.
    #[arg(short = 'c', long)]
    pub code: Option<String>,

    /// JSON input. Without it, piped stdin is used as input when present.
    #[arg(short = 'i', long)]
    pub input: Option<String>,

    /// Do not wait for a result value.
    #[arg(long = "no-output")]
    pub no_output: bool,

    /// Interpreter to run (overrides PYBRIDGE_RUNTIME).
    #[arg(long)]
    pub runtime: Option<String>,

    /// Kill the script after this many milliseconds (overrides PYBRIDGE_TIMEOUT_MS).
    #[arg(long = "timeout-ms")]
    pub timeout_ms: Option<u64>,

    /// Do not print the script's diagnostic lines.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Print the interpreter version and exit.
    #[arg(long = "runtime-version")]
    pub runtime_version: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

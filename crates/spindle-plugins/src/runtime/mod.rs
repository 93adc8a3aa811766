//! Runtime detection and launch command construction.
//!
//! A [`RuntimeDetector`] holds an ordered list of [`RuntimeKind`] strategies.
//! Each strategy recognises a source tree by its marker files and knows how to
//! build the [`LaunchCommand`] that starts a server from that tree. Detection
//! only reads the filesystem.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

mod plan;

pub use self::plan::{CommandSource, LaunchPlan};

/// Loopback address handed to every plugin.
pub const PLUGIN_HOST: &str = "127.0.0.1";

/// Placeholder replaced by the assigned port in explicit command arguments.
pub const PORT_PLACEHOLDER: &str = "{port}";

const PYTHON_ENTRIES: &[&str] = &["main.py", "server.py", "app.py"];
const PYTHON_MARKERS: &[&str] = &[
    "pyproject.toml",
    "requirements.txt",
    "main.py",
    "server.py",
    "app.py",
];
const NODE_MARKERS: &[&str] = &["package.json"];
const GO_MARKERS: &[&str] = &["go.mod"];
const CARGO_MARKERS: &[&str] = &["Cargo.toml"];
const NODE_DEFAULT_MAIN: &str = "index.js";

/// Language runtime used to launch a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// `python3` with a `main.py`, `server.py` or `app.py` entry point.
    Python,
    /// `node` running the `main` script of `package.json`.
    Node,
    /// `go run .`
    Go,
    /// `cargo run --quiet --release`
    Cargo,
}

impl RuntimeKind {
    /// All strategies in default detection order.
    pub const ALL: [Self; 4] = [Self::Python, Self::Node, Self::Go, Self::Cargo];

    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Go => "go",
            Self::Cargo => "cargo",
        }
    }

    /// Program the strategy runs.
    #[must_use]
    pub const fn program(self) -> &'static str {
        match self {
            Self::Python => "python3",
            Self::Node => "node",
            Self::Go => "go",
            Self::Cargo => "cargo",
        }
    }

    /// Files whose presence identifies a source tree for this runtime.
    #[must_use]
    pub const fn markers(self) -> &'static [&'static str] {
        match self {
            Self::Python => PYTHON_MARKERS,
            Self::Node => NODE_MARKERS,
            Self::Go => GO_MARKERS,
            Self::Cargo => CARGO_MARKERS,
        }
    }

    /// Returns `true` when any marker file exists directly under `root`.
    #[must_use]
    pub fn detect(self, root: &Path) -> bool {
        self.markers()
            .iter()
            .any(|marker| root.join(marker).is_file())
    }

    /// Builds the command that starts the plugin server in `root`,
    /// listening on `port`.
    #[must_use]
    pub fn build_command(self, root: &Path, port: u16) -> LaunchCommand {
        let command = match self {
            Self::Python => python_command(root),
            Self::Node => LaunchCommand::new(self.program(), vec![node_main(root)]),
            Self::Go => LaunchCommand::new(self.program(), vec!["run".into(), ".".into()]),
            Self::Cargo => LaunchCommand::new(
                self.program(),
                vec!["run".into(), "--quiet".into(), "--release".into()],
            ),
        };
        command.bound_to(port)
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn python_command(root: &Path) -> LaunchCommand {
    if let Some(entry) = PYTHON_ENTRIES
        .iter()
        .find(|entry| root.join(entry).is_file())
    {
        return LaunchCommand::new("python3", vec![(*entry).to_owned()]);
    }

    // Package layout: run the directory as a module from its parent.
    let module = root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut command = LaunchCommand::new("python3", vec!["-m".into(), module]);
    if let Some(parent) = root.parent() {
        command = command.with_env("PYTHONPATH", parent.to_string_lossy());
    }
    command
}

#[derive(Deserialize)]
struct PackageJson {
    main: Option<String>,
}

fn node_main(root: &Path) -> String {
    fs::read_to_string(root.join("package.json"))
        .ok()
        .and_then(|text| serde_json::from_str::<PackageJson>(&text).ok())
        .and_then(|package| package.main)
        .filter(|main| !main.trim().is_empty())
        .unwrap_or_else(|| NODE_DEFAULT_MAIN.to_owned())
}

/// Program, arguments and environment used to spawn a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl LaunchCommand {
    /// Creates a command with an empty environment overlay.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    /// Builds a command from an explicit argument vector, replacing
    /// `{port}` in every element. Returns `None` for an empty vector.
    #[must_use]
    pub fn from_argv(argv: &[String], port: u16) -> Option<Self> {
        let port_text = port.to_string();
        let mut parts = argv
            .iter()
            .map(|part| part.replace(PORT_PLACEHOLDER, &port_text));
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()).bound_to(port))
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merges environment variables; existing keys are overwritten.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(key, value)| (key.into(), value.into())));
        self
    }

    pub(crate) fn bound_to(self, port: u16) -> Self {
        self.with_env("PORT", port.to_string())
            .with_env("HOST", PLUGIN_HOST)
    }

    /// Program to execute.
    #[must_use]
    pub const fn program(&self) -> &str {
        self.program.as_str()
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment overlay applied on top of the inherited environment.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Ordered list of launch strategies.
///
/// The first strategy whose markers are present wins, so the order matters
/// for trees that carry markers of several runtimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDetector {
    strategies: Vec<RuntimeKind>,
}

impl Default for RuntimeDetector {
    fn default() -> Self {
        Self::new(RuntimeKind::ALL.to_vec())
    }
}

impl RuntimeDetector {
    /// Creates a detector that tries `strategies` in order.
    #[must_use]
    pub const fn new(strategies: Vec<RuntimeKind>) -> Self {
        Self { strategies }
    }

    /// Strategies in detection order.
    #[must_use]
    pub fn strategies(&self) -> &[RuntimeKind] {
        &self.strategies
    }

    /// Returns the first strategy that recognises `root`.
    #[must_use]
    pub fn select(&self, root: &Path) -> Option<RuntimeKind> {
        self.strategies
            .iter()
            .copied()
            .find(|strategy| strategy.detect(root))
    }
}

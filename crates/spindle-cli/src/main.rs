//! Entry point of the `spindle` binary.
//!
//! Delegates to [`spindle_cli::run`] with the process arguments and the
//! standard streams. The streams stay unlocked: runtime worker threads write
//! log events to standard error while a command runs.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    spindle_cli::run(std::env::args_os(), &mut io::stdout(), &mut io::stderr())
}

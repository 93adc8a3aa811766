//! Command-line runtime for the Spindle plugin host.
//!
//! The runtime splits configuration flags from the command, loads layered
//! configuration, installs telemetry and runs the command on a multi-threaded
//! Tokio runtime. IO streams and configuration loading can be substituted so
//! the whole flow is exercised from tests.

use std::ffi::OsString;
use std::future::Future;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use spindle_config::Config;

mod cli;
mod commands;
mod config;
mod errors;
pub mod telemetry;

use cli::Cli;
use config::{ConfigLoader, OrthoConfigLoader, split_config_arguments};
use errors::AppError;

/// Bundles the IO streams provided to the CLI runtime.
pub(crate) struct IoStreams<'a, W: Write, E: Write> {
    pub(crate) stdout: &'a mut W,
    pub(crate) stderr: &'a mut E,
}

impl<'a, W: Write, E: Write> IoStreams<'a, W, E> {
    pub(crate) const fn new(stdout: &'a mut W, stderr: &'a mut E) -> Self {
        Self { stdout, stderr }
    }
}

/// Outcome of argument parsing: a command to run, or text clap already
/// rendered for `--help` and `--version`.
enum Parsed {
    Command(Cli),
    Informational(clap::Error),
}

fn parse_cli(arguments: Vec<OsString>) -> Result<Parsed, AppError> {
    match Cli::try_parse_from(arguments) {
        Ok(cli) => Ok(Parsed::Command(cli)),
        Err(error) if !error.use_stderr() => Ok(Parsed::Informational(error)),
        Err(error) => Err(AppError::CliUsage(error)),
    }
}

fn run_with_shutdown<I, W, E, L, F, S>(
    args: I,
    io: &mut IoStreams<'_, W, E>,
    loader: &L,
    shutdown: F,
) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
    F: FnOnce() -> S,
    S: Future<Output = Result<(), AppError>>,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = split_config_arguments(&args);

    let result = parse_cli(split.command_arguments).and_then(|parsed| match parsed {
        Parsed::Informational(text) => {
            write!(io.stdout, "{text}").map_err(AppError::WriteOutput)
        }
        Parsed::Command(cli) => {
            let config = loader.load(&split.config_arguments)?;
            execute(cli, &config, io, shutdown)
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            writeln!(io.stderr, "{error}").ok();
            ExitCode::FAILURE
        }
    }
}

fn execute<W, E, F, S>(
    cli: Cli,
    config: &Config,
    io: &mut IoStreams<'_, W, E>,
    shutdown: F,
) -> Result<(), AppError>
where
    W: Write,
    E: Write,
    F: FnOnce() -> S,
    S: Future<Output = Result<(), AppError>>,
{
    telemetry::initialise(config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(AppError::Runtime)?;
    runtime.block_on(commands::execute(cli.command, config, io, shutdown()))
}

/// Runs the CLI using the provided arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let mut io = IoStreams::new(stdout, stderr);
    run_with_shutdown(args, &mut io, &OrthoConfigLoader, commands::shutdown_signal)
}

#[cfg(test)]
mod tests;

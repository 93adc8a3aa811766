//! Binary entrypoint for the echo plugin.

use std::io::{self, Write};
use std::process::ExitCode;

use spindle_echo_plugin::{EchoError, bind, bind_address, serve};
use tokio::signal::unix::{SignalKind, signal};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            writeln!(io::stderr().lock(), "spindle-echo-plugin: {error}").ok();
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), EchoError> {
    let addr = bind_address(|key| std::env::var(key).ok())?;
    let listener = bind(addr).await?;
    let local = listener.local_addr().map_err(EchoError::Serve)?;
    writeln!(io::stdout().lock(), "echo plugin listening on {local}").ok();

    let mut terminate = signal(SignalKind::terminate()).map_err(EchoError::Serve)?;
    serve(listener, async move {
        tokio::select! {
            _ = terminate.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    })
    .await
}

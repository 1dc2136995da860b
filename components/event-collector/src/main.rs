mod cli;
mod collector;
mod gateway;
mod helpers;
mod instrumentation;
mod metrics;
mod models;
mod retry;
mod runtime;
mod sink;

use cli::cli::Invocation;
use runtime::runtime::Outcome;
use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Settings decide where logs go, so they are loaded before tracing exists.
    let invocation = match cli::cli::parse() {
        Ok(invocation) => invocation,
        Err(e) => return fail(&e),
    };

    let _guard = match &invocation {
        Invocation::Run(settings) | Invocation::Watch(settings) => {
            match instrumentation::tracing::init_tracing(&settings.logging) {
                Ok(guard) => Some(guard),
                Err(e) => return fail(&e),
            }
        }
        Invocation::Validate(..) | Invocation::Version => None,
    };
    instrumentation::tracing::init_panic_handler();

    match cli::cli::run(invocation).await {
        Ok(Outcome::Completed) => ExitCode::SUCCESS,
        Ok(Outcome::Interrupted) => {
            tracing::info!("Run interrupted by user");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "vmwarelog failed");
            fail(&e)
        }
    }
}

fn fail(e: &anyhow::Error) -> ExitCode {
    eprintln!("ERROR: {e:#}");
    ExitCode::FAILURE
}

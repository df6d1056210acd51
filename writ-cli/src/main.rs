mod cli;

use std::process::ExitCode;

use writ::WritError;

const PARSE_ERROR: u8 = 2;
const RUNTIME_ERROR: u8 = 3;
const TIMEOUT: u8 = 4;

/// Exit code for an error from loading or querying.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<WritError>() {
        Some(e) if e.is_load_error() => PARSE_ERROR,
        Some(WritError::Core(e)) if e.is_timeout() => TIMEOUT,
        _ => RUNTIME_ERROR,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let result = cli::Args::parse(std::env::args().skip(1)).and_then(|args| cli::run(&args));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

//! tandem - sync a hosted task service locally and extend it with plugins

use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(e) = tandem_cli::cli::run() {
        eprintln!("Error: {:#}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

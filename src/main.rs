use std::process::ExitCode;

use git_warden::cli;

// Main entry point
fn main() -> ExitCode {
    match cli::handle_calls() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("git-warden: {err:#}");
            ExitCode::from(1)
        }
    }
}

use clap::Parser;

use russ_cli::handlers;
use russ_cli::telemetry::init_tracing;
use russ_cli::Cli;

fn main() {
    let cli = Cli::parse();
    let guard = init_tracing(cli.verbose);

    let code = match handlers::run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Suggestion: {}", suggestion);
            }
            if e.is_retryable() {
                eprintln!("(This error may be transient - retry may succeed)");
            }
            e.exit_code()
        }
    };

    drop(guard);
    std::process::exit(code);
}

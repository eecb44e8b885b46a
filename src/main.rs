use clap::Parser;
use scan_relay::app::{LineSource, Options, run_with_io};
use std::panic::{self, PanicHookInfo};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "websocket")]
use scan_relay::connection::websocket::WebSocketTransport;

#[cfg(not(feature = "websocket"))]
compile_error!("The scan-relay binary needs the `websocket` feature");

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr so stdout stays reserved for scan results.
///
/// `RUST_LOG` takes precedence over the `--verbose` default.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "scan_relay=debug"
    } else {
        "scan_relay=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let mut out = std::io::stdout();
    let mut err = std::io::stderr();

    match run_with_io(
        options,
        &LineSource,
        Box::new(WebSocketTransport),
        &mut out,
        &mut err,
    )
    .await
    {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}

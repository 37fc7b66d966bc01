//! CoPilot client side executable.

use std::process::ExitCode;

use clap::Parser;

use tokio::runtime::Builder;
use tokio::sync::watch;

use copilot::{logger_init, pf_error, pf_warn, CopilotError, StaticDirectory};

mod clients;

use crate::clients::{ClientBench, ClientMode, ClientRepl};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the directory TOML file listing replica addresses and the
    /// initial leaders of the two pilots.
    #[arg(short, long)]
    directory: String,

    /// Client configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Client utility mode to run: repl|bench.
    #[arg(short, long)]
    utility: String,

    /// Mode-specific client parameters TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    params: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(mode)` on success or
    /// `Err(CopilotError)` on any error.
    fn sanitize(&self) -> Result<ClientMode, CopilotError> {
        if self.threads < 2 {
            Err(CopilotError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if self.directory.is_empty() {
            Err(CopilotError::msg("directory file path not given"))
        } else {
            ClientMode::parse_name(&self.utility).ok_or(CopilotError::msg(
                format!("utility mode '{}' unrecognized", self.utility),
            ))
        }
    }
}

/// Actual main function of CoPilot client executable.
fn client_main() -> Result<(), CopilotError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    let mode = args.sanitize()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(args.config.clone())
    };

    // parse optional params string if given
    let params_str = if args.params.is_empty() {
        None
    } else {
        args.params = args.params.replace('+', "\n");
        Some(&args.params[..])
    };

    let directory = StaticDirectory::from_file(&args.directory)?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(CopilotError::msg)?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime, connect to the service, and do work
    runtime.block_on(async move {
        match mode {
            ClientMode::Repl => {
                // run interactive REPL loop
                let mut repl =
                    ClientRepl::new_and_setup(directory, config_str, rx_term)
                        .await?;
                repl.run().await?;
            }
            ClientMode::Bench => {
                // run benchmarking workers
                let mut bench = ClientBench::new(
                    directory, config_str, params_str, rx_term,
                )?;
                bench.run().await?;
            }
        }

        Ok::<(), CopilotError>(()) // give type hint for this async closure
    })
}

/// Main function of CoPilot client executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exitted: {}", e);
        ExitCode::FAILURE
    } else {
        pf_warn!("client_main exitted successfully");
        ExitCode::SUCCESS
    }
}

#![deny(warnings)]

use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;

use logship::{app, cli::Opts, trace};

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();
    trace::init(std::io::stderr().is_terminal(), opts.log_level());

    match app::run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(message = "Fatal error.", %error);
            ExitCode::FAILURE
        }
    }
}

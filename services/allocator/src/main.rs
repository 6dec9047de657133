//! devlease - lease a farm device for a CI build step.
//!
//! Locates (or flashes) a device carrying the requested build, holds an
//! exclusive session on it and exposes its ADB and Marionette proxies as
//! environment variables.

use clap::Parser;

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    devlease_allocator::logging::init(cli.log_format);

    match cli.run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            cli::output::print_error(&e);
            std::process::exit(cli::output::exit_code(&e));
        }
    }
}

//! Subcommand dispatch and execution.
//!
//! The [`dispatch`] function routes the parsed CLI to the appropriate
//! subcommand handler: [`run`], [`validate`], or [`health`]. Each handler
//! lives in its own submodule.

pub mod health;
pub mod run;
pub mod validate;

use crate::cli::{Cli, Commands};
use crate::error::RouterError;

pub async fn dispatch(cli: Cli) -> Result<(), RouterError> {
    match cli.command {
        Some(Commands::Run(args)) => run::execute(*args).await,
        Some(Commands::Validate(ref args)) => validate::execute(args),
        Some(Commands::Health(args)) => health::execute(args).await,
        None => {
            print_welcome();
            Ok(())
        }
    }
}

fn print_welcome() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        "\n  inference-router v{version}: traffic control for multi-tenant inference\n\n  \
         No command provided. To get started:\n\n    \
         inference-router validate policies.yaml             Check a policy seed file\n    \
         inference-router run --policy-file policies.yaml    Start the router\n    \
         inference-router --help                             See all commands and options\n"
    );
}

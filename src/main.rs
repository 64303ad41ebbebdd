mod change;
mod config;
mod error;
mod gerrit;
mod git;
mod lsp;
mod position;
mod prompt;
mod review;
mod session;
mod show_cmd;
#[cfg(test)]
mod test_support;

use clap::Parser;

use crate::config::{Cli, Command};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    // stdout carries the LSP transport, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Lsp(args) => {
            let config = config::load_config(&cli.global, args.hide_resolved)?;
            lsp::run(config)
        }
        Command::Show(args) => {
            let config = config::load_config(&cli.global, args.hide_resolved)?;
            show_cmd::run(config, args.paths)
        }
    }
}

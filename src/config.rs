use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use confique::Config as _;
use confique::Layer as _;

use crate::gerrit::GerritClient;
use crate::git::{DEFAULT_MAX_OUTPUT, GitCli};
use crate::session::SessionManager;

#[derive(confique::Config, Debug, Clone)]
pub struct AppConfig {
    /// Base url of the Gerrit server, e.g. `https://android-review.googlesource.com`.
    #[config(env = "GERRIT_REVIEW_URL")]
    pub gerrit_url: Option<String>,
    /// Remote to use without asking when a repo has several.
    #[config(env = "GERRIT_REVIEW_REMOTE")]
    pub remote: Option<String>,
    #[config(default = 4194304, env = "GERRIT_REVIEW_GIT_MAX_OUTPUT")]
    pub git_max_output: usize,
    #[config(default = false, env = "GERRIT_REVIEW_HIDE_RESOLVED")]
    pub hide_resolved: bool,
}

impl AppConfig {
    pub fn session_manager(&self) -> SessionManager {
        let max_output = if self.git_max_output == 0 {
            DEFAULT_MAX_OUTPUT
        } else {
            self.git_max_output
        };
        SessionManager::new(
            GitCli::new(max_output),
            GerritClient::new(self.gerrit_url.clone()),
        )
        .with_preferred_remote(self.remote.clone())
        .with_hide_resolved(self.hide_resolved)
    }
}

#[derive(Parser)]
#[command(
    name = "gerrit-review",
    version,
    about = "Show Gerrit review comments for the checked-out commit."
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Optional path to a config file to load in addition to the standard locations.
    #[arg(long = "config-file", global = true)]
    pub config_file: Option<PathBuf>,

    /// Gerrit base url.
    #[arg(long = "gerrit-url", global = true)]
    pub gerrit_url: Option<String>,

    /// Git remote carrying the refs/changes namespace.
    #[arg(long = "remote", global = true)]
    pub remote: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the language server on stdio.
    Lsp(LspCli),
    /// Print the comments of the current patchset.
    Show(ShowCli),
}

#[derive(Args, Debug, Clone, Default)]
pub struct LspCli {
    /// Only highlight unresolved comments.
    #[arg(long = "hide-resolved", action = ArgAction::SetTrue)]
    pub hide_resolved: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ShowCli {
    /// Directories to look for the repository in (default: current directory).
    pub paths: Vec<PathBuf>,

    /// Only print unresolved comments.
    #[arg(long = "hide-resolved", action = ArgAction::SetTrue)]
    pub hide_resolved: bool,
}

pub fn load_config(global: &GlobalArgs, hide_resolved: bool) -> Result<AppConfig> {
    let mut cli_layer = <AppConfig as confique::Config>::Layer::empty();
    cli_layer.gerrit_url = global.gerrit_url.clone();
    cli_layer.remote = global.remote.clone();
    cli_layer.hide_resolved = hide_resolved.then_some(true);

    let mut builder = AppConfig::builder().preloaded(cli_layer).env();
    if let Some(path) = &global.config_file {
        builder = builder.file(path);
    }

    if let Ok(cwd) = std::env::current_dir() {
        let local_root = cwd.join(".config");
        builder = add_if_exists(builder, local_root.join("gerrit-review.toml"));
        builder = add_if_exists(builder, local_root.join("gerrit-review").join("config.toml"));
    }

    if let Some(dir) = dirs::config_dir() {
        builder = add_if_exists(builder, dir.join("gerrit-review").join("config.toml"));
    }

    builder.load().context("load gerrit-review config")
}

fn add_if_exists(
    mut builder: confique::Builder<AppConfig>,
    path: impl AsRef<Path>,
) -> confique::Builder<AppConfig> {
    let path = path.as_ref();
    if path.exists() {
        builder = builder.file(path);
    }
    builder
}

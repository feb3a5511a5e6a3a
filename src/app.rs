
use anyhow::Result;
use clap::Parser;
use crate::commands::completions::Completions;
use crate::commands::filter::Filter;
use crate::commands::grab::Grab;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}";

/// Rewrite and inspect Subversion dump streams.
#[derive(Debug, Parser)]
#[command(
    name = "svdump",
    version = VERSION,
    about = format!("Subversion dump stream utilities {}", VERSION),
    help_template = HELP_TEMPLATE,
)]
pub enum Commands {
    /// Filter a dump stream from stdin to stdout
    Filter(Filter),
    /// Print only the given revisions of a dump stream
    Grab(Grab),
    /// Generate shell completions
    Completions(Completions),
}

pub trait Run {
    fn run(&mut self) -> Result<()>;
}

impl Run for Commands {
    fn run(&mut self) -> Result<()> {
        match self {
            Commands::Filter(cmd) => cmd.run(),
            Commands::Grab(cmd) => cmd.run(),
            Commands::Completions(cmd) => cmd.run(),
        }
    }
}

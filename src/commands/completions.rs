
use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::{generate, shells::Shell};
use crate::util::SvError::General;

/// Generate shell completions and write them to stdout.
#[derive(Debug, Parser)]
#[command(
    author,
    help_template = crate::app::HELP_TEMPLATE,
)]
pub struct Completions {
    /// Target shell for the completions.  Omit to detect the current
    /// shell from the environment.
    #[arg(value_name = "SHELL")]
    shell: Option<Shell>,
}

impl Completions {
    pub fn run(&mut self) -> Result<()> {
        let shell = self
            .shell
            .or_else(Shell::from_env)
            .ok_or(General("cannot determine a shell to generate completions for".to_owned()))?;
        let mut cmd = crate::app::Commands::command();
        let name = cmd.get_name().to_owned();
        generate(shell, &mut cmd, name, &mut std::io::stdout().lock());
        Ok(())
    }
}

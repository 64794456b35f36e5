use clap::CommandFactory;
use clap_complete::{generate, Shell};
use logmill_core::LogmillError;
use std::io;

pub fn run(shell: Shell) -> Result<(), LogmillError> {
    let mut cmd = crate::Cli::command();
    generate(shell, &mut cmd, "logmill", &mut io::stdout());
    Ok(())
}

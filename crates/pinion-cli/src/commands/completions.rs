use super::EXIT_SUCCESS;
use clap::CommandFactory;
use clap_complete::{generate, Shell};

pub fn run<C: CommandFactory>(shell: Shell) -> Result<u8, String> {
    let mut cmd = C::command();
    generate(shell, &mut cmd, "pinion", &mut std::io::stdout());
    Ok(EXIT_SUCCESS)
}

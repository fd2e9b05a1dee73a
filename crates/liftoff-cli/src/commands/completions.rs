use super::EXIT_SUCCESS;
use clap::CommandFactory;
use clap_complete::Shell;

pub fn run<C: CommandFactory>(shell: Shell) -> u8 {
    clap_complete::generate(shell, &mut C::command(), "liftoff", &mut std::io::stdout());
    EXIT_SUCCESS
}

pub mod command;
pub mod input;

pub use command::{CommandExecutor, CommandOutput, DefaultCommandExecutor};
pub use input::{Prompter, StdinPrompter};

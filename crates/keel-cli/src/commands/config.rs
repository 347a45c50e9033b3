use crate::cli::ConfigCommands;
use crate::commands::common::{load_settings, print_json, settings_path, Paths};
use crate::error::CliError;

pub fn run_config(command: &ConfigCommands, paths: &Paths) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => {
            let settings = load_settings(paths)?;
            print_json(&settings)
        }
        ConfigCommands::Path => {
            println!("{}", settings_path(paths)?.display());
            Ok(())
        }
    }
}

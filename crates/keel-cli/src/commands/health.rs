use keel_core::sync::RemoteEndpoint;

use crate::commands::common::{connect_remote, load_settings, Paths};
use crate::error::CliError;

pub async fn run_health(paths: &Paths) -> Result<(), CliError> {
    let remote = connect_remote(&load_settings(paths)?)?;
    remote.health_check().await?;
    println!("Sync server reachable");
    Ok(())
}

use crate::commands::common::{
    format_entity_lines, load_settings, open_store, parse_entity_type, print_json, Paths,
};
use crate::error::CliError;

pub async fn run_show(
    entity_type: &str,
    limit: usize,
    as_json: bool,
    paths: &Paths,
) -> Result<(), CliError> {
    let entity_type = parse_entity_type(entity_type)?;
    let store = open_store(&load_settings(paths)?)?;
    let entities = store.list_entities(entity_type, limit).await?;

    if as_json {
        return print_json(&entities);
    }
    if entities.is_empty() {
        println!("No {entity_type} entities stored locally.");
        return Ok(());
    }
    for line in format_entity_lines(&entities) {
        println!("{line}");
    }
    Ok(())
}

use keel_core::ChangeKind;

use crate::commands::common::{
    load_settings, open_store, parse_entity_id, parse_entity_type, parse_payload,
    read_piped_stdin, Paths,
};
use crate::error::CliError;

pub async fn run_record(
    entity_type: &str,
    kind: &str,
    id: Option<&str>,
    payload: Option<&str>,
    paths: &Paths,
) -> Result<(), CliError> {
    let entity_type = parse_entity_type(entity_type)?;
    let kind = ChangeKind::from(kind.trim().to_ascii_lowercase());
    let entity_id = parse_entity_id(id)?;

    let piped = match payload {
        Some(_) => None,
        None if kind.is_delete() => None,
        None => read_piped_stdin()?,
    };
    let payload = parse_payload(payload.or(piped.as_deref()), kind.is_delete())?;

    let settings = load_settings(paths)?;
    let store = open_store(&settings)?;
    let (entity, change) = store
        .apply_local_change(entity_type, entity_id, kind, payload)
        .await?;

    println!("{} {} ({})", entity.entity_type, entity.id, change.change_kind);
    println!("Queued change {}", change.id);
    Ok(())
}

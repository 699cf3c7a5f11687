use std::path::Path;

use crate::commands::common::{
    normalize_resource_id, open_database, parse_resource_type, read_json, resources_from_document,
};
use crate::error::CliError;

pub fn run_import(file: &Path, db_path: &Path) -> Result<(), CliError> {
    let resources = resources_from_document(read_json(file)?)?;
    let db = open_database(db_path)?;
    for resource in &resources {
        let key = db.import_resource(resource)?;
        println!("{key}");
    }
    tracing::info!("Imported {} resources", resources.len());
    Ok(())
}

pub fn run_add(file: &Path, db_path: &Path) -> Result<(), CliError> {
    let resources = resources_from_document(read_json(file)?)?;
    let db = open_database(db_path)?;
    for resource in resources {
        let key = db.insert_resource(resource)?;
        println!("{key}");
    }
    Ok(())
}

pub fn run_update(
    resource_type: &str,
    id: &str,
    patch_file: &Path,
    db_path: &Path,
) -> Result<(), CliError> {
    let resource_type = parse_resource_type(resource_type)?;
    let id = normalize_resource_id(id)?;
    let patch = read_json(patch_file)?;

    let db = open_database(db_path)?;
    db.update_resource(&resource_type, &id, &patch)?;
    println!("{resource_type}/{id}");
    Ok(())
}

pub fn run_delete(resource_type: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let resource_type = parse_resource_type(resource_type)?;
    let id = normalize_resource_id(id)?;

    let db = open_database(db_path)?;
    db.delete_resource(&resource_type, &id)?;
    println!("{resource_type}/{id}");
    Ok(())
}

// src/schema.rs

use std::{fs, path::Path};

use anyhow::{Context, Error};
use connector_plugin::TopicEvent;
use schemars::schema_for;
use tracing::info;

use crate::catalog::{AppDescriptor, CatalogManifest};

/// Write the JSON schemas for catalog files and broker deliveries into
/// `out_dir`. Returns the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("could not create {}", out_dir.display()))?;

    let schemas = [
        ("application.schema.json", serde_json::to_string_pretty(&schema_for!(AppDescriptor))?),
        ("catalog.schema.json", serde_json::to_string_pretty(&schema_for!(CatalogManifest))?),
        ("delivery.schema.json", serde_json::to_string_pretty(&schema_for!(TopicEvent))?),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, json) in schemas {
        let path = out_dir.join(name);
        fs::write(&path, json).with_context(|| format!("could not write {}", path.display()))?;
        info!("Wrote {}", path.display());
        written.push(name.to_string());
    }
    Ok(written)
}

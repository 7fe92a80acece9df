//! Key commands: put, get, delete, and list.

use anyhow::Result;
use serde::Serialize;
use tabled::Tabled;

use confstore_core::prelude::*;

use crate::output::{self, OutputFormat};

#[derive(Debug, Serialize, Tabled)]
struct EntryRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl From<ConfigEntry> for EntryRow {
    fn from(entry: ConfigEntry) -> Self {
        Self {
            name: entry.name,
            value: entry.value,
        }
    }
}

pub async fn put(
    service: &ConfigService,
    key: &str,
    value: &str,
    format: OutputFormat,
) -> Result<()> {
    let written = service.put(key, value).await?;
    match format {
        OutputFormat::Table => output::print_success(&format!("{} = {}", key, written)),
        _ => {
            let row = EntryRow {
                name: key.to_string(),
                value: written.clone(),
            };
            output::print_value(&written, &row, format)?;
        }
    }
    Ok(())
}

pub async fn get(service: &ConfigService, key: &str, format: OutputFormat) -> Result<()> {
    service.rebuild_projection().await?;
    let value = service.get(key)?;
    output::print_value(
        &value,
        &EntryRow {
            name: key.to_string(),
            value: value.clone(),
        },
        format,
    )
}

pub async fn delete(service: &ConfigService, key: &str, format: OutputFormat) -> Result<()> {
    service.delete(key).await?;
    match format {
        OutputFormat::Table => output::print_success(&format!("{} deleted", key)),
        _ => {
            let body = serde_json::json!({ "name": key, "deleted": true });
            output::print_value(key, &body, format)?;
        }
    }
    Ok(())
}

pub async fn list(service: &ConfigService, format: OutputFormat) -> Result<()> {
    service.rebuild_projection().await?;
    let rows: Vec<EntryRow> = service.all().into_iter().map(EntryRow::from).collect();
    output::print_list(&rows, format)
}

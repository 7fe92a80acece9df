//! History commands: full event history and point-in-time reads.

use anyhow::Result;
use serde::Serialize;
use tabled::Tabled;

use confstore_core::prelude::*;

use crate::output::{self, OutputFormat};

#[derive(Debug, Tabled)]
struct HistoryRow {
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Event")]
    event: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Recorded At")]
    recorded_at: String,
}

impl From<&HistoryEntry> for HistoryRow {
    fn from(entry: &HistoryEntry) -> Self {
        let field = match entry.event_type.as_str() {
            "ValueDeleted" => "deleted_value",
            _ => "value",
        };
        let value = entry
            .data
            .get(field)
            .and_then(|v| v.as_str())
            .unwrap_or("-")
            .to_string();
        Self {
            version: entry.stream_version,
            event: entry.event_type.clone(),
            value,
            recorded_at: entry.recorded_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PointInTime<'a> {
    name: &'a str,
    value: &'a str,
    at: &'a str,
}

pub async fn history(service: &ConfigService, key: &str, format: OutputFormat) -> Result<()> {
    let entries = service.history(key).await?;
    match format {
        OutputFormat::Table => {
            let rows: Vec<HistoryRow> = entries.iter().map(HistoryRow::from).collect();
            output::print_table(&rows);
        }
        _ => output::print_serialized(&entries, format)?,
    }
    Ok(())
}

pub async fn at(service: &ConfigService, key: &str, at: &str, format: OutputFormat) -> Result<()> {
    let value = service.at(key, at).await?;
    let body = PointInTime {
        name: key,
        value: &value,
        at,
    };
    output::print_value(&value, &body, format)
}

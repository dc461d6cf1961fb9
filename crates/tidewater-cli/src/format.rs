//! Output formatting for the tidewater binary
//!
//! Target records are JSON lines. Stream listings, descriptions and the query
//! summary are rounded tables; headings and status lines are colored when the
//! pipeline's `colored` option is on and stdout is a terminal.

use colored::*;
use serde_json::json;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tidewater_catalog::{StreamDescription, StreamInfo};
use tidewater_core::{Record, Value};
use tidewater_sql::{QueryInfo, QueryStats};

#[derive(Tabled)]
struct StreamRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Format")]
    format: String,
    #[tabled(rename = "Partitions")]
    partitions: u32,
    #[tabled(rename = "Topic")]
    topic: String,
}

#[derive(Tabled)]
struct ColumnRow {
    #[tabled(rename = "Field")]
    name: String,
    #[tabled(rename = "Type")]
    type_name: String,
}

#[derive(Tabled)]
struct QueryRow {
    #[tabled(rename = "Query")]
    query_id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Processed")]
    processed: u64,
    #[tabled(rename = "Emitted")]
    emitted: u64,
    #[tabled(rename = "Filtered")]
    filtered: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
    #[tabled(rename = "Target")]
    target: String,
}

fn render<T: Tabled>(rows: Vec<T>) -> String {
    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));
    format!("{}\n", table)
}

/// One target record as a JSON line
pub fn record_line(stream: &str, record: &Record, value: &Value) -> String {
    let key = record
        .key
        .as_ref()
        .map(|k| String::from_utf8_lossy(k).into_owned());
    json!({
        "stream": stream,
        "partition": record.partition,
        "offset": record.offset,
        "timestamp": record.timestamp,
        "key": key,
        "value": value,
    })
    .to_string()
}

pub fn success(message: &str, colored: bool) -> String {
    if colored {
        format!("{} {}", "✅".green(), message)
    } else {
        format!("✅ {}", message)
    }
}

fn failure(message: &str, colored: bool) -> String {
    if colored {
        format!("{} {}", "❌".red(), message)
    } else {
        format!("❌ {}", message)
    }
}

fn key_value(key: &str, value: &str, colored: bool) -> String {
    if colored {
        format!("  {}: {}\n", key.bold(), value)
    } else {
        format!("  {}: {}\n", key, value)
    }
}

pub fn streams_table(streams: &[StreamInfo]) -> String {
    if streams.is_empty() {
        return "No streams found\n".to_string();
    }
    render(
        streams
            .iter()
            .map(|s| StreamRow {
                name: s.name.clone(),
                format: s.format.to_string(),
                partitions: s.partitions,
                topic: s.topic.clone(),
            })
            .collect(),
    )
}

pub fn description(desc: &StreamDescription, colored: bool) -> String {
    let mut out = String::new();
    out.push_str(&key_value("Name", &desc.name, colored));
    out.push_str(&key_value("Topic", &desc.topic, colored));
    out.push_str(&key_value("Format", &desc.format.to_string(), colored));
    out.push_str(&key_value("Partitions", &desc.partitions.to_string(), colored));
    out.push_str(&key_value("Replicas", &desc.replicas.to_string(), colored));
    if !desc.key_fields.is_empty() {
        out.push_str(&key_value("Key", &desc.key_fields.join(", "), colored));
    }
    if let Some(ts) = &desc.timestamp_field {
        out.push_str(&key_value("Timestamp", ts, colored));
    }

    out.push('\n');
    out.push_str(&render(
        desc.columns
            .iter()
            .map(|c| ColumnRow {
                name: c.name.clone(),
                type_name: c.type_name.clone(),
            })
            .collect(),
    ));
    out
}

/// Per-query counters, then the last error of every failed query
pub fn query_summary(queries: &[QueryInfo], stats: &[QueryStats], colored: bool) -> String {
    if queries.is_empty() {
        return "No queries found\n".to_string();
    }

    let rows = queries
        .iter()
        .zip(stats)
        .map(|(info, stats)| QueryRow {
            query_id: info.query_id.clone(),
            status: format!("{:?}", info.status),
            processed: stats.messages_processed,
            emitted: stats.messages_emitted,
            filtered: stats.messages_filtered,
            failed: stats.messages_failed,
            target: info.target.clone(),
        })
        .collect();
    let mut out = render(rows);
    for info in queries {
        if let Some(err) = &info.last_error {
            out.push_str(&failure(&format!("{}: {}", info.query_id, err), colored));
            out.push('\n');
        }
    }
    out
}

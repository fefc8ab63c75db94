use comfy_table::Table;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Json,
    Table,
}

/// Print `data` as pretty JSON; table output is built per command
pub fn print_json<T: Serialize>(data: &T) {
    match serde_json::to_string_pretty(&data) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!("Failed to serialize output: {e}"),
    }
}

/// Print one JSON object per line, for streaming output
pub fn print_json_line<T: Serialize>(data: &T) {
    match serde_json::to_string(data) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!("Failed to serialize output: {e}"),
    }
}

pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);
    table
}

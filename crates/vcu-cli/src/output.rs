//! Output formatting for vcuctl (table, json, csv)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print rows in the configured format
    pub fn print<T: Tabled + Serialize>(&self, rows: &[T]) {
        match self.format {
            OutputFormat::Table if rows.is_empty() => {
                if !self.quiet {
                    println!("No data");
                }
            }
            OutputFormat::Table => println!("{}", Table::new(rows)),
            OutputFormat::Json => match serde_json::to_string_pretty(rows) {
                Ok(json) => println!("{}", json),
                Err(e) => self.error(&format!("JSON encoding failed: {}", e)),
            },
            OutputFormat::Csv => {
                for line in csv_lines(rows) {
                    println!("{}", line);
                }
            }
        }
    }

    /// Print key-value pairs
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
                    .collect();
                println!("{}", Value::Object(map));
            }
            OutputFormat::Csv => {
                println!("{}", csv_record(pairs.iter().map(|(k, _)| *k)));
                println!("{}", csv_record(pairs.iter().map(|(_, v)| v.as_str())));
            }
        }
    }

    /// Header for a stream of rows printed one by one
    ///
    /// Only CSV output has one.
    pub fn print_stream_header<T: Tabled>(&self) {
        if self.format == OutputFormat::Csv {
            println!("{}", csv_record(T::headers()));
        }
    }

    /// Print one row of a stream: `line` for tables, one JSON object per line
    /// otherwise
    pub fn print_stream_row<T: Tabled + Serialize>(&self, row: &T, line: &str) {
        match self.format {
            OutputFormat::Table => println!("{}", line),
            OutputFormat::Json => match serde_json::to_string(row) {
                Ok(json) => println!("{}", json),
                Err(e) => self.error(&format!("JSON encoding failed: {}", e)),
            },
            OutputFormat::Csv => println!("{}", csv_record(row.fields())),
        }
    }
}

/// Header line followed by one line per row, columns in declaration order
fn csv_lines<T: Tabled>(rows: &[T]) -> Vec<String> {
    if rows.is_empty() {
        return Vec::new();
    }
    let header = csv_record(T::headers());
    std::iter::once(header)
        .chain(rows.iter().map(|row| csv_record(row.fields())))
        .collect()
}

fn csv_record<S: AsRef<str>>(cells: impl IntoIterator<Item = S>) -> String {
    cells
        .into_iter()
        .map(|cell| escape_csv(cell.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_csv(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render a JSON value without quoting plain strings
pub fn format_json_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One registry entry, for `params`
#[derive(Debug, Tabled, Serialize)]
pub struct ParameterRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Request")]
    pub request: String,
    #[tabled(rename = "Response")]
    pub response: String,
    #[tabled(rename = "Interval")]
    pub interval_ms: u64,
    #[tabled(rename = "Unit")]
    pub unit: String,
}

/// One received frame, for `send` and `write`
#[derive(Debug, Tabled, Serialize)]
pub struct FrameRow {
    #[tabled(rename = "Time")]
    pub timestamp: String,
    #[tabled(rename = "ID")]
    pub can_id: String,
    #[tabled(rename = "Data")]
    pub data: String,
}

/// One parameter update, for `monitor`
///
/// JSON carries the decoded value as is; the table and CSV use its rendered
/// form.
#[derive(Debug, Tabled, Serialize)]
pub struct UpdateRow {
    #[tabled(rename = "Time")]
    pub timestamp: String,
    #[tabled(rename = "Parameter")]
    pub parameter: String,
    #[tabled(rename = "Value")]
    #[serde(skip)]
    pub rendered: String,
    #[tabled(skip)]
    pub value: Value,
    #[tabled(rename = "Unit")]
    pub unit: String,
}

impl UpdateRow {
    pub fn new(timestamp: String, parameter: &str, value: &Value, unit: String) -> Self {
        Self {
            timestamp,
            parameter: parameter.to_string(),
            rendered: format_json_value(value),
            value: value.clone(),
            unit,
        }
    }
}

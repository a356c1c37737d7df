// Output formatting for CLI

use anyhow::Result;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            "yaml" => OutputFormat::Yaml,
            _ => OutputFormat::Text,
        }
    }

    pub fn print_value<T: Serialize>(&self, value: &T) -> Result<()> {
        match self {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(value)?);
            }
            OutputFormat::Yaml => {
                println!("{}", serde_yaml::to_string(value)?);
            }
            OutputFormat::Text => {
                // Text format is handled by each command
            }
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }
}

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<14} {}", format!("{}:", label), value);
}

/// Print a table header
pub fn print_table_header(columns: &[(&str, usize)]) {
    println!("{}", format_row(columns));
}

/// Print a table row
pub fn print_table_row(values: &[(&str, usize)]) {
    println!("{}", format_row(values));
}

fn format_row(cells: &[(&str, usize)]) -> String {
    cells
        .iter()
        .map(|(val, width)| {
            let s = if val.chars().count() > *width && *width > 3 {
                format!("{}...", val.chars().take(width - 3).collect::<String>())
            } else {
                val.to_string()
            };
            format!("{:<width$}", s, width = width)
        })
        .collect::<Vec<_>>()
        .join("  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_str() {
        assert_eq!(OutputFormat::from_str("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("yaml"), OutputFormat::Yaml);
        assert_eq!(OutputFormat::from_str("anything"), OutputFormat::Text);
        assert!(OutputFormat::Text.is_text());
    }

    #[test]
    fn test_long_cells_are_truncated() {
        let row = format_row(&[("worker-0123456789", 10), ("ok", 4)]);
        assert_eq!(row, "worker-...  ok  ");
    }

    #[test]
    fn test_truncation_respects_multibyte_chars() {
        // The cut point falls inside the 2-byte 'é' when counting bytes.
        let row = format_row(&[("résumé-résumé", 5)]);
        assert_eq!(row, "ré...");
    }
}

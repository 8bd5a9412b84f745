use anyhow::{Context, Result};

use crate::config::FleetConfig;
use crate::http::CoordinatorClient;

pub mod config;
pub mod gate_check;
pub mod list;
pub mod retention;
pub mod serve;
pub mod status;
pub mod worker;

/// Client for the configured coordinator, honouring the configured request timeout
pub fn coordinator_client(config: &FleetConfig) -> Result<CoordinatorClient> {
    CoordinatorClient::new(&config.coordinator.api_url, config.coordinator.request_timeout)
        .with_context(|| format!("failed to build client for {}", config.coordinator.api_url))
}

/// Render rows as left-aligned columns under a header
pub(crate) fn render_table(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![line(header.to_vec())];
    out.extend(rows.iter().map(|r| line(r.iter().map(String::as_str).collect())));
    out.join("\n")
}

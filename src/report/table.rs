use std::io::Write;
use crate::pipeline::EnrichedRow;
use crate::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct TableOptions {
    pub include_hostname: bool,
    pub include_readme: bool,
}

const BASE_COLUMNS: [&str; 13] = [
    "Protocol",
    "Local Address",
    "Foreign Address",
    "Status",
    "PID",
    "Process Name",
    "City",
    "Region",
    "Country",
    "Location",
    "Organization",
    "Postal",
    "Timezone",
];

pub fn headers(options: TableOptions) -> Vec<&'static str> {
    let mut headers = BASE_COLUMNS.to_vec();
    if options.include_hostname {
        headers.push("Hostname");
    }
    if options.include_readme {
        headers.push("Readme");
    }
    headers
}

pub fn row_cells(row: &EnrichedRow, options: TableOptions) -> Vec<String> {
    let conn = &row.connection;
    let geo = &row.geo;

    let mut cells = vec![
        conn.protocol.to_string(),
        conn.local_display(),
        conn.remote_display(),
        conn.status.to_string(),
        conn.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "N/A".to_string()),
        row.process_name().to_string(),
        geo.city.clone(),
        geo.region.clone(),
        geo.country.clone(),
        geo.location_display(),
        geo.organization.clone(),
        geo.postal.clone(),
        geo.timezone.clone(),
    ];

    if options.include_hostname {
        cells.push(geo.hostname.clone());
    }
    if options.include_readme {
        cells.push(geo.readme.clone());
    }
    cells
}

/// Columns printed ahead of the map, one row per connection.
const SUMMARY_COLUMNS: [&str; 9] = [
    "Local Address",
    "Foreign Address",
    "Hostname",
    "Organization",
    "Status",
    "Process Name",
    "City",
    "Region",
    "Country",
];

pub fn summary_cells(row: &EnrichedRow) -> Vec<String> {
    let conn = &row.connection;
    let geo = &row.geo;

    vec![
        conn.local_display(),
        conn.remote_display(),
        geo.hostname.clone(),
        geo.organization.clone(),
        conn.status.to_string(),
        row.process_name().to_string(),
        geo.city.clone(),
        geo.region.clone(),
        geo.country.clone(),
    ]
}

/// Writes rows as left-aligned, space-padded columns in the order given.
pub fn render_table<W: Write>(out: &mut W, rows: &[EnrichedRow], options: TableOptions) -> Result<()> {
    let body: Vec<Vec<String>> = rows.iter().map(|row| row_cells(row, options)).collect();
    write_columns(out, &headers(options), &body)
}

/// Map-mode connection summary. Rows without coordinates are listed too.
pub fn render_summary_table<W: Write>(out: &mut W, rows: &[EnrichedRow]) -> Result<()> {
    let body: Vec<Vec<String>> = rows.iter().map(summary_cells).collect();
    write_columns(out, &SUMMARY_COLUMNS, &body)
}

fn write_columns<W: Write>(out: &mut W, headers: &[&str], body: &[Vec<String>]) -> Result<()> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for cells in body {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.chars().count());
        }
    }

    write_line(out, headers.iter().copied(), &widths)?;
    for cells in body {
        write_line(out, cells.iter().map(String::as_str), &widths)?;
    }
    Ok(())
}

fn write_line<'a, W, I>(out: &mut W, cells: I, widths: &[usize]) -> Result<()>
where
    W: Write,
    I: Iterator<Item = &'a str>,
{
    let line = cells
        .zip(widths)
        .map(|(cell, &width)| format!("{:<width$}", cell, width = width))
        .collect::<Vec<_>>()
        .join("  ");
    writeln!(out, "{}", line.trim_end())?;
    Ok(())
}

//! Shared helpers for the command line tools.

use crate::config::{load_config, load_config_from, Config};
use crate::divvy::{DistributionReport, DivvyRanking};
use crate::error::Result;
use crate::models::PendingDistribution;
use crate::persistence::{Database, DividendOverview};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Color as TableColor;
use comfy_table::{Attribute, Cell, CellAlignment, ContentArrangement, Table};
use std::path::Path;

/// Load the configuration (from `path` when given) and open its database.
pub fn open_database_from_config(path: Option<&Path>) -> Result<(Config, Database)> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let db = Database::open(&config.database.path)?;
    Ok((config, db))
}

fn header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| {
            Cell::new(label)
                .fg(TableColor::Cyan)
                .add_attribute(Attribute::Bold)
        })
        .collect()
}

fn new_table(labels: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header(labels));
    table
}

/// `12345678` satoshis as `0.12345678 BSV`.
pub fn format_satoshis(amount: u64) -> String {
    format!("{}.{:08} BSV", amount / 100_000_000, amount % 100_000_000)
}

/// First and last characters of a long id.
pub fn short_id(id: &str) -> String {
    if id.len() > 16 {
        format!("{}...{}", &id[..8], &id[id.len() - 4..])
    } else {
        id.to_string()
    }
}

pub fn rankings_table(rankings: &[DivvyRanking]) -> Table {
    let mut table = new_table(&["#", "Symbol", "Owner", "Holders", "Price", "Dividends", "Payments"]);
    for (rank, entry) in rankings.iter().enumerate() {
        let change = if entry.metrics.change_24h >= 0.0 {
            TableColor::Green
        } else {
            TableColor::Red
        };
        table.add_row(vec![
            Cell::new(rank + 1),
            Cell::new(&entry.symbol).add_attribute(Attribute::Bold),
            Cell::new(&entry.owner.display_name),
            Cell::new(entry.holders).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.6}", entry.metrics.price)).fg(change),
            Cell::new(format_satoshis(entry.total_dividends_paid))
                .set_alignment(CellAlignment::Right),
            Cell::new(entry.dividend_payments).set_alignment(CellAlignment::Right),
        ]);
    }
    table
}

pub fn pending_table(pending: &[PendingDistribution]) -> Table {
    let mut table = new_table(&["Distribution", "Token", "Holder", "Holding", "Amount", "Payment"]);
    for entry in pending {
        table.add_row(vec![
            Cell::new(short_id(&entry.distribution.id)),
            Cell::new(&entry.token.symbol),
            Cell::new(&entry.distribution.holder_handle),
            Cell::new(entry.distribution.holding_amount).set_alignment(CellAlignment::Right),
            Cell::new(entry.distribution.amount).set_alignment(CellAlignment::Right),
            Cell::new(short_id(&entry.payment.payment_tx_id)),
        ]);
    }
    table
}

pub fn overview_table(overview: &DividendOverview) -> Table {
    let mut table = new_table(&["Metric", "Value"]);
    table.add_row(vec![
        Cell::new("Total dividends paid"),
        Cell::new(format_satoshis(overview.total_dividends_paid)).fg(TableColor::Green),
    ]);
    table.add_row(vec![
        Cell::new("Tokens paying dividends"),
        Cell::new(overview.active_tokens),
    ]);
    table.add_row(vec![
        Cell::new("Pending distributions"),
        Cell::new(overview.pending_distributions).fg(if overview.pending_distributions > 0 {
            TableColor::Yellow
        } else {
            TableColor::Green
        }),
    ]);
    table.add_row(vec![Cell::new("Holders"), Cell::new(overview.total_holders)]);
    table
}

pub fn report_table(report: &DistributionReport) -> Table {
    let mut table = new_table(&["Payment", "Processed", "Successful", "Failed"]);
    table.add_row(vec![
        Cell::new(short_id(&report.payment_id)),
        Cell::new(report.processed),
        Cell::new(report.successful).fg(TableColor::Green),
        Cell::new(report.failed).fg(if report.failed > 0 {
            TableColor::Red
        } else {
            TableColor::Green
        }),
    ]);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_satoshis() {
        assert_eq!(format_satoshis(0), "0.00000000 BSV");
        assert_eq!(format_satoshis(150_000_000), "1.50000000 BSV");
        assert_eq!(format_satoshis(42), "0.00000042 BSV");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(
            short_id("0123456789abcdef-0123"),
            "01234567...0123"
        );
    }

    #[test]
    fn test_overview_table_renders_values() {
        let rendered = overview_table(&DividendOverview {
            total_dividends_paid: 100_000_000,
            active_tokens: 2,
            pending_distributions: 0,
            total_holders: 7,
        })
        .to_string();
        assert!(rendered.contains("1.00000000 BSV"));
        assert!(rendered.contains("Holders"));
    }
}

//! Stage reports rendered as terminal tables.

use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use engagement_analysis::AnalysisReport;
use engagement_coding::CodingReport;
use engagement_config::ConfigIssue;
use engagement_sync::SyncReport;

fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

fn warn_cell(count: usize) -> Cell {
    if count > 0 {
        Cell::new(count).fg(Color::Yellow)
    } else {
        Cell::new(count)
    }
}

pub fn sync_table(report: &SyncReport) -> Table {
    let mut table = table(&["Dataset", "Inserted", "Unchanged", "Conflicts"]);
    for (dataset, counts) in &report.per_dataset {
        table.add_row(vec![
            Cell::new(dataset),
            Cell::new(counts.inserted),
            Cell::new(counts.unchanged),
            warn_cell(counts.conflicts),
        ]);
    }
    table.add_row(vec![
        Cell::new("total").fg(Color::Green),
        Cell::new(report.inserted),
        Cell::new(report.unchanged),
        warn_cell(report.conflicts),
    ]);
    table
}

pub fn coding_table(report: &CodingReport) -> Table {
    let mut table = table(&[
        "Coding dataset",
        "Messages",
        "Auto-coded",
        "Not coded",
        "Manual",
        "Rejected",
        "Awaiting review",
        "WS moved",
        "Errors",
    ]);
    let total = report.total();
    let rows = report
        .datasets
        .iter()
        .map(|(name, r)| (Cell::new(name), r))
        .chain(std::iter::once((Cell::new("total").fg(Color::Green), &total)));
    for (name, r) in rows {
        table.add_row(vec![
            name,
            Cell::new(r.messages),
            Cell::new(r.auto_coded),
            Cell::new(r.not_coded),
            Cell::new(r.manual_applied),
            warn_cell(r.manual_rejected),
            Cell::new(r.awaiting_manual),
            Cell::new(r.ws_moved),
            warn_cell(r.auto_coding_errors),
        ]);
    }
    table
}

pub fn analysis_table(report: &AnalysisReport) -> Table {
    let mut table = table(&[
        "Analysis dataset",
        "Messages",
        "Test excluded",
        "Uncoded",
        "Records",
        "Participants",
        "Not reviewed cells",
    ]);
    for (name, counts) in &report.datasets {
        table.add_row(vec![
            Cell::new(name),
            Cell::new(counts.messages_read),
            Cell::new(counts.test_participants_excluded),
            Cell::new(counts.uncoded_excluded),
            Cell::new(counts.records),
            Cell::new(counts.participants),
            warn_cell(counts.not_reviewed_cells),
        ]);
    }
    table
}

pub fn issues_table(issues: &[ConfigIssue]) -> Table {
    let mut table = table(&["Location", "Problem"]);
    for issue in issues {
        table.add_row(vec![
            Cell::new(&issue.location),
            Cell::new(&issue.message).fg(Color::Red),
        ]);
    }
    table
}

pub fn print_sync_report(report: &SyncReport) {
    println!("Sync: {} flows, {} responses", report.flows_fetched, report.responses_seen);
    println!("{}", sync_table(report));
    if !report.skipped.is_empty() {
        println!("Skipped {} responses with unconfigured fields", report.skipped.len());
    }
    if report.cancelled {
        println!("Sync was cancelled; re-run to resume");
    }
}

pub fn print_coding_report(report: &CodingReport) {
    println!("{}", coding_table(report));
    for (name, dataset) in &report.datasets {
        for sample in &dataset.error_samples {
            println!("  {} auto-coding error: {}", name, sample);
        }
    }
    if report.cancelled {
        println!("Coding was cancelled; re-run to resume");
    }
}

pub fn print_analysis_report(report: &AnalysisReport) {
    println!("{}", analysis_table(report));
    if report.exported > 0 {
        println!("Exported {} analysis datasets", report.exported);
    }
    if report.cancelled {
        println!("Analysis was cancelled");
    }
}

//! Compliance report pretty-printing — `retouch inspect`.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

pub fn cmd_inspect(report: &Path) -> Result<()> {
    use retouch::fixer::{ComplianceResult, Severity};

    let raw = std::fs::read_to_string(report)
        .with_context(|| format!("Failed to read report {}", report.display()))?;
    let compliance: ComplianceResult = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse report {}", report.display()))?;

    let verdict = if compliance.passed {
        style("PASS").green().bold()
    } else {
        style("FAIL").red().bold()
    };
    println!("{} — score {}/100", verdict, style(compliance.score).cyan());

    if let Some(context) = &compliance.listing_context {
        println!("Listing: {}", style(context).dim());
    }

    if compliance.violations.is_empty() {
        println!("\nNo violations recorded.");
    } else {
        println!(
            "\n{} violations ({} critical, {} warning, {} info):",
            compliance.violations.len(),
            compliance.count_by_severity(Severity::Critical),
            compliance.count_by_severity(Severity::Warning),
            compliance.count_by_severity(Severity::Info),
        );
        for violation in &compliance.violations {
            let marker = match violation.severity {
                Severity::Critical => style("●").red(),
                Severity::Warning => style("●").yellow(),
                Severity::Info => style("●").blue(),
            };
            println!(
                "  {} [{}] {}: {}",
                marker,
                violation.severity,
                style(&violation.category).bold(),
                violation.message
            );
            if !violation.recommendation.is_empty() {
                println!("      fix: {}", style(&violation.recommendation).dim());
            }
            if let Some(region) = &violation.region {
                println!("      region: {}", style(region).dim());
            }
        }
    }

    if !compliance.recommendations.is_empty() {
        println!("\nAnalyzer recommendations:");
        for rec in &compliance.recommendations {
            println!("  - {}", rec);
        }
    }

    Ok(())
}

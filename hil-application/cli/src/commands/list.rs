//! List 命令处理

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::catalog::demo_catalog;

#[derive(Serialize)]
struct SequenceRow {
    name: String,
    description: String,
    steps: usize,
}

pub async fn handle(json: bool) -> Result<()> {
    let rows: Vec<SequenceRow> = demo_catalog()?
        .list()
        .into_iter()
        .map(|entry| SequenceRow {
            name: entry.name,
            description: entry.description,
            steps: entry.step_count,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<16} {:<8} {}", "名称".bold(), "步骤".bold(), "描述".bold());
    println!("{}", "-".repeat(60));
    for row in &rows {
        println!(
            "{:<16} {:<8} {}",
            row.name.cyan(),
            row.steps.to_string().yellow(),
            row.description.bright_black()
        );
    }

    Ok(())
}

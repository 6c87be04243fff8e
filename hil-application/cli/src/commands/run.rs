//! Run 命令处理

use anyhow::{Context, Result};
use colored::Colorize;
use hil_flow::{CancellationToken, MemoryAccumulator, RunReport, Sequencer, TagRuleTable};
use hil_orchestrator::{HilApp, StartSignal};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::catalog::demo_catalog;
use crate::config::HilConfig;
use crate::console::{ConsoleDispatcher, ConsoleOptions};

pub struct RunArgs {
    pub sequences: Vec<String>,
    pub repeat: u32,
    pub auto_recover: bool,
    pub json: bool,
    pub report_dir: Option<PathBuf>,
}

pub async fn handle(config: &HilConfig, args: RunArgs) -> Result<()> {
    let catalog = demo_catalog()?;

    let mut requests = Vec::new();
    for round in 0..args.repeat.max(1) {
        for name in &args.sequences {
            let sequence = catalog
                .instantiate(name)
                .with_context(|| format!("未知序列: {} (使用 `hil list` 查看可用序列)", name))?;
            requests.push(
                StartSignal::new(sequence)
                    .with_metadata("source", "cli")
                    .with_metadata("round", &(round + 1).to_string()),
            );
        }
    }
    info!("提交 {} 个测试请求", requests.len());

    let sequencer = build_sequencer(config)?;
    let accumulator = Arc::new(MemoryAccumulator::new());

    let console = ConsoleDispatcher::new(
        requests,
        ConsoleOptions {
            json: args.json,
            auto_recover: args.auto_recover,
            handle_ctrl_c: true,
        },
    );
    let results = console.results();

    let mut app = HilApp::new(sequencer, config.orchestrator.clone())?
        .with_accumulator(accumulator.clone());
    app.add_dispatcher(console);
    app.run(CancellationToken::new())
        .await
        .context("编排器运行失败")?;

    let history = accumulator.history().await;
    if let Some(dir) = &args.report_dir {
        let written = write_reports(dir, &history)?;
        info!("已导出 {} 份运行报告到 {:?}", written, dir);
    }

    let results = results.lock().await;
    let passed = results.iter().filter(|r| r.is_passing).count();
    let cancelled = results.iter().filter(|r| r.cancelled).count();
    let failed = results.len() - passed - cancelled;

    if !args.json {
        println!("\n{}", "=".repeat(60));
        println!("{}", "运行汇总".bold());
        println!("{}", "=".repeat(60));
        for report in history.iter().rev() {
            let verdict = if report.is_passing {
                "PASS".green()
            } else if report.cancelled {
                "CANCELLED".yellow()
            } else {
                "FAIL".red()
            };
            println!(
                "  {:<10} {:<16} {:>8} ms  {}/{} 步骤",
                verdict,
                report.sequence_name,
                report.duration_ms,
                report.step_passed.iter().filter(|p| **p).count(),
                report.step_passed.len()
            );
        }
        println!();
        println!("  总数:   {}", results.len().to_string().bright_blue());
        println!("  通过:   {}", passed.to_string().green());
        println!("  失败:   {}", failed.to_string().red());
        println!("  取消:   {}", cancelled.to_string().yellow());
    }

    if passed < results.len() {
        anyhow::bail!("{} 个测试未通过", results.len() - passed);
    }

    Ok(())
}

/// 每个运行报告写成一个 JSON 文件: <序列名>-<test_id>.json
fn write_reports(dir: &Path, reports: &[RunReport]) -> Result<usize> {
    fs::create_dir_all(dir).with_context(|| format!("创建报告目录失败: {:?}", dir))?;

    for report in reports {
        let path = dir.join(format!("{}-{}.json", report.sequence_name, report.test_id));
        let content = report.to_json().context("序列化运行报告失败")?;
        fs::write(&path, content).with_context(|| format!("写入报告失败: {:?}", path))?;
    }

    Ok(reports.len())
}

/// 按配置选择标签判定方式
fn build_sequencer(config: &HilConfig) -> Result<Sequencer> {
    let sequencer = Sequencer::new();

    match &config.results.tags_file {
        Some(path) => {
            let table = TagRuleTable::from_yaml_file(path)
                .with_context(|| format!("加载标签规则失败: {:?}", path))?;
            info!("使用标签规则表: {:?} ({} 条)", path, table.len());
            Ok(sequencer.with_evaluator(Arc::new(table)))
        }
        None => Ok(sequencer),
    }
}

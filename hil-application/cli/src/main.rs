//! HIL CLI 应用

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};

mod catalog;
mod commands;
mod config;
mod console;

use config::HilConfig;

#[derive(Parser)]
#[command(name = "hil")]
#[command(about = "HIL - 硬件在环测试序列编排", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别 (覆盖配置文件)
    #[arg(short, long)]
    log_level: Option<String>,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出可用序列
    List {
        /// JSON 格式输出
        #[arg(long)]
        json: bool,
    },

    /// 运行一个或多个序列
    Run {
        /// 序列名称
        #[arg(required = true)]
        sequences: Vec<String>,

        /// 重复次数
        #[arg(short, long, default_value = "1")]
        repeat: u32,

        /// 致命错误后自动恢复
        #[arg(long)]
        auto_recover: bool,

        /// 以 JSON 行输出结果
        #[arg(long)]
        json: bool,

        /// 运行报告导出目录
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },

    /// 配置管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// 显示当前生效的配置
    Show,
    /// 写入默认配置文件
    Init {
        /// 覆盖已存在的文件
        #[arg(long)]
        force: bool,
    },
    /// 显示配置文件路径
    Path,
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let explicit = cli.config.as_deref();

    // init 不依赖已有配置文件是否有效
    if let Commands::Config {
        action: ConfigAction::Init { force },
    } = cli.command
    {
        let level = cli.log_level.as_deref().unwrap_or("info");
        tracing_subscriber::fmt().with_max_level(parse_level(level)).init();
        return commands::config::handle(
            ConfigAction::Init { force },
            &HilConfig::default(),
            None,
            explicit,
        )
        .await;
    }

    let (config, source) = HilConfig::load(explicit)?;

    // 初始化日志
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .init();

    info!("HIL CLI 启动");

    match cli.command {
        Commands::List { json } => commands::list::handle(json).await?,
        Commands::Run {
            sequences,
            repeat,
            auto_recover,
            json,
            report_dir,
        } => {
            let args = commands::run::RunArgs {
                sequences,
                repeat,
                auto_recover,
                json,
                report_dir,
            };
            commands::run::handle(&config, args).await?
        }
        Commands::Config { action } => {
            commands::config::handle(action, &config, source.as_deref(), explicit).await?
        }
    }

    Ok(())
}

//! Config 命令处理

use anyhow::Result;
use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::config::HilConfig;
use crate::ConfigAction;

pub async fn handle(
    action: ConfigAction,
    config: &HilConfig,
    source: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<()> {
    match action {
        ConfigAction::Show => show(config, source),
        ConfigAction::Init { force } => init(explicit, force),
        ConfigAction::Path => path(source),
    }
}

fn show(config: &HilConfig, source: Option<&Path>) -> Result<()> {
    match source {
        Some(path) => println!("{} {}", "# 配置文件:".bright_black(), path.display()),
        None => println!("{}", "# 未找到配置文件，使用默认配置".bright_black()),
    }
    print!("{}", config.to_toml()?);
    Ok(())
}

fn init(explicit: Option<&Path>, force: bool) -> Result<()> {
    let target: PathBuf = match explicit {
        Some(path) => path.to_path_buf(),
        None => HilConfig::user_config_path()?,
    };

    if target.exists() && !force {
        anyhow::bail!("配置文件已存在: {:?} (使用 --force 覆盖)", target);
    }

    HilConfig::default().save(&target)?;
    println!("{} 已写入默认配置: {}", "✓".green().bold(), target.display());
    Ok(())
}

fn path(source: Option<&Path>) -> Result<()> {
    match source {
        Some(path) => println!("{}", path.display()),
        None => println!(
            "{} (不存在)",
            HilConfig::user_config_path()?.display().to_string().bright_black()
        ),
    }
    Ok(())
}

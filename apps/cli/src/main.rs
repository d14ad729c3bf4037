//! # trigsync CLI
//!
//! 触发同步采集的命令行工具。
//!
//! ```bash
//! # 主控：以 10 Hz 产生触发并向订阅者投递
//! trigsync master --bind 0.0.0.0:18900 --rate 10
//!
//! # 前端：订阅主控的触发并逐个读出
//! trigsync listen --master 192.168.1.10:18900 --name adc-1
//! ```
//!
//! 日志级别由 `RUST_LOG` 控制，默认 `trigsync=info`。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod shutdown;

use commands::{ListenCommand, MasterCommand};
use config::LoadedConfig;
use shutdown::Shutdown;

/// trigsync - 触发同步命令行工具
#[derive(Parser, Debug)]
#[command(name = "trigsync")]
#[command(about = "Trigger-rate master and synchronised frontend listener", long_about = None)]
#[command(version)]
struct Cli {
    /// 配置文件（TOML，含 [trigger] 与 [sync] 节）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 产生稳定触发并向订阅者投递
    Master {
        #[command(flatten)]
        args: MasterCommand,
    },

    /// 作为前端订阅触发并读出
    Listen {
        #[command(flatten)]
        args: ListenCommand,
    },
}

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trigsync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let loaded = LoadedConfig::load(cli.config.as_deref())?;
    let shutdown = Shutdown::install()?;

    match cli.command {
        Commands::Master { args } => args.execute(&loaded, &shutdown),
        Commands::Listen { args } => args.execute(&loaded, &shutdown),
    }
}

//! lockctl
//!
//! 分布式锁的命令行入口点。配置加载顺序见 `AppConfig::load`，
//! 命令行全局参数优先级最高。

use anyhow::Context;
use clap::Parser;
use distlock::LockClient;
use distlock::cli::{Cli, CommandRunner, Commands};
use distlock_shared::config::AppConfig;
use distlock_shared::observability;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 不存在时忽略
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = AppConfig::load("lockctl").context("加载配置失败")?;
    cli.apply_overrides(&mut config);
    observability::init(&config.observability)?;

    let client = LockClient::connect(&config)
        .await
        .context("连接锁存储失败")?;
    let runner = CommandRunner::new(client.clone());

    let result = match cli.command {
        Commands::Hold {
            key,
            hold_secs,
            wait_secs,
        } => {
            runner
                .run_hold(
                    &key,
                    Duration::from_secs(hold_secs),
                    wait_secs.map(Duration::from_secs),
                )
                .await
        }
        Commands::Try { key } => runner.run_try(&key).await.map(|_| ()),
        Commands::Status { key } => runner.run_status(&key).await.map(|_| ()),
        Commands::Ping => runner.run_ping().await,
    };

    client.shutdown().await;
    result
}

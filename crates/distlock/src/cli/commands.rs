//! CLI 命令定义
//!
//! 使用 clap derive 宏定义命令行接口结构。全局参数覆盖配置文件中的同名项。

use clap::{Parser, Subcommand, ValueEnum};
use distlock_shared::config::{AppConfig, BackendStrategy};

/// 分布式锁命令行工具
#[derive(Parser, Debug)]
#[command(name = "lockctl")]
#[command(version, about = "分布式锁运维工具")]
#[command(propagate_version = true)]
pub struct Cli {
    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// 锁后端，覆盖配置
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Redis 地址，覆盖配置
    #[arg(long)]
    pub redis_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// 命令行可选的后端
///
/// 层级节点后端需要注入存储会话，命令行不提供
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Redis,
    Memory,
}

impl From<BackendArg> for BackendStrategy {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Redis => Self::Redis,
            BackendArg::Memory => Self::Memory,
        }
    }
}

impl Cli {
    /// 把命令行覆盖项写入配置
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        if let Some(backend) = self.backend {
            config.lock.backend = backend.into();
        }
        if let Some(url) = &self.redis_url {
            config.redis.url = url.clone();
        }
    }
}

/// 子命令枚举
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 获取锁并持有一段时间
    ///
    /// 持有期间自动续期，按 Ctrl+C 提前释放。
    Hold {
        /// 锁 key
        key: String,

        /// 持有时长（秒）
        #[arg(long, default_value = "30")]
        hold_secs: u64,

        /// 最长等待时间（秒），不指定时一直等待
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// 尝试获取一次锁，成功后立即释放
    Try {
        /// 锁 key
        key: String,
    },

    /// 查看锁记录的剩余存活时间
    Status {
        /// 锁 key
        key: String,
    },

    /// 检查锁存储是否可达
    Ping,
}

//! pvget：按名称读取过程变量的当前值。
//!
//! # 使用方法
//! ```bash
//! pvget [--config client.toml] [--timeout 2.0] [--monitor 10] NAME...
//! ```
//! - `--config`：可选，TOML 格式的 [`ClientConfig`]；缺省使用内置默认值；
//! - `--timeout`：连接与读取各自的超时秒数，默认 2 秒；
//! - `--monitor`：读取后继续订阅给定秒数并打印每次更新。
//!
//! 日志级别由 `RUST_LOG` 控制，默认 `info`，输出到标准错误。

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use pvlink_client::driver;
use pvlink_client::{ClientConfig, SubscriptionId, SubscriptionSpec, SyncBridge};
use pvlink_core::wire::{DbrType, Reading};
use tracing_subscriber::EnvFilter;

struct Options {
    config: Option<PathBuf>,
    timeout: Duration,
    monitor: Option<Duration>,
    names: Vec<String>,
}

fn usage(detail: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "{detail}\n用法: pvget [--config FILE] [--timeout SECS] [--monitor SECS] NAME..."
    )
}

fn seconds(flag: &str, value: Option<String>) -> anyhow::Result<Duration> {
    let raw = value.ok_or_else(|| usage(&format!("{flag} 之后必须提供秒数")))?;
    let secs: f64 = raw
        .parse()
        .with_context(|| format!("{flag} 的取值不是数字: {raw}"))?;
    Duration::try_from_secs_f64(secs).with_context(|| format!("{flag} 的取值无效: {raw}"))
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Options {
            config: None,
            timeout: Duration::from_secs(2),
            monitor: None,
            names: Vec::new(),
        };
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args
                        .next()
                        .ok_or_else(|| usage("--config 之后必须提供文件路径"))?;
                    options.config = Some(PathBuf::from(path));
                }
                "--timeout" => options.timeout = seconds("--timeout", args.next())?,
                "--monitor" => options.monitor = Some(seconds("--monitor", args.next())?),
                flag if flag.starts_with("--") => return Err(usage(&format!("未知参数: {flag}"))),
                name => options.names.push(name.to_owned()),
            }
        }
        if options.names.is_empty() {
            return Err(usage("至少需要一个过程变量名"));
        }
        Ok(options)
    }
}

fn render(reading: &Reading) -> String {
    format!(
        "{} [{} {}]",
        reading.value, reading.severity, reading.status
    )
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = Options::parse(env::args().skip(1))?;
    let config = match &options.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
            ClientConfig::from_toml_str(&raw)?
        }
        None => ClientConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("构建 Tokio 运行时失败")?;
    let client = runtime.block_on(driver::spawn(config))?;
    let bridge = SyncBridge::new(client.context().clone());

    let mut failures = 0usize;
    let mut channels = Vec::new();
    for name in &options.names {
        let outcome = bridge.connect(name, options.timeout).and_then(|channel| {
            channels.push(channel);
            bridge.get(channel, DbrType::Double, 0, options.timeout)
        });
        match outcome {
            Ok(reading) => println!("{name} {}", render(&reading)),
            Err(err) => {
                eprintln!("{name}: {err} ({})", err.code());
                failures += 1;
            }
        }
    }

    if let Some(window) = options.monitor {
        for channel in &channels {
            let name = bridge
                .context()
                .channel_info(*channel)
                .map(|info| info.name)
                .unwrap_or_default();
            bridge.context().subscribe(
                *channel,
                SubscriptionSpec::new(DbrType::Double),
                Arc::new(move |_: SubscriptionId, reading: &Reading| println!("{name} {}", render(reading))),
            )?;
        }
        std::thread::sleep(window);
    }

    client.shutdown();
    runtime.shutdown_timeout(Duration::from_secs(1));
    if failures > 0 {
        bail!("{failures} 个过程变量读取失败");
    }
    Ok(())
}

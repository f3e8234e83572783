// 瞬時電力と瞬時電流を周期的に読み取ってログに出す。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use anyhow::Context;
use clap::Parser;
use denkimeter::{Error, Meter, MeterConfig};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// スマートメーターの瞬時値モニター
#[derive(Parser, Debug)]
#[command(name = "power_monitor")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML設定ファイル
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// シリアルデバイス名
    #[arg(short = 'D', long, env = "ROUTE_B_DEVICE", default_value = "/dev/ttyUSB0")]
    device: String,

    /// ルートBID(32文字)
    #[arg(long, env = "ROUTE_B_ID")]
    id: Option<String>,

    /// ルートBパスワード
    #[arg(long, env = "ROUTE_B_PASSWORD")]
    password: Option<String>,

    /// 読み取り間隔(秒)
    #[arg(short, long, default_value_t = 60)]
    interval: u64,
}

fn load_config(cli: &Cli) -> anyhow::Result<MeterConfig> {
    if let Some(path) = &cli.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read \"{}\"", path.display()))?;
        return toml::from_str(&text).context("failed to parse the configuration file");
    }
    let id = cli
        .id
        .clone()
        .context("either --config or --id/ROUTE_B_ID must be given")?;
    let password = cli
        .password
        .clone()
        .context("either --config or --password/ROUTE_B_PASSWORD must be given")?;
    Ok(MeterConfig::new(
        id.parse().map_err(anyhow::Error::msg)?,
        password.parse().map_err(anyhow::Error::msg)?,
        cli.device.clone(),
    ))
}

fn monitor(meter: &Meter, interval: Duration) -> denkimeter::Result<()> {
    loop {
        let power = meter.get_instantaneous_power()?;
        let current = meter.get_instantaneous_current()?;
        tracing::info!(
            "instantaneous power: {} W, current: R {} A / T {} A",
            power,
            current.r_phase,
            current.t_phase
        );
        thread::sleep(interval);
    }
}

fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    // デバッグレベルは RUST_LOG 環境変数で設定できる
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let interval = Duration::from_secs(cli.interval);

    loop {
        let meter = Meter::open(&config)?;
        match monitor(&meter, interval) {
            Err(Error::NeedToReopen(reason)) => {
                tracing::warn!("reopening the session: {}", reason);
                drop(meter);
                thread::sleep(Duration::from_secs(10));
            }
            Err(e) => return Err(e.into()),
            Ok(()) => unreachable!("the monitor loop only exits with an error"),
        }
    }
}

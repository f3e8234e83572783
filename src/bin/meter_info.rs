// メーターのメタデータを読み取ってJSONで出力する。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use anyhow::Context;
use clap::Parser;
use denkimeter::{Error, Meter, MeterConfig};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// スマートメーターの属性一覧を表示する
#[derive(Parser, Debug)]
#[command(name = "meter_info")]
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

fn epc_list(properties: &BTreeSet<u8>) -> Vec<String> {
    properties.iter().map(|p| format!("0x{:02X}", p)).collect()
}

fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let meter = Meter::open(&config)?;

    let scan = meter.scan_result();
    let pan = json!({
        "channel": format!("0x{:02X}", scan.channel),
        "pan_id": format!("0x{:04X}", scan.pan_id),
        "mac_addr": scan.mac_hex(),
        "lqi": scan.lqi,
        "rssi_dbm": scan.rssi(),
    });

    // 係数はオプションなので拒否されたら省く
    let coefficient = match meter.get_coefficient_for_cumulative_energy() {
        Ok(coefficient) => json!(coefficient),
        Err(Error::ResponseNotPossible(_)) => json!(null),
        Err(e) => return Err(e.into()),
    };

    let info = json!({
        "pan": pan,
        "operation_status": meter.get_operation_status()?,
        "installation_location": meter.get_installation_location()?,
        "standard_version": meter.get_standard_version()?,
        "fault_status": meter.get_fault_status()?,
        "manufacturer_code": meter
            .get_manufacturer_code()?
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<String>(),
        "serial_number": meter.get_serial_number()?,
        "coefficient": coefficient,
        "effective_digits": meter.get_number_of_effective_digits_for_cumulative_energy()?,
        "unit_kwh": meter.get_unit_for_cumulative_energy()?,
        "cumulative_energy_kwh": meter.get_measured_cumulative_energy(false)?,
        "properties_to_get": epc_list(&meter.get_properties_to_get_values()?),
        "properties_to_set": epc_list(&meter.get_properties_to_set_values()?),
        "properties_for_status_notification":
            epc_list(&meter.get_properties_for_status_notification()?),
    });

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

// SKSTACK/IPの応答
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use crate::error::{Error, Result};
use crate::skstack::parser;
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;

/// EVENT行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub code: u8,
    pub sender: Ipv6Addr,
    pub side: Option<u8>,
    pub param: Option<u8>,
}

impl Event {
    pub fn from_line(line: &str) -> Result<Self> {
        match parser::event_line(line) {
            Ok(("", event)) => Ok(event),
            _ => Err(Error::ResponseNotExpected(format!(
                "not an EVENT line: {line}"
            ))),
        }
    }

    /// The trailing numeric field; the UDP transmission result for EVENT 21.
    pub fn trailing_param(&self) -> Option<u8> {
        self.param.or(self.side)
    }
}

/// ERXUDP行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxUdp {
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_mac: u64,
    pub lqi: u8,
    pub secured: u8,
    pub side: u8,
    pub data_len: u16,
    pub data: Vec<u8>,
}

impl RxUdp {
    pub fn from_line(line: &str) -> Result<Self> {
        match parser::erxudp_line(line) {
            Ok(("", udp)) => Ok(udp),
            _ => Err(Error::ResponseNotExpected(format!(
                "not an ERXUDP line: {line}"
            ))),
        }
    }

    pub fn rssi(&self) -> f64 {
        rssi_from_lqi(self.lqi)
    }
}

/// EPANDESC受信 (アクティブスキャン結果)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub channel: u8,
    pub channel_page: u8,
    pub pan_id: u16,
    pub mac_addr: u64,
    pub lqi: u8,
    pub side: u8,
    pub pair_id: u32,
}

impl ScanResult {
    pub fn from_lines(res: &[String]) -> Result<Self> {
        Ok(Self {
            channel: last_field(res, "Channel:")? as u8,
            channel_page: last_field(res, "Channel Page:")? as u8,
            pan_id: last_field(res, "Pan ID:")? as u16,
            mac_addr: last_field(res, "Addr:")?,
            lqi: last_field(res, "LQI:")? as u8,
            side: last_field(res, "Side:")? as u8,
            pair_id: last_field(res, "PairID:")? as u32,
        })
    }

    pub fn rssi(&self) -> f64 {
        rssi_from_lqi(self.lqi)
    }

    /// MACアドレスの16進表現(SKLL64の引数)
    pub fn mac_hex(&self) -> String {
        format!("{:016X}", self.mac_addr)
    }
}

/// SKVER応答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkVer {
    pub version: String,
}

impl SkVer {
    pub fn from_lines(res: &[String]) -> Result<Self> {
        let version = last_parsed(res, "EVER", parser::ever_line)?;
        Ok(Self { version })
    }
}

/// SKAPPVER応答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkAppVer {
    pub version: String,
}

impl SkAppVer {
    pub fn from_lines(res: &[String]) -> Result<Self> {
        let version = last_parsed(res, "EAPPVER", parser::eappver_line)?;
        Ok(Self { version })
    }
}

/// SKINFO応答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkInfo {
    pub ip6_addr: Ipv6Addr,
    pub mac_addr: u64,
    pub channel: u8,
    pub pan_id: u16,
    pub side: u8,
}

impl SkInfo {
    pub fn from_lines(res: &[String]) -> Result<Self> {
        let (ip6_addr, mac_addr, channel, pan_id, side) =
            last_parsed(res, "EINFO", parser::einfo_line)?;
        Ok(Self {
            ip6_addr,
            mac_addr,
            channel,
            pan_id,
            side,
        })
    }
}

/// SKLL64応答からリンクローカルアドレスを取り出す
pub fn ll64_from_lines(res: &[String]) -> Result<Ipv6Addr> {
    last_parsed(res, "FE80:", parser::ipv6addr)
}

pub fn rssi_from_lqi(lqi: u8) -> f64 {
    0.275 * f64::from(lqi) - 104.27
}

// キーワードを含む最後の行を取り出して解析する
fn last_parsed<T>(
    res: &[String],
    keyword: &str,
    line_parser: impl Fn(&str) -> nom::IResult<&str, T>,
) -> Result<T> {
    res.iter()
        .rev()
        .find(|line| line.starts_with(keyword))
        .and_then(|line| line_parser(line).ok().map(|(_rest, value)| value))
        .ok_or_else(|| Error::ResponseNotExpected(format!("missing a '{keyword}' line")))
}

fn last_field(res: &[String], label: &str) -> Result<u64> {
    res.iter()
        .rev()
        .find_map(|line| parser::labelled_hex(label, line))
        .ok_or_else(|| Error::ResponseNotExpected(format!("missing a '{label}' field")))
}

#[test]
fn test1() {
    let res: Vec<String> = [
        "OK",
        "EVENT 20 FE80:0000:0000:0000:021D:1290:1234:5678 0",
        "EPANDESC",
        "  Channel:3B",
        "  Channel Page:09",
        "  Pan ID:8888",
        "  Addr:001D129012345678",
        "  LQI:54",
        "  Side:0",
        "  PairID:01234567",
        "EVENT 22 FE80:0000:0000:0000:021D:1290:1234:5678 0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let scan = ScanResult::from_lines(&res).unwrap();
    assert_eq!(scan.channel, 0x3B);
    assert_eq!(scan.channel_page, 9);
    assert_eq!(scan.pan_id, 0x8888);
    assert_eq!(scan.mac_addr, 0x001D_1290_1234_5678);
    assert_eq!(scan.lqi, 0x54);
    assert_eq!(scan.side, 0);
    assert_eq!(scan.pair_id, 0x01234567);
    assert_eq!(scan.mac_hex(), "001D129012345678");
    assert!((scan.rssi() - (0.275 * 84.0 - 104.27)).abs() < 1e-9);
}

#[test]
fn test2() {
    let res: Vec<String> = ["SKLL64 001D129012345678", "FE80:0000:0000:0000:021D:1290:1234:5678"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(
        ll64_from_lines(&res).unwrap(),
        "FE80:0000:0000:0000:021D:1290:1234:5678"
            .parse::<Ipv6Addr>()
            .unwrap()
    );

    let missing: Vec<String> = vec!["OK".to_string()];
    assert!(ll64_from_lines(&missing).is_err());
}

#[test]
fn test3() {
    let res: Vec<String> = ["EVER 1.5.2", "OK"].iter().map(|s| s.to_string()).collect();
    assert_eq!(SkVer::from_lines(&res).unwrap().version, "1.5.2");

    let event =
        Event::from_line("EVENT 21 FE80:0000:0000:0000:021D:1290:1234:5678 0 00").unwrap();
    assert_eq!(event.code, 0x21);
    assert_eq!(event.trailing_param(), Some(0));

    // single-stack firmware leaves out the side field
    let event = Event::from_line("EVENT 21 FE80:0000:0000:0000:021D:1290:1234:5678 01").unwrap();
    assert_eq!(event.side, Some(1));
    assert_eq!(event.param, None);
    assert_eq!(event.trailing_param(), Some(1));
}

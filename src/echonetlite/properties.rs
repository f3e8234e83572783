// Echonetlite 低圧スマートメータークラスのプロパティ
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use crate::error::{Error, Result};
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use rust_decimal::Decimal;
use std::collections::BTreeSet;

/// プロパティコード
pub mod epc {
    pub const OPERATION_STATUS: u8 = 0x80;
    pub const INSTALLATION_LOCATION: u8 = 0x81;
    pub const STANDARD_VERSION_INFORMATION: u8 = 0x82;
    pub const FAULT_STATUS: u8 = 0x88;
    pub const MANUFACTURER_CODE: u8 = 0x8A;
    pub const SERIAL_NUMBER: u8 = 0x8D;
    pub const CURRENT_TIME_SETTING: u8 = 0x97;
    pub const CURRENT_DATE_SETTING: u8 = 0x98;
    pub const STATUS_NOTIFICATION_PROPERTY_MAP: u8 = 0x9D;
    pub const SET_PROPERTY_MAP: u8 = 0x9E;
    pub const GET_PROPERTY_MAP: u8 = 0x9F;
    pub const ROUTE_B_ID: u8 = 0xC0;
    pub const ONE_MINUTE_CUMULATIVE_ENERGY: u8 = 0xD0;
    pub const COEFFICIENT: u8 = 0xD3;
    pub const EFFECTIVE_DIGITS: u8 = 0xD7;
    pub const CUMULATIVE_ENERGY: u8 = 0xE0;
    pub const UNIT_FOR_CUMULATIVE_ENERGY: u8 = 0xE1;
    pub const HISTORICAL_ENERGY_1: u8 = 0xE2;
    pub const CUMULATIVE_ENERGY_REVERSED: u8 = 0xE3;
    pub const HISTORICAL_ENERGY_1_REVERSED: u8 = 0xE4;
    pub const DAY_FOR_HISTORICAL_DATA_1: u8 = 0xE5;
    pub const INSTANTANEOUS_POWER: u8 = 0xE7;
    pub const INSTANTANEOUS_CURRENT: u8 = 0xE8;
    pub const CUMULATIVE_ENERGY_AT_FIXED_TIME: u8 = 0xEA;
    pub const CUMULATIVE_ENERGY_AT_FIXED_TIME_REVERSED: u8 = 0xEB;
    pub const HISTORICAL_ENERGY_2: u8 = 0xEC;
    pub const TIME_FOR_HISTORICAL_DATA_2: u8 = 0xED;
    pub const HISTORICAL_ENERGY_3: u8 = 0xEE;
    pub const TIME_FOR_HISTORICAL_DATA_3: u8 = 0xEF;
}

// 積算電力量の「データなし」値
const NO_DATA: u32 = 0xFFFF_FFFE;

/// 積算電力量の換算状態。実効倍率は係数×単位。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EnergyScaling {
    pub coefficient: u32,
    pub unit: Decimal,
}

impl EnergyScaling {
    pub fn factor(&self) -> Decimal {
        Decimal::from(self.coefficient) * self.unit
    }
}

impl Default for EnergyScaling {
    fn default() -> Self {
        Self {
            coefficient: 1,
            unit: Decimal::ONE,
        }
    }
}

/// 0xc0 ルートB識別番号
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RouteBIdentity {
    pub manufacturer: [u8; 3],
    pub authentication_id: Vec<u8>,
}

/// 正逆両方向の積算電力量(kWh換算済み、データなしはNone)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BidirectionalEnergy {
    pub timestamp: NaiveDateTime,
    pub normal: Option<Decimal>,
    pub reverse: Option<Decimal>,
}

/// 半時間ごとの積算電力量履歴の1点
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EnergyAtTime {
    pub timestamp: NaiveDateTime,
    pub energy: Option<Decimal>,
}

/// 0xea/0xeb 定時積算電力量
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FixedTimeEnergy {
    pub timestamp: NaiveDateTime,
    pub energy: Decimal,
}

/// 0xe8 瞬時電流(アンペア)
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InstantaneousCurrent {
    pub r_phase: Decimal,
    pub t_phase: Decimal,
}

/// 0xed/0xef 履歴収集日時と収集数
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HistoryWindow {
    pub timestamp: Option<NaiveDateTime>,
    pub points: u8,
}

/// 解析済みプロパティ値
#[derive(Clone, PartialEq, Debug)]
pub enum PropertyValue {
    OperationStatus(Option<bool>),
    InstallationLocation(String),
    StandardVersion(String),
    FaultStatus(Option<bool>),
    ManufacturerCode([u8; 3]),
    SerialNumber(String),
    CurrentTime(NaiveTime),
    CurrentDate(NaiveDate),
    PropertyMap(BTreeSet<u8>),
    RouteBIdentity(RouteBIdentity),
    OneMinuteEnergy(BidirectionalEnergy),
    Coefficient(u32),
    EffectiveDigits(u8),
    CumulativeEnergy(Decimal),
    EnergyUnit(Decimal),
    EnergyHistory(Vec<EnergyAtTime>),
    HistoryDay(u8),
    InstantaneousPower(Decimal),
    InstantaneousCurrent(InstantaneousCurrent),
    EnergyAtFixedTime(FixedTimeEnergy),
    BidirectionalHistory(Vec<BidirectionalEnergy>),
    HistoryWindow(HistoryWindow),
}

/// EPCで振り分けて解析する。履歴1の起点は今日。
pub fn parse_property(property: u8, edt: &[u8], scaling: &EnergyScaling) -> Result<PropertyValue> {
    parse_property_at(property, edt, scaling, chrono::Local::now().date_naive())
}

/// EPCで振り分けて解析する(履歴1の起点日を指定)
pub fn parse_property_at(
    property: u8,
    edt: &[u8],
    scaling: &EnergyScaling,
    today: NaiveDate,
) -> Result<PropertyValue> {
    match property {
        epc::OPERATION_STATUS => parse_operation_status(edt).map(PropertyValue::OperationStatus),
        epc::INSTALLATION_LOCATION => {
            parse_installation_location(edt).map(PropertyValue::InstallationLocation)
        }
        epc::STANDARD_VERSION_INFORMATION => {
            parse_standard_version(edt).map(PropertyValue::StandardVersion)
        }
        epc::FAULT_STATUS => parse_fault_status(edt).map(PropertyValue::FaultStatus),
        epc::MANUFACTURER_CODE => parse_manufacturer_code(edt).map(PropertyValue::ManufacturerCode),
        epc::SERIAL_NUMBER => parse_serial_number(edt).map(PropertyValue::SerialNumber),
        epc::CURRENT_TIME_SETTING => parse_current_time(edt).map(PropertyValue::CurrentTime),
        epc::CURRENT_DATE_SETTING => parse_current_date(edt).map(PropertyValue::CurrentDate),
        epc::STATUS_NOTIFICATION_PROPERTY_MAP | epc::SET_PROPERTY_MAP | epc::GET_PROPERTY_MAP => {
            parse_property_map(edt).map(PropertyValue::PropertyMap)
        }
        epc::ROUTE_B_ID => parse_route_b_identity(edt).map(PropertyValue::RouteBIdentity),
        epc::ONE_MINUTE_CUMULATIVE_ENERGY => {
            parse_one_minute_energy(edt, scaling).map(PropertyValue::OneMinuteEnergy)
        }
        epc::COEFFICIENT => parse_coefficient(edt).map(PropertyValue::Coefficient),
        epc::EFFECTIVE_DIGITS => parse_effective_digits(edt).map(PropertyValue::EffectiveDigits),
        epc::CUMULATIVE_ENERGY | epc::CUMULATIVE_ENERGY_REVERSED => {
            parse_cumulative_energy(edt, scaling).map(PropertyValue::CumulativeEnergy)
        }
        epc::UNIT_FOR_CUMULATIVE_ENERGY => parse_energy_unit(edt).map(PropertyValue::EnergyUnit),
        epc::HISTORICAL_ENERGY_1 | epc::HISTORICAL_ENERGY_1_REVERSED => {
            parse_energy_history_1(edt, scaling, today).map(PropertyValue::EnergyHistory)
        }
        epc::DAY_FOR_HISTORICAL_DATA_1 => parse_history_day(edt).map(PropertyValue::HistoryDay),
        epc::INSTANTANEOUS_POWER => {
            parse_instantaneous_power(edt).map(PropertyValue::InstantaneousPower)
        }
        epc::INSTANTANEOUS_CURRENT => {
            parse_instantaneous_current(edt).map(PropertyValue::InstantaneousCurrent)
        }
        epc::CUMULATIVE_ENERGY_AT_FIXED_TIME | epc::CUMULATIVE_ENERGY_AT_FIXED_TIME_REVERSED => {
            parse_fixed_time_energy(edt, scaling).map(PropertyValue::EnergyAtFixedTime)
        }
        epc::HISTORICAL_ENERGY_2 => {
            parse_bidirectional_history(edt, scaling, TimeDelta::minutes(30))
                .map(PropertyValue::BidirectionalHistory)
        }
        epc::HISTORICAL_ENERGY_3 => {
            parse_bidirectional_history(edt, scaling, TimeDelta::minutes(1))
                .map(PropertyValue::BidirectionalHistory)
        }
        epc::TIME_FOR_HISTORICAL_DATA_2 | epc::TIME_FOR_HISTORICAL_DATA_3 => {
            parse_history_window(edt).map(PropertyValue::HistoryWindow)
        }
        other => Err(Error::Runtime(format!(
            "no parser found for EPC 0x{:02X}",
            other
        ))),
    }
}

/// 0x80 動作状態
pub fn parse_operation_status(edt: &[u8]) -> Result<Option<bool>> {
    match edt {
        [0x30] => Ok(Some(true)),
        [0x31] => Ok(Some(false)),
        [_] => Ok(None),
        _ => Err(bad_edt("operation status", edt)),
    }
}

/// 0x81 設置場所
pub fn parse_installation_location(edt: &[u8]) -> Result<String> {
    let location_map = [
        "living room",
        "dining room",
        "kitchen",
        "bathroom",
        "toilet",
        "washroom",
        "hallway",
        "room",
        "stairs",
        "entrance",
        "storage room",
        "garden/perimeter",
        "garage",
        "veranda",
        "other",
    ];
    match edt {
        [0x00, ..] => Ok("location not set".to_owned()),
        [0x01, rest @ ..] => {
            let hex = rest.iter().map(|b| format!("{:02x}", b)).collect::<String>();
            Ok(format!("location information: {}", hex))
        }
        &[code @ 0x08..=0x7F, ..] => {
            let name = location_map[(code >> 3) as usize - 1];
            Ok(format!("{} {}", name, code & 0x07))
        }
        [0x02..=0x07, ..] | [0x80..=0xFE, ..] => Ok("not implemented".to_owned()),
        [0xFF, ..] => Ok("location not fixed".to_owned()),
        _ => Err(bad_edt("installation location", edt)),
    }
}

/// 0x82 規格Version
pub fn parse_standard_version(edt: &[u8]) -> Result<String> {
    match edt {
        &[a, b, c, d] => {
            let mut version = String::new();
            if a > 0 {
                version.push(a as char);
            }
            if b > 0 {
                version.push(b as char);
            }
            version.push(c as char);
            version.push('.');
            version.push_str(&d.to_string());
            Ok(version)
        }
        _ => Err(bad_edt("standard version", edt)),
    }
}

/// 0x88 異常発生状態
pub fn parse_fault_status(edt: &[u8]) -> Result<Option<bool>> {
    match edt {
        [0x41] => Ok(Some(true)),
        [0x42] => Ok(Some(false)),
        [_] => Ok(None),
        _ => Err(bad_edt("fault status", edt)),
    }
}

/// 0x8a 製造者コード
pub fn parse_manufacturer_code(edt: &[u8]) -> Result<[u8; 3]> {
    match edt {
        &[a, b, c] => Ok([a, b, c]),
        _ => Err(bad_edt("manufacturer code", edt)),
    }
}

/// 0x8d 製造番号
pub fn parse_serial_number(edt: &[u8]) -> Result<String> {
    String::from_utf8(edt.to_vec()).map_err(|_| bad_edt("serial number", edt))
}

/// 0x97 現在時刻設定
pub fn parse_current_time(edt: &[u8]) -> Result<NaiveTime> {
    match edt {
        &[hour, minute] => NaiveTime::from_hms_opt(hour as u32, minute as u32, 0)
            .ok_or_else(|| bad_edt("current time setting", edt)),
        _ => Err(bad_edt("current time setting", edt)),
    }
}

/// 0x98 現在年月日設定
pub fn parse_current_date(edt: &[u8]) -> Result<NaiveDate> {
    match edt {
        &[year0, year1, month, day] => {
            let year = u16::from_be_bytes([year0, year1]);
            NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                .ok_or_else(|| bad_edt("current date setting", edt))
        }
        _ => Err(bad_edt("current date setting", edt)),
    }
}

/// 0x9d/0x9e/0x9f プロパティマップ
///
/// Fewer than 16 entries are listed directly; 16 or more come as a
/// 16-byte bitmap where byte `i` bit `j` denotes EPC `((j + 8) << 4) | i`.
pub fn parse_property_map(edt: &[u8]) -> Result<BTreeSet<u8>> {
    match edt {
        [count, props @ ..] if *count < 16 => Ok(props.iter().copied().collect()),
        [_count, props @ ..] if props.len() >= 16 => {
            let mut properties = BTreeSet::new();
            for (i, byte) in props[..16].iter().enumerate() {
                for j in 0..8u8 {
                    if byte & (1 << j) != 0 {
                        properties.insert(((j + 8) << 4) | i as u8);
                    }
                }
            }
            Ok(properties)
        }
        _ => Err(bad_edt("property map", edt)),
    }
}

/// 0xc0 ルートB識別番号
pub fn parse_route_b_identity(edt: &[u8]) -> Result<RouteBIdentity> {
    match edt {
        [_, m0, m1, m2, authentication_id @ ..] => Ok(RouteBIdentity {
            manufacturer: [*m0, *m1, *m2],
            authentication_id: authentication_id.to_vec(),
        }),
        _ => Err(bad_edt("route b identity", edt)),
    }
}

/// 0xd0 1分積算電力量計測値
pub fn parse_one_minute_energy(edt: &[u8], scaling: &EnergyScaling) -> Result<BidirectionalEnergy> {
    match edt {
        &[
            year0,    // 年 2bytes
            year1,    //
            month,    // 月 1byte
            day,      // 日 1byte
            hour,     // 時 1byte
            minute,   // 分 1byte
            second,   // 秒 1byte
            normal0,  // 正方向 4bytes
            normal1,  //
            normal2,  //
            normal3,  //
            reverse0, // 逆方向 4bytes
            reverse1, //
            reverse2, //
            reverse3, //
        ] => {
            let year = u16::from_be_bytes([year0, year1]);
            let timestamp = datetime_from(year, month, day, hour, minute, second)?;
            let normal = u32::from_be_bytes([normal0, normal1, normal2, normal3]);
            let reverse = u32::from_be_bytes([reverse0, reverse1, reverse2, reverse3]);
            Ok(BidirectionalEnergy {
                timestamp,
                normal: scaled(normal, scaling),
                reverse: scaled(reverse, scaling),
            })
        }
        _ => Err(bad_edt("one-minute cumulative energy", edt)),
    }
}

/// 0xd3 係数
pub fn parse_coefficient(edt: &[u8]) -> Result<u32> {
    match edt {
        &[a, b, c, d] => Ok(u32::from_be_bytes([a, b, c, d])),
        _ => Err(bad_edt("coefficient", edt)),
    }
}

/// 0xd7 積算電力量有効桁数
pub fn parse_effective_digits(edt: &[u8]) -> Result<u8> {
    match edt {
        &[digits] => Ok(digits),
        _ => Err(bad_edt("effective digits", edt)),
    }
}

/// 0xe0/0xe3 積算電力量計測値
pub fn parse_cumulative_energy(edt: &[u8], scaling: &EnergyScaling) -> Result<Decimal> {
    match edt {
        &[a, b, c, d] => {
            Ok(Decimal::from(u32::from_be_bytes([a, b, c, d])) * scaling.factor())
        }
        _ => Err(bad_edt("cumulative energy", edt)),
    }
}

/// 0xe1 積算電力量単位
pub fn parse_energy_unit(edt: &[u8]) -> Result<Decimal> {
    match edt {
        [0x00] => Ok(Decimal::new(1, 0)),     // 1 kwh
        [0x01] => Ok(Decimal::new(1, 1)),     // 0.1 kwh
        [0x02] => Ok(Decimal::new(1, 2)),     // 0.01 kwh
        [0x03] => Ok(Decimal::new(1, 3)),     // 0.001 kwh
        [0x04] => Ok(Decimal::new(1, 4)),     // 0.0001 kwh
        [0x0a] => Ok(Decimal::new(10, 0)),    // 10 kwh
        [0x0b] => Ok(Decimal::new(100, 0)),   // 100 kwh
        [0x0c] => Ok(Decimal::new(1000, 0)),  // 1000 kwh
        [0x0d] => Ok(Decimal::new(10000, 0)), // 10000 kwh
        [code] => Err(Error::Runtime(format!(
            "the obtained unit for cumulative energy (0x{:02X}) is not defined",
            code
        ))),
        _ => Err(bad_edt("unit for cumulative energy", edt)),
    }
}

/// 0xe2/0xe4 積算電力量計測値履歴1
///
/// 48 half-hour samples anchored at `today` minus the leading day count.
pub fn parse_energy_history_1(
    edt: &[u8],
    scaling: &EnergyScaling,
    today: NaiveDate,
) -> Result<Vec<EnergyAtTime>> {
    match edt {
        [day0, day1, points @ ..] if points.len() == 48 * 4 => {
            let days_ago = u16::from_be_bytes([*day0, *day1]);
            let day = today
                .checked_sub_days(Days::new(days_ago as u64))
                .ok_or_else(|| bad_edt("historical energy 1", edt))?;
            let mut timestamp = day.and_time(NaiveTime::MIN);
            let mut historical = Vec::with_capacity(48);
            for quadruple in points.chunks_exact(4) {
                let dword = quadruple
                    .try_into()
                    .map(u32::from_be_bytes)
                    .unwrap();
                historical.push(EnergyAtTime {
                    timestamp,
                    energy: scaled(dword, scaling),
                });
                timestamp += TimeDelta::minutes(30);
            }
            Ok(historical)
        }
        _ => Err(bad_edt("historical energy 1", edt)),
    }
}

/// 0xe5 積算履歴収集日1
pub fn parse_history_day(edt: &[u8]) -> Result<u8> {
    match edt {
        &[day] => Ok(day),
        _ => Err(bad_edt("day for historical data 1", edt)),
    }
}

/// 0xe7 瞬時電力計測値(W、負値あり)
pub fn parse_instantaneous_power(edt: &[u8]) -> Result<Decimal> {
    match edt {
        &[a, b, c, d] => Ok(Decimal::from(i32::from_be_bytes([a, b, c, d]))),
        _ => Err(bad_edt("instantaneous power", edt)),
    }
}

/// 0xe8 瞬時電流計測値(0.1A単位)
pub fn parse_instantaneous_current(edt: &[u8]) -> Result<InstantaneousCurrent> {
    match edt {
        &[r0, r1, t0, t1] => Ok(InstantaneousCurrent {
            r_phase: Decimal::new(i16::from_be_bytes([r0, r1]) as i64, 1),
            t_phase: Decimal::new(i16::from_be_bytes([t0, t1]) as i64, 1),
        }),
        _ => Err(bad_edt("instantaneous current", edt)),
    }
}

/// 0xea/0xeb 定時積算電力量計測値
pub fn parse_fixed_time_energy(edt: &[u8], scaling: &EnergyScaling) -> Result<FixedTimeEnergy> {
    match edt {
        &[year0, year1, month, day, hour, minute, second, e0, e1, e2, e3] => {
            let year = u16::from_be_bytes([year0, year1]);
            let timestamp = datetime_from(year, month, day, hour, minute, second)?;
            let energy = Decimal::from(u32::from_be_bytes([e0, e1, e2, e3])) * scaling.factor();
            Ok(FixedTimeEnergy { timestamp, energy })
        }
        _ => Err(bad_edt("cumulative energy at fixed time", edt)),
    }
}

/// 0xec/0xee 積算電力量計測値履歴2・3
///
/// Samples are newest first; each subsequent entry steps back by `step`.
pub fn parse_bidirectional_history(
    edt: &[u8],
    scaling: &EnergyScaling,
    step: TimeDelta,
) -> Result<Vec<BidirectionalEnergy>> {
    match edt {
        [year0, year1, month, day, hour, minute, count, points @ ..]
            if points.len() == *count as usize * 8 =>
        {
            let year = u16::from_be_bytes([*year0, *year1]);
            let mut timestamp = datetime_from(year, *month, *day, *hour, *minute, 0)?;
            let mut historical = Vec::with_capacity(*count as usize);
            for octuple in points.chunks_exact(8) {
                let normal = octuple[0..4].try_into().map(u32::from_be_bytes).unwrap();
                let reverse = octuple[4..8].try_into().map(u32::from_be_bytes).unwrap();
                historical.push(BidirectionalEnergy {
                    timestamp,
                    normal: scaled(normal, scaling),
                    reverse: scaled(reverse, scaling),
                });
                timestamp -= step;
            }
            Ok(historical)
        }
        _ => Err(bad_edt("bidirectional energy history", edt)),
    }
}

/// 0xed/0xef 積算履歴収集日時
pub fn parse_history_window(edt: &[u8]) -> Result<HistoryWindow> {
    match edt {
        &[0xff, 0xff, _, _, _, _, count] => Ok(HistoryWindow {
            timestamp: None,
            points: count,
        }),
        &[year0, year1, month, day, hour, minute, count] => {
            let year = u16::from_be_bytes([year0, year1]);
            Ok(HistoryWindow {
                timestamp: Some(datetime_from(year, month, day, hour, minute, 0)?),
                points: count,
            })
        }
        _ => Err(bad_edt("history collection time", edt)),
    }
}

/// 0xe5 積算履歴収集日1の設定値
pub fn edt_day_for_historical_data_1(day: u8) -> Result<Vec<u8>> {
    if day > 99 {
        return Err(Error::InvalidParameter(
            "the day for historical data 1 must be between 0 and 99".to_owned(),
        ));
    }
    Ok(vec![day])
}

/// 0xed 積算履歴収集日時2の設定値(分は0/30に丸める)
pub fn edt_time_for_historical_data_2(timestamp: &NaiveDateTime, points: u8) -> Result<Vec<u8>> {
    if !(1..=12).contains(&points) {
        return Err(Error::InvalidParameter(
            "the number of data points must be between 1 and 12".to_owned(),
        ));
    }
    let minute = if timestamp.minute() < 30 { 0 } else { 30 };
    history_window_edt(timestamp, minute, points)
}

/// 0xef 積算履歴収集日時3の設定値(分はそのまま)
pub fn edt_time_for_historical_data_3(timestamp: &NaiveDateTime, points: u8) -> Result<Vec<u8>> {
    if !(1..=10).contains(&points) {
        return Err(Error::InvalidParameter(
            "the number of data points must be between 1 and 10".to_owned(),
        ));
    }
    history_window_edt(timestamp, timestamp.minute() as u8, points)
}

fn history_window_edt(timestamp: &NaiveDateTime, minute: u8, points: u8) -> Result<Vec<u8>> {
    let year = timestamp.year();
    if !(1..=9999).contains(&year) {
        return Err(Error::InvalidParameter(
            "the year must be between 1 and 9999".to_owned(),
        ));
    }
    let year = year as u16;
    Ok(vec![
        (year >> 8) as u8,
        year as u8,
        timestamp.month() as u8,
        timestamp.day() as u8,
        timestamp.hour() as u8,
        minute,
        points,
    ])
}

fn scaled(raw: u32, scaling: &EnergyScaling) -> Option<Decimal> {
    (raw != NO_DATA).then(|| Decimal::from(raw) * scaling.factor())
}

fn datetime_from(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
) -> Result<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|d| d.and_hms_opt(hour as u32, minute as u32, second as u32))
        .ok_or_else(|| {
            Error::ResponseNotExpected(format!(
                "invalid timestamp {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ))
        })
}

fn bad_edt(what: &str, edt: &[u8]) -> Error {
    Error::ResponseNotExpected(format!("unexpected EDT for {}: {:02X?}", what, edt))
}

#[cfg(test)]
use rust_decimal::dec;

#[test]
fn test1() {
    assert_eq!(parse_operation_status(&[0x30]).unwrap(), Some(true));
    assert_eq!(parse_operation_status(&[0x31]).unwrap(), Some(false));
    assert_eq!(parse_operation_status(&[0x99]).unwrap(), None);
    assert!(parse_operation_status(&[]).is_err());

    assert_eq!(parse_fault_status(&[0x41]).unwrap(), Some(true));
    assert_eq!(parse_fault_status(&[0x42]).unwrap(), Some(false));
    assert_eq!(parse_fault_status(&[0x00]).unwrap(), None);
}

#[test]
fn test2() {
    assert_eq!(parse_installation_location(&[0x00]).unwrap(), "location not set");
    assert_eq!(
        parse_installation_location(&[0x01, 0xab, 0xcd]).unwrap(),
        "location information: abcd"
    );
    assert_eq!(parse_installation_location(&[0x0b]).unwrap(), "living room 3");
    assert_eq!(
        parse_installation_location(&[0x61]).unwrap(),
        "garden/perimeter 1"
    );
    assert_eq!(parse_installation_location(&[0x05]).unwrap(), "not implemented");
    assert_eq!(parse_installation_location(&[0x80]).unwrap(), "not implemented");
    assert_eq!(parse_installation_location(&[0xff]).unwrap(), "location not fixed");
}

#[test]
fn test3() {
    assert_eq!(parse_standard_version(&[0, 0, b'J', 3]).unwrap(), "J.3");
    assert_eq!(
        parse_standard_version(&[b'A', b'B', b'C', 1]).unwrap(),
        "ABC.1"
    );

    assert_eq!(parse_manufacturer_code(&[0x00, 0x00, 0x16]).unwrap(), [0, 0, 0x16]);
    assert_eq!(parse_serial_number(b"S19000001").unwrap(), "S19000001");

    assert_eq!(
        parse_current_time(&[23, 45]).unwrap(),
        NaiveTime::from_hms_opt(23, 45, 0).unwrap()
    );
    assert_eq!(
        parse_current_date(&[0x07, 0xEA, 8, 1]).unwrap(),
        NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
    );
    assert!(parse_current_date(&[0x07, 0xEA, 13, 1]).is_err());
}

#[test]
fn test4() {
    // fewer than 16 properties are listed directly
    let set = parse_property_map(&[3, 0xe7, 0xe8, 0xe0]).unwrap();
    assert_eq!(set, BTreeSet::from([0xe0, 0xe7, 0xe8]));

    // 16 or more come as a bitmap; sweep all 128 single-bit maps
    for i in 0..16usize {
        for j in 0..8u8 {
            let mut edt = vec![16u8; 1];
            edt.extend_from_slice(&[0u8; 16]);
            edt[1 + i] = 1 << j;
            let set = parse_property_map(&edt).unwrap();
            assert_eq!(set.len(), 1);
            assert!(set.contains(&(((j + 8) << 4) | i as u8)));
        }
    }
}

#[test]
fn test5() {
    assert_eq!(parse_energy_unit(&[0x00]).unwrap(), dec!(1));
    assert_eq!(parse_energy_unit(&[0x01]).unwrap(), dec!(0.1));
    assert_eq!(parse_energy_unit(&[0x02]).unwrap(), dec!(0.01));
    assert_eq!(parse_energy_unit(&[0x03]).unwrap(), dec!(0.001));
    assert_eq!(parse_energy_unit(&[0x04]).unwrap(), dec!(0.0001));
    assert_eq!(parse_energy_unit(&[0x0a]).unwrap(), dec!(10));
    assert_eq!(parse_energy_unit(&[0x0b]).unwrap(), dec!(100));
    assert_eq!(parse_energy_unit(&[0x0c]).unwrap(), dec!(1000));
    assert_eq!(parse_energy_unit(&[0x0d]).unwrap(), dec!(10000));
    assert!(matches!(parse_energy_unit(&[0x05]), Err(Error::Runtime(_))));
}

#[test]
fn test6() {
    let scaling = EnergyScaling {
        coefficient: 1,
        unit: dec!(0.1),
    };
    assert_eq!(
        parse_cumulative_energy(&[0x00, 0x00, 0x00, 0x64], &scaling).unwrap(),
        dec!(10.0)
    );

    let scaling = EnergyScaling {
        coefficient: 10,
        unit: dec!(0.1),
    };
    assert_eq!(scaling.factor(), dec!(1.0));
    assert_eq!(
        parse_cumulative_energy(&[0x00, 0x00, 0x00, 0x64], &scaling).unwrap(),
        dec!(100.0)
    );
}

#[test]
fn test7() {
    // 48 half-hour samples anchored at today minus the day count
    let mut edt = vec![0x00, 0x01];
    for _ in 0..48 {
        edt.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    }
    let scaling = EnergyScaling::default();
    let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
    let history = parse_energy_history_1(&edt, &scaling, today).unwrap();
    assert_eq!(history.len(), 48);
    assert_eq!(
        history[0].timestamp,
        NaiveDate::from_ymd_opt(2026, 7, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    );
    assert_eq!(
        history[1].timestamp - history[0].timestamp,
        TimeDelta::minutes(30)
    );
    assert_eq!(
        history[47].timestamp,
        NaiveDate::from_ymd_opt(2026, 7, 31)
            .unwrap()
            .and_hms_opt(23, 30, 0)
            .unwrap()
    );
    assert!(history.iter().all(|p| p.energy == Some(dec!(1))));

    // the no-data sentinel becomes None
    edt[2..6].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFE]);
    let history = parse_energy_history_1(&edt, &scaling, today).unwrap();
    assert_eq!(history[0].energy, None);
    assert_eq!(history[1].energy, Some(dec!(1)));
}

#[test]
fn test8() {
    // history 2 steps back 30 minutes per sample, newest first
    let edt = [
        0x07, 0xEA, 8, 1, 10, 30, 2, // 2026-08-01 10:30, 2 points
        0x00, 0x00, 0x00, 0x64, // normal
        0xFF, 0xFF, 0xFF, 0xFE, // reverse: no data
        0x00, 0x00, 0x00, 0x32, //
        0x00, 0x00, 0x00, 0x0A, //
    ];
    let scaling = EnergyScaling {
        coefficient: 1,
        unit: dec!(0.1),
    };
    let history = parse_bidirectional_history(&edt, &scaling, TimeDelta::minutes(30)).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[0].timestamp,
        NaiveDate::from_ymd_opt(2026, 8, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
    );
    assert_eq!(history[0].normal, Some(dec!(10.0)));
    assert_eq!(history[0].reverse, None);
    assert_eq!(
        history[1].timestamp,
        NaiveDate::from_ymd_opt(2026, 8, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    );
    assert_eq!(history[1].normal, Some(dec!(5.0)));
    assert_eq!(history[1].reverse, Some(dec!(1.0)));

    // history 3 steps back one minute per sample
    let history = parse_bidirectional_history(&edt, &scaling, TimeDelta::minutes(1)).unwrap();
    assert_eq!(
        history[1].timestamp,
        NaiveDate::from_ymd_opt(2026, 8, 1)
            .unwrap()
            .and_hms_opt(10, 29, 0)
            .unwrap()
    );
}

#[test]
fn test9() {
    let window = parse_history_window(&[0xFF, 0xFF, 8, 1, 10, 30, 12]).unwrap();
    assert_eq!(window.timestamp, None);
    assert_eq!(window.points, 12);

    let window = parse_history_window(&[0x07, 0xEA, 8, 1, 10, 30, 6]).unwrap();
    assert_eq!(
        window.timestamp,
        Some(
            NaiveDate::from_ymd_opt(2026, 8, 1)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap()
        )
    );
    assert_eq!(window.points, 6);
}

#[test]
fn test10() {
    assert_eq!(
        parse_instantaneous_power(&[0x00, 0x00, 0x01, 0xF4]).unwrap(),
        dec!(500)
    );
    assert_eq!(
        parse_instantaneous_power(&[0xFF, 0xFF, 0xFF, 0x38]).unwrap(),
        dec!(-200)
    );

    let current = parse_instantaneous_current(&[0x00, 0x6F, 0xFF, 0xF6]).unwrap();
    assert_eq!(current.r_phase, dec!(11.1));
    assert_eq!(current.t_phase, dec!(-1.0));
}

#[test]
fn test11() {
    let scaling = EnergyScaling {
        coefficient: 1,
        unit: dec!(0.1),
    };
    let fixed = parse_fixed_time_energy(
        &[0x07, 0xEA, 8, 1, 0, 30, 0, 0x00, 0x00, 0x00, 0x64],
        &scaling,
    )
    .unwrap();
    assert_eq!(
        fixed.timestamp,
        NaiveDate::from_ymd_opt(2026, 8, 1)
            .unwrap()
            .and_hms_opt(0, 30, 0)
            .unwrap()
    );
    assert_eq!(fixed.energy, dec!(10.0));

    let one_minute = parse_one_minute_energy(
        &[
            0x07, 0xEA, 8, 1, 12, 34, 56, //
            0x00, 0x00, 0x00, 0x64, //
            0xFF, 0xFF, 0xFF, 0xFE, //
        ],
        &scaling,
    )
    .unwrap();
    assert_eq!(one_minute.normal, Some(dec!(10.0)));
    assert_eq!(one_minute.reverse, None);
}

#[test]
fn test12() {
    let identity = parse_route_b_identity(&[0x00, 0x00, 0x00, 0x16, 1, 2, 3, 4]).unwrap();
    assert_eq!(identity.manufacturer, [0, 0, 0x16]);
    assert_eq!(identity.authentication_id, vec![1, 2, 3, 4]);

    assert_eq!(parse_coefficient(&[0, 0, 0, 10]).unwrap(), 10);
    assert_eq!(parse_effective_digits(&[6]).unwrap(), 6);
}

#[test]
fn test13() {
    assert_eq!(edt_day_for_historical_data_1(0).unwrap(), vec![0]);
    assert_eq!(edt_day_for_historical_data_1(99).unwrap(), vec![99]);
    assert!(matches!(
        edt_day_for_historical_data_1(100),
        Err(Error::InvalidParameter(_))
    ));

    let timestamp = NaiveDate::from_ymd_opt(2026, 8, 1)
        .unwrap()
        .and_hms_opt(10, 29, 0)
        .unwrap();
    // the minute is snapped to 0 or 30 for history 2
    assert_eq!(
        edt_time_for_historical_data_2(&timestamp, 12).unwrap(),
        vec![0x07, 0xEA, 8, 1, 10, 0, 12]
    );
    let timestamp = timestamp.with_minute(30).unwrap();
    assert_eq!(
        edt_time_for_historical_data_2(&timestamp, 1).unwrap(),
        vec![0x07, 0xEA, 8, 1, 10, 30, 1]
    );
    assert!(edt_time_for_historical_data_2(&timestamp, 0).is_err());
    assert!(edt_time_for_historical_data_2(&timestamp, 13).is_err());

    // history 3 keeps the minute as given
    let timestamp = timestamp.with_minute(29).unwrap();
    assert_eq!(
        edt_time_for_historical_data_3(&timestamp, 10).unwrap(),
        vec![0x07, 0xEA, 8, 1, 10, 29, 10]
    );
    assert!(edt_time_for_historical_data_3(&timestamp, 11).is_err());
}

#[test]
fn test14() {
    let scaling = EnergyScaling::default();
    let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
    assert!(matches!(
        parse_property_at(0xF0, &[], &scaling, today),
        Err(Error::Runtime(_))
    ));
    assert_eq!(
        parse_property_at(epc::INSTANTANEOUS_POWER, &[0, 0, 1, 0xF4], &scaling, today).unwrap(),
        PropertyValue::InstantaneousPower(dec!(500))
    );
    assert_eq!(
        parse_property_at(epc::UNIT_FOR_CUMULATIVE_ENERGY, &[0x01], &scaling, today).unwrap(),
        PropertyValue::EnergyUnit(dec!(0.1))
    );
}

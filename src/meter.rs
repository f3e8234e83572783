// 低圧スマート電力量メータークライアント
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use crate::config::MeterConfig;
use crate::echonetlite::frame::{self, ExtractError, Frame, RequestProperty, ResponseProperty, esv};
use crate::echonetlite::properties::{
    self, BidirectionalEnergy, EnergyAtTime, EnergyScaling, FixedTimeEnergy, HistoryWindow,
    InstantaneousCurrent, PropertyValue, RouteBIdentity, epc,
};
use crate::echonetlite::UDP_PORT;
use crate::error::{Error, Result};
use crate::serial::{LineReader, LineWriter};
use crate::session::SessionManager;
use crate::skstack::{Event, RxUdp, ScanResult};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

/// 一括設定の項目。指定した項目だけが1つのSetC要求になる。
#[derive(Debug, Clone, Default)]
pub struct SetRequest {
    pub day_for_historical_data_1: Option<u8>,
    pub time_for_historical_data_2: Option<(NaiveDateTime, u8)>,
    pub time_for_historical_data_3: Option<(NaiveDateTime, u8)>,
}

#[derive(Default)]
struct ScalingState {
    coefficient: Option<u32>,
    unit: Option<Decimal>,
}

/// スマートメーターへの接続
///
/// `open()` establishes the PANA session and primes the energy scaling
/// (coefficient 0xD3 and unit 0xE1); dropping the handle closes the
/// session and releases the serial port on every exit path.
pub struct Meter {
    session: SessionManager,
    xmit_retries: u32,
    recv_timeout: Duration,
    internal_xmit_interval: Duration,
    transaction_id: AtomicU32,
    scaling: Mutex<ScalingState>,
    request_lock: Mutex<()>,
}

impl Meter {
    pub fn open(config: &MeterConfig) -> Result<Self> {
        let session = SessionManager::open(config)?;
        Self::finish_open(config, session)
    }

    /// Open over an already opened line transport.
    pub fn open_with_port(
        config: &MeterConfig,
        reader: Box<dyn LineReader>,
        writer: Box<dyn LineWriter>,
    ) -> Result<Self> {
        let session = SessionManager::open_with_port(config, reader, writer)?;
        Self::finish_open(config, session)
    }

    fn finish_open(config: &MeterConfig, session: SessionManager) -> Result<Self> {
        let mut meter = Self {
            session,
            xmit_retries: config.xmit_retries,
            recv_timeout: config.recv_timeout,
            internal_xmit_interval: config.internal_xmit_interval,
            transaction_id: AtomicU32::new(0),
            scaling: Mutex::new(ScalingState::default()),
            request_lock: Mutex::new(()),
        };
        // let the link settle before the first transaction
        thread::sleep(meter.internal_xmit_interval);
        if let Err(e) = meter.prime_scaling() {
            tracing::error!("could not prime the energy scaling: {}", e);
            meter.close();
            return Err(e);
        }
        tracing::info!("the meter is open");
        Ok(meter)
    }

    /// セッションを閉じる。何度呼んでもよい。
    pub fn close(&mut self) {
        let mut scaling = self.scaling.lock();
        scaling.coefficient = None;
        scaling.unit = None;
        drop(scaling);
        self.session.close();
    }

    /// アクティブスキャンの結果(チャンネル、PAN ID、LQIなど)
    pub fn scan_result(&self) -> &ScanResult {
        self.session.scan_result()
    }

    // 係数(任意プロパティ、拒否なら1)と単位を読んで換算状態を確定する
    fn prime_scaling(&self) -> Result<()> {
        let coefficient = match self.get_coefficient_for_cumulative_energy() {
            Ok(coefficient) => {
                thread::sleep(self.internal_xmit_interval);
                coefficient
            }
            Err(Error::ResponseNotPossible(_)) => 1,
            Err(e) => return Err(e),
        };
        self.scaling.lock().coefficient = Some(coefficient);

        let unit = self.get_unit_for_cumulative_energy()?;
        thread::sleep(self.internal_xmit_interval);
        self.scaling.lock().unit = Some(unit);
        Ok(())
    }

    fn scaling(&self) -> EnergyScaling {
        let state = self.scaling.lock();
        EnergyScaling {
            coefficient: state.coefficient.unwrap_or(1),
            unit: state.unit.unwrap_or(Decimal::ONE),
        }
    }

    /// 1トランザクションを実行する
    ///
    /// Builds the request frame, transmits it up to `xmit_retries` times
    /// and reads the session's receive queue until a frame correlated by
    /// TID and the request property list arrives. Frames that do not
    /// match are noise; a meter failure ESV propagates.
    pub fn request(
        &self,
        service: u8,
        req_properties: &[RequestProperty],
    ) -> Result<Vec<ResponseProperty>> {
        let _serialized = self.request_lock.lock();
        let tid = (self
            .transaction_id
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1)
            & 0xFFFF) as u16;
        let payload = Frame::request(tid, service, req_properties)?.encode()?;

        self.session.drain_received();

        for _ in 0..self.xmit_retries {
            self.session.send(&payload)?;
            loop {
                let Some(line) = self.session.pop_received(self.recv_timeout) else {
                    tracing::warn!("the request for transaction id {:04X} timed out", tid);
                    break; // to retransmit the request
                };

                if line.starts_with("EVENT 21") {
                    let Ok(event) = Event::from_line(&line) else {
                        continue;
                    };
                    match event.trailing_param() {
                        Some(0x00) => {
                            tracing::debug!(
                                "successfully transmitted the request packet for transaction id {:04X}",
                                tid
                            );
                        }
                        Some(0x01) => {
                            tracing::info!(
                                "retransmitting the request packet for transaction id {:04X}",
                                tid
                            );
                            thread::sleep(self.internal_xmit_interval);
                            break; // to retransmit the request
                        }
                        Some(0x02) => {
                            tracing::debug!("transmitting neighbor solicitation packets");
                        }
                        _ => {}
                    }
                } else if line.starts_with("EVENT 02") {
                    tracing::debug!("received a neighbor advertisement packet");
                } else if line.starts_with("ERXUDP") {
                    let Ok(udp) = RxUdp::from_line(&line) else {
                        continue;
                    };
                    if udp.src_port != UDP_PORT || udp.dst_port != UDP_PORT {
                        continue;
                    }
                    if udp.side != 0 {
                        continue;
                    }
                    if udp.src_addr != *self.session.meter_addr() {
                        continue;
                    }
                    match frame::extract_response(&udp.data, tid, req_properties) {
                        Ok(res_properties) => {
                            tracing::debug!(
                                "successfully received a response packet for transaction id {:04X}",
                                tid
                            );
                            return Ok(res_properties);
                        }
                        Err(ExtractError::Rejected(reason)) => {
                            tracing::trace!("discarding a received frame: {}", reason);
                        }
                        Err(e @ ExtractError::NotPossible(_)) => return Err(e.into()),
                    }
                }
            }
        }
        tracing::error!(
            "gave up obtaining a response for transaction id {:04X}",
            tid
        );
        Err(Error::NeedToReopen(format!(
            "gave up obtaining a response for transaction id {tid:04X}"
        )))
    }

    pub fn request_to_get_raw(
        &self,
        properties: &[RequestProperty],
    ) -> Result<Vec<ResponseProperty>> {
        self.request(esv::GET, properties)
    }

    pub fn request_to_set_raw(&self, properties: &[RequestProperty]) -> Result<()> {
        self.request(esv::SET_C, properties).map(|_| ())
    }

    /// 指定したEPC集合を1つのGet要求で読み、EPCごとの解析値を返す
    pub fn request_to_get(&self, properties: &BTreeSet<u8>) -> Result<BTreeMap<u8, PropertyValue>> {
        let req: Vec<RequestProperty> = properties
            .iter()
            .map(|&code| RequestProperty::get(code))
            .collect();
        let res = self.request_to_get_raw(&req)?;
        let scaling = self.scaling();
        let mut parsed = BTreeMap::new();
        for property in res {
            let edt = property.edt.unwrap_or_default();
            parsed.insert(
                property.epc,
                properties::parse_property(property.epc, &edt, &scaling)?,
            );
        }
        Ok(parsed)
    }

    /// 指定した項目を1つのSetC要求で書き込む
    pub fn request_to_set(&self, request: &SetRequest) -> Result<()> {
        let mut req_properties = Vec::new();
        if let Some(day) = request.day_for_historical_data_1 {
            req_properties.push(RequestProperty::set(
                epc::DAY_FOR_HISTORICAL_DATA_1,
                properties::edt_day_for_historical_data_1(day)?,
            ));
        }
        if let Some((timestamp, points)) = request.time_for_historical_data_2 {
            req_properties.push(RequestProperty::set(
                epc::TIME_FOR_HISTORICAL_DATA_2,
                properties::edt_time_for_historical_data_2(&timestamp, points)?,
            ));
        }
        if let Some((timestamp, points)) = request.time_for_historical_data_3 {
            req_properties.push(RequestProperty::set(
                epc::TIME_FOR_HISTORICAL_DATA_3,
                properties::edt_time_for_historical_data_3(&timestamp, points)?,
            ));
        }
        self.request_to_set_raw(&req_properties)
    }

    fn get_edt(&self, code: u8) -> Result<Vec<u8>> {
        let res = self.request_to_get_raw(&[RequestProperty::get(code)])?;
        res.into_iter()
            .next()
            .and_then(|property| property.edt)
            .ok_or_else(|| {
                Error::ResponseNotExpected(format!("the response for EPC 0x{code:02X} has no EDT"))
            })
    }

    /// 0x80 動作状態
    pub fn get_operation_status(&self) -> Result<Option<bool>> {
        let edt = self.get_edt(epc::OPERATION_STATUS)?;
        properties::parse_operation_status(&edt)
    }

    /// 0x81 設置場所
    pub fn get_installation_location(&self) -> Result<String> {
        let edt = self.get_edt(epc::INSTALLATION_LOCATION)?;
        properties::parse_installation_location(&edt)
    }

    /// 0x82 規格Version
    pub fn get_standard_version(&self) -> Result<String> {
        let edt = self.get_edt(epc::STANDARD_VERSION_INFORMATION)?;
        properties::parse_standard_version(&edt)
    }

    /// 0x88 異常発生状態
    pub fn get_fault_status(&self) -> Result<Option<bool>> {
        let edt = self.get_edt(epc::FAULT_STATUS)?;
        properties::parse_fault_status(&edt)
    }

    /// 0x8a 製造者コード
    pub fn get_manufacturer_code(&self) -> Result<[u8; 3]> {
        let edt = self.get_edt(epc::MANUFACTURER_CODE)?;
        properties::parse_manufacturer_code(&edt)
    }

    /// 0x8d 製造番号
    pub fn get_serial_number(&self) -> Result<String> {
        let edt = self.get_edt(epc::SERIAL_NUMBER)?;
        properties::parse_serial_number(&edt)
    }

    /// 0x97 現在時刻設定
    pub fn get_current_time_setting(&self) -> Result<NaiveTime> {
        let edt = self.get_edt(epc::CURRENT_TIME_SETTING)?;
        properties::parse_current_time(&edt)
    }

    /// 0x98 現在年月日設定
    pub fn get_current_date_setting(&self) -> Result<NaiveDate> {
        let edt = self.get_edt(epc::CURRENT_DATE_SETTING)?;
        properties::parse_current_date(&edt)
    }

    /// 0x9d 状変アナウンスプロパティマップ
    pub fn get_properties_for_status_notification(&self) -> Result<BTreeSet<u8>> {
        let edt = self.get_edt(epc::STATUS_NOTIFICATION_PROPERTY_MAP)?;
        properties::parse_property_map(&edt)
    }

    /// 0x9e Setプロパティマップ
    pub fn get_properties_to_set_values(&self) -> Result<BTreeSet<u8>> {
        let edt = self.get_edt(epc::SET_PROPERTY_MAP)?;
        properties::parse_property_map(&edt)
    }

    /// 0x9f Getプロパティマップ
    pub fn get_properties_to_get_values(&self) -> Result<BTreeSet<u8>> {
        let edt = self.get_edt(epc::GET_PROPERTY_MAP)?;
        properties::parse_property_map(&edt)
    }

    /// 0xc0 ルートB識別番号
    pub fn get_route_b_id(&self) -> Result<RouteBIdentity> {
        let edt = self.get_edt(epc::ROUTE_B_ID)?;
        properties::parse_route_b_identity(&edt)
    }

    /// 0xd0 1分積算電力量計測値
    pub fn get_one_minute_measured_cumulative_energy(&self) -> Result<BidirectionalEnergy> {
        let edt = self.get_edt(epc::ONE_MINUTE_CUMULATIVE_ENERGY)?;
        properties::parse_one_minute_energy(&edt, &self.scaling())
    }

    /// 0xd3 係数
    pub fn get_coefficient_for_cumulative_energy(&self) -> Result<u32> {
        let edt = self.get_edt(epc::COEFFICIENT)?;
        properties::parse_coefficient(&edt)
    }

    /// 0xd7 積算電力量有効桁数
    pub fn get_number_of_effective_digits_for_cumulative_energy(&self) -> Result<u8> {
        let edt = self.get_edt(epc::EFFECTIVE_DIGITS)?;
        properties::parse_effective_digits(&edt)
    }

    /// 0xe0/0xe3 積算電力量計測値(kWh)
    pub fn get_measured_cumulative_energy(&self, reverse: bool) -> Result<Decimal> {
        let code = if reverse {
            epc::CUMULATIVE_ENERGY_REVERSED
        } else {
            epc::CUMULATIVE_ENERGY
        };
        let edt = self.get_edt(code)?;
        properties::parse_cumulative_energy(&edt, &self.scaling())
    }

    /// 0xe1 積算電力量単位
    pub fn get_unit_for_cumulative_energy(&self) -> Result<Decimal> {
        let edt = self.get_edt(epc::UNIT_FOR_CUMULATIVE_ENERGY)?;
        properties::parse_energy_unit(&edt)
    }

    /// 0xe2/0xe4 積算電力量計測値履歴1。収集日を設定してから読む。
    pub fn get_historical_cumulative_energy_1(
        &self,
        day: u8,
        reverse: bool,
    ) -> Result<Vec<EnergyAtTime>> {
        self.set_day_for_historical_data_1(day)?;
        let code = if reverse {
            epc::HISTORICAL_ENERGY_1_REVERSED
        } else {
            epc::HISTORICAL_ENERGY_1
        };
        let edt = self.get_edt(code)?;
        properties::parse_energy_history_1(
            &edt,
            &self.scaling(),
            chrono::Local::now().date_naive(),
        )
    }

    /// 0xe5 積算履歴収集日1を設定する
    pub fn set_day_for_historical_data_1(&self, day: u8) -> Result<()> {
        let edt = properties::edt_day_for_historical_data_1(day)?;
        self.request_to_set_raw(&[RequestProperty::set(epc::DAY_FOR_HISTORICAL_DATA_1, edt)])
    }

    /// 0xe5 積算履歴収集日1
    pub fn get_day_for_historical_data_1(&self) -> Result<u8> {
        let edt = self.get_edt(epc::DAY_FOR_HISTORICAL_DATA_1)?;
        properties::parse_history_day(&edt)
    }

    /// 0xe7 瞬時電力計測値(W)
    pub fn get_instantaneous_power(&self) -> Result<Decimal> {
        let edt = self.get_edt(epc::INSTANTANEOUS_POWER)?;
        properties::parse_instantaneous_power(&edt)
    }

    /// 0xe8 瞬時電流計測値(A)
    pub fn get_instantaneous_current(&self) -> Result<InstantaneousCurrent> {
        let edt = self.get_edt(epc::INSTANTANEOUS_CURRENT)?;
        properties::parse_instantaneous_current(&edt)
    }

    /// 0xea/0xeb 定時積算電力量計測値
    pub fn get_cumulative_energy_measured_at_fixed_time(
        &self,
        reverse: bool,
    ) -> Result<FixedTimeEnergy> {
        let code = if reverse {
            epc::CUMULATIVE_ENERGY_AT_FIXED_TIME_REVERSED
        } else {
            epc::CUMULATIVE_ENERGY_AT_FIXED_TIME
        };
        let edt = self.get_edt(code)?;
        properties::parse_fixed_time_energy(&edt, &self.scaling())
    }

    /// 0xec 積算電力量計測値履歴2。収集日時を設定してから読む。
    pub fn get_historical_cumulative_energy_2(
        &self,
        timestamp: Option<NaiveDateTime>,
        num_of_data_points: u8,
    ) -> Result<Vec<BidirectionalEnergy>> {
        let timestamp = timestamp.unwrap_or_else(|| chrono::Local::now().naive_local());
        self.set_time_for_historical_data_2(&timestamp, num_of_data_points)?;
        let edt = self.get_edt(epc::HISTORICAL_ENERGY_2)?;
        properties::parse_bidirectional_history(&edt, &self.scaling(), TimeDelta::minutes(30))
    }

    /// 0xed 積算履歴収集日時2を設定する
    pub fn set_time_for_historical_data_2(
        &self,
        timestamp: &NaiveDateTime,
        num_of_data_points: u8,
    ) -> Result<()> {
        let edt = properties::edt_time_for_historical_data_2(timestamp, num_of_data_points)?;
        self.request_to_set_raw(&[RequestProperty::set(epc::TIME_FOR_HISTORICAL_DATA_2, edt)])
    }

    /// 0xed 積算履歴収集日時2
    pub fn get_time_for_historical_data_2(&self) -> Result<HistoryWindow> {
        let edt = self.get_edt(epc::TIME_FOR_HISTORICAL_DATA_2)?;
        properties::parse_history_window(&edt)
    }

    /// 0xee 積算電力量計測値履歴3。収集日時を設定してから読む。
    pub fn get_historical_cumulative_energy_3(
        &self,
        timestamp: Option<NaiveDateTime>,
        num_of_data_points: u8,
    ) -> Result<Vec<BidirectionalEnergy>> {
        let timestamp = timestamp.unwrap_or_else(|| chrono::Local::now().naive_local());
        self.set_time_for_historical_data_3(&timestamp, num_of_data_points)?;
        let edt = self.get_edt(epc::HISTORICAL_ENERGY_3)?;
        properties::parse_bidirectional_history(&edt, &self.scaling(), TimeDelta::minutes(1))
    }

    /// 0xef 積算履歴収集日時3を設定する
    pub fn set_time_for_historical_data_3(
        &self,
        timestamp: &NaiveDateTime,
        num_of_data_points: u8,
    ) -> Result<()> {
        let edt = properties::edt_time_for_historical_data_3(timestamp, num_of_data_points)?;
        self.request_to_set_raw(&[RequestProperty::set(epc::TIME_FOR_HISTORICAL_DATA_3, edt)])
    }

    /// 0xef 積算履歴収集日時3
    pub fn get_time_for_historical_data_3(&self) -> Result<HistoryWindow> {
        let edt = self.get_edt(epc::TIME_FOR_HISTORICAL_DATA_3)?;
        properties::parse_history_window(&edt)
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod meter_stub {
    use crate::echonetlite::edata::Edata;
    use crate::echonetlite::frame::{CONTROLLER_EOJ, EHD_FORMAT1, Frame, SMART_METER_EOJ, esv};
    use crate::session::session_stub::{self, METER_ADDR};
    use std::collections::VecDeque;

    const LOCAL_ADDR: &str = "FE80:0000:0000:0000:021D:1290:8765:4321";

    pub struct Sendto {
        pub tid: u16,
        pub esv: u8,
        pub properties: Vec<(u8, Vec<u8>)>,
    }

    /// Pick the ECHONET payload back out of a raw SKSENDTO write.
    pub fn parse_sendto(data: &[u8]) -> Option<Sendto> {
        if !data.starts_with(b"SKSENDTO") {
            return None;
        }
        let mut spaces = 0;
        let mut payload_at = None;
        for (i, &b) in data.iter().enumerate() {
            if b == b' ' {
                spaces += 1;
                if spaces == 7 {
                    payload_at = Some(i + 1);
                    break;
                }
            }
        }
        let payload = &data[payload_at?..];
        let tid = u16::from_be_bytes([payload[2], payload[3]]);
        let service = payload[10];
        let opc = payload[11] as usize;
        let mut properties = Vec::with_capacity(opc);
        let mut cur = 12;
        for _ in 0..opc {
            let code = payload[cur];
            let pdc = payload[cur + 1] as usize;
            properties.push((code, payload[cur + 2..cur + 2 + pdc].to_vec()));
            cur += 2 + pdc;
        }
        Some(Sendto {
            tid,
            esv: service,
            properties,
        })
    }

    pub fn erxudp_for(tid: u16, service: u8, properties: &[(u8, Vec<u8>)]) -> String {
        let edata: Vec<Edata> = properties
            .iter()
            .map(|(code, edt)| {
                if edt.is_empty() {
                    Edata::get(*code)
                } else {
                    Edata::set(*code, edt.clone())
                }
            })
            .collect();
        let payload = Frame {
            ehd: EHD_FORMAT1,
            tid,
            seoj: SMART_METER_EOJ,
            deoj: CONTROLLER_EOJ,
            esv: service,
            opc: edata.len() as u8,
            edata,
        }
        .encode()
        .unwrap();
        let hex: String = payload.iter().map(|b| format!("{:02X}", b)).collect();
        format!(
            "ERXUDP {} {} 0E1A 0E1A 001D129012345678 4B 1 0 {:04X} {}",
            METER_ADDR,
            LOCAL_ADDR,
            payload.len(),
            hex
        )
    }

    pub fn transmit_ack() -> String {
        format!("EVENT 21 {} 0 00", METER_ADDR)
    }

    // 取得要求への既定の応答EDT
    pub fn default_edt(code: u8) -> Vec<u8> {
        match code {
            0x80 => vec![0x30],
            0x81 => vec![0x08],
            0x82 => vec![0, 0, b'J', 3],
            0x88 => vec![0x42],
            0x8A => vec![0x00, 0x00, 0x16],
            0x8D => b"S19000001".to_vec(),
            0x97 => vec![12, 34],
            0x98 => vec![0x07, 0xEA, 8, 1],
            0x9D | 0x9E | 0x9F => vec![3, 0x80, 0xE7, 0xE8],
            0xC0 => vec![0xFE, 0x00, 0x00, 0x16, 9, 9, 9, 9],
            0xD0 => {
                let mut edt = vec![0x07, 0xEA, 8, 1, 12, 34, 0];
                edt.extend_from_slice(&[0x00, 0x00, 0x00, 0x64]);
                edt.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFE]);
                edt
            }
            0xD3 => vec![0x00, 0x00, 0x00, 0x01],
            0xD7 => vec![6],
            0xE0 | 0xE3 => vec![0x00, 0x00, 0x00, 0x64],
            0xE1 => vec![0x01], // 0.1 kwh
            0xE2 | 0xE4 => {
                let mut edt = vec![0x00, 0x01];
                for _ in 0..48 {
                    edt.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
                }
                edt
            }
            0xE5 => vec![1],
            0xE7 => vec![0x00, 0x00, 0x01, 0xF4],
            0xE8 => vec![0x00, 0x6F, 0x00, 0x64],
            0xEA | 0xEB => vec![0x07, 0xEA, 8, 1, 0, 30, 0, 0x00, 0x00, 0x00, 0x64],
            0xEC | 0xEE => {
                let mut edt = vec![0x07, 0xEA, 8, 1, 10, 30, 2];
                edt.extend_from_slice(&[0x00, 0x00, 0x00, 0x64, 0x00, 0x00, 0x00, 0x32]);
                edt.extend_from_slice(&[0x00, 0x00, 0x00, 0x0A, 0xFF, 0xFF, 0xFF, 0xFE]);
                edt
            }
            0xED | 0xEF => vec![0x07, 0xEA, 8, 1, 10, 30, 12],
            _ => vec![0x00],
        }
    }

    /// A compliant stubbed meter: negotiation plus Get/SetC responses.
    pub fn default_replies(data: &[u8], replies: &mut VecDeque<String>) {
        if session_stub::negotiation_replies(data, replies) {
            return;
        }
        let Some(sendto) = parse_sendto(data) else {
            return;
        };
        replies.push_back("OK".to_owned());
        replies.push_back(transmit_ack());
        match sendto.esv {
            esv::GET => {
                let res: Vec<(u8, Vec<u8>)> = sendto
                    .properties
                    .iter()
                    .map(|(code, _)| (*code, default_edt(*code)))
                    .collect();
                replies.push_back(erxudp_for(sendto.tid, esv::GET_RES, &res));
            }
            esv::SET_C => {
                let res: Vec<(u8, Vec<u8>)> = sendto
                    .properties
                    .iter()
                    .map(|(code, _)| (*code, Vec::new()))
                    .collect();
                replies.push_back(erxudp_for(sendto.tid, esv::SET_RES, &res));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
use crate::serial::stub::StubPort;
#[cfg(test)]
use crate::session::session_stub::{self, METER_ADDR, stub_config};
#[cfg(test)]
use rust_decimal::dec;
#[cfg(test)]
use std::collections::VecDeque;

#[cfg(test)]
fn open_stub_meter(port: &StubPort) -> Meter {
    port.set_responder(meter_stub::default_replies);
    let (reader, writer) = port.split();
    Meter::open_with_port(&stub_config(), reader, writer).unwrap()
}

#[test]
fn test1() {
    // happy-path power read: exact request payload on the wire, 500 W back
    let port = StubPort::new();
    let mut meter = open_stub_meter(&port);

    assert_eq!(meter.get_instantaneous_power().unwrap(), dec!(500));

    let writes = port.writes();
    let sendtos: Vec<meter_stub::Sendto> = writes
        .iter()
        .filter_map(|w| meter_stub::parse_sendto(w))
        .collect();
    // priming reads coefficient (tid 1) and unit (tid 2) before the power read
    assert_eq!(sendtos[0].tid, 1);
    assert_eq!(sendtos[0].properties[0].0, 0xD3);
    assert_eq!(sendtos[1].tid, 2);
    assert_eq!(sendtos[1].properties[0].0, 0xE1);
    assert_eq!(sendtos[2].tid, 3);
    assert_eq!(sendtos[2].esv, 0x62);
    assert_eq!(sendtos[2].properties, vec![(0xE7, Vec::new())]);

    // the full frame for the power read, byte for byte
    let power_read = writes
        .iter()
        .filter(|w| w.starts_with(b"SKSENDTO"))
        .nth(2)
        .unwrap();
    let payload_at = power_read.len() - 14;
    assert_eq!(
        &power_read[payload_at..],
        &[
            0x10, 0x81, 0x00, 0x03, 0x05, 0xFF, 0x01, 0x02, 0x88, 0x01, 0x62, 0x01, 0xE7, 0x00
        ]
    );
    meter.close();
}

#[test]
fn test2() {
    // foreign frames are noise: wrong port, wrong side, wrong source address
    let port = StubPort::new();
    let sendto_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let sendto_count = std::sync::Arc::clone(&sendto_count);
        port.set_responder(move |data: &[u8], replies: &mut VecDeque<String>| {
            if let Some(sendto) = meter_stub::parse_sendto(data) {
                replies.push_back("OK".to_owned());
                replies.push_back(meter_stub::transmit_ack());
                if sendto.properties[0].0 != 0xE7 {
                    let res: Vec<(u8, Vec<u8>)> = sendto
                        .properties
                        .iter()
                        .map(|(code, _)| (*code, meter_stub::default_edt(*code)))
                        .collect();
                    replies.push_back(meter_stub::erxudp_for(sendto.tid, 0x72, &res));
                    return;
                }
                sendto_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let good = meter_stub::erxudp_for(sendto.tid, 0x72, &[(0xE7, vec![0, 0, 1, 0xF4])]);
                // wrong source port
                replies.push_back(good.replace("0E1A 0E1A", "02CC 0E1A"));
                // wrong side
                replies.push_back(good.replace(" 4B 1 0 ", " 4B 1 1 "));
                // wrong source address
                replies.push_back(good.replace(
                    "ERXUDP FE80:0000:0000:0000:021D:1290:1234:5678",
                    "ERXUDP FE80:0000:0000:0000:0000:0000:0000:0001",
                ));
                // a response for some other transaction
                replies.push_back(meter_stub::erxudp_for(
                    sendto.tid.wrapping_add(7),
                    0x72,
                    &[(0xE7, vec![0, 0, 1, 0xF4])],
                ));
                // and finally the real one
                replies.push_back(good);
            } else {
                session_stub::negotiation_replies(data, replies);
            }
        });
    }
    let (reader, writer) = port.split();
    let mut meter = Meter::open_with_port(&stub_config(), reader, writer).unwrap();

    assert_eq!(meter.get_instantaneous_power().unwrap(), dec!(500));
    // the noise did not force a retransmission
    assert_eq!(sendto_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    meter.close();
}

#[test]
fn test3() {
    // retry exhaustion: 12 transmissions, then NeedToReopen
    let port = StubPort::new();
    port.set_responder(|data: &[u8], replies: &mut VecDeque<String>| {
        if let Some(sendto) = meter_stub::parse_sendto(data) {
            replies.push_back("OK".to_owned());
            replies.push_back(meter_stub::transmit_ack());
            if sendto.properties[0].0 == 0xE7 {
                return; // never answer the power read
            }
            let res: Vec<(u8, Vec<u8>)> = sendto
                .properties
                .iter()
                .map(|(code, _)| (*code, meter_stub::default_edt(*code)))
                .collect();
            replies.push_back(meter_stub::erxudp_for(sendto.tid, 0x72, &res));
        } else {
            session_stub::negotiation_replies(data, replies);
        }
    });
    let (reader, writer) = port.split();
    let mut meter = Meter::open_with_port(&stub_config(), reader, writer).unwrap();

    match meter.get_instantaneous_power() {
        Err(Error::NeedToReopen(_)) => {}
        other => panic!("unexpected result: {:?}", other.err()),
    }
    let power_reads = port
        .writes()
        .iter()
        .filter_map(|w| meter_stub::parse_sendto(w))
        .filter(|s| s.properties[0].0 == 0xE7)
        .count();
    assert_eq!(power_reads, 12);
    meter.close();
}

#[test]
fn test4() {
    // the meter refuses the optional coefficient: default to 1, open succeeds
    let port = StubPort::new();
    port.set_responder(|data: &[u8], replies: &mut VecDeque<String>| {
        if let Some(sendto) = meter_stub::parse_sendto(data) {
            replies.push_back("OK".to_owned());
            replies.push_back(meter_stub::transmit_ack());
            if sendto.properties[0].0 == 0xD3 {
                // Get_SNA
                replies.push_back(meter_stub::erxudp_for(sendto.tid, 0x52, &[(0xD3, Vec::new())]));
                return;
            }
            let res: Vec<(u8, Vec<u8>)> = sendto
                .properties
                .iter()
                .map(|(code, _)| (*code, meter_stub::default_edt(*code)))
                .collect();
            replies.push_back(meter_stub::erxudp_for(sendto.tid, 0x72, &res));
        } else {
            session_stub::negotiation_replies(data, replies);
        }
    });
    let (reader, writer) = port.split();
    let mut meter = Meter::open_with_port(&stub_config(), reader, writer).unwrap();

    assert_eq!(meter.scaling().coefficient, 1);
    assert_eq!(meter.scaling().unit, dec!(0.1));
    // 0x64 raw * 1 * 0.1 kwh
    assert_eq!(meter.get_measured_cumulative_energy(false).unwrap(), dec!(10.0));
    meter.close();
}

#[test]
fn test5() {
    // lifetime expiry blocks a send until the rejoin event releases the gate
    let port = StubPort::new();
    let meter = std::sync::Arc::new(open_stub_meter(&port));

    port.inject_line(&format!("EVENT 29 {} 0", METER_ADDR));
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !meter.session.gate().is_locked() {
        assert!(std::time::Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }

    let reader = {
        let meter = std::sync::Arc::clone(&meter);
        thread::spawn(move || meter.get_instantaneous_power())
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!reader.is_finished(), "the send path must block while restricted");

    port.inject_line(&format!("EVENT 25 {} 0", METER_ADDR));
    assert_eq!(reader.join().unwrap().unwrap(), dec!(500));
}

#[test]
fn test6() {
    // rate limit engages mid-read; a second caller waits its turn
    let port = StubPort::new();
    let power_reads = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let power_reads = std::sync::Arc::clone(&power_reads);
        port.set_responder(move |data: &[u8], replies: &mut VecDeque<String>| {
            if let Some(sendto) = meter_stub::parse_sendto(data) {
                replies.push_back("OK".to_owned());
                replies.push_back(meter_stub::transmit_ack());
                if sendto.properties[0].0 == 0xE7 {
                    let n = power_reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n == 0 {
                        // the rate limit engages before the first response arrives
                        replies.push_back(format!("EVENT 32 {} 0", METER_ADDR));
                        return;
                    }
                }
                let res: Vec<(u8, Vec<u8>)> = sendto
                    .properties
                    .iter()
                    .map(|(code, _)| (*code, meter_stub::default_edt(*code)))
                    .collect();
                replies.push_back(meter_stub::erxudp_for(sendto.tid, 0x72, &res));
            } else {
                session_stub::negotiation_replies(data, replies);
            }
        });
    }
    let (reader, writer) = port.split();
    let meter = std::sync::Arc::new(Meter::open_with_port(&stub_config(), reader, writer).unwrap());

    let first = {
        let meter = std::sync::Arc::clone(&meter);
        thread::spawn(move || {
            let value = meter.get_instantaneous_power();
            (value, std::time::Instant::now())
        })
    };
    // wait for the rate limit to engage
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !meter.session.gate().is_locked() {
        assert!(std::time::Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
    let second = {
        let meter = std::sync::Arc::clone(&meter);
        thread::spawn(move || {
            let value = meter.get_instantaneous_power();
            (value, std::time::Instant::now())
        })
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!first.is_finished());
    assert!(!second.is_finished());

    port.inject_line(&format!("EVENT 33 {} 0", METER_ADDR));
    let (first_value, first_done) = first.join().unwrap();
    let (second_value, second_done) = second.join().unwrap();
    assert_eq!(first_value.unwrap(), dec!(500));
    assert_eq!(second_value.unwrap(), dec!(500));
    assert!(first_done <= second_done);
}

#[test]
fn test7() {
    // history 1 end to end: day preset, 48 anchored points
    let port = StubPort::new();
    let mut meter = open_stub_meter(&port);

    let history = meter.get_historical_cumulative_energy_1(1, false).unwrap();
    assert_eq!(history.len(), 48);
    let expected_start = chrono::Local::now()
        .date_naive()
        .checked_sub_days(chrono::Days::new(1))
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    assert_eq!(history[0].timestamp, expected_start);
    assert_eq!(
        history[1].timestamp - history[0].timestamp,
        TimeDelta::minutes(30)
    );
    // unit 0.1 kwh applies to every sample
    assert!(history.iter().all(|p| p.energy == Some(dec!(0.1))));

    // the preceding SetC carried the requested day
    let day_set = port
        .writes()
        .iter()
        .filter_map(|w| meter_stub::parse_sendto(w))
        .find(|s| s.esv == 0x61)
        .expect("no SetC request on the wire");
    assert_eq!(day_set.properties, vec![(0xE5, vec![1])]);
    meter.close();
}

#[test]
fn test8() {
    // batch get and batch set
    let port = StubPort::new();
    let mut meter = open_stub_meter(&port);

    let parsed = meter
        .request_to_get(&BTreeSet::from([0xE7, 0xE1, 0x8A]))
        .unwrap();
    assert_eq!(
        parsed.get(&0xE7),
        Some(&PropertyValue::InstantaneousPower(dec!(500)))
    );
    assert_eq!(parsed.get(&0xE1), Some(&PropertyValue::EnergyUnit(dec!(0.1))));
    assert_eq!(
        parsed.get(&0x8A),
        Some(&PropertyValue::ManufacturerCode([0, 0, 0x16]))
    );

    let timestamp = NaiveDate::from_ymd_opt(2026, 8, 1)
        .unwrap()
        .and_hms_opt(10, 29, 0)
        .unwrap();
    meter
        .request_to_set(&SetRequest {
            day_for_historical_data_1: Some(3),
            time_for_historical_data_2: Some((timestamp, 12)),
            time_for_historical_data_3: None,
        })
        .unwrap();
    let set = port
        .writes()
        .iter()
        .filter_map(|w| meter_stub::parse_sendto(w))
        .find(|s| s.esv == 0x61)
        .unwrap();
    assert_eq!(
        set.properties,
        vec![
            (0xE5, vec![3]),
            (0xED, vec![0x07, 0xEA, 8, 1, 10, 0, 12]),
        ]
    );
    meter.close();
}

#[test]
fn test9() {
    // an unknown EPC in the batch dispatch is a runtime error
    let port = StubPort::new();
    let mut meter = open_stub_meter(&port);
    match meter.request_to_get(&BTreeSet::from([0xF0])) {
        Err(Error::Runtime(_)) => {}
        other => panic!("unexpected result: {:?}", other.err()),
    }
    meter.close();
}

#[test]
fn test11() {
    // the transaction id counter wraps to its low 16 bits
    let port = StubPort::new();
    let mut meter = open_stub_meter(&port);
    meter.transaction_id.store(0xFFFF, Ordering::SeqCst);

    assert_eq!(meter.get_instantaneous_power().unwrap(), dec!(500));
    let last = port
        .writes()
        .iter()
        .filter_map(|w| meter_stub::parse_sendto(w))
        .last()
        .unwrap();
    assert_eq!(last.tid, 0x0000);
    meter.close();
}

#[test]
fn test10() {
    // a link-layer retransmit signal backs off and transmits again
    let port = StubPort::new();
    let power_reads = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let power_reads = std::sync::Arc::clone(&power_reads);
        port.set_responder(move |data: &[u8], replies: &mut VecDeque<String>| {
            if let Some(sendto) = meter_stub::parse_sendto(data) {
                replies.push_back("OK".to_owned());
                if sendto.properties[0].0 == 0xE7
                    && power_reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0
                {
                    // the link layer reports a retransmission
                    replies.push_back(format!("EVENT 21 {} 0 01", METER_ADDR));
                    return;
                }
                replies.push_back(meter_stub::transmit_ack());
                let res: Vec<(u8, Vec<u8>)> = sendto
                    .properties
                    .iter()
                    .map(|(code, _)| (*code, meter_stub::default_edt(*code)))
                    .collect();
                replies.push_back(meter_stub::erxudp_for(sendto.tid, 0x72, &res));
            } else {
                session_stub::negotiation_replies(data, replies);
            }
        });
    }
    let (reader, writer) = port.split();
    let mut meter = Meter::open_with_port(&stub_config(), reader, writer).unwrap();

    assert_eq!(meter.get_instantaneous_power().unwrap(), dec!(500));
    assert_eq!(power_reads.load(std::sync::atomic::Ordering::SeqCst), 2);
    meter.close();
}

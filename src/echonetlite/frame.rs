// Echonetlite FRAME
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use crate::echonetlite::edata::Edata;
use crate::error::{Error, Result};
use core::result;

/// ECHONET Lite EDATA形式1ヘッダ
pub const EHD_FORMAT1: u16 = 0x1081;
/// コントローラークラス
pub const CONTROLLER_EOJ: [u8; 3] = [0x05, 0xff, 0x01];
/// 低圧スマート電力量メータークラス
pub const SMART_METER_EOJ: [u8; 3] = [0x02, 0x88, 0x01];

pub mod esv {
    pub const SET_C: u8 = 0x61;
    pub const GET: u8 = 0x62;
    pub const SET_RES: u8 = 0x71;
    pub const GET_RES: u8 = 0x72;
}

pub fn wire_config()
-> bincode::config::Configuration<bincode::config::BigEndian, bincode::config::Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// リクエストの1プロパティ。Getは`edt`なし、SetCは`edt`必須。
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RequestProperty {
    pub epc: u8,
    pub edt: Option<Vec<u8>>,
}

impl RequestProperty {
    pub fn get(epc: u8) -> Self {
        Self { epc, edt: None }
    }

    pub fn set(epc: u8, edt: Vec<u8>) -> Self {
        Self {
            epc,
            edt: Some(edt),
        }
    }
}

/// 応答の1プロパティ。PDC=0のとき`edt`なし。
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ResponseProperty {
    pub epc: u8,
    pub edt: Option<Vec<u8>>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Frame {
    pub ehd: u16,
    pub tid: u16,
    pub seoj: [u8; 3],
    pub deoj: [u8; 3],
    pub esv: u8,
    pub opc: u8,
    pub edata: Vec<Edata>,
}

impl Frame {
    /// コントローラーからスマートメーターへのリクエストを組み立てる
    pub fn request(tid: u16, service: u8, properties: &[RequestProperty]) -> Result<Frame> {
        let edata = match service {
            esv::GET => properties.iter().map(|p| Edata::get(p.epc)).collect(),
            esv::SET_C => properties
                .iter()
                .map(|p| {
                    p.edt
                        .clone()
                        .map(|edt| Edata::set(p.epc, edt))
                        .ok_or_else(|| {
                            Error::InvalidParameter(format!(
                                "a SetC request needs EDT for EPC 0x{:02X}",
                                p.epc
                            ))
                        })
                })
                .collect::<Result<Vec<Edata>>>()?,
            other => {
                return Err(Error::Runtime(format!(
                    "unsupported service code 0x{:02X}",
                    other
                )));
            }
        };
        Ok(Frame {
            ehd: EHD_FORMAT1,
            tid,
            seoj: CONTROLLER_EOJ,
            deoj: SMART_METER_EOJ,
            esv: service,
            opc: properties.len() as u8,
            edata,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, wire_config()).map_err(|e| Error::Runtime(e.to_string()))
    }
}

impl Default for Frame {
    #[inline]
    fn default() -> Self {
        Frame {
            ehd: EHD_FORMAT1,
            tid: 0,
            seoj: [0, 0, 0],
            deoj: [0, 0, 0],
            esv: 0,
            opc: 0,
            edata: vec![],
        }
    }
}

impl<Context> bincode::Decode<Context> for Frame {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> core::result::Result<Self, bincode::error::DecodeError> {
        let ehd: u16 = bincode::Decode::decode(decoder)?;
        let tid: u16 = bincode::Decode::decode(decoder)?;
        let seoj: [u8; 3] = bincode::Decode::decode(decoder)?;
        let deoj: [u8; 3] = bincode::Decode::decode(decoder)?;
        let esv: u8 = bincode::Decode::decode(decoder)?;
        let opc: u8 = bincode::Decode::decode(decoder)?;
        let mut edata: Vec<Edata> = Vec::new();
        for _idx in 0..opc {
            edata.push(bincode::Decode::decode(decoder)?);
        }
        Ok(Self {
            ehd,
            tid,
            seoj,
            deoj,
            esv,
            opc,
            edata,
        })
    }
}

impl bincode::Encode for Frame {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.ehd, encoder)?;
        bincode::Encode::encode(&self.tid, encoder)?;
        bincode::Encode::encode(&self.seoj, encoder)?;
        bincode::Encode::encode(&self.deoj, encoder)?;
        bincode::Encode::encode(&self.esv, encoder)?;
        bincode::Encode::encode(&self.opc, encoder)?;
        for v in &self.edata {
            bincode::Encode::encode(v, encoder)?;
        }
        Ok(())
    }
}

/// 応答フレームの不一致。`Rejected`はエラーではなく「次の行を待て」の合図。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    Rejected(String),
    NotPossible(u8),
}

impl From<ExtractError> for Error {
    fn from(e: ExtractError) -> Error {
        match e {
            ExtractError::Rejected(reason) => Error::ResponseNotExpected(reason),
            ExtractError::NotPossible(service) => Error::ResponseNotPossible(service),
        }
    }
}

/// 受信したUDPペイロードを検査してプロパティ列を取り出す
///
/// Validation order: EHD, TID, SEOJ, DEOJ, ESV failure window, OPC, then
/// the per-slot EPC correlation against the request.
pub fn extract_response(
    data: &[u8],
    tid: u16,
    req_properties: &[RequestProperty],
) -> result::Result<Vec<ResponseProperty>, ExtractError> {
    let (frame, _len): (Frame, usize) = bincode::decode_from_slice(data, wire_config())
        .map_err(|e| ExtractError::Rejected(format!("undecodable frame: {e}")))?;

    if frame.ehd != EHD_FORMAT1 {
        return Err(ExtractError::Rejected(
            "the data is not ECHONET Lite EDATA format 1".to_owned(),
        ));
    }
    if frame.tid != tid {
        return Err(ExtractError::Rejected(format!(
            "the transaction id does not match: expected {:04X} but {:04X} was set",
            tid, frame.tid
        )));
    }
    if frame.seoj != SMART_METER_EOJ {
        return Err(ExtractError::Rejected(
            "the source is not a smart meter".to_owned(),
        ));
    }
    if frame.deoj != CONTROLLER_EOJ {
        return Err(ExtractError::Rejected(
            "the destination is not a controller".to_owned(),
        ));
    }
    if (0x50..=0x5F).contains(&frame.esv) {
        return Err(ExtractError::NotPossible(frame.esv));
    }
    if frame.opc as usize != req_properties.len() {
        return Err(ExtractError::Rejected(format!(
            "OPC is expected to be {} but {} was set",
            req_properties.len(),
            frame.opc
        )));
    }

    let mut properties = Vec::with_capacity(frame.edata.len());
    for (edata, req) in frame.edata.into_iter().zip(req_properties) {
        if edata.epc != req.epc {
            return Err(ExtractError::Rejected(format!(
                "the property code does not match: EPC 0x{:02X}",
                req.epc
            )));
        }
        properties.push(ResponseProperty {
            epc: edata.epc,
            edt: if edata.pdc == 0 { None } else { Some(edata.edt) },
        });
    }
    Ok(properties)
}

#[test]
fn test1() {
    let frame = Frame::request(0x0001, esv::GET, &[RequestProperty::get(0xe7)]).unwrap();

    let binary: Vec<u8> = vec![
        0x10, 0x81, //
        0x00, 0x01, //
        0x05, 0xff, 0x01, //
        0x02, 0x88, 0x01, //
        0x62, //
        0x01, //
        0xe7, 0x00, //
    ];

    let encoded = frame.encode().unwrap();
    assert_eq!(encoded.len(), 14);
    assert_eq!(encoded, binary);

    let (decoded, _len): (Frame, usize) =
        bincode::decode_from_slice(&encoded[..], wire_config()).unwrap();
    assert_eq!(frame, decoded);
}

#[cfg(test)]
fn response_bytes(tid: u16, service: u8, edata: Vec<Edata>) -> Vec<u8> {
    Frame {
        ehd: EHD_FORMAT1,
        tid,
        seoj: SMART_METER_EOJ,
        deoj: CONTROLLER_EOJ,
        esv: service,
        opc: edata.len() as u8,
        edata,
    }
    .encode()
    .unwrap()
}

#[test]
fn test2() {
    // a Get response round-trips into the requested property list
    let req = vec![RequestProperty::get(0xe7)];
    let data = response_bytes(
        0x1234,
        esv::GET_RES,
        vec![Edata::set(0xe7, vec![0, 0, 1, 0xf4])],
    );
    let res = extract_response(&data, 0x1234, &req).unwrap();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0].epc, 0xe7);
    assert_eq!(res[0].edt, Some(vec![0, 0, 1, 0xf4]));

    // PDC = 0 means no EDT
    let data = response_bytes(0x1234, esv::SET_RES, vec![Edata::get(0xe5)]);
    let res = extract_response(&data, 0x1234, &[RequestProperty::get(0xe5)]).unwrap();
    assert_eq!(res[0].edt, None);
}

#[test]
fn test3() {
    let req = vec![RequestProperty::get(0xe7)];
    let good = response_bytes(0x0001, esv::GET_RES, vec![Edata::set(0xe7, vec![0, 0, 0, 1])]);

    // every mismatched field rejects the frame
    let mut bad_ehd = good.clone();
    bad_ehd[0] = 0x11;
    assert!(matches!(
        extract_response(&bad_ehd, 0x0001, &req),
        Err(ExtractError::Rejected(_))
    ));

    assert!(matches!(
        extract_response(&good, 0x0002, &req),
        Err(ExtractError::Rejected(_))
    ));

    let mut bad_seoj = good.clone();
    bad_seoj[4..7].copy_from_slice(&[0x0e, 0xf0, 0x01]);
    assert!(matches!(
        extract_response(&bad_seoj, 0x0001, &req),
        Err(ExtractError::Rejected(_))
    ));

    let mut bad_deoj = good.clone();
    bad_deoj[7..10].copy_from_slice(&[0x0e, 0xf0, 0x01]);
    assert!(matches!(
        extract_response(&bad_deoj, 0x0001, &req),
        Err(ExtractError::Rejected(_))
    ));

    // OPC must equal the request property count
    assert!(matches!(
        extract_response(
            &good,
            0x0001,
            &[RequestProperty::get(0xe7), RequestProperty::get(0xe8)]
        ),
        Err(ExtractError::Rejected(_))
    ));

    // EPC correlation is order-preserving
    assert!(matches!(
        extract_response(&good, 0x0001, &[RequestProperty::get(0xe8)]),
        Err(ExtractError::Rejected(_))
    ));

    // a truncated frame is noise, not a crash
    assert!(matches!(
        extract_response(&good[..10], 0x0001, &req),
        Err(ExtractError::Rejected(_))
    ));
}

#[test]
fn test4() {
    // the whole ESV failure window raises NotPossible
    let req = vec![RequestProperty::get(0xd3)];
    for service in 0x50..=0x5f {
        let data = response_bytes(0x0001, service, vec![Edata::get(0xd3)]);
        assert_eq!(
            extract_response(&data, 0x0001, &req),
            Err(ExtractError::NotPossible(service))
        );
    }
}

#[test]
fn test5() {
    // SetC requires EDT on every property
    assert!(Frame::request(1, esv::SET_C, &[RequestProperty::get(0xe5)]).is_err());
    let frame = Frame::request(1, esv::SET_C, &[RequestProperty::set(0xe5, vec![3])]).unwrap();
    assert_eq!(frame.opc, 1);
    assert_eq!(frame.edata[0].pdc, 1);

    // only Get and SetC are requests
    assert!(Frame::request(1, esv::GET_RES, &[]).is_err());
}

// Echonetlite EDATA
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use bincode::de::read::Reader;
use core::result;
use std::fmt;

/// One property block: property code, data count and data bytes.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Edata {
    pub epc: u8,
    pub pdc: u8,
    pub edt: Vec<u8>,
}

impl Edata {
    /// Getリクエスト用(EDTなし)
    pub fn get(epc: u8) -> Self {
        Edata {
            epc,
            pdc: 0,
            edt: Vec::new(),
        }
    }

    /// SetCリクエスト用
    pub fn set(epc: u8, edt: Vec<u8>) -> Self {
        Edata {
            epc,
            pdc: edt.len() as u8,
            edt,
        }
    }
}

impl<Context> bincode::Decode<Context> for Edata {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> core::result::Result<Self, bincode::error::DecodeError> {
        let epc: u8 = bincode::Decode::decode(decoder)?;
        let pdc: u8 = bincode::Decode::decode(decoder)?;
        decoder.claim_bytes_read(pdc as usize)?;
        let mut edt = vec![0u8; pdc as usize];
        decoder.reader().read(&mut edt)?;
        Ok(Self { epc, pdc, edt })
    }
}

impl bincode::Encode for Edata {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.epc, encoder)?;
        bincode::Encode::encode(&self.pdc, encoder)?;
        for v in &self.edt {
            bincode::Encode::encode(v, encoder)?;
        }
        Ok(())
    }
}

impl fmt::Display for Edata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "EPC:0x{:02X}, EDT:[{}]",
            self.epc,
            self.edt
                .iter()
                .map(|x| format!("0x{:02X}", x))
                .collect::<Vec<String>>()
                .join(",")
        )
    }
}

#[test]
fn test1() {
    let e7 = Edata {
        epc: 0xe7,
        pdc: 4,
        edt: vec![1, 2, 3, 4],
    };
    let edata = e7.clone();

    let binary: Vec<u8> = vec![0xe7, 0x04, 0x01, 0x02, 0x03, 0x04];
    let config = crate::echonetlite::frame::wire_config();
    let encoded = bincode::encode_to_vec(&edata, config).unwrap();
    assert_eq!(encoded, binary);

    let (decoded, _len): (Edata, usize) = bincode::decode_from_slice(&encoded[..], config).unwrap();
    assert_eq!(e7, decoded);
}

#[test]
fn test2() {
    assert_eq!(
        Edata::get(0xe7),
        Edata {
            epc: 0xe7,
            pdc: 0,
            edt: vec![],
        }
    );
    assert_eq!(
        Edata::set(0xe5, vec![3]),
        Edata {
            epc: 0xe5,
            pdc: 1,
            edt: vec![3],
        }
    );
}

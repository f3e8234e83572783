// SKSTACK/IPの応答行パーサー
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use crate::skstack::response::{Event, RxUdp};
use nom::Parser;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::{digit1, hex_digit1, space0, space1};
use nom::combinator::{map, map_res, opt, rest};
use nom::multi::{many0, separated_list1};
use nom::sequence::preceded;
use std::net::Ipv6Addr;

// 8ビット16進数(任意桁)
fn u8_hex_digit(input: &str) -> nom::IResult<&str, u8> {
    map_res(hex_digit1, |hexd| u8::from_str_radix(hexd, 16)).parse(input)
}

// 8ビット16進数(2桁固定)
fn u8_hex_digit2(input: &str) -> nom::IResult<&str, u8> {
    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()), |s| {
        u8::from_str_radix(s, 16)
    })
    .parse(input)
}

// 8ビット10進数
fn u8_decimal(input: &str) -> nom::IResult<&str, u8> {
    map_res(digit1, str::parse::<u8>).parse(input)
}

// 16ビット16進数(任意桁)
fn u16_hex_digit(input: &str) -> nom::IResult<&str, u16> {
    map_res(hex_digit1, |hexd| u16::from_str_radix(hexd, 16)).parse(input)
}

// 64ビット16進数(任意桁)
fn u64_hex_digit(input: &str) -> nom::IResult<&str, u64> {
    map_res(hex_digit1, |hexd| u64::from_str_radix(hexd, 16)).parse(input)
}

// Ipv6アドレス(FE80:0000:0000:0000:0000:0000:0000:0000)
pub fn ipv6addr(s: &str) -> nom::IResult<&str, Ipv6Addr> {
    let parser = separated_list1(tag(":"), hex_digit1);
    map_res(parser, |xs: Vec<&str>| xs.join(":").parse::<Ipv6Addr>()).parse(s)
}

// FAIL ERxx (エラーコードは10進数)
pub fn fail_line(input: &str) -> nom::IResult<&str, u8> {
    preceded(tag("FAIL ER"), u8_decimal).parse(input)
}

// OK または OK xx
pub fn ok_line(input: &str) -> nom::IResult<&str, Option<u8>> {
    map((tag("OK"), opt(preceded(space1, u8_decimal))), |(_, n)| n).parse(input)
}

// EVENT xx FE80:... [<side>] [<param>]
pub fn event_line(s: &str) -> nom::IResult<&str, Event> {
    let (s, _) = tag("EVENT").parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, code) = u8_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, sender) = ipv6addr.parse(s)?;
    let (s, side) = opt(preceded(space1, u8_hex_digit)).parse(s)?;
    let (s, param) = opt(preceded(space1, u8_hex_digit)).parse(s)?;
    let (s, _) = space0.parse(s)?;
    Ok((
        s,
        Event {
            code,
            sender,
            side,
            param,
        },
    ))
}

// ERXUDP <src> <dst> <sport> <dport> <srcmac> <lqi> <sec> <side> <len> <data>
pub fn erxudp_line(s: &str) -> nom::IResult<&str, RxUdp> {
    let (s, _) = tag("ERXUDP").parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信元アドレス
    let (s, src_addr) = ipv6addr.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信先アドレス
    let (s, dst_addr) = ipv6addr.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信元ポート番号
    let (s, src_port) = u16_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信先ポート番号
    let (s, dst_port) = u16_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 送信元のMAC層アドレス
    let (s, src_mac) = u64_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 受信時の電波強度
    let (s, lqi) = u8_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 暗号化あり/なし
    let (s, secured) = u8_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 論理側面(ルートBは0)
    let (s, side) = u8_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 受信したデータの長さ
    let (s, data_len) = u16_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 受信データ(16進テキスト)
    let (s, data) = many0(u8_hex_digit2).parse(s)?;

    Ok((
        s,
        RxUdp {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            src_mac,
            lqi,
            secured,
            side,
            data_len,
            data,
        },
    ))
}

// EPANDESCブロックのフィールド行("  Channel:3B"など)
pub fn labelled_hex(label: &str, input: &str) -> Option<u64> {
    (space0::<&str, nom::error::Error<&str>>, tag(label), u64_hex_digit)
        .parse(input)
        .ok()
        .map(|(_rest, (_, _, value))| value)
}

// EVER x.y.z
pub fn ever_line(input: &str) -> nom::IResult<&str, String> {
    map((tag("EVER"), space1, rest), |(_, _, v): (_, _, &str)| {
        v.trim().to_owned()
    })
    .parse(input)
}

// EAPPVER xxx
pub fn eappver_line(input: &str) -> nom::IResult<&str, String> {
    map((tag("EAPPVER"), space1, rest), |(_, _, v): (_, _, &str)| {
        v.trim().to_owned()
    })
    .parse(input)
}

// EINFO <ip6> <mac> <channel> <panid> <side>
pub fn einfo_line(s: &str) -> nom::IResult<&str, (Ipv6Addr, u64, u8, u16, u8)> {
    let (s, _) = tag("EINFO").parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, ip6_addr) = ipv6addr.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, mac_addr) = u64_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, channel) = u8_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, pan_id) = u16_hex_digit.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, side) = u8_hex_digit.parse(s)?;
    Ok((s, (ip6_addr, mac_addr, channel, pan_id, side)))
}

#[test]
fn test1() {
    assert_eq!(fail_line("FAIL ER04").unwrap(), ("", 4));
    assert_eq!(fail_line("FAIL ER10").unwrap(), ("", 10));
    assert!(fail_line("OK").is_err());

    assert_eq!(ok_line("OK").unwrap(), ("", None));
    assert_eq!(ok_line("OK 01").unwrap(), ("", Some(1)));
}

#[test]
fn test2() {
    let sender = "FE80:0000:0000:0000:021D:1290:1234:5678";

    assert_eq!(
        event_line(&format!("EVENT 25 {}", sender)).unwrap(),
        (
            "",
            Event {
                code: 0x25,
                sender: sender.parse().unwrap(),
                side: None,
                param: None,
            }
        )
    );

    assert_eq!(
        event_line(&format!("EVENT 21 {} 0 02", sender)).unwrap(),
        (
            "",
            Event {
                code: 0x21,
                sender: sender.parse().unwrap(),
                side: Some(0),
                param: Some(2),
            }
        )
    );
}

#[test]
fn test3() {
    let line = "ERXUDP FE80:0000:0000:0000:021D:1290:1234:5678 \
                FE80:0000:0000:0000:021D:1290:8765:4321 \
                0E1A 0E1A 001D129012345678 4B 1 0 0004 10810001";
    let (rest, udp) = erxudp_line(line).unwrap();
    assert_eq!(rest, "");
    assert_eq!(
        udp.src_addr,
        "FE80:0000:0000:0000:021D:1290:1234:5678"
            .parse::<Ipv6Addr>()
            .unwrap()
    );
    assert_eq!(udp.src_port, 0x0E1A);
    assert_eq!(udp.dst_port, 0x0E1A);
    assert_eq!(udp.src_mac, 0x001D_1290_1234_5678);
    assert_eq!(udp.lqi, 0x4B);
    assert_eq!(udp.secured, 1);
    assert_eq!(udp.side, 0);
    assert_eq!(udp.data_len, 4);
    assert_eq!(udp.data, vec![0x10, 0x81, 0x00, 0x01]);
}

#[test]
fn test4() {
    assert_eq!(labelled_hex("Channel:", "  Channel:3B"), Some(0x3B));
    assert_eq!(labelled_hex("Pan ID:", "  Pan ID:8888"), Some(0x8888));
    assert_eq!(labelled_hex("Channel:", "  Channel Page:09"), None);

    assert_eq!(ever_line("EVER 1.5.2").unwrap(), ("", "1.5.2".to_owned()));
    let (_, (addr, mac, channel, pan_id, side)) =
        einfo_line("EINFO FE80:0000:0000:0000:021D:1290:1234:5678 001D129012345678 21 8888 0")
            .unwrap();
    assert_eq!(addr.segments()[0], 0xFE80);
    assert_eq!(mac, 0x001D_1290_1234_5678);
    assert_eq!(channel, 0x21);
    assert_eq!(pan_id, 0x8888);
    assert_eq!(side, 0);
}

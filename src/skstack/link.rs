// Wi-SUNモジュールとのコマンド送受信
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use crate::error::{Error, Result, SkCommandError};
use crate::serial::{LineReader, LineWriter};
use crate::skstack::parser;
use crate::skstack::response::{self, ScanResult, SkAppVer, SkInfo, SkVer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const COMMAND_SUBSCRIBER: &str = "cmd";
const PUBLISHER_POLL: Duration = Duration::from_secs(1);
const BOOT_DRAIN_IDLE: Duration = Duration::from_secs(2);
const MODE_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

type Subscribers = Arc<Mutex<HashMap<String, mpsc::Sender<String>>>>;

struct CommandPipe {
    writer: Box<dyn LineWriter>,
    lines: mpsc::Receiver<String>,
}

/// One open Wi-SUN module: a publisher thread fanning received lines out
/// to named subscriber queues, and a serialized command execution path.
pub struct SkLink {
    cmd: Mutex<CommandPipe>,
    subscribers: Subscribers,
    stop: Arc<AtomicBool>,
    publisher: Mutex<Option<JoinHandle<()>>>,
}

impl SkLink {
    /// Flush boot-time garbage, force the module into ASCII UDP mode and
    /// start the line publisher.
    pub fn open(
        mut reader: Box<dyn LineReader>,
        mut writer: Box<dyn LineWriter>,
    ) -> Result<Self> {
        writer.write_bytes(b"\r\n")?;
        reader.drain(BOOT_DRAIN_IDLE)?;

        if exec_ropt(reader.as_mut(), writer.as_mut())? != 1 {
            tracing::warn!(
                "executing 'WOPT 01' to make the module return UDP payloads in ASCII; \
                 the setting is stored in NVRAM so this should happen at most once per device"
            );
            exec_wopt(reader.as_mut(), writer.as_mut(), 1)?;
        }

        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel();
        subscribers.lock().insert(COMMAND_SUBSCRIBER.to_owned(), cmd_tx);

        let stop = Arc::new(AtomicBool::new(false));
        let publisher = {
            let subscribers = Arc::clone(&subscribers);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("line-publisher".to_owned())
                .spawn(move || publisher_loop(reader, subscribers, stop))
                .map_err(Error::Transport)?
        };

        Ok(Self {
            cmd: Mutex::new(CommandPipe {
                writer,
                lines: cmd_rx,
            }),
            subscribers,
            stop,
            publisher: Mutex::new(Some(publisher)),
        })
    }

    /// Stop the publisher thread. Safe to call more than once.
    pub fn close(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.publisher.lock().take() {
            let _ = handle.join();
        }
    }

    /// Register a named subscriber queue with the publisher. The returned
    /// sender lets the owner inject its own control messages into the queue.
    pub fn subscribe(&self, name: &str) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().insert(name.to_owned(), tx.clone());
        (tx, rx)
    }

    pub fn unsubscribe(&self, name: &str) {
        self.subscribers.lock().remove(name);
    }

    /// コマンドを実行して応答行を集める
    ///
    /// Joins `tokens` with single spaces, writes the command (with the raw
    /// `payload` appended after a space when present, otherwise CRLF
    /// terminated) and collects response lines until one starts with a
    /// `wait_until` prefix. `ERXUDP` lines belong to the session manager
    /// and are skipped. A `FAIL ERxx` line maps to a typed command error.
    pub fn exec(
        &self,
        tokens: &[&str],
        wait_until: &[&str],
        timeout: Option<Duration>,
        payload: Option<&[u8]>,
    ) -> Result<Vec<String>> {
        let command = tokens.join(" ");
        let mut pipe = self.cmd.lock();

        // stale lines from a previous command
        while pipe.lines.try_recv().is_ok() {}

        match payload {
            Some(p) => {
                let mut data = command.clone().into_bytes();
                data.push(b' ');
                data.extend_from_slice(p);
                pipe.writer.write_bytes(&data)?;
            }
            None => pipe.writer.write_bytes(format!("{command}\r\n").as_bytes())?,
        }

        let mut res = Vec::new();
        loop {
            let line = match timeout {
                Some(t) => pipe.lines.recv_timeout(t).map_err(|e| match e {
                    mpsc::RecvTimeoutError::Timeout => Error::Timeout(command.clone()),
                    mpsc::RecvTimeoutError::Disconnected => publisher_gone(),
                })?,
                None => pipe.lines.recv().map_err(|_| publisher_gone())?,
            };

            if line.starts_with("ERXUDP") {
                continue;
            }
            if line.starts_with("FAIL") {
                let code = parser::fail_line(&line).map(|(_, code)| code).unwrap_or(0);
                return Err(SkCommandError::from_code(code, &command).into());
            }

            let matched = wait_until.iter().any(|w| line.starts_with(w));
            res.push(line);
            if matched {
                break;
            }
        }
        Ok(res)
    }

    pub fn skver(&self) -> Result<SkVer> {
        let res = self.exec(&["SKVER"], &["OK"], None, None)?;
        SkVer::from_lines(&res)
    }

    pub fn skappver(&self) -> Result<SkAppVer> {
        let res = self.exec(&["SKAPPVER"], &["OK"], None, None)?;
        SkAppVer::from_lines(&res)
    }

    pub fn skinfo(&self) -> Result<SkInfo> {
        let res = self.exec(&["SKINFO"], &["OK"], None, None)?;
        SkInfo::from_lines(&res)
    }

    pub fn skreset(&self) -> Result<()> {
        self.exec(&["SKRESET"], &["OK"], None, None).map(|_| ())
    }

    /// レジスタ書き込み(値は大文字16進、0xなし)
    pub fn sksreg(&self, reg: &str, val: &str) -> Result<()> {
        self.exec(&["SKSREG", reg, val], &["OK"], None, None)
            .map(|_| ())
    }

    pub fn sksetrbid(&self, rbid: &str) -> Result<()> {
        self.exec(&["SKSETRBID", rbid], &["OK"], None, None)
            .map(|_| ())
    }

    pub fn sksetpwd(&self, pwd: &str) -> Result<()> {
        self.exec(
            &["SKSETPWD", &format!("{:X}", pwd.len()), pwd],
            &["OK"],
            None,
            None,
        )
        .map(|_| ())
    }

    /// アクティブスキャンでPANを探す
    ///
    /// Estimated scan time is 0.0096 * (2^duration + 1) * 28 seconds, so
    /// roughly 18 s, 35 s and 69 s for the three attempts.
    pub fn skscan(&self) -> Result<ScanResult> {
        let mut duration = 6u32;
        for _ in 0..3 {
            tracing::debug!("trying to scan a PAN, duration {}", duration);
            let res = self.exec(
                &["SKSCAN", "2", "FFFFFFFF", &duration.to_string(), "0"],
                &["EVENT 22"],
                None,
                None,
            )?;
            if res.iter().any(|line| line.starts_with("EPANDESC")) {
                return ScanResult::from_lines(&res);
            }
            duration += 1;
        }
        Err(Error::ScanFailure)
    }

    /// MACアドレスをIPv6リンクローカルアドレスに変換する
    pub fn skll64(&self, mac_addr: u64) -> Result<Ipv6Addr> {
        let res = self.exec(
            &["SKLL64", &format!("{:016X}", mac_addr)],
            &["FE80:"],
            None,
            None,
        )?;
        response::ll64_from_lines(&res)
    }

    /// PANA認証を開始する
    pub fn skjoin(&self, addr: &Ipv6Addr) -> Result<()> {
        let addr = addr_to_skstack(addr);
        for _ in 0..3 {
            tracing::debug!("trying to establish a PANA session");
            let res = self.exec(&["SKJOIN", &addr], &["EVENT 24", "EVENT 25"], None, None)?;
            if res.last().is_some_and(|line| line.starts_with("EVENT 25")) {
                tracing::debug!("a PANA session has been established");
                return Ok(());
            }
        }
        Err(Error::JoinFailure)
    }

    /// PANAセッションを終了する
    pub fn skterm(&self) -> Result<()> {
        let res = self.exec(&["SKTERM"], &["EVENT 27", "EVENT 28"], None, None)?;
        if res.last().is_some_and(|line| line.starts_with("EVENT 28")) {
            tracing::warn!("there was no PANA session to terminate");
        }
        Ok(())
    }

    /// UDPデータグラムを送信する
    pub fn sksendto(&self, addr: &Ipv6Addr, port: u16, data: &[u8]) -> Result<()> {
        self.exec(
            &[
                "SKSENDTO",
                "1",
                &addr_to_skstack(addr),
                &format!("{:04X}", port),
                "2",
                "0",
                &format!("{:04X}", data.len()),
            ],
            &["OK"],
            None,
            Some(data),
        )
        .map(|_| ())
    }
}

impl Drop for SkLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// SKSTACKが期待する形のIPv6アドレス表記
pub fn addr_to_skstack(addr: &Ipv6Addr) -> String {
    addr.segments().map(|n| format!("{:04X}", n)).join(":")
}

fn publisher_gone() -> Error {
    Error::Transport(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "the line publisher has stopped",
    ))
}

fn publisher_loop(mut reader: Box<dyn LineReader>, subscribers: Subscribers, stop: Arc<AtomicBool>) {
    tracing::debug!("the line publisher has been started");
    while !stop.load(Ordering::Relaxed) {
        let line = match reader.read_line(PUBLISHER_POLL) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("serial read failed in the line publisher: {}", e);
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        let mut subs = subscribers.lock();
        let dead: Vec<String> = subs
            .iter()
            .filter(|(_, tx)| tx.send(line.clone()).is_err())
            .map(|(name, _)| name.clone())
            .collect();
        for name in dead {
            subs.remove(&name);
        }
    }
    tracing::debug!("the line publisher has been stopped");
}

// ROPT応答("OK 01")からUDPペイロード形式を読み取る。publisher起動前専用。
fn exec_ropt(reader: &mut dyn LineReader, writer: &mut dyn LineWriter) -> Result<u8> {
    writer.write_bytes(b"ROPT\r")?;
    let deadline = Instant::now() + MODE_EXCHANGE_TIMEOUT;
    while Instant::now() < deadline {
        let line = reader.read_line(Duration::from_secs(2))?;
        if let Ok((_, Some(n))) = parser::ok_line(&line) {
            return Ok(n);
        }
    }
    Err(Error::Timeout("ROPT".to_owned()))
}

// UDPペイロード形式を設定する。NVRAMへの書き込みなので乱用しないこと。
fn exec_wopt(reader: &mut dyn LineReader, writer: &mut dyn LineWriter, opt: u8) -> Result<()> {
    writer.write_bytes(format!("WOPT {:02}\r", opt).as_bytes())?;
    let deadline = Instant::now() + MODE_EXCHANGE_TIMEOUT;
    while Instant::now() < deadline {
        let line = reader.read_line(Duration::from_secs(2))?;
        if parser::ok_line(&line).is_ok() {
            return Ok(());
        }
    }
    Err(Error::Timeout(format!("WOPT {:02}", opt)))
}

#[cfg(test)]
use crate::serial::stub::StubPort;
#[cfg(test)]
use std::collections::VecDeque;

#[cfg(test)]
fn ascii_mode_responder(data: &[u8], replies: &mut VecDeque<String>) {
    if data.starts_with(b"ROPT") {
        replies.push_back("OK 01".to_owned());
    }
}

#[cfg(test)]
fn open_stub_link(port: &StubPort) -> SkLink {
    let (reader, writer) = port.split();
    SkLink::open(reader, writer).unwrap()
}

#[test]
fn test1() {
    // command responses terminate on the wait-until prefix
    let port = StubPort::new();
    port.set_responder(|data: &[u8], replies: &mut VecDeque<String>| {
        if data.starts_with(b"ROPT") {
            replies.push_back("OK 01".to_owned());
        } else if data.starts_with(b"SKVER") {
            replies.push_back("EVER 1.5.2".to_owned());
            replies.push_back("OK".to_owned());
        }
    });
    let link = open_stub_link(&port);
    assert_eq!(link.skver().unwrap().version, "1.5.2");
    link.close();
}

#[test]
fn test2() {
    // FAIL ER lines map to typed command errors; ERXUDP lines are skipped
    let port = StubPort::new();
    port.set_responder(|data: &[u8], replies: &mut VecDeque<String>| {
        if data.starts_with(b"ROPT") {
            replies.push_back("OK 01".to_owned());
        } else if data.starts_with(b"SKSREG") {
            replies.push_back(
                "ERXUDP FE80:0000:0000:0000:021D:1290:1234:5678 \
                 FE80:0000:0000:0000:021D:1290:8765:4321 \
                 0E1A 0E1A 001D129012345678 4B 1 0 0002 1081"
                    .to_owned(),
            );
            replies.push_back("FAIL ER04".to_owned());
        }
    });
    let link = open_stub_link(&port);
    match link.sksreg("SA2", "1") {
        Err(Error::Command(SkCommandError::Unsupported { command })) => {
            assert_eq!(command, "SKSREG SA2 1");
        }
        other => panic!("unexpected result: {:?}", other.err()),
    }
    link.close();
}

#[test]
fn test3() {
    // a command with an explicit timeout fails with Error::Timeout
    let port = StubPort::new();
    port.set_responder(ascii_mode_responder);
    let link = open_stub_link(&port);
    match link.exec(&["SKVER"], &["OK"], Some(Duration::from_millis(50)), None) {
        Err(Error::Timeout(command)) => assert_eq!(command, "SKVER"),
        other => panic!("unexpected result: {:?}", other.err()),
    }
    link.close();
}

#[test]
fn test4() {
    // WOPT runs only when the module is not already in ASCII mode
    let port = StubPort::new();
    port.set_responder(|data: &[u8], replies: &mut VecDeque<String>| {
        if data.starts_with(b"ROPT") {
            replies.push_back("OK 00".to_owned());
        } else if data.starts_with(b"WOPT") {
            replies.push_back("OK".to_owned());
        }
    });
    let link = open_stub_link(&port);
    link.close();
    let writes = port.writes();
    assert!(writes.iter().any(|w| w.starts_with(b"WOPT 01\r")));
}

#[test]
fn test5() {
    // the payload is written after a single space with no terminator
    let port = StubPort::new();
    port.set_responder(|data: &[u8], replies: &mut VecDeque<String>| {
        if data.starts_with(b"ROPT") {
            replies.push_back("OK 01".to_owned());
        } else if data.starts_with(b"SKSENDTO") {
            replies.push_back("OK".to_owned());
        }
    });
    let link = open_stub_link(&port);
    let addr: Ipv6Addr = "FE80:0000:0000:0000:021D:1290:1234:5678".parse().unwrap();
    link.sksendto(&addr, 0x0E1A, &[0x10, 0x81, 0x00, 0x01]).unwrap();
    link.close();

    let writes = port.writes();
    let sendto = writes
        .iter()
        .find(|w| w.starts_with(b"SKSENDTO"))
        .expect("no SKSENDTO write");
    let expected_prefix =
        b"SKSENDTO 1 FE80:0000:0000:0000:021D:1290:1234:5678 0E1A 2 0 0004 ".to_vec();
    assert!(sendto.starts_with(&expected_prefix));
    assert_eq!(&sendto[expected_prefix.len()..], &[0x10, 0x81, 0x00, 0x01]);
}

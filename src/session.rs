// PANAセッション管理
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use crate::config::MeterConfig;
use crate::echonetlite::UDP_PORT;
use crate::error::{Error, Result};
use crate::serial::{self, LineReader, LineWriter};
use crate::skstack::{ScanResult, SkLink};
use parking_lot::{Condvar, Mutex};
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SESSION_SUBSCRIBER: &str = "session";
const CLOSE_SENTINEL: &str = "__CLOSE__";
const XMIT_LOCK_TIMEOUT: Duration = Duration::from_secs(120);
const XMIT_LOCK_RETRIES: u32 = 30;
const XMIT_RETRY_PAUSE: Duration = Duration::from_secs(3);
const REJOIN_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// 送信ゲート
///
/// A binary semaphore with a restriction depth counter. The receiver task
/// restricts/unrestricts it on PANA events while the send path acquires it
/// per transmission, so the release may come from a different thread than
/// the acquire. The depth stays within 0..=2: the only overlapping causes
/// are lifetime-expiry-waiting-for-rejoin and the transmit rate limit.
pub(crate) struct XmitGate {
    state: Mutex<GateState>,
    unlocked: Condvar,
}

struct GateState {
    depth: i32,
    locked: bool,
}

impl XmitGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                depth: 0,
                locked: false,
            }),
            unlocked: Condvar::new(),
        }
    }

    /// The send path takes the gate for one transmission.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.locked {
            if self.unlocked.wait_until(&mut state, deadline).timed_out() && state.locked {
                return false;
            }
        }
        state.locked = true;
        true
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        state.locked = false;
        drop(state);
        self.unlocked.notify_all();
    }

    pub fn restrict(&self) {
        let mut state = self.state.lock();
        state.depth += 1;
        tracing::debug!(
            "the transmit restriction depth was incremented to {}",
            state.depth
        );
        assert!(
            state.depth <= 2,
            "the transmit restriction depth is inconsistent: greater than expected"
        );
        if state.depth == 1 {
            // waits for an in-flight transmission to finish
            while state.locked {
                self.unlocked.wait(&mut state);
            }
            state.locked = true;
            tracing::debug!("data transmission is being restricted");
        }
    }

    /// `force` zeroes the depth on close; releasing an already-released
    /// gate is fine.
    pub fn unrestrict(&self, force: bool) {
        let mut state = self.state.lock();
        if force {
            state.depth = 0;
            tracing::debug!("the transmit restriction depth was forcibly reset");
        } else {
            state.depth -= 1;
            tracing::debug!(
                "the transmit restriction depth was decremented to {}",
                state.depth
            );
        }
        assert!(
            state.depth >= 0,
            "the transmit restriction depth is inconsistent: less than expected"
        );
        if state.depth == 0 {
            state.locked = false;
            drop(state);
            self.unlocked.notify_all();
            tracing::debug!("data transmission is being unrestricted");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    #[cfg(test)]
    pub fn depth(&self) -> i32 {
        self.state.lock().depth
    }
}

/// PANAセッション
///
/// Owns the radio link, keeps the session alive across lifetime expiry and
/// rate limiting, and hands received `EVENT 21`/`EVENT 02`/`ERXUDP` lines
/// to the transaction layer.
pub struct SessionManager {
    link: Arc<SkLink>,
    scan: ScanResult,
    meter_addr: Ipv6Addr,
    established: Arc<AtomicBool>,
    gate: Arc<XmitGate>,
    rejoin_lock: Arc<Mutex<()>>,
    receiver_error: Arc<Mutex<Option<Error>>>,
    received: Mutex<mpsc::Receiver<String>>,
    event_tx: mpsc::Sender<String>,
    receiver: Option<JoinHandle<()>>,
    xmit_lock_timeout: Duration,
    closed: bool,
}

impl SessionManager {
    pub fn open(config: &MeterConfig) -> Result<Self> {
        let (reader, writer) = serial::open_port(&config.device, config.baudrate)?;
        Self::open_with_port(config, reader, writer)
    }

    /// Open a session over an already opened line transport.
    pub fn open_with_port(
        config: &MeterConfig,
        reader: Box<dyn LineReader>,
        writer: Box<dyn LineWriter>,
    ) -> Result<Self> {
        tracing::info!("opening a Route-B session");
        let link = SkLink::open(reader, writer)?;
        let (scan, meter_addr) = match Self::negotiate(&link, config) {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("could not open a Route-B session: {}", e);
                link.close();
                return Err(e);
            }
        };

        let link = Arc::new(link);
        let established = Arc::new(AtomicBool::new(true));
        let gate = Arc::new(XmitGate::new());
        let rejoin_lock = Arc::new(Mutex::new(()));
        let receiver_error = Arc::new(Mutex::new(None));
        let (event_tx, event_rx) = link.subscribe(SESSION_SUBSCRIBER);
        let (forward_tx, forward_rx) = mpsc::channel();

        let task = ReceiverTask {
            link: Arc::clone(&link),
            meter_addr,
            established: Arc::clone(&established),
            gate: Arc::clone(&gate),
            rejoin_lock: Arc::clone(&rejoin_lock),
            error: Arc::clone(&receiver_error),
            events: event_rx,
            forward: forward_tx,
        };
        let receiver = thread::Builder::new()
            .name("session-receiver".to_owned())
            .spawn(move || task.run())
            .map_err(Error::Transport)?;

        tracing::info!("the Route-B session is open");
        Ok(Self {
            link,
            scan,
            meter_addr,
            established,
            gate,
            rejoin_lock,
            receiver_error,
            received: Mutex::new(forward_rx),
            event_tx,
            receiver: Some(receiver),
            xmit_lock_timeout: XMIT_LOCK_TIMEOUT,
            closed: false,
        })
    }

    // スキャンからPANA認証まで
    fn negotiate(link: &SkLink, config: &MeterConfig) -> Result<(ScanResult, Ipv6Addr)> {
        if config.reset_device {
            link.skreset()?;
        }
        // to report the LQI of received packets
        link.sksreg("SA2", "1")?;
        link.sksetrbid(config.route_b_id.as_str())?;
        link.sksetpwd(config.route_b_password.as_str())?;
        tracing::info!("the Route-B ID and the password were registered");

        tracing::info!("scanning PAN channels");
        let scan = link.skscan().inspect_err(|_| {
            tracing::error!(
                "gave up finding a PAN; check the device location and the Route-B ID, then try again"
            );
        })?;
        tracing::info!(
            "a PAN was found: channel 0x{:02X}, PAN id 0x{:04X}, LQI {}",
            scan.channel,
            scan.pan_id,
            scan.lqi
        );

        let meter_addr = link.skll64(scan.mac_addr)?;
        link.sksreg("S2", &format!("{:X}", scan.channel))?;
        link.sksreg("S3", &format!("{:04X}", scan.pan_id))?;

        tracing::info!("joining the PAN");
        link.skjoin(&meter_addr).inspect_err(|_| {
            tracing::error!(
                "gave up establishing a PANA session; check the Route-B ID and password, then try again"
            );
        })?;
        tracing::info!("a PANA session has been established");
        Ok((scan, meter_addr))
    }

    pub fn meter_addr(&self) -> &Ipv6Addr {
        &self.meter_addr
    }

    pub fn scan_result(&self) -> &ScanResult {
        &self.scan
    }

    /// UDPペイロードをスマートメーターへ送信する
    ///
    /// Blocks while the transmit gate is restricted; surfaces a fatal
    /// receiver error as `NeedToReopen`.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        for _ in 0..3 {
            let mut acquired = false;
            for _ in 0..XMIT_LOCK_RETRIES {
                if self.gate.acquire_timeout(self.xmit_lock_timeout) {
                    acquired = true;
                    break;
                }
                tracing::warn!("could not acquire the transmit gate");
                if let Some(e) = self.receiver_error.lock().as_ref() {
                    tracing::error!("got an error from the receiver task: {}", e);
                    return Err(Error::NeedToReopen(format!(
                        "got an error from the receiver task: {e}"
                    )));
                }
            }
            if !acquired {
                return Err(Error::NeedToReopen(
                    "transmission rights could not be acquired".to_owned(),
                ));
            }

            assert!(
                self.established.load(Ordering::SeqCst),
                "tried to transmit a packet, but no PANA session was established"
            );

            let result = self.link.sksendto(&self.meter_addr, UDP_PORT, data);
            self.gate.release();
            match result {
                Ok(()) => return Ok(()),
                Err(e @ Error::Command(_)) => {
                    tracing::warn!("failed to transmit a packet: {}", e);
                }
                Err(e) => {
                    tracing::warn!("an error occurred while transmitting a packet: {}", e);
                }
            }
            thread::sleep(XMIT_RETRY_PAUSE);
        }
        Err(Error::NeedToReopen("could not transmit a packet".to_owned()))
    }

    /// 受信キューから1行取り出す(タイムアウトでNone)
    pub fn pop_received(&self, timeout: Duration) -> Option<String> {
        match self.received.lock().recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            // a dead receiver surfaces at the next send
            Err(mpsc::RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn drain_received(&self) {
        let received = self.received.lock();
        while received.try_recv().is_ok() {}
    }

    /// セッションを閉じる。何度呼んでもよい。
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::info!("closing the Route-B session");

        let guard = self.rejoin_lock.try_lock_for(REJOIN_LOCK_TIMEOUT);
        if guard.is_none() {
            tracing::warn!("failed to acquire the rejoin lock");
        }
        if self.established.swap(false, Ordering::SeqCst) {
            tracing::info!("terminating the PANA session");
            if let Err(e) = self.link.skterm() {
                tracing::warn!("failed to terminate the PANA session: {}", e);
            }
        }
        drop(guard);

        if let Some(receiver) = self.receiver.take() {
            let _ = self.event_tx.send(CLOSE_SENTINEL.to_owned());
            let _ = receiver.join();
        }
        self.link.unsubscribe(SESSION_SUBSCRIBER);
        self.gate.unrestrict(true);

        assert!(!self.gate.is_locked(), "the transmit gate is unexpectedly held");
        assert!(
            !self.rejoin_lock.is_locked(),
            "the rejoin lock is unexpectedly held"
        );

        self.link.close();
        tracing::info!("the Route-B session is closed");
    }

    #[cfg(test)]
    pub(crate) fn gate(&self) -> &XmitGate {
        &self.gate
    }

    #[cfg(test)]
    pub(crate) fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn receiver_error_message(&self) -> Option<String> {
        self.receiver_error.lock().as_ref().map(|e| e.to_string())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close();
    }
}

// 受信イベントをセッション状態遷移に変換するタスク
struct ReceiverTask {
    link: Arc<SkLink>,
    meter_addr: Ipv6Addr,
    established: Arc<AtomicBool>,
    gate: Arc<XmitGate>,
    rejoin_lock: Arc<Mutex<()>>,
    error: Arc<Mutex<Option<Error>>>,
    events: mpsc::Receiver<String>,
    forward: mpsc::Sender<String>,
}

impl ReceiverTask {
    fn run(self) {
        tracing::debug!("the session receiver has been started");
        loop {
            let Ok(line) = self.events.recv() else {
                break; // the publisher is gone
            };
            if line == CLOSE_SENTINEL {
                break;
            }

            if line.starts_with("EVENT 29") {
                tracing::debug!("the PANA session lifetime has expired");
                self.gate.restrict();
            } else if line.starts_with("EVENT 24") {
                tracing::warn!("could not rejoin the PAN");
                if !self.rejoin() {
                    break;
                }
            } else if line.starts_with("EVENT 25") {
                tracing::debug!("successfully rejoined the PAN");
                self.established.store(true, Ordering::SeqCst);
                self.gate.unrestrict(false);
            } else if line.starts_with("EVENT 32") {
                tracing::warn!("the transmission rate limit has been engaged");
                self.gate.restrict();
            } else if line.starts_with("EVENT 33") {
                tracing::debug!("the transmission rate limit has been released");
                self.gate.unrestrict(false);
            } else if line.starts_with("EVENT 27") {
                self.gate.restrict();
                tracing::debug!("the PANA session has been closed successfully");
            } else if line.starts_with("EVENT 28") {
                self.gate.restrict();
                tracing::warn!("there was no PANA session to close");
            } else if line.starts_with("EVENT 21")
                || line.starts_with("EVENT 02")
                || line.starts_with("ERXUDP")
            {
                let _ = self.forward.send(line);
            }
            // everything else is a command response and is dropped here
        }
        tracing::debug!("the session receiver has been stopped");
    }

    // true to keep running, false on a fatal rejoin failure
    fn rejoin(&self) -> bool {
        let _guard = self.rejoin_lock.lock();
        if !self.established.swap(false, Ordering::SeqCst) {
            return true; // another path is already handling the session
        }
        match self.link.skjoin(&self.meter_addr) {
            Ok(()) => true, // the module emits EVENT 25, handled above
            Err(e) => {
                tracing::error!("{}; close the session and open it again", e);
                *self.error.lock() = Some(e);
                false
            }
        }
    }
}

#[test]
fn test1() {
    // EVENT 29 then EVENT 25: depth 1 and held, then 0 and free
    let gate = XmitGate::new();
    gate.restrict();
    assert_eq!(gate.depth(), 1);
    assert!(gate.is_locked());
    gate.unrestrict(false);
    assert_eq!(gate.depth(), 0);
    assert!(!gate.is_locked());
}

#[test]
fn test2() {
    // overlapping causes accumulate to 2; the gate opens on the last release
    let gate = XmitGate::new();
    gate.restrict();
    gate.restrict();
    assert_eq!(gate.depth(), 2);
    assert!(gate.is_locked());
    gate.unrestrict(false);
    assert_eq!(gate.depth(), 1);
    assert!(gate.is_locked());
    gate.unrestrict(false);
    assert!(!gate.is_locked());
}

#[test]
fn test3() {
    // close() forces the depth to zero whatever it was
    let gate = XmitGate::new();
    gate.restrict();
    gate.restrict();
    gate.unrestrict(true);
    assert_eq!(gate.depth(), 0);
    assert!(!gate.is_locked());
    // forcing an already open gate is fine
    gate.unrestrict(true);
    assert!(!gate.is_locked());
}

#[test]
#[should_panic(expected = "less than expected")]
fn test4() {
    let gate = XmitGate::new();
    gate.unrestrict(false);
}

#[test]
#[should_panic(expected = "greater than expected")]
fn test5() {
    let gate = XmitGate::new();
    gate.restrict();
    gate.restrict();
    gate.restrict();
}

#[test]
fn test6() {
    // a sender blocks while restricted and proceeds once released
    let gate = std::sync::Arc::new(XmitGate::new());
    gate.restrict();
    assert!(!gate.acquire_timeout(Duration::from_millis(50)));

    let shared = std::sync::Arc::clone(&gate);
    let waiter = thread::spawn(move || {
        let acquired = shared.acquire_timeout(Duration::from_secs(5));
        if acquired {
            shared.release();
        }
        acquired
    });
    thread::sleep(Duration::from_millis(50));
    gate.unrestrict(false);
    assert!(waiter.join().unwrap());
}

#[cfg(test)]
pub(crate) mod session_stub {
    use crate::serial::stub::StubPort;
    use std::collections::VecDeque;

    pub const METER_ADDR: &str = "FE80:0000:0000:0000:021D:1290:1234:5678";

    /// Replies that carry a stubbed module through reset, scan and join.
    pub fn negotiation_replies(data: &[u8], replies: &mut VecDeque<String>) -> bool {
        let push = |replies: &mut VecDeque<String>, lines: &[&str]| {
            for line in lines {
                replies.push_back((*line).to_owned());
            }
        };
        if data.starts_with(b"ROPT") {
            push(replies, &["OK 01"]);
        } else if data.starts_with(b"SKRESET")
            || data.starts_with(b"SKSREG")
            || data.starts_with(b"SKSETRBID")
            || data.starts_with(b"SKSETPWD")
        {
            push(replies, &["OK"]);
        } else if data.starts_with(b"SKSCAN") {
            push(
                replies,
                &[
                    "OK",
                    "EPANDESC",
                    "  Channel:21",
                    "  Channel Page:09",
                    "  Pan ID:8888",
                    "  Addr:001D129012345678",
                    "  LQI:54",
                    "  Side:0",
                    "  PairID:01234567",
                ],
            );
            replies.push_back(format!("EVENT 22 {} 0", METER_ADDR));
        } else if data.starts_with(b"SKLL64") {
            push(replies, &[METER_ADDR]);
        } else if data.starts_with(b"SKJOIN") {
            push(replies, &["OK"]);
            replies.push_back(format!("EVENT 25 {} 0", METER_ADDR));
        } else if data.starts_with(b"SKTERM") {
            push(replies, &["OK"]);
            replies.push_back(format!("EVENT 27 {} 0", METER_ADDR));
        } else {
            return false;
        }
        true
    }

    pub fn stub_config() -> crate::config::MeterConfig {
        let mut config = crate::config::MeterConfig::new(
            "00112233445566778899AABBCCDDEEFF".parse().unwrap(),
            "0123456789AB".parse().unwrap(),
            "stub".to_owned(),
        );
        config.recv_timeout = std::time::Duration::from_millis(200);
        config.internal_xmit_interval = std::time::Duration::from_millis(10);
        config
    }

    pub fn open_negotiated(port: &StubPort) -> crate::session::SessionManager {
        port.set_responder(|data: &[u8], replies: &mut VecDeque<String>| {
            negotiation_replies(data, replies);
        });
        let (reader, writer) = port.split();
        crate::session::SessionManager::open_with_port(&stub_config(), reader, writer).unwrap()
    }
}

#[cfg(test)]
use std::collections::VecDeque;

#[cfg(test)]
fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test7() {
    // lifetime expiry restricts the gate, the rejoin event releases it
    let port = crate::serial::stub::StubPort::new();
    let mut session = session_stub::open_negotiated(&port);
    assert!(session.is_established());
    assert!(!session.gate().is_locked());

    port.inject_line(&format!("EVENT 29 {} 0", session_stub::METER_ADDR));
    wait_until("the gate to be restricted", || session.gate().is_locked());

    port.inject_line(&format!("EVENT 25 {} 0", session_stub::METER_ADDR));
    wait_until("the gate to be released", || !session.gate().is_locked());
    assert!(session.is_established());
    session.close();
}

#[test]
fn test8() {
    // the rate limit engages and releases the gate
    let port = crate::serial::stub::StubPort::new();
    let mut session = session_stub::open_negotiated(&port);

    port.inject_line(&format!("EVENT 32 {} 0", session_stub::METER_ADDR));
    wait_until("the gate to be restricted", || session.gate().is_locked());
    port.inject_line(&format!("EVENT 33 {} 0", session_stub::METER_ADDR));
    wait_until("the gate to be released", || !session.gate().is_locked());
    session.close();
}

#[test]
fn test9() {
    // a restriction outstanding at close still ends depth 0, gate free:
    // the clean SKTERM shutdown adds its own EVENT 27 restriction on top
    let port = crate::serial::stub::StubPort::new();
    let mut session = session_stub::open_negotiated(&port);

    port.inject_line(&format!("EVENT 29 {} 0", session_stub::METER_ADDR));
    wait_until("the restriction to land", || session.gate().depth() == 1);
    session.close();
    assert_eq!(session.gate().depth(), 0);
    assert!(!session.gate().is_locked());
}

#[test]
fn test10() {
    // a failed automatic rejoin records the fatal error for the send path
    let port = crate::serial::stub::StubPort::new();
    // join succeeds during open, then fails on every rejoin attempt
    let join_fails = std::sync::Arc::new(AtomicBool::new(false));
    {
        let join_fails = std::sync::Arc::clone(&join_fails);
        port.set_responder(move |data: &[u8], replies: &mut VecDeque<String>| {
            if data.starts_with(b"SKJOIN") && join_fails.load(Ordering::SeqCst) {
                replies.push_back("OK".to_owned());
                replies.push_back(format!("EVENT 24 {} 0", session_stub::METER_ADDR));
            } else {
                session_stub::negotiation_replies(data, replies);
            }
        });
    }
    let (reader, writer) = port.split();
    let mut session =
        SessionManager::open_with_port(&session_stub::stub_config(), reader, writer).unwrap();
    join_fails.store(true, Ordering::SeqCst);

    port.inject_line(&format!("EVENT 29 {} 0", session_stub::METER_ADDR));
    port.inject_line(&format!("EVENT 24 {} 0", session_stub::METER_ADDR));
    wait_until("the receiver to record the failure", || {
        session.receiver_error_message().is_some()
    });
    assert!(!session.is_established());

    // the gate stays restricted; a sender that cannot acquire it surfaces the error
    session.xmit_lock_timeout = Duration::from_millis(50);
    match session.send(&[0x10, 0x81]) {
        Err(Error::NeedToReopen(_)) => {}
        other => panic!("unexpected send result: {:?}", other.err()),
    }
    session.close();
}

#[test]
fn test11() {
    // EVENT 21, EVENT 02 and ERXUDP lines are forwarded to the receive queue
    let port = crate::serial::stub::StubPort::new();
    let mut session = session_stub::open_negotiated(&port);

    port.inject_line(&format!("EVENT 21 {} 0 00", session_stub::METER_ADDR));
    port.inject_line(&format!("EVENT 02 {} 0", session_stub::METER_ADDR));
    port.inject_line("SKVER"); // a command response must not be forwarded
    let first = session.pop_received(Duration::from_secs(1)).unwrap();
    assert!(first.starts_with("EVENT 21"));
    let second = session.pop_received(Duration::from_secs(1)).unwrap();
    assert!(second.starts_with("EVENT 02"));
    assert!(session.pop_received(Duration::from_millis(100)).is_none());
    session.close();
}

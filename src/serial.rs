// シリアルポート / line-oriented serial port access
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2026 The denkimeter authors
//
use serialport::{DataBits, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Pulls `\r`-terminated lines off the wire, one at a time.
///
/// The terminator is stripped; a timeout yields an empty string. `\n` bytes
/// are discarded altogether so both `...\r\n` response lines and the
/// bare-`\r` `ROPT`/`WOPT` replies terminate a line.
pub trait LineReader: Send {
    fn read_line(&mut self, timeout: Duration) -> io::Result<String>;

    /// Discard pending input until the line stays idle for `idle_timeout`.
    fn drain(&mut self, idle_timeout: Duration) -> io::Result<()>;
}

/// Writes raw bytes to the wire and flushes them.
pub trait LineWriter: Send {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()>;
}

/// シリアルポートを開く
///
/// The reader and writer are two handles onto the same port so the
/// publisher thread can read while a command is being written.
pub fn open_port(dev: &str, baudrate: u32) -> io::Result<(Box<dyn LineReader>, Box<dyn LineWriter>)> {
    let port = serialport::new(dev, baudrate)
        .stop_bits(StopBits::One)
        .data_bits(DataBits::Eight)
        .timeout(Duration::from_secs(1))
        .open()
        .map_err(io::Error::from)?;
    let reader = port.try_clone().map_err(io::Error::from)?;
    Ok((
        Box::new(SerialLineReader {
            port: reader,
            buf: Vec::new(),
        }),
        Box::new(SerialLineWriter { port }),
    ))
}

pub struct SerialLineReader {
    port: Box<dyn SerialPort>,
    buf: Vec<u8>,
}

impl LineReader for SerialLineReader {
    fn read_line(&mut self, timeout: Duration) -> io::Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\r') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop(); // the '\r' terminator
                let line = String::from_utf8_lossy(&line).into_owned();
                if !line.is_empty() {
                    tracing::trace!(target: "<-Rx", "{}", line.escape_debug());
                }
                return Ok(line);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(String::new());
            }
            self.port.set_timeout(deadline - now).map_err(io::Error::from)?;
            let mut chunk = [0u8; 256];
            match self.port.read(&mut chunk) {
                Ok(0) => return Ok(String::new()),
                Ok(n) => self
                    .buf
                    .extend(chunk[..n].iter().filter(|&&b| b != b'\n')),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(String::new()),
                Err(e) => return Err(e),
            }
        }
    }

    fn drain(&mut self, idle_timeout: Duration) -> io::Result<()> {
        self.buf.clear();
        self.port.set_timeout(idle_timeout).map_err(io::Error::from)?;
        let mut chunk = [0u8; 256];
        loop {
            match self.port.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct SerialLineWriter {
    port: Box<dyn SerialPort>,
}

impl LineWriter for SerialLineWriter {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        let s = data
            .iter()
            .map(|n| *n as char)
            .filter(|n| n.is_ascii())
            .collect::<String>();
        tracing::trace!(target: "Tx->", "{}", s.escape_debug());
        self.port.write_all(data)?;
        self.port.flush()
    }
}

// 試験用の台本付きポート
#[cfg(test)]
pub(crate) mod stub {
    use super::{LineReader, LineWriter};
    use parking_lot::{Condvar, Mutex};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    type Responder = Box<dyn FnMut(&[u8], &mut VecDeque<String>) + Send>;

    struct State {
        lines: VecDeque<String>,
        writes: Vec<Vec<u8>>,
        responder: Option<Responder>,
    }

    /// An in-memory port: every write is recorded and handed to a
    /// responder which may queue reply lines for the reader side.
    #[derive(Clone)]
    pub struct StubPort {
        state: Arc<Mutex<State>>,
        wakeup: Arc<Condvar>,
    }

    impl StubPort {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(State {
                    lines: VecDeque::new(),
                    writes: Vec::new(),
                    responder: None,
                })),
                wakeup: Arc::new(Condvar::new()),
            }
        }

        pub fn set_responder(
            &self,
            responder: impl FnMut(&[u8], &mut VecDeque<String>) + Send + 'static,
        ) {
            self.state.lock().responder = Some(Box::new(responder));
        }

        /// Queue an unsolicited line, as the radio module would emit it.
        pub fn inject_line(&self, line: &str) {
            self.state.lock().lines.push_back(line.to_owned());
            self.wakeup.notify_all();
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.state.lock().writes.clone()
        }

        pub fn split(&self) -> (Box<dyn LineReader>, Box<dyn LineWriter>) {
            (
                Box::new(StubReader(self.clone())),
                Box::new(StubWriter(self.clone())),
            )
        }
    }

    struct StubReader(StubPort);

    impl LineReader for StubReader {
        fn read_line(&mut self, timeout: Duration) -> io::Result<String> {
            let deadline = Instant::now() + timeout;
            let mut state = self.0.state.lock();
            loop {
                if let Some(line) = state.lines.pop_front() {
                    return Ok(line);
                }
                if self.0.wakeup.wait_until(&mut state, deadline).timed_out() {
                    return Ok(String::new());
                }
            }
        }

        fn drain(&mut self, _idle_timeout: Duration) -> io::Result<()> {
            self.0.state.lock().lines.clear();
            Ok(())
        }
    }

    struct StubWriter(StubPort);

    impl LineWriter for StubWriter {
        fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
            let mut state = self.0.state.lock();
            state.writes.push(data.to_vec());
            if let Some(mut responder) = state.responder.take() {
                let mut replies = VecDeque::new();
                responder(data, &mut replies);
                state.lines.append(&mut replies);
                state.responder = Some(responder);
            }
            self.0.wakeup.notify_all();
            Ok(())
        }
    }
}

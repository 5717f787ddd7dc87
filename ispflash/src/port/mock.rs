//! Scripted in-memory transports for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::{ControlChannel, Port};

#[derive(Debug)]
pub(crate) struct MockState {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub open: bool,
    /// Reads answered with a timeout before `rx` is served.
    pub silent_reads: usize,
    /// Byte repeated forever once `rx` runs dry, like a chatty line.
    pub noise: Option<u8>,
    pub timeout: Duration,
    pub dtr: bool,
    pub rts: bool,
}

/// Serial port double: reads come from a preloaded queue, writes are logged.
///
/// Clones share state, so a test can keep a handle after moving the port
/// into a link.
#[derive(Debug, Clone)]
pub(crate) struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::with_rx(&[])
    }

    pub fn with_rx(rx: &[u8]) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                rx: rx.iter().copied().collect(),
                tx: Vec::new(),
                open: true,
                silent_reads: 0,
                noise: None,
                timeout: Duration::from_millis(100),
                dtr: false,
                rts: false,
            })),
        }
    }

    pub fn push_rx(&self, bytes: &[u8]) {
        self.state.lock().unwrap().rx.extend(bytes.iter().copied());
    }

    pub fn set_silent_reads(&self, count: usize) {
        self.state.lock().unwrap().silent_reads = count;
    }

    pub fn set_noise(&self, byte: u8) {
        self.state.lock().unwrap().noise = Some(byte);
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().tx.clone()
    }

    pub fn clear_written(&self) {
        self.state.lock().unwrap().tx.clear();
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        if state.silent_reads > 0 {
            state.silent_reads -= 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        if state.rx.is_empty() {
            if let Some(byte) = state.noise {
                buf.fill(byte);
                return Ok(buf.len());
            }
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for b in buf.iter_mut().take(n) {
            *b = state.rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        state.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.state.lock().unwrap().timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.state.lock().unwrap().timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.state.lock().unwrap().dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.state.lock().unwrap().rts = level;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn close(&mut self) {
        self.state.lock().unwrap().open = false;
    }
}

#[derive(Debug)]
pub(crate) struct ChannelState {
    pub responses: VecDeque<Vec<u8>>,
    pub requests: Vec<Vec<u8>>,
    pub open: bool,
}

/// USB control channel double: responses are served in order, requests logged.
#[derive(Debug, Clone)]
pub(crate) struct MockChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                responses: VecDeque::new(),
                requests: Vec::new(),
                open: true,
            })),
        }
    }

    pub fn push_response(&self, response: Vec<u8>) {
        self.state.lock().unwrap().responses.push_back(response);
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl ControlChannel for MockChannel {
    fn write_request(&mut self, request: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(Error::Io(io::Error::new(io::ErrorKind::NotConnected, "closed")));
        }
        state.requests.push(request.to_vec());
        Ok(())
    }

    fn read_response(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        match state.responses.pop_front() {
            Some(mut response) => {
                response.truncate(max_len);
                Ok(response)
            },
            None => Err(Error::Timeout("no response".into())),
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn close(&mut self) {
        self.state.lock().unwrap().open = false;
    }

    fn name(&self) -> &str {
        "mock-usb"
    }
}

///! Line framing for a raw telnet byte stream.
///!
///! Cluster nodes speak telnet, so the stream may carry IAC option negotiation
///! between (or inside) text lines. [`LineBuffer`] strips those sequences,
///! splits on LF with any trailing CR removed, and decodes lossily so a stray
///! Latin-1 byte never costs us a whole line.

use regex::Regex;
use std::sync::LazyLock;

const IAC: u8 = 255;
const SB: u8 = 250;
const SE: u8 = 240;
const WILL: u8 = 251;
const DONT: u8 = 254;

/// Longest unterminated line we keep before flushing it as-is
const MAX_LINE_BYTES: usize = 8 * 1024;

static LOGIN_PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(login|call|callsign)\s*:\s*$").expect("login prompt regex is valid")
});

/// Does this text end with a login prompt?
pub fn is_login_prompt(text: &str) -> bool {
    LOGIN_PROMPT_RE.is_match(text.trim_end_matches(['\r', '\n']))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TelnetState {
    #[default]
    Data,
    Iac,
    /// WILL/WONT/DO/DONT, waiting for the option byte
    Option,
    Subnegotiation,
    SubnegotiationIac,
}

#[derive(Debug, Default)]
pub struct LineBuffer {
    state: TelnetState,
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the socket.
    pub fn push(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            self.state = match (self.state, byte) {
                (TelnetState::Data, IAC) => TelnetState::Iac,
                (TelnetState::Data, b) => {
                    self.pending.push(b);
                    TelnetState::Data
                }
                // Escaped 0xFF is a data byte
                (TelnetState::Iac, IAC) => {
                    self.pending.push(IAC);
                    TelnetState::Data
                }
                (TelnetState::Iac, SB) => TelnetState::Subnegotiation,
                (TelnetState::Iac, WILL..=DONT) => TelnetState::Option,
                (TelnetState::Iac, _) => TelnetState::Data,
                (TelnetState::Option, _) => TelnetState::Data,
                (TelnetState::Subnegotiation, IAC) => TelnetState::SubnegotiationIac,
                (TelnetState::Subnegotiation, _) => TelnetState::Subnegotiation,
                (TelnetState::SubnegotiationIac, SE) => TelnetState::Data,
                (TelnetState::SubnegotiationIac, _) => TelnetState::Subnegotiation,
            };
        }
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        match self.pending.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                while line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some(String::from_utf8_lossy(&line).into_owned())
            }
            None if self.pending.len() > MAX_LINE_BYTES => {
                let line: Vec<u8> = self.pending.drain(..).collect();
                Some(String::from_utf8_lossy(&line).into_owned())
            }
            None => None,
        }
    }

    pub fn has_line(&self) -> bool {
        self.pending.contains(&b'\n')
    }

    /// Bytes received after the last line terminator, e.g. a prompt.
    pub fn partial(&self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.state = TelnetState::Data;
    }
}

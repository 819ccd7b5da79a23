// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Pattern-driven console sessions over TCP serial servers or spawned connection commands.
// Author: Lukas Bower
#![forbid(unsafe_code)]

//! Console access for devices under test.
//!
//! [`ExpectConsole`] reads on a dedicated thread that feeds an `mpsc`
//! channel; every [`Console::expect`] waits with `recv_timeout` on the
//! remaining budget so no wait outlives its bound.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use regex::Regex;
use thiserror::Error;

use crate::config::ConsoleConfig;
use crate::error::{BootError, Phase};

const READ_CHUNK: usize = 4096;
const MAX_BUFFER: usize = 1 << 20;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while talking to a console.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// None of the patterns appeared within the bound.
    #[error("timed out after {waited:?} waiting for {patterns}")]
    Timeout {
        /// Time spent waiting.
        waited: Duration,
        /// Patterns that were awaited, joined with `|`.
        patterns: String,
    },
    /// The remote end closed the console.
    #[error("console closed")]
    Closed,
    /// Reading or writing the console failed.
    #[error("console i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Result of a successful [`Console::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleMatch {
    /// Index of the pattern that matched.
    pub index: usize,
    /// Output consumed before the match.
    pub before: String,
    /// Matched text.
    pub matched: String,
}

/// Device output captured during a session.
#[derive(Debug, Default)]
pub struct Transcript {
    lines: Vec<String>,
    partial: String,
    sink: Option<BufWriter<File>>,
}

impl Transcript {
    /// Create an in-memory transcript.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transcript mirrored to `path`.
    pub fn to_file(path: &Path) -> io::Result<Self> {
        let mut sink = BufWriter::new(File::create(path)?);
        writeln!(
            sink,
            "# devboot console transcript started {}",
            chrono::Utc::now().to_rfc3339()
        )?;
        sink.flush()?;
        Ok(Self {
            sink: Some(sink),
            ..Self::default()
        })
    }

    /// Append raw console output.
    pub fn record(&mut self, chunk: &str) {
        for piece in chunk.split_inclusive('\n') {
            match piece.strip_suffix('\n') {
                Some(line) => {
                    self.partial.push_str(line);
                    let line = std::mem::take(&mut self.partial);
                    self.lines.push(line.trim_end_matches('\r').to_owned());
                }
                None => self.partial.push_str(piece),
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.write_all(chunk.as_bytes()).and_then(|()| sink.flush()) {
                warn!("console transcript mirror failed, disabling it: {err}");
                self.sink = None;
            }
        }
    }

    /// Completed output lines.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Entire transcript, including an unterminated last line.
    #[must_use]
    pub fn text(&self) -> String {
        let mut text = self.lines.join("\n");
        if !self.partial.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&self.partial);
        }
        text
    }
}

/// Line-oriented, pattern-driven device console.
pub trait Console {
    /// Write raw text.
    fn send(&mut self, text: &str) -> Result<(), ConsoleError>;

    /// Write `line` followed by a newline.
    fn send_line(&mut self, line: &str) -> Result<(), ConsoleError> {
        self.send(&format!("{line}\n"))
    }

    /// Write `Ctrl-<letter>`.
    fn send_control(&mut self, letter: char) -> Result<(), ConsoleError> {
        let byte = (letter.to_ascii_uppercase() as u8) & 0x1f;
        self.send(&char::from(byte).to_string())
    }

    /// Wait until one of `patterns` appears, consuming output up to the match.
    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<ConsoleMatch, ConsoleError>;

    /// Output captured so far.
    fn transcript(&self) -> &Transcript;
}

impl<C: Console + ?Sized> Console for Box<C> {
    fn send(&mut self, text: &str) -> Result<(), ConsoleError> {
        (**self).send(text)
    }

    fn send_line(&mut self, line: &str) -> Result<(), ConsoleError> {
        (**self).send_line(line)
    }

    fn send_control(&mut self, letter: char) -> Result<(), ConsoleError> {
        (**self).send_control(letter)
    }

    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<ConsoleMatch, ConsoleError> {
        (**self).expect(patterns, timeout)
    }

    fn transcript(&self) -> &Transcript {
        (**self).transcript()
    }
}

/// Earliest match of any pattern in `buffer`; ties go to the lower index.
#[must_use]
pub fn find_earliest<'h>(buffer: &'h str, patterns: &[Regex]) -> Option<(usize, regex::Match<'h>)> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(index, pattern)| pattern.find(buffer).map(|found| (index, found)))
        .min_by_key(|(index, found)| (found.start(), *index))
}

fn describe(patterns: &[Regex]) -> String {
    patterns
        .iter()
        .map(Regex::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

type Chunk = io::Result<Vec<u8>>;

/// Console backed by any reader/writer pair.
pub struct ExpectConsole {
    writer: Box<dyn Write + Send>,
    rx: Receiver<Chunk>,
    buffer: String,
    pending: Vec<u8>,
    closed: bool,
    char_delay: Option<Duration>,
    transcript: Transcript,
    child: Option<Child>,
    socket: Option<TcpStream>,
}

impl ExpectConsole {
    /// Drive a console over `reader`/`writer`, reading on a background thread.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Chunk>();
        thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) => {}
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }
        });
        Self {
            writer: Box::new(writer),
            rx,
            buffer: String::new(),
            pending: Vec::new(),
            closed: false,
            char_delay: None,
            transcript: Transcript::new(),
            child: None,
            socket: None,
        }
    }

    /// Connect to a network serial server at `host:port`.
    pub fn connect_tcp(address: &str) -> io::Result<Self> {
        let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address resolved for {address}"))
        })?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let socket = stream.try_clone()?;
        debug!("console connected to {addr}");
        let mut console = Self::new(reader, stream);
        console.socket = Some(socket);
        Ok(console)
    }

    /// Run `command` through `sh -c` and use its stdio as the console.
    pub fn spawn(command: &str) -> io::Result<Self> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "console stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "console stdout unavailable"))?;
        debug!("console spawned `{command}` as pid {}", child.id());
        let mut console = Self::new(stdout, stdin);
        console.child = Some(child);
        Ok(console)
    }

    /// Open the console described by `config`.
    pub fn open(config: &ConsoleConfig) -> Result<Self, BootError> {
        let console = match (&config.tcp, &config.connection_command) {
            (Some(address), None) => Self::connect_tcp(address).map_err(|err| {
                BootError::operation(
                    Phase::EnterBootloader,
                    format!("connect console {address}: {err}"),
                )
            })?,
            (None, Some(command)) => Self::spawn(command).map_err(|err| {
                BootError::operation(
                    Phase::EnterBootloader,
                    format!("spawn console `{command}`: {err}"),
                )
            })?,
            (Some(_), Some(_)) => {
                return Err(BootError::Config(
                    "console sets both tcp and connection_command".to_owned(),
                ))
            }
            (None, None) => {
                return Err(BootError::Config(
                    "console needs either tcp or connection_command".to_owned(),
                ))
            }
        };
        let console = if config.send_char {
            console.with_char_delay(Duration::from_millis(config.send_char_delay_ms))
        } else {
            console
        };
        match &config.transcript_path {
            Some(path) => {
                let transcript = Transcript::to_file(path).map_err(|err| {
                    BootError::Config(format!("cannot write transcript {}: {err}", path.display()))
                })?;
                Ok(console.with_transcript(transcript))
            }
            None => Ok(console),
        }
    }

    /// Write one character at a time, pausing `delay` between characters.
    #[must_use]
    pub fn with_char_delay(mut self, delay: Duration) -> Self {
        self.char_delay = Some(delay);
        self
    }

    /// Replace the transcript sink.
    #[must_use]
    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = transcript;
        self
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let (valid, rest) = self.pending.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            let remainder = rest[len..].to_vec();
                            self.pending = remainder;
                        }
                        None => {
                            let remainder = rest.to_vec();
                            self.pending = remainder;
                            break;
                        }
                    }
                }
            }
        }
        trace!("console <- {text:?}");
        self.transcript.record(&text);
        self.buffer.push_str(&text);
        if self.buffer.len() > MAX_BUFFER {
            let mut cut = self.buffer.len() - MAX_BUFFER;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }
    }
}

impl Console for ExpectConsole {
    fn send(&mut self, text: &str) -> Result<(), ConsoleError> {
        trace!("console -> {text:?}");
        match self.char_delay {
            Some(delay) => {
                let mut encoded = [0u8; 4];
                for c in text.chars() {
                    self.writer.write_all(c.encode_utf8(&mut encoded).as_bytes())?;
                    self.writer.flush()?;
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
            None => {
                self.writer.write_all(text.as_bytes())?;
                self.writer.flush()?;
            }
        }
        Ok(())
    }

    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<ConsoleMatch, ConsoleError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if let Some((index, found)) = find_earliest(&self.buffer, patterns) {
                let (start, end) = (found.start(), found.end());
                let before = self.buffer[..start].to_owned();
                let matched = self.buffer[start..end].to_owned();
                self.buffer.drain(..end);
                debug!("console matched {:?}", patterns[index].as_str());
                return Ok(ConsoleMatch {
                    index,
                    before,
                    matched,
                });
            }
            if self.closed {
                return Err(ConsoleError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConsoleError::Timeout {
                    waited: now - started,
                    patterns: describe(patterns),
                });
            }
            match self.rx.recv_timeout(deadline - now) {
                Ok(Ok(bytes)) => self.absorb(&bytes),
                Ok(Err(err)) => {
                    self.closed = true;
                    return Err(ConsoleError::Io(err));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.closed = true,
            }
        }
    }

    fn transcript(&self) -> &Transcript {
        &self.transcript
    }
}

impl Drop for ExpectConsole {
    fn drop(&mut self) {
        // Unblocks the reader thread and frees the serial server port.
        if let Some(socket) = self.socket.take() {
            if let Err(err) = socket.shutdown(Shutdown::Both) {
                debug!("console shutdown: {err}");
            }
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

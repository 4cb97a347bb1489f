//! Byte transport under the FISH engine.
//!
//! The engine talks through the [`Transport`] trait so the protocol
//! state machine can be driven by a real `ssh`/`rsh` child process in
//! production and by an in-memory script in conformance tests. The
//! scripted flavor lives here unconditionally; it is part of the
//! testing surface of the crate.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::{VfsError, VfsResult};
use crate::path::{ConnectSpec, HostFlavor};

/// Blocking byte pipe to the remote shell.
pub trait Transport {
    /// Send raw bytes. Short writes are not allowed to succeed.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read up to and including `term`, returning the content without
    /// the terminator. `None` means the pipe reached end of file (a
    /// partial unterminated line is also end of file).
    fn read_until(&mut self, term: u8) -> io::Result<Option<String>>;

    /// Read one `\n`-terminated line.
    fn read_line(&mut self) -> io::Result<Option<String>> {
        self.read_until(b'\n')
    }

    /// Read raw bytes, used by the streaming transfer sub-protocol.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Production transport: a spawned `ssh`/`rsh` child with piped stdio.
/// Stderr goes to the null device so remote banners cannot pollute the
/// protocol stream.
pub struct PipeTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl PipeTransport {
    pub fn spawn(program: &str, args: &[String]) -> io::Result<Self> {
        debug!(program, ?args, "spawning transport");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not piped"))?;
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    /// Close our end of the pipes and reap the child, escalating to a
    /// kill when it does not exit on its own.
    pub fn shutdown(&mut self) {
        self.stdin = None;
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for PipeTransport {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "transport shut down"))?;
        stdin.write_all(data)?;
        stdin.flush()
    }

    fn read_until(&mut self, term: u8) -> io::Result<Option<String>> {
        let mut raw = Vec::new();
        let n = self.stdout.read_until(term, &mut raw)?;
        if n == 0 {
            return Ok(None);
        }
        if raw.last() == Some(&term) {
            raw.pop();
        } else {
            // unterminated tail at end of file
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

/// Produces a connected [`Transport`] for a [`ConnectSpec`]. The
/// production implementation spawns the external shell program; tests
/// substitute closures returning scripted transports.
pub trait Connector {
    fn connect(&self, spec: &ConnectSpec) -> VfsResult<Box<dyn Transport>>;
}

impl<F> Connector for F
where
    F: Fn(&ConnectSpec) -> VfsResult<Box<dyn Transport>>,
{
    fn connect(&self, spec: &ConnectSpec) -> VfsResult<Box<dyn Transport>> {
        self(spec)
    }
}

/// Spawns `ssh` (or `rsh`) with the argument vector for the
/// connection's host, user and flavor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessConnector;

impl ProcessConnector {
    /// The argument vector, exposed separately so it can be tested
    /// without spawning anything.
    #[must_use]
    pub fn command_line(spec: &ConnectSpec) -> (String, Vec<String>) {
        let program = match spec.flavor {
            HostFlavor::Rsh => "rsh",
            _ => "ssh",
        };
        let mut args = Vec::new();
        match spec.flavor {
            HostFlavor::SshCompressed => args.push("-C".to_string()),
            HostFlavor::Port(port) => {
                args.push("-p".to_string());
                args.push(port.to_string());
            }
            HostFlavor::Ssh | HostFlavor::Rsh => {}
        }
        // Only pass -l when the user was explicit in the URL; otherwise
        // the transport picks the login name itself and ~/.ssh/config
        // overrides keep working.
        if let Some(user) = &spec.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.push(spec.host.clone());
        args.push("echo FISH:; /bin/sh".to_string());
        (program.to_string(), args)
    }
}

impl Connector for ProcessConnector {
    fn connect(&self, spec: &ConnectSpec) -> VfsResult<Box<dyn Transport>> {
        let (program, args) = Self::command_line(spec);
        let transport = PipeTransport::spawn(&program, &args).map_err(|err| {
            VfsError::Protocol(format!("cannot spawn {program} for {}: {err}", spec.host))
        })?;
        Ok(Box::new(transport))
    }
}

/// One step of a scripted conversation.
#[derive(Debug, Clone)]
enum ScriptStep {
    /// Bytes the fake remote side emits.
    Send(Vec<u8>),
    /// A substring that must have been written by the client before the
    /// conversation proceeds.
    Expect(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    steps: VecDeque<ScriptStep>,
    reading: VecDeque<u8>,
    written: Vec<u8>,
    cursor: usize,
}

impl ScriptState {
    /// Move scripted bytes into the read buffer, verifying expectations
    /// along the way. Returns `false` at end of script.
    fn advance(&mut self) -> io::Result<bool> {
        while self.reading.is_empty() {
            match self.steps.front() {
                None => return Ok(false),
                Some(ScriptStep::Send(_)) => {
                    if let Some(ScriptStep::Send(bytes)) = self.steps.pop_front() {
                        self.reading.extend(bytes);
                    }
                }
                Some(ScriptStep::Expect(pattern)) => {
                    let haystack = String::from_utf8_lossy(&self.written[self.cursor..]).into_owned();
                    match haystack.find(pattern.as_str()) {
                        Some(pos) => {
                            self.cursor += pos + pattern.len();
                            self.steps.pop_front();
                        }
                        None => {
                            return Err(io::Error::other(format!(
                                "scripted transport: expected {pattern:?} before next reply; got {haystack:?}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(true)
    }
}

/// In-memory transport driven by a script of `expect`/`send` steps.
/// Reads consume `send` bytes; an `expect` step blocks the script until
/// the pattern shows up in what the client wrote. Everything written is
/// retained for post-run assertions.
#[derive(Debug, Default, Clone)]
pub struct ScriptedTransport {
    state: Rc<RefCell<ScriptState>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A second handle on the same conversation, for the test to script
    /// and inspect while the engine owns the transport.
    #[must_use]
    pub fn handle(&self) -> ScriptedTransport {
        self.clone()
    }

    pub fn send(&self, bytes: impl AsRef<[u8]>) -> &Self {
        self.state
            .borrow_mut()
            .steps
            .push_back(ScriptStep::Send(bytes.as_ref().to_vec()));
        self
    }

    pub fn expect(&self, pattern: impl Into<String>) -> &Self {
        self.state
            .borrow_mut()
            .steps
            .push_back(ScriptStep::Expect(pattern.into()));
        self
    }

    /// Everything the client has written so far, lossily decoded.
    #[must_use]
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.state.borrow().written).into_owned()
    }

    #[must_use]
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    /// True when every scripted step has been consumed.
    #[must_use]
    pub fn script_done(&self) -> bool {
        let state = self.state.borrow();
        state.steps.is_empty() && state.reading.is_empty()
    }
}

impl Transport for ScriptedTransport {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        trace!(bytes = data.len(), "scripted write");
        self.state.borrow_mut().written.extend_from_slice(data);
        Ok(())
    }

    fn read_until(&mut self, term: u8) -> io::Result<Option<String>> {
        let mut state = self.state.borrow_mut();
        let mut raw = Vec::new();
        loop {
            if state.reading.is_empty() && !state.advance()? {
                return Ok(None);
            }
            match state.reading.pop_front() {
                Some(byte) if byte == term => {
                    return Ok(Some(String::from_utf8_lossy(&raw).into_owned()));
                }
                Some(byte) => raw.push(byte),
                None => return Ok(None),
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.reading.is_empty() && !state.advance()? {
            return Ok(0);
        }
        let mut count = 0;
        while count < buf.len() {
            match state.reading.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_plain() {
        let (spec, _) = crate::path::parse_network_url("box/x").unwrap();
        let (program, args) = ProcessConnector::command_line(&spec);
        assert_eq!(program, "ssh");
        assert_eq!(args, vec!["box", "echo FISH:; /bin/sh"]);
    }

    #[test]
    fn test_command_line_full() {
        let (spec, _) = crate::path::parse_network_url("alice@box:2222/x").unwrap();
        let (program, args) = ProcessConnector::command_line(&spec);
        assert_eq!(program, "ssh");
        assert_eq!(
            args,
            vec!["-p", "2222", "-l", "alice", "box", "echo FISH:; /bin/sh"]
        );
    }

    #[test]
    fn test_command_line_rsh_and_compressed() {
        let (spec, _) = crate::path::parse_network_url("box:r/").unwrap();
        assert_eq!(ProcessConnector::command_line(&spec).0, "rsh");

        let (spec, _) = crate::path::parse_network_url("box:C/").unwrap();
        let (program, args) = ProcessConnector::command_line(&spec);
        assert_eq!(program, "ssh");
        assert_eq!(args[0], "-C");
    }

    #[test]
    fn test_scripted_send_then_read() {
        let script = ScriptedTransport::new();
        script.send("hello\nworld\n");
        let mut transport = script.handle();
        assert_eq!(transport.read_line().unwrap().as_deref(), Some("hello"));
        assert_eq!(transport.read_line().unwrap().as_deref(), Some("world"));
        assert_eq!(transport.read_line().unwrap(), None);
    }

    #[test]
    fn test_scripted_expect_gates_reply() {
        let script = ScriptedTransport::new();
        script.expect("#PING\n").send("pong\n");
        let mut transport = script.handle();
        transport.write_all(b"#PING\n").unwrap();
        assert_eq!(transport.read_line().unwrap().as_deref(), Some("pong"));
        assert!(script.script_done());
    }

    #[test]
    fn test_scripted_unmet_expectation_errors() {
        let script = ScriptedTransport::new();
        script.expect("#PING\n").send("pong\n");
        let mut transport = script.handle();
        transport.write_all(b"#OTHER\n").unwrap();
        assert!(transport.read_line().is_err());
    }

    #[test]
    fn test_scripted_raw_read() {
        let script = ScriptedTransport::new();
        script.send([1u8, 2, 3, 4, 5]);
        let mut transport = script.handle();
        let mut buf = [0u8; 3];
        assert_eq!(transport.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
    }
}

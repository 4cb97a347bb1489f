//! FISH: files transferred over a shell connection.
//!
//! The backend drives a remote `/bin/sh` through an `ssh`/`rsh` pipe.
//! Encryption and authentication are entirely the transport program's
//! business; password prompts cannot be answered (the transport reads
//! them from its own tty) and abort the connect.
//!
//! Connection lifecycle: spawn the transport, wait for the greeting,
//! probe the optional server helper, exchange a version marker, force
//! the `C` locale so dates parse unambiguously, probe remote tool
//! capabilities, and finally read the remote working directory. After
//! that the connection is ready and commands run strictly one at a
//! time, each terminated by the `### ddd` reply marker.

pub mod listing;
pub mod proto;
pub mod scripts;
pub mod transport;

use std::io::Read;
use std::path::Path;
use std::rc::Rc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::backend::{ClassFlags, Mount, VfsBackend, VfsClass};
use crate::error::{OpContext, VfsError, VfsResult};
use crate::escape::{Quoted, shell_escape};
use crate::host::Host;
use crate::path::{ConnectSpec, MountSpec};
use crate::tree::{DirTree, InodeId};

use self::listing::PendingEntry;
use self::proto::{REPLY_MARKER, Reply, ReplyClass, get_reply};
use self::scripts::{ScriptSet, env_prefix, render_command};
use self::transport::{Connector, ProcessConnector, Transport};

/// Transfer buffer size, also the upload chunk granularity.
const CHUNK_SIZE: usize = 8192;

/// The FISH backend class: remote, temp-copy based, registered under
/// the `sh` scheme token.
pub struct FishBackend {
    class: VfsClass,
    connector: Box<dyn Connector>,
    host: Rc<dyn Host>,
}

impl FishBackend {
    #[must_use]
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self::with_connector(host, Box::new(ProcessConnector))
    }

    /// Use a custom transport factory. Conformance tests connect the
    /// engine to scripted transports this way.
    #[must_use]
    pub fn with_connector(host: Rc<dyn Host>, connector: Box<dyn Connector>) -> Self {
        Self {
            class: VfsClass {
                name: "fish",
                prefix: "sh",
                flags: ClassFlags {
                    remote: true,
                    use_tmp: true,
                    no_exclusive_create: true,
                    ..ClassFlags::default()
                },
            },
            connector,
            host,
        }
    }
}

impl VfsBackend for FishBackend {
    fn class(&self) -> &VfsClass {
        &self.class
    }

    fn open_archive(&self, spec: &MountSpec) -> VfsResult<Box<dyn Mount>> {
        let MountSpec::Network(connect) = spec else {
            return Err(VfsError::Invalid("fish can only mount network specs".into()));
        };
        let transport = self.connector.connect(connect)?;
        let config_dir = self.host.config_dir();
        let scripts = ScriptSet::load(config_dir.as_deref(), &connect.host);

        let mut mount = FishMount {
            transport,
            scripts,
            spec: connect.clone(),
            mount_spec: MountSpec::Network(connect.clone()),
            host: Rc::clone(&self.host),
            env: String::new(),
            host_flags: 0,
            home: String::new(),
            linear: None,
            connected: false,
        };
        mount.handshake()?;
        Ok(Box::new(mount))
    }

    fn archive_same(&self, spec: &MountSpec, mount: &dyn Mount) -> bool {
        match (spec, mount.spec()) {
            (MountSpec::Network(a), MountSpec::Network(b)) => a.same_session(b),
            _ => false,
        }
    }
}

struct LinearState {
    total: u64,
    got: u64,
    finished: bool,
}

/// One live shell connection.
pub struct FishMount {
    transport: Box<dyn Transport>,
    scripts: ScriptSet,
    spec: ConnectSpec,
    mount_spec: MountSpec,
    host: Rc<dyn Host>,
    /// Cached `FISH_HAVE_*` export prefix, rendered from the probe.
    env: String,
    host_flags: u32,
    /// Remote home directory, reported at connect time.
    home: String,
    linear: Option<LinearState>,
    connected: bool,
}

impl FishMount {
    /// Remote capability bitmask detected during the handshake.
    #[must_use]
    pub fn capabilities(&self) -> u32 {
        self.host_flags
    }

    /// Remote home directory, with a trailing separator.
    #[must_use]
    pub fn home(&self) -> &str {
        &self.home
    }

    fn handshake(&mut self) -> VfsResult<()> {
        self.host.message("fish: Waiting for initial line...");
        let greeting = self
            .transport
            .read_until(b':')
            .map_err(|err| VfsError::Protocol(format!("no greeting from {}: {err}", self.spec.host)))?
            .ok_or_else(|| VfsError::Protocol(format!("{} closed the connection", self.spec.host)))?;

        // the transport reads passwords from its own tty, not from us
        if greeting.contains("assword") {
            self.host
                .message("fish: password authentication is not supported");
            return Err(VfsError::Protocol(format!(
                "{} asked for a password",
                self.spec.host
            )));
        }

        self.host.message("fish: Sending initial line...");
        // Probe the optional server helper; its absence is fine, the
        // shell answers the marker either way.
        if !self
            .command(true, "#FISH\necho; start_fish_server 2>&1; echo '### 200'\n")?
            .is_complete()
        {
            return Err(VfsError::Protocol("server rejected session start".into()));
        }

        self.host.message("fish: Handshaking version...");
        if !self.command(true, "#VER 0.0.3\necho '### 000'\n")?.is_complete() {
            return Err(VfsError::Protocol("version handshake failed".into()));
        }

        // otherwise dates in listings are unparseable
        if !self
            .command(
                true,
                "LANG=C LC_ALL=C LC_TIME=C; export LANG LC_ALL LC_TIME;\necho '### 200'\n",
            )?
            .is_complete()
        {
            return Err(VfsError::Protocol("cannot set remote locale".into()));
        }

        self.host.message("fish: Getting host info...");
        self.probe_info()?;
        self.env = env_prefix(self.host_flags);

        self.host.message("fish: Setting up current directory...");
        self.home = self.getcwd()?;
        self.host
            .message(&format!("fish: Connected, home {}.", self.home));
        debug!(host = %self.spec.host, flags = self.host_flags, home = %self.home, "connected");

        self.connected = true;
        Ok(())
    }

    /// Run the capability-detection script and keep the last integer it
    /// prints as the bitmask.
    fn probe_info(&mut self) -> VfsResult<()> {
        let script = self.scripts.info.clone();
        self.command(false, &script)?;
        loop {
            match self.transport.read_line() {
                Ok(Some(line)) => {
                    if line.starts_with(REPLY_MARKER) {
                        return Ok(());
                    }
                    self.host_flags = leading_u32(&line);
                }
                Ok(None) => {
                    return Err(VfsError::ConnectionReset(self.op_context("info")));
                }
                Err(err) => return Err(VfsError::from(err)),
            }
        }
    }

    /// Remote working directory, reported with a trailing separator.
    fn getcwd(&mut self) -> VfsResult<String> {
        let reply = self.command(true, "#PWD\npwd; echo '### 200'\n")?;
        if !reply.is_complete() {
            return Err(VfsError::Protocol("cannot read remote home".into()));
        }
        match reply.text {
            Some(dir) if !dir.is_empty() => Ok(format!("{dir}/")),
            _ => Err(VfsError::Protocol("empty remote home".into())),
        }
    }

    /// Write one framed command and optionally consume its reply.
    fn command(&mut self, wait_reply: bool, text: &str) -> VfsResult<Reply> {
        trace!(command = text, "fish command");
        self.host.enable_interrupt_key();
        let written = self.transport.write_all(text.as_bytes());
        self.host.disable_interrupt_key();
        if let Err(err) = written {
            warn!(host = %self.spec.host, %err, "command write failed");
            return Err(VfsError::ConnectionReset(self.op_context("command")));
        }
        if wait_reply {
            get_reply(self.transport.as_mut())
        } else {
            Ok(Reply { class: ReplyClass::Complete, text: None })
        }
    }

    /// Render and run one scripted operation, mapping any non-complete
    /// reply to the remote-failure error.
    fn run_script(
        &mut self,
        op: &'static str,
        script: &str,
        vars: &[(&str, Quoted)],
        path_for_error: &str,
    ) -> VfsResult<()> {
        let cmd = render_command(&self.env, vars, script);
        let reply = self.command(true, &cmd)?;
        if reply.is_complete() {
            Ok(())
        } else {
            Err(VfsError::Remote(
                OpContext::new()
                    .with_op(op)
                    .with_path(path_for_error)
                    .with_mount(self.name()),
            ))
        }
    }

    fn op_context(&self, op: &'static str) -> OpContext {
        OpContext::new().with_op(op).with_mount(self.name())
    }

    /// Drain and discard the rest of a declared transfer so the
    /// connection stays usable, then consume the final reply.
    fn linear_abort(&mut self) {
        let Some(mut state) = self.linear.take() else {
            return;
        };
        self.host.message("fish: Aborting transfer...");

        let mut buf = [0u8; CHUNK_SIZE];
        while state.got < state.total {
            let want = usize::try_from((state.total - state.got).min(CHUNK_SIZE as u64))
                .unwrap_or(CHUNK_SIZE);
            match self.transport.read(&mut buf[..want]) {
                Ok(0) | Err(_) => return, // pipe died; nothing to resync
                Ok(n) => state.got += n as u64,
            }
        }

        match get_reply(self.transport.as_mut()) {
            Ok(reply) if reply.is_complete() => {
                self.host.message("fish: Aborted transfer would be successful.");
            }
            _ => self.host.message("fish: Error reported after abort."),
        }
    }
}

impl Mount for FishMount {
    fn name(&self) -> String {
        self.spec.display_name("sh")
    }

    fn spec(&self) -> &MountSpec {
        &self.mount_spec
    }

    fn dir_load(&mut self, tree: &mut DirTree, dir: InodeId, remote_path: &str) -> VfsResult<()> {
        self.host
            .message(&format!("fish: Reading directory {remote_path}..."));

        let quoted = shell_escape(remote_path);
        let script = self.scripts.ls.clone();
        let cmd = render_command(&self.env, &[("FISH_FILENAME", quoted)], &script);
        self.command(false, &cmd)?;

        let mut pending = PendingEntry::new();
        let final_code;
        loop {
            if self.host.interrupted() {
                return Err(VfsError::ConnectionReset(self.op_context("dir_load")));
            }
            let line = match self.transport.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(VfsError::ConnectionReset(self.op_context("dir_load")));
                }
                Err(err) => return Err(VfsError::from(err)),
            };
            trace!(line = %line, "listing line");

            if let Some(code) = line.strip_prefix(REPLY_MARKER) {
                final_code = proto::decode_reply(code, false);
                break;
            }
            if line.is_empty() {
                if let Some(entry) = pending.take() {
                    let node = tree.add_child(dir, &entry.name, entry.stat)?;
                    tree.inode_mut(node).link_target = entry.link_target;
                }
                continue;
            }
            pending.apply_fact(&line);
        }

        match final_code {
            ReplyClass::Complete => {
                self.host.message("fish: done.");
                Ok(())
            }
            ReplyClass::Error => Err(VfsError::AccessDenied(remote_path.to_string())),
            _ => Err(VfsError::Remote(
                OpContext::new()
                    .with_op("dir_load")
                    .with_path(remote_path)
                    .with_mount(self.name()),
            )),
        }
    }

    fn file_store(&mut self, remote_path: &str, local: &Path, append: bool) -> VfsResult<()> {
        let mut file = std::fs::File::open(local)
            .map_err(|err| VfsError::io(err, self.op_context("store").with_path(remote_path)))?;
        let size = file
            .metadata()
            .map_err(|err| VfsError::io(err, self.op_context("store").with_path(remote_path)))?
            .len();

        let quoted = shell_escape(remote_path);
        self.host
            .message(&format!("fish: store {}: sending command...", quoted.as_str()));

        let script = if append { self.scripts.append.clone() } else { self.scripts.send.clone() };
        let cmd = render_command(
            &self.env,
            &[("FISH_FILENAME", quoted), ("FISH_FILESIZE", Quoted::number(size))],
            &script,
        );
        let reply = self.command(true, &cmd)?;
        if reply.class != ReplyClass::Prelim {
            return Err(VfsError::Remote(
                OpContext::new()
                    .with_op("store")
                    .with_path(remote_path)
                    .with_mount(self.name()),
            ));
        }

        // The remote script consumes exactly `size` bytes. Whatever
        // happens locally, that many bytes must cross the pipe or the
        // session desynchronizes; local trouble switches us to sending
        // zeros for the remainder.
        let mut buf = [0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;
        let mut zero_fill = false;
        while sent < size {
            let want =
                usize::try_from((size - sent).min(CHUNK_SIZE as u64)).unwrap_or(CHUNK_SIZE);
            let n = if zero_fill {
                buf[..want].fill(0);
                want
            } else {
                match file.read(&mut buf[..want]) {
                    Ok(0) | Err(_) => {
                        self.host.message("fish: Local read failed, sending zeros");
                        zero_fill = true;
                        continue;
                    }
                    Ok(n) => n,
                }
            };

            if self.host.interrupted() && !zero_fill {
                // keep the byte count honest; report failure at the end
                zero_fill = true;
            }

            if let Err(err) = self.transport.write_all(&buf[..n]) {
                warn!(%err, "upload write failed");
                let _ = get_reply(self.transport.as_mut());
                return Err(VfsError::ConnectionReset(
                    self.op_context("store").with_path(remote_path),
                ));
            }
            sent += n as u64;
            self.host.message(&format!(
                "fish: {} {sent}/{size}",
                if zero_fill { "storing zeros" } else { "storing file" }
            ));
        }

        let reply = get_reply(self.transport.as_mut())?;
        if reply.is_complete() && !zero_fill {
            Ok(())
        } else {
            Err(VfsError::Remote(
                OpContext::new()
                    .with_op("store")
                    .with_path(remote_path)
                    .with_mount(self.name()),
            ))
        }
    }

    fn linear_start(&mut self, remote_path: &str, offset: u64) -> VfsResult<u64> {
        if self.linear.is_some() {
            return Err(VfsError::Invalid("transfer already in progress".into()));
        }

        let quoted = shell_escape(remote_path);
        let script = self.scripts.get.clone();
        let cmd = render_command(
            &self.env,
            &[("FISH_FILENAME", quoted), ("FISH_START_OFFSET", Quoted::number(offset))],
            &script,
        );
        let reply = self.command(true, &cmd)?;
        if reply.class != ReplyClass::Prelim {
            return Err(VfsError::Remote(
                OpContext::new()
                    .with_op("retrieve")
                    .with_path(remote_path)
                    .with_mount(self.name()),
            ));
        }
        let total: u64 = reply
            .text
            .as_deref()
            .map(str::trim)
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| {
                VfsError::Remote(
                    OpContext::new()
                        .with_op("retrieve size")
                        .with_path(remote_path)
                        .with_mount(self.name()),
                )
            })?;

        self.linear = Some(LinearState { total, got: 0, finished: false });
        Ok(total)
    }

    fn linear_read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let Some(state) = self.linear.as_mut() else {
            return Err(VfsError::Invalid("no transfer in progress".into()));
        };

        let remaining = state.total - state.got;
        let want = usize::try_from(remaining.min(buf.len() as u64)).unwrap_or(buf.len());

        if want == 0 {
            // end of declared data: the final marker settles the deal
            let reply = get_reply(self.transport.as_mut())?;
            let state = self.linear.as_mut().expect("transfer state");
            state.finished = true;
            if reply.is_complete() {
                return Ok(0);
            }
            return Err(VfsError::Remote(self.op_context("retrieve")));
        }

        if self.host.interrupted() {
            self.linear_abort();
            return Err(VfsError::io(
                std::io::Error::new(std::io::ErrorKind::Interrupted, "transfer interrupted"),
                self.op_context("retrieve"),
            ));
        }

        match self.transport.read(&mut buf[..want]) {
            Ok(0) => Err(VfsError::ConnectionReset(self.op_context("retrieve"))),
            Ok(n) => {
                let state = self.linear.as_mut().expect("transfer state");
                state.got += n as u64;
                Ok(n)
            }
            Err(err) => Err(VfsError::from(err)),
        }
    }

    fn linear_close(&mut self) -> VfsResult<()> {
        let Some(state) = self.linear.as_ref() else {
            return Ok(());
        };
        let finished = state.finished;
        let undrained = state.got < state.total;

        if finished {
            self.linear = None;
            return Ok(());
        }
        if undrained {
            self.linear_abort();
            return Ok(());
        }
        // all bytes consumed but the final marker is still queued
        let reply = get_reply(self.transport.as_mut())?;
        self.linear = None;
        if reply.is_complete() {
            Ok(())
        } else {
            Err(VfsError::Remote(self.op_context("retrieve")))
        }
    }

    fn chmod(&mut self, path: &str, perm: u32) -> VfsResult<()> {
        let script = self.scripts.chmod.clone();
        self.run_script(
            "chmod",
            &script,
            &[("FISH_FILENAME", shell_escape(path)), ("FISH_FILEMODE", Quoted::mode(perm))],
            path,
        )
    }

    fn chown(&mut self, path: &str, owner: &str, group: &str) -> VfsResult<()> {
        let script = self.scripts.chown.clone();
        self.run_script(
            "chown",
            &script,
            &[
                ("FISH_FILENAME", shell_escape(path)),
                ("FISH_FILEOWNER", shell_escape(owner)),
                ("FISH_FILEGROUP", shell_escape(group)),
            ],
            path,
        )
    }

    fn utime(&mut self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let atime: DateTime<Utc> = atime.into();
        let mtime: DateTime<Utc> = mtime.into();
        let script = self.scripts.utime.clone();
        self.run_script(
            "utime",
            &script,
            &[
                ("FISH_FILENAME", shell_escape(path)),
                ("FISH_TOUCHATIME", shell_escape(&atime.format("%Y%m%d%H%M.%S").to_string())),
                ("FISH_TOUCHMTIME", shell_escape(&mtime.format("%Y%m%d%H%M.%S").to_string())),
                (
                    "FISH_TOUCHATIME_W_NSEC",
                    shell_escape(&atime.format("%Y-%m-%d %H:%M:%S").to_string()),
                ),
                (
                    "FISH_TOUCHMTIME_W_NSEC",
                    shell_escape(&mtime.format("%Y-%m-%d %H:%M:%S").to_string()),
                ),
                ("FISH_FILEATIME", Quoted::number(atime.timestamp().max(0) as u64)),
                ("FISH_FILEMTIME", Quoted::number(mtime.timestamp().max(0) as u64)),
            ],
            path,
        )
    }

    fn symlink(&mut self, target: &str, link_path: &str) -> VfsResult<()> {
        let script = self.scripts.ln.clone();
        self.run_script(
            "symlink",
            &script,
            &[("FISH_FILEFROM", shell_escape(target)), ("FISH_FILETO", shell_escape(link_path))],
            link_path,
        )
    }

    fn hardlink(&mut self, from: &str, to: &str) -> VfsResult<()> {
        let script = self.scripts.hardlink.clone();
        self.run_script(
            "hardlink",
            &script,
            &[("FISH_FILEFROM", shell_escape(from)), ("FISH_FILETO", shell_escape(to))],
            to,
        )
    }

    fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        let script = self.scripts.mv.clone();
        self.run_script(
            "rename",
            &script,
            &[("FISH_FILEFROM", shell_escape(from)), ("FISH_FILETO", shell_escape(to))],
            to,
        )
    }

    fn unlink(&mut self, path: &str) -> VfsResult<()> {
        let script = self.scripts.unlink.clone();
        self.run_script("unlink", &script, &[("FISH_FILENAME", shell_escape(path))], path)
    }

    fn mkdir(&mut self, path: &str) -> VfsResult<()> {
        let script = self.scripts.mkdir.clone();
        self.run_script("mkdir", &script, &[("FISH_FILENAME", shell_escape(path))], path)
    }

    fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        let script = self.scripts.rmdir.clone();
        self.run_script("rmdir", &script, &[("FISH_FILENAME", shell_escape(path))], path)
    }

    fn exists(&mut self, path: &str) -> VfsResult<bool> {
        let script = self.scripts.exists.clone();
        let cmd = render_command(&self.env, &[("FISH_FILENAME", shell_escape(path))], &script);
        Ok(self.command(true, &cmd)?.is_complete())
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.host
                .message(&format!("fish: Disconnecting from {}", self.spec.host));
            let _ = self.command(false, "#BYE\nexit\n");
            self.connected = false;
        }
    }
}

fn leading_u32(text: &str) -> u32 {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

//! File metadata as the cache stores it, plus parsers for the textual
//! forms remote listings use.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};

/// What kind of filesystem object an inode describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// `stat`-equivalent metadata for one filesystem object.
///
/// Owner and group are kept as names: remote listings report names and
/// the remote mutation commands take names, so a numeric id would just
/// be an extra lossy conversion in the middle.
#[derive(Debug, Clone, PartialEq)]
pub struct FileStat {
    pub kind: FileKind,
    /// Permission bits (low 12 bits of the mode).
    pub perm: u32,
    pub size: u64,
    pub nlink: u32,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub ctime: SystemTime,
    /// Device major/minor for character and block devices.
    pub rdev: Option<(u32, u32)>,
}

impl FileStat {
    #[must_use]
    pub fn new(kind: FileKind, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind,
            perm: perm & 0o7777,
            size: 0,
            nlink: 1,
            owner: None,
            group: None,
            mtime: now,
            atime: now,
            ctime: now,
            rdev: None,
        }
    }

    /// Default metadata for a synthesized directory.
    #[must_use]
    pub fn directory() -> Self {
        Self::new(FileKind::Directory, 0o755)
    }

    /// Default metadata for a synthesized regular file.
    #[must_use]
    pub fn regular() -> Self {
        Self::new(FileKind::Regular, 0o644)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn set_times(&mut self, when: SystemTime) {
        self.mtime = when;
        self.atime = when;
        self.ctime = when;
    }
}

/// Parse an `ls -l` style mode string (`"-rw-r--r--"`, `"drwxr-x---"`).
///
/// Returns `None` for strings too short or with an unknown type letter.
/// Setuid/setgid/sticky spellings (`s`, `S`, `t`, `T`) are honored.
#[must_use]
pub fn parse_filemode(text: &str) -> Option<(FileKind, u32)> {
    let bytes = text.as_bytes();
    if bytes.len() < 10 {
        return None;
    }
    let kind = match bytes[0] {
        b'-' => FileKind::Regular,
        b'd' => FileKind::Directory,
        b'l' => FileKind::Symlink,
        b'c' => FileKind::CharDevice,
        b'b' => FileKind::BlockDevice,
        b'p' => FileKind::Fifo,
        b's' => FileKind::Socket,
        _ => return None,
    };

    let mut perm = 0u32;
    // rwx triplets, highest bits first
    let triplets = [(1, 0o400, 0o200, 0o100), (4, 0o040, 0o020, 0o010), (7, 0o004, 0o002, 0o001)];
    for (base, r, w, x) in triplets {
        if bytes[base] == b'r' {
            perm |= r;
        }
        if bytes[base + 1] == b'w' {
            perm |= w;
        }
        match bytes[base + 2] {
            b'x' => perm |= x,
            b's' => {
                perm |= x;
                perm |= if base == 1 { 0o4000 } else { 0o2000 };
            }
            b'S' => perm |= if base == 1 { 0o4000 } else { 0o2000 },
            b't' => {
                perm |= x;
                perm |= 0o1000;
            }
            b'T' => perm |= 0o1000,
            _ => {}
        }
    }
    Some((kind, perm))
}

/// Parse a raw octal mode carrying both type and permission bits
/// (the `R` fact line: `R<octal>` with optional trailing fields).
#[must_use]
pub fn parse_raw_filemode(text: &str) -> Option<(FileKind, u32)> {
    let first = text.split_whitespace().next()?;
    let mode = u32::from_str_radix(first, 8).ok()?;
    let kind = match mode & 0o170000 {
        0o140000 => FileKind::Socket,
        0o120000 => FileKind::Symlink,
        0o100000 => FileKind::Regular,
        0o060000 => FileKind::BlockDevice,
        0o040000 => FileKind::Directory,
        0o020000 => FileKind::CharDevice,
        0o010000 => FileKind::Fifo,
        _ => return None,
    };
    Some((kind, mode & 0o7777))
}

fn system_time_from_naive(naive: NaiveDateTime) -> SystemTime {
    let secs = naive.and_utc().timestamp();
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Parse the textual date of a `d` fact line.
///
/// Accepts `YYYY-MM-DD HH:MM:SS` from modern listing scripts and the two
/// `ls` spellings `Mon DD YYYY` and `Mon DD HH:MM` (the latter implies
/// the current year, as `ls` omits the year for recent files).
#[must_use]
pub fn parse_listing_date(text: &str) -> Option<SystemTime> {
    let text = text.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(system_time_from_naive(naive));
    }

    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 3 {
        return None;
    }
    let month = parse_month(fields[0])?;
    let day: u32 = fields[1].parse().ok()?;
    if let Some((hour, minute)) = fields[2].split_once(':') {
        let hour: u32 = hour.parse().ok()?;
        let minute: u32 = minute.parse().ok()?;
        let year = Utc::now().year();
        let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
        return Some(system_time_from_naive(naive));
    }
    let year: i32 = fields[2].parse().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    Some(system_time_from_naive(naive))
}

/// Parse the numeric `D` fact line: six integers filled straight into a
/// broken-down time, so the year counts from 1900 and the month is
/// zero-based. Remote helper scripts emit the fields that way.
#[must_use]
pub fn parse_broken_down_date(text: &str) -> Option<SystemTime> {
    let fields: Vec<i64> = text
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() != 6 {
        return None;
    }
    let year = i32::try_from(fields[0]).ok()? + 1900;
    let month = u32::try_from(fields[1]).ok()? + 1;
    let day = u32::try_from(fields[2]).ok()?;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(
        u32::try_from(fields[3]).ok()?,
        u32::try_from(fields[4]).ok()?,
        u32::try_from(fields[5]).ok()?,
    )?;
    Some(system_time_from_naive(naive))
}

fn parse_month(name: &str) -> Option<u32> {
    let month = match name {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    Some(month)
}

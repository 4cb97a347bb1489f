//! Parser for the directory-listing sub-protocol.
//!
//! The remote `ls` script emits one block of tagged fact lines per
//! file, terminated by a blank line:
//!
//! ```text
//! P-rw-r--r-- 1000.1000
//! S1234
//! d2024-01-02 03:04:05
//! :"file.txt"
//!
//! ```
//!
//! A symlink block carries `"name" -> "target"` inside the `:` line.
//! Fact lines that fail to parse are ignored, keeping whatever the
//! block established so far; unknown tags are skipped the same way.

use crate::escape::shell_unescape;
use crate::stat::{
    FileKind, FileStat, parse_broken_down_date, parse_filemode, parse_listing_date,
    parse_raw_filemode,
};

/// A parsed listing block ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedEntry {
    pub name: String,
    pub stat: FileStat,
    pub link_target: Option<String>,
}

/// Accumulates fact lines of the block currently being received.
#[derive(Debug, Default)]
pub struct PendingEntry {
    name: Option<String>,
    link_target: Option<String>,
    kind: Option<FileKind>,
    perm: u32,
    size: u64,
    owner: Option<String>,
    group: Option<String>,
    mtime: Option<std::time::SystemTime>,
    rdev: Option<(u32, u32)>,
    skip: bool,
}

impl PendingEntry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one tagged line into the pending block.
    pub fn apply_fact(&mut self, line: &str) {
        let (tag, rest) = match line.split_at_checked(1) {
            Some(split) => split,
            None => return,
        };
        match tag {
            ":" => self.apply_name(rest),
            "S" => {
                self.size = leading_u64(rest);
            }
            "P" => {
                if let Some((kind, perm)) = parse_filemode(rest) {
                    self.kind = Some(kind);
                    self.perm = perm;
                }
                self.apply_owner_group(rest);
            }
            "R" => {
                if let Some((kind, perm)) = parse_raw_filemode(rest) {
                    self.kind = Some(kind);
                    self.perm = perm;
                }
            }
            "d" => {
                if let Some(when) = parse_listing_date(rest) {
                    self.mtime = Some(when);
                }
            }
            "D" => {
                if let Some(when) = parse_broken_down_date(rest) {
                    self.mtime = Some(when);
                }
            }
            "E" => {
                if let Some((major, minor)) = rest.split_once(',')
                    && let (Ok(major), Ok(minor)) = (major.trim().parse(), minor.trim().parse())
                {
                    self.rdev = Some((major, minor));
                }
            }
            _ => {}
        }
    }

    fn apply_name(&mut self, data: &str) {
        // "." and ".." are the parent's own business
        if data == "\".\"" || data == "\"..\"" {
            self.skip = true;
            return;
        }

        if self.kind == Some(FileKind::Symlink) {
            // expected: "escaped-name" -> "escaped-target"; a literal
            // " -> " cannot occur inside the names because the listing
            // escapes it
            let trimmed = data.strip_prefix('"').unwrap_or(data);
            match trimmed.find("\" -> \"") {
                Some(pos) => {
                    let name = &trimmed[..pos];
                    let mut target = &trimmed[pos + 6..];
                    if let Some(stripped) = target.strip_suffix('"') {
                        target = stripped;
                    }
                    self.name = Some(shell_unescape(name));
                    self.link_target = Some(shell_unescape(target));
                }
                None => {
                    // broken client, or something went wrong
                    let name = trimmed.strip_suffix('"').unwrap_or(trimmed);
                    self.name = Some(shell_unescape(name));
                    self.link_target = Some(String::new());
                }
            }
        } else {
            let mut name = data;
            if name.len() > 2 {
                name = name.strip_prefix('"').unwrap_or(name);
                name = name.strip_suffix('"').unwrap_or(name);
            }
            self.name = Some(shell_unescape(name));
        }
    }

    fn apply_owner_group(&mut self, rest: &str) {
        // mode string, then "owner.group"
        let Some(ids) = rest.split_whitespace().nth(1) else {
            return;
        };
        if let Some((owner, group)) = ids.split_once('.') {
            if !owner.is_empty() {
                self.owner = Some(owner.to_string());
            }
            if !group.is_empty() {
                self.group = Some(group.to_string());
            }
        }
    }

    /// Finish the block on its blank line. Returns `None` when the
    /// block never named a file (or named `.`/`..`); either way the
    /// accumulator is reset for the next block.
    pub fn take(&mut self) -> Option<ListedEntry> {
        let pending = std::mem::take(self);
        if pending.skip {
            return None;
        }
        let name = pending.name?;

        let mut stat = FileStat::new(pending.kind.unwrap_or(FileKind::Regular), pending.perm);
        stat.size = pending.size;
        stat.owner = pending.owner;
        stat.group = pending.group;
        stat.rdev = pending.rdev;
        if let Some(when) = pending.mtime {
            stat.set_times(when);
        }
        Some(ListedEntry { name, stat, link_target: pending.link_target })
    }
}

fn leading_u64(text: &str) -> u64 {
    let trimmed = text.trim_start();
    let digits: String = trimmed.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn parse_block(lines: &[&str]) -> Option<ListedEntry> {
        let mut pending = PendingEntry::new();
        for line in lines {
            pending.apply_fact(line);
        }
        pending.take()
    }

    #[test]
    fn test_regular_file_block() {
        let entry = parse_block(&[
            "P-rw-r--r-- alice.users",
            "S1234",
            "d2024-01-02 03:04:05",
            ":\"file.txt\"",
        ])
        .unwrap();

        assert_eq!(entry.name, "file.txt");
        assert_eq!(entry.stat.size, 1234);
        assert_eq!(entry.stat.kind, FileKind::Regular);
        assert_eq!(entry.stat.perm, 0o644);
        assert_eq!(entry.stat.owner.as_deref(), Some("alice"));
        assert_eq!(entry.stat.group.as_deref(), Some("users"));
        assert_eq!(
            entry.stat.mtime,
            UNIX_EPOCH + Duration::from_secs(1_704_164_645)
        );
    }

    #[test]
    fn test_symlink_block() {
        let entry = parse_block(&[
            "Plrwxrwxrwx 0.0",
            "S4",
            ":\"link\" -> \"target dir/file\"",
        ])
        .unwrap();

        assert_eq!(entry.name, "link");
        assert_eq!(entry.stat.kind, FileKind::Symlink);
        assert_eq!(entry.link_target.as_deref(), Some("target dir/file"));
    }

    #[test]
    fn test_symlink_without_arrow_falls_back() {
        let entry = parse_block(&["Plrwxrwxrwx 0.0", ":\"oddlink\""]).unwrap();
        assert_eq!(entry.name, "oddlink");
        assert_eq!(entry.link_target.as_deref(), Some(""));
    }

    #[test]
    fn test_escaped_name_round_trips() {
        let entry = parse_block(&[
            "P-rw-r--r-- 0.0",
            ":\"evil\\\"\\;name\"",
        ])
        .unwrap();
        assert_eq!(entry.name, "evil\";name");
    }

    #[test]
    fn test_dot_entries_are_skipped() {
        assert!(parse_block(&["P-rwxr-xr-x 0.0", ":\".\""]).is_none());
        assert!(parse_block(&["Pdrwxr-xr-x 0.0", ":\"..\""]).is_none());
    }

    #[test]
    fn test_block_without_name_is_dropped() {
        assert!(parse_block(&["S10", "P-rw-r--r-- 0.0"]).is_none());
    }

    #[test]
    fn test_device_node_block() {
        let entry = parse_block(&["Pbrw-rw---- 0.6", "E8,0", ":\"sda\""]).unwrap();
        assert_eq!(entry.stat.kind, FileKind::BlockDevice);
        assert_eq!(entry.stat.rdev, Some((8, 0)));
    }

    #[test]
    fn test_raw_mode_line() {
        let entry = parse_block(&["R100600 0 0.0", ":\"secret\""]).unwrap();
        assert_eq!(entry.stat.kind, FileKind::Regular);
        assert_eq!(entry.stat.perm, 0o600);
    }

    #[test]
    fn test_bad_fact_lines_are_ignored() {
        let entry = parse_block(&[
            "Pgarbage",
            "Snot-a-number",
            "dnot a date",
            "Ejunk",
            "Xunknown",
            ":\"ok.txt\"",
        ])
        .unwrap();
        assert_eq!(entry.name, "ok.txt");
        assert_eq!(entry.stat.size, 0);
        assert_eq!(entry.stat.kind, FileKind::Regular);
    }

    #[test]
    fn test_take_resets_for_next_block() {
        let mut pending = PendingEntry::new();
        pending.apply_fact("S77");
        pending.apply_fact(":\"a\"");
        assert!(pending.take().is_some());

        pending.apply_fact(":\"b\"");
        let second = pending.take().unwrap();
        assert_eq!(second.name, "b");
        assert_eq!(second.stat.size, 0);
    }

    #[test]
    fn test_short_name_unquoted() {
        // two characters or fewer keep their quotes ambiguity rule:
        // nothing is stripped
        let entry = parse_block(&[":ab"]).unwrap();
        assert_eq!(entry.name, "ab");
    }
}

//! Path parsing and scheme routing.
//!
//! Remote paths follow `sh://[user@]host[:flags]/path`, where the flags
//! suffix is `C` for a compressed connection, `r` to use `rsh` instead
//! of `ssh`, or a decimal SSH port. Anything without a recognized
//! `<scheme>://` prefix belongs to the local filesystem.

use crate::error::{VfsError, VfsResult};

/// How to reach a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFlavor {
    Ssh,
    SshCompressed,
    Rsh,
    Port(u16),
}

/// Identity of one shell connection: host, user and transport flavor.
/// Two paths resolve to the same live connection exactly when all three
/// match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSpec {
    pub host: String,
    pub user: Option<String>,
    pub flavor: HostFlavor,
}

impl ConnectSpec {
    /// The username the connection will actually run as: the explicit
    /// one from the URL, else the local login name.
    #[must_use]
    pub fn effective_user(&self) -> String {
        self.user.clone().unwrap_or_else(local_username)
    }

    /// Identity predicate: host, effective user and flavor must all
    /// match.
    #[must_use]
    pub fn same_session(&self, other: &ConnectSpec) -> bool {
        self.host == other.host
            && self.effective_user() == other.effective_user()
            && self.flavor == other.flavor
    }

    /// Render back to URL form (`sh://user@host:flags/`), used for
    /// display names and connection enumeration.
    #[must_use]
    pub fn display_name(&self, prefix: &str) -> String {
        let flags = match self.flavor {
            HostFlavor::Ssh => String::new(),
            HostFlavor::SshCompressed => ":C".to_string(),
            HostFlavor::Rsh => ":r".to_string(),
            HostFlavor::Port(port) => format!(":{port}"),
        };
        format!("{prefix}://{}@{}{}/", self.effective_user(), self.host, flags)
    }
}

/// What a path resolved to before superblock lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    /// The local filesystem; there is exactly one such mount.
    Local,
    /// A remote shell connection.
    Network(ConnectSpec),
}

/// Split a leading `<token>://` scheme prefix off a path.
///
/// Returns `None` when the path has no such prefix (a local path). The
/// token itself is matched against backends by their `which` predicate.
#[must_use]
pub fn split_scheme(path: &str) -> Option<(&str, &str)> {
    let (token, rest) = path.split_once("://")?;
    if token.is_empty()
        || !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+')
    {
        return None;
    }
    Some((token, rest))
}

/// Scheme-token predicate shared by backends: exact equality, or the
/// prefix followed by `+` (the "no archive required" variant marker).
#[must_use]
pub fn token_matches(prefix: &str, token: &str) -> bool {
    token == prefix
        || (token.len() == prefix.len() + 1 && token.starts_with(prefix) && token.ends_with('+'))
}

/// Parse the remainder of a network URL after the scheme:
/// `[user@]host[:flags][/path]`.
pub fn parse_network_url(rest: &str) -> VfsResult<(ConnectSpec, String)> {
    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, ""),
    };

    let (user, hostpart) = match authority.rsplit_once('@') {
        Some((user, host)) => (Some(user), host),
        None => (None, authority),
    };

    let (host, flavor) = match hostpart.rsplit_once(':') {
        Some((host, flags)) => (host, parse_flags(flags)?),
        None => (hostpart, HostFlavor::Ssh),
    };

    if host.is_empty() {
        return Err(VfsError::Invalid(format!("missing host in '{rest}'")));
    }
    if let Some(user) = user
        && user.is_empty()
    {
        return Err(VfsError::Invalid(format!("empty user in '{rest}'")));
    }

    let spec = ConnectSpec {
        host: host.to_string(),
        user: user.map(str::to_string),
        flavor,
    };
    Ok((spec, canonicalize(path)))
}

fn parse_flags(flags: &str) -> VfsResult<HostFlavor> {
    match flags {
        "" => Ok(HostFlavor::Ssh),
        "C" => Ok(HostFlavor::SshCompressed),
        "r" => Ok(HostFlavor::Rsh),
        digits if digits.chars().all(|c| c.is_ascii_digit()) => {
            let port: u16 = digits
                .parse()
                .map_err(|_| VfsError::Invalid(format!("port out of range: '{digits}'")))?;
            Ok(HostFlavor::Port(port))
        }
        other => Err(VfsError::Invalid(format!("unknown connection flags: '{other}'"))),
    }
}

/// Collapse repeated separators and `.` components. `..` is left in
/// place; the cache walk resolves it against the tree so symlinked
/// parents behave correctly.
#[must_use]
pub fn canonicalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    parts.join("/")
}

/// Split a canonical in-mount path into directory and basename.
#[must_use]
pub fn split_dir_name(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    }
}

fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "nobody".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("sh://host/a"), Some(("sh", "host/a")));
        assert_eq!(split_scheme("tar+://x"), Some(("tar+", "x")));
        assert_eq!(split_scheme("/usr/bin"), None);
        assert_eq!(split_scheme("://x"), None);
        assert_eq!(split_scheme("weird scheme://x"), None);
    }

    #[test]
    fn test_token_matches_plus_variant() {
        assert!(token_matches("sh", "sh"));
        assert!(token_matches("sh", "sh+"));
        assert!(!token_matches("sh", "shell"));
        assert!(!token_matches("sh", "s"));
        assert!(!token_matches("sh", "sh++"));
    }

    #[test]
    fn test_parse_plain_host() {
        let (spec, path) = parse_network_url("box/etc/hosts").unwrap();
        assert_eq!(spec.host, "box");
        assert_eq!(spec.user, None);
        assert_eq!(spec.flavor, HostFlavor::Ssh);
        assert_eq!(path, "etc/hosts");
    }

    #[test]
    fn test_parse_user_and_flags() {
        let (spec, path) = parse_network_url("alice@box:C/srv").unwrap();
        assert_eq!(spec.user.as_deref(), Some("alice"));
        assert_eq!(spec.flavor, HostFlavor::SshCompressed);
        assert_eq!(path, "srv");

        let (spec, _) = parse_network_url("bob@box:r/").unwrap();
        assert_eq!(spec.flavor, HostFlavor::Rsh);

        let (spec, path) = parse_network_url("box:2222").unwrap();
        assert_eq!(spec.flavor, HostFlavor::Port(2222));
        assert_eq!(path, "");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_network_url("/only/path").is_err());
        assert!(parse_network_url("box:zz/a").is_err());
        assert!(parse_network_url("box:99999/a").is_err());
        assert!(parse_network_url("@box/a").is_err());
    }

    #[test]
    fn test_identity_includes_port() {
        let (a, _) = parse_network_url("alice@box/").unwrap();
        let (b, _) = parse_network_url("alice@box/other").unwrap();
        let (c, _) = parse_network_url("alice@box:2222/").unwrap();
        assert!(a.same_session(&b));
        assert!(!a.same_session(&c));
    }

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("a//b/./c/"), "a/b/c");
        assert_eq!(canonicalize("./x"), "x");
        assert_eq!(canonicalize(""), "");
        // '..' is resolved by the tree walk, not here
        assert_eq!(canonicalize("a/../b"), "a/../b");
    }

    #[test]
    fn test_split_dir_name() {
        assert_eq!(split_dir_name("a/b/c.txt"), ("a/b", "c.txt"));
        assert_eq!(split_dir_name("c.txt"), ("", "c.txt"));
    }

    #[test]
    fn test_display_name() {
        let (spec, _) = parse_network_url("alice@box:2222/x").unwrap();
        assert_eq!(spec.display_name("sh"), "sh://alice@box:2222/");
    }
}

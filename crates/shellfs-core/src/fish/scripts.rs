//! Remote shell scripts for each FISH operation.
//!
//! Every operation runs a small `/bin/sh` script on the remote side.
//! Scripts reference their arguments through `${FISH_*}` variables that
//! the client prepends as assignments; the values substituted into
//! those assignments are always pre-escaped [`Quoted`] strings — the
//! template layer has no entry point that takes a raw caller string.
//!
//! A script may be overridden per host by a file under
//! `<config_dir>/fish/<hostname>/<script-name>`; otherwise the
//! compiled-in default is used.

use std::path::Path;

use tracing::debug;

use crate::escape::Quoted;

/// Remote capability bits reported by the `info` probe.
pub const HAVE_HEAD: u32 = 1;
pub const HAVE_SED: u32 = 2;
pub const HAVE_AWK: u32 = 4;
pub const HAVE_PERL: u32 = 8;
pub const HAVE_LSQ: u32 = 16;
pub const HAVE_DATE_MDYT: u32 = 32;
pub const HAVE_TAIL: u32 = 64;

const LS_DEF: &str = "#LIST /${FISH_FILENAME}\n\
export LC_TIME=C\n\
ls -Qlan \"/${FISH_FILENAME}\" 2>/dev/null | grep '^[^cbt]' | (\n\
while read p l u g s m d y n; do\n\
    echo \"P$p $u.$g\"\n\
    echo \"S$s\"\n\
    echo \"d$m $d $y\"\n\
    echo \":$n\"\n\
    echo\n\
done\n\
)\n\
ls -Qlan \"/${FISH_FILENAME}\" 2>/dev/null | grep '^[cb]' | (\n\
while read p l u g a i m d y n; do\n\
    echo \"P$p $u.$g\"\n\
    echo \"E$a$i\"\n\
    echo \"d$m $d $y\"\n\
    echo \":$n\"\n\
    echo\n\
done\n\
)\n\
echo \"### 200\"\n";

const EXISTS_DEF: &str = "#ISEXISTS $FISH_FILENAME\n\
ls -l \"/${FISH_FILENAME}\" >/dev/null 2>/dev/null\n\
echo '### '$?\n";

const MKDIR_DEF: &str = "#MKD $FISH_FILENAME\n\
if mkdir \"/${FISH_FILENAME}\" 2>/dev/null; then\n\
    echo \"### 000\"\n\
else\n\
    echo \"### 500\"\n\
fi\n";

const UNLINK_DEF: &str = "#DELE $FISH_FILENAME\n\
if rm -f \"/${FISH_FILENAME}\" 2>/dev/null; then\n\
    echo \"### 000\"\n\
else\n\
    echo \"### 500\"\n\
fi\n";

const CHOWN_DEF: &str = "#CHOWN $FISH_FILEOWNER:$FISH_FILEGROUP $FISH_FILENAME\n\
if chown ${FISH_FILEOWNER}:${FISH_FILEGROUP} \"/${FISH_FILENAME}\"; then\n\
    echo \"### 000\"\n\
else\n\
    echo \"### 500\"\n\
fi\n";

const CHMOD_DEF: &str = "#CHMOD $FISH_FILEMODE $FISH_FILENAME\n\
if chmod ${FISH_FILEMODE} \"/${FISH_FILENAME}\" 2>/dev/null; then\n\
    echo \"### 000\"\n\
else\n\
    echo \"### 500\"\n\
fi\n";

const UTIME_DEF: &str = "#UTIME \"$FISH_TOUCHATIME_W_NSEC\" \"$FISH_TOUCHMTIME_W_NSEC\" $FISH_FILENAME\n\
if TZ=UTC touch -m -d \"$FISH_TOUCHMTIME_W_NSEC\" \"/${FISH_FILENAME}\" 2>/dev/null && \\\n\
   TZ=UTC touch -a -d \"$FISH_TOUCHATIME_W_NSEC\" \"/${FISH_FILENAME}\" 2>/dev/null; then\n\
  echo \"### 000\"\n\
elif TZ=UTC touch -m -t $FISH_TOUCHMTIME \"/${FISH_FILENAME}\" 2>/dev/null && \\\n\
     TZ=UTC touch -a -t $FISH_TOUCHATIME \"/${FISH_FILENAME}\" 2>/dev/null; then\n\
  echo \"### 000\"\n\
elif [ -n \"$FISH_HAVE_PERL\" ] && \\\n\
   perl -e 'utime '$FISH_FILEATIME','$FISH_FILEMTIME',@ARGV;' \"/${FISH_FILENAME}\" 2>/dev/null; then\n\
  echo \"### 000\"\n\
else\n\
  echo \"### 500\"\n\
fi\n";

const RMDIR_DEF: &str = "#RMD $FISH_FILENAME\n\
if rmdir \"/${FISH_FILENAME}\" 2>/dev/null; then\n\
   echo \"### 000\"\n\
else\n\
   echo \"### 500\"\n\
fi\n";

const LN_DEF: &str = "#SYMLINK $FISH_FILEFROM $FISH_FILETO\n\
if ln -s \"${FISH_FILEFROM}\" \"/${FISH_FILETO}\" 2>/dev/null; then\n\
   echo \"### 000\"\n\
else\n\
   echo \"### 500\"\n\
fi\n";

const MV_DEF: &str = "#RENAME $FISH_FILEFROM $FISH_FILETO\n\
if mv \"/${FISH_FILEFROM}\" \"/${FISH_FILETO}\" 2>/dev/null; then\n\
   echo \"### 000\"\n\
else\n\
   echo \"### 500\"\n\
fi\n";

const HARDLINK_DEF: &str = "#LINK $FISH_FILEFROM $FISH_FILETO\n\
if ln \"/${FISH_FILEFROM}\" \"/${FISH_FILETO}\" 2>/dev/null; then\n\
   echo \"### 000\"\n\
else\n\
   echo \"### 500\"\n\
fi\n";

const GET_DEF: &str = "export LC_TIME=C\n\
#RETR $FISH_FILENAME\n\
if dd if=\"/${FISH_FILENAME}\" of=/dev/null bs=1 count=1 2>/dev/null ; then\n\
    ls -ln \"/${FISH_FILENAME}\" 2>/dev/null | (\n\
       read p l u g s r\n\
       echo $s\n\
    )\n\
    echo \"### 100\"\n\
    cat \"/${FISH_FILENAME}\"\n\
    echo \"### 200\"\n\
else\n\
    echo \"### 500\"\n\
fi\n";

const SEND_DEF: &str = "FILENAME=\"/${FISH_FILENAME}\"\n\
FILESIZE=${FISH_FILESIZE}\n\
#STOR $FILESIZE $FILENAME\n\
echo \"### 001\"\n\
{\n\
    while [ $FILESIZE -gt 0 ]; do\n\
        cnt=`expr \\( $FILESIZE + 255 \\) / 256`\n\
        n=`dd bs=256 count=$cnt | tee -a \"${FILENAME}\" | wc -c`\n\
        FILESIZE=`expr $FILESIZE - $n`\n\
    done\n\
}; echo \"### 200\"\n";

const APPEND_DEF: &str = "FILENAME=\"/${FISH_FILENAME}\"\n\
FILESIZE=${FISH_FILESIZE}\n\
#APPE $FILESIZE $FILENAME\n\
echo \"### 001\"\n\
res=`exec 3>&1\n\
(\n\
    head -c $FILESIZE -q - || echo DD >&3\n\
) 2>/dev/null | (\n\
    cat > \"${FILENAME}\"\n\
    cat > /dev/null\n\
)`; [ \"$res\" = DD ] && {\n\
    > \"${FILENAME}\"\n\
    while [ $FILESIZE -gt 0 ]\n\
    do\n\
       cnt=`expr \\( $FILESIZE + 255 \\) / 256`\n\
       n=`dd bs=256 count=$cnt | tee -a \"${FILENAME}\" | wc -c`\n\
       FILESIZE=`expr $FILESIZE - $n`\n\
    done\n\
}; echo \"### 200\"\n";

const INFO_DEF: &str = "export LC_TIME=C\n\
res=0\n\
if `echo yes| head -c 1 > /dev/null 2>&1` ; then\n\
    res=`expr $res + 1`\n\
fi\n\
if `sed --version >/dev/null 2>&1` ; then\n\
    res=`expr $res + 2`\n\
fi\n\
if `awk --version > /dev/null 2>&1` ; then\n\
    res=`expr $res + 4`\n\
fi\n\
if `perl -v > /dev/null 2>&1` ; then\n\
    res=`expr $res + 8`\n\
fi\n\
if `ls -Q / >/dev/null 2>&1` ; then\n\
    res=`expr $res + 16`\n\
fi\n\
dat=`ls -lan / 2>/dev/null | head -n 3 | tail -n 1 | (\n\
    while read p l u g s rec; do\n\
        if [ -n \"$g\" ]; then\n\
            if [ -n \"$l\" ]; then\n\
                echo \"$rec\"\n\
            fi\n\
        fi\n\
    done\n\
) | cut -c1 2>/dev/null`\n\
r=`echo \"0123456789\"| grep \"$dat\"`\n\
if [ -z \"$r\" ]; then\n\
    res=`expr $res + 32`\n\
fi\n\
if `echo yes| tail -c +1 - > /dev/null 2>&1` ; then\n\
    res=`expr $res + 64`\n\
fi\n\
echo $res\n\
echo \"### 200\"\n";

/// The scripts one connection uses, resolved once at connect time.
#[derive(Debug, Clone)]
pub struct ScriptSet {
    pub ls: String,
    pub exists: String,
    pub mkdir: String,
    pub unlink: String,
    pub chown: String,
    pub chmod: String,
    pub utime: String,
    pub rmdir: String,
    pub ln: String,
    pub mv: String,
    pub hardlink: String,
    pub get: String,
    pub send: String,
    pub append: String,
    pub info: String,
}

impl ScriptSet {
    /// Resolve every script for `hostname`, preferring per-host override
    /// files under `config_dir` and falling back to the compiled-in
    /// defaults. Missing or unreadable override files are silently
    /// skipped.
    #[must_use]
    pub fn load(config_dir: Option<&Path>, hostname: &str) -> Self {
        let pick = |name: &str, def: &str| load_script(config_dir, hostname, name, def);
        Self {
            ls: pick("ls", LS_DEF),
            exists: pick("exists", EXISTS_DEF),
            mkdir: pick("mkdir", MKDIR_DEF),
            unlink: pick("unlink", UNLINK_DEF),
            chown: pick("chown", CHOWN_DEF),
            chmod: pick("chmod", CHMOD_DEF),
            utime: pick("utime", UTIME_DEF),
            rmdir: pick("rmdir", RMDIR_DEF),
            ln: pick("ln", LN_DEF),
            mv: pick("mv", MV_DEF),
            hardlink: pick("hardlink", HARDLINK_DEF),
            get: pick("get", GET_DEF),
            send: pick("send", SEND_DEF),
            append: pick("append", APPEND_DEF),
            info: pick("info", INFO_DEF),
        }
    }
}

fn load_script(config_dir: Option<&Path>, hostname: &str, name: &str, def: &str) -> String {
    if let Some(dir) = config_dir {
        let path = dir.join("fish").join(hostname).join(name);
        if let Ok(content) = std::fs::read_to_string(&path) {
            debug!(script = name, path = %path.display(), "using per-host script override");
            return content;
        }
    }
    def.to_string()
}

/// Render the cached environment-flags prefix for a capability bitmask:
/// one `NAME=1 export NAME; ` clause per detected tool.
#[must_use]
pub fn env_prefix(flags: u32) -> String {
    let known = [
        (HAVE_HEAD, "FISH_HAVE_HEAD"),
        (HAVE_SED, "FISH_HAVE_SED"),
        (HAVE_AWK, "FISH_HAVE_AWK"),
        (HAVE_PERL, "FISH_HAVE_PERL"),
        (HAVE_LSQ, "FISH_HAVE_LSQ"),
        (HAVE_DATE_MDYT, "FISH_HAVE_DATE_MDYT"),
        (HAVE_TAIL, "FISH_HAVE_TAIL"),
    ];
    let mut out = String::new();
    for (bit, name) in known {
        if flags & bit != 0 {
            out.push_str(name);
            out.push_str("=1 export ");
            out.push_str(name);
            out.push_str("; ");
        }
    }
    out
}

/// Assemble one command: environment prefix, variable assignments with
/// pre-escaped values, then the script body.
#[must_use]
pub fn render_command(env: &str, vars: &[(&str, Quoted)], script: &str) -> String {
    let mut cmd = String::with_capacity(env.len() + script.len() + 64);
    cmd.push_str(env);
    if !vars.is_empty() {
        for (index, (name, value)) in vars.iter().enumerate() {
            if index > 0 {
                cmd.push(' ');
            }
            cmd.push_str(name);
            cmd.push('=');
            cmd.push_str(value.as_str());
        }
        cmd.push_str(";\n");
    }
    cmd.push_str(script);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::shell_escape;

    #[test]
    fn test_env_prefix_bits() {
        assert_eq!(env_prefix(0), "");
        assert_eq!(env_prefix(HAVE_HEAD), "FISH_HAVE_HEAD=1 export FISH_HAVE_HEAD; ");
        let both = env_prefix(HAVE_SED | HAVE_TAIL);
        assert!(both.contains("FISH_HAVE_SED=1"));
        assert!(both.contains("FISH_HAVE_TAIL=1"));
        assert!(!both.contains("FISH_HAVE_AWK"));
    }

    #[test]
    fn test_render_command_shape() {
        let name = shell_escape("a file.txt");
        let cmd = render_command(
            "FISH_HAVE_HEAD=1 export FISH_HAVE_HEAD; ",
            &[("FISH_FILENAME", name), ("FISH_FILESIZE", Quoted::number(9))],
            "#STOR\n",
        );
        assert_eq!(
            cmd,
            "FISH_HAVE_HEAD=1 export FISH_HAVE_HEAD; FISH_FILENAME=a\\ file.txt FISH_FILESIZE=9;\n#STOR\n"
        );
    }

    #[test]
    fn test_render_command_without_vars() {
        assert_eq!(render_command("", &[], "pwd; echo '### 200'\n"), "pwd; echo '### 200'\n");
    }

    #[test]
    fn test_script_override_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let host_dir = dir.path().join("fish").join("box");
        std::fs::create_dir_all(&host_dir).unwrap();
        std::fs::write(host_dir.join("mkdir"), "custom mkdir\n").unwrap();

        let set = ScriptSet::load(Some(dir.path()), "box");
        assert_eq!(set.mkdir, "custom mkdir\n");
        // everything else falls back to the default
        assert_eq!(set.rmdir, RMDIR_DEF);

        let other = ScriptSet::load(Some(dir.path()), "otherhost");
        assert_eq!(other.mkdir, MKDIR_DEF);
    }

    #[test]
    fn test_defaults_end_with_marker_line() {
        for script in [
            LS_DEF, EXISTS_DEF, MKDIR_DEF, UNLINK_DEF, CHOWN_DEF, CHMOD_DEF, UTIME_DEF,
            RMDIR_DEF, LN_DEF, MV_DEF, HARDLINK_DEF, GET_DEF, SEND_DEF, APPEND_DEF, INFO_DEF,
        ] {
            assert!(script.contains("### "), "script lacks a reply marker: {script}");
            assert!(script.ends_with('\n'));
        }
    }
}

//! Invocation of external utilities.
//!
//! Every utility the tool spawns is listed in a static allow-list mapping its
//! logical name to an absolute path. Output is captured with stdout and
//! stderr combined, matching what an operator would see on a terminal. The
//! runner never interprets output; parsing is up to the caller.

use std::cell::RefCell;
use std::process::Command;

use crate::error::{Result, ToolError};

/// Allow-list of external utilities, sorted by logical name.
static UTILITIES: &[(&str, &str)] = &[
    ("blkid", "/usr/sbin/blkid"),
    ("bootctl", "/usr/bin/bootctl"),
    ("chpasswd", "/usr/sbin/chpasswd"),
    ("chroot", "/usr/sbin/chroot"),
    ("cp", "/usr/bin/cp"),
    ("cryptsetup", "/usr/sbin/cryptsetup"),
    ("dd", "/usr/bin/dd"),
    ("dmsetup", "/usr/sbin/dmsetup"),
    ("e2fsck", "/usr/sbin/e2fsck"),
    ("losetup", "/usr/sbin/losetup"),
    ("lsblk", "/usr/bin/lsblk"),
    ("mkfs.ext4", "/usr/sbin/mkfs.ext4"),
    ("mkfs.vfat", "/usr/sbin/mkfs.vfat"),
    ("mount", "/usr/bin/mount"),
    ("setfiles", "/usr/sbin/setfiles"),
    ("sfdisk", "/usr/sbin/sfdisk"),
    ("sh", "/usr/bin/sh"),
    ("sync", "/usr/bin/sync"),
    ("tune2fs", "/usr/sbin/tune2fs"),
    ("umount", "/usr/bin/umount"),
    ("useradd", "/usr/sbin/useradd"),
    ("usermod", "/usr/sbin/usermod"),
    ("veritysetup", "/usr/sbin/veritysetup"),
    ("xz", "/usr/bin/xz"),
];

/// Resolve a logical utility name against the allow-list.
pub fn resolve(name: &str) -> Result<&'static str> {
    UTILITIES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, path)| *path)
        .ok_or_else(|| ToolError::UnknownUtility(name.to_owned()))
}

/// Capability to run an allow-listed utility.
pub trait Runner {
    /// Run `utility` with `args`, returning the combined stdout and stderr.
    fn run(&self, utility: &str, args: &[&str]) -> Result<String>;
}

/// Runner spawning the real utilities by absolute path.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, utility: &str, args: &[&str]) -> Result<String> {
        let path = resolve(utility)?;
        let output = Command::new(path).args(args).output()?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(combined)
        } else {
            Err(ToolError::UtilityFailed {
                name: utility.to_owned(),
                args: args.iter().map(|arg| (*arg).to_owned()).collect(),
                output: combined,
                status: output.status.code().unwrap_or(-1),
            })
        }
    }
}

/// Runner backed by a closure, recording every invocation.
///
/// Test double for [`SystemRunner`]. The closure maps an invocation to the
/// combined output, or to the output of a failed invocation.
pub struct FakeRunner {
    #[allow(clippy::type_complexity)]
    handler: Box<dyn Fn(&str, &[&str]) -> std::result::Result<String, String>>,
    calls: RefCell<Vec<(String, Vec<String>)>>,
}

impl FakeRunner {
    pub fn new(
        handler: impl Fn(&str, &[&str]) -> std::result::Result<String, String> + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// All recorded invocations, in order.
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.borrow().clone()
    }

    /// Argument vectors of the recorded invocations of `utility`.
    pub fn invocations_of(&self, utility: &str) -> Vec<Vec<String>> {
        self.calls
            .borrow()
            .iter()
            .filter(|(name, _)| name == utility)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

impl Runner for FakeRunner {
    fn run(&self, utility: &str, args: &[&str]) -> Result<String> {
        // The allow-list applies to fakes too.
        resolve(utility)?;
        let args: Vec<String> = args.iter().map(|arg| (*arg).to_owned()).collect();
        self.calls
            .borrow_mut()
            .push((utility.to_owned(), args.clone()));
        (self.handler)(utility, &args.iter().map(String::as_str).collect::<Vec<_>>()).map_err(
            |output| ToolError::UtilityFailed {
                name: utility.to_owned(),
                args,
                output,
                status: 1,
            },
        )
    }
}

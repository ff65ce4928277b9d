use camino::{Utf8Path, Utf8PathBuf};

use crate::cmd::Runner;
use crate::error::Result;

/// A mounted filesystem which is lazily unmounted when dropped.
pub struct Mounted<'r> {
    runner: &'r dyn Runner,
    path: Option<Utf8PathBuf>,
}

impl<'r> Mounted<'r> {
    pub fn mount(runner: &'r dyn Runner, dev: &str, dst: impl AsRef<Utf8Path>) -> Result<Self> {
        let dst = dst.as_ref();
        runner.run("mount", &[dev, dst.as_str()])?;
        Ok(Mounted {
            runner,
            path: Some(dst.to_owned()),
        })
    }

    pub fn mount_read_only(
        runner: &'r dyn Runner,
        dev: &str,
        dst: impl AsRef<Utf8Path>,
    ) -> Result<Self> {
        let dst = dst.as_ref();
        runner.run("mount", &["-o", "ro", dev, dst.as_str()])?;
        Ok(Mounted {
            runner,
            path: Some(dst.to_owned()),
        })
    }

    pub fn bind(runner: &'r dyn Runner, src: &str, dst: impl AsRef<Utf8Path>) -> Result<Self> {
        let dst = dst.as_ref();
        runner.run("mount", &["--bind", src, dst.as_str()])?;
        Ok(Mounted {
            runner,
            path: Some(dst.to_owned()),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        self.path.as_deref().expect("mount handle already consumed")
    }

    /// Unmount now instead of on drop, surfacing any failure.
    pub fn unmount(mut self) -> Result<()> {
        let path = self.path.take().expect("mount handle already consumed");
        self.runner.run("umount", &["-l", path.as_str()])?;
        Ok(())
    }
}

impl Drop for Mounted<'_> {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.runner.run("umount", &["-l", path.as_str()]).ok();
        }
    }
}

/// Ordered stack of mounts, released in reverse acquisition order.
pub struct MountStack<'r> {
    mounts: Vec<Mounted<'r>>,
}

impl<'r> MountStack<'r> {
    pub fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    pub fn push(&mut self, mounted: Mounted<'r>) {
        self.mounts.push(mounted);
    }

    /// Unmount everything, last mount first.
    pub fn unmount_all(&mut self) -> Result<()> {
        while let Some(mounted) = self.mounts.pop() {
            mounted.unmount()?;
        }
        Ok(())
    }
}

impl Default for MountStack<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MountStack<'_> {
    fn drop(&mut self) {
        while let Some(mounted) = self.mounts.pop() {
            drop(mounted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::FakeRunner;

    fn ok_runner() -> FakeRunner {
        FakeRunner::new(|_, _| Ok(String::new()))
    }

    #[test]
    fn test_mount_unmounts_on_drop() {
        let runner = ok_runner();
        {
            let _mounted = Mounted::mount(&runner, "/dev/sda6", "/mnt/dest").unwrap();
        }
        assert_eq!(
            runner.calls(),
            vec![
                (
                    "mount".to_owned(),
                    vec!["/dev/sda6".to_owned(), "/mnt/dest".to_owned()]
                ),
                (
                    "umount".to_owned(),
                    vec!["-l".to_owned(), "/mnt/dest".to_owned()]
                ),
            ]
        );
    }

    #[test]
    fn test_explicit_unmount_is_not_repeated_on_drop() {
        let runner = ok_runner();
        let mounted = Mounted::mount_read_only(&runner, "/dev/loop0p1", "/mnt/src").unwrap();
        mounted.unmount().unwrap();
        assert_eq!(runner.invocations_of("umount").len(), 1);
    }

    #[test]
    fn test_mount_stack_releases_in_reverse_order() {
        let runner = ok_runner();
        let mut stack = MountStack::new();
        stack.push(Mounted::mount(&runner, "/dev/sda2", "/mnt/first").unwrap());
        stack.push(Mounted::mount(&runner, "/dev/sda6", "/mnt/second").unwrap());
        stack.unmount_all().unwrap();
        let unmounts = runner.invocations_of("umount");
        assert_eq!(unmounts[0][1], "/mnt/second");
        assert_eq!(unmounts[1][1], "/mnt/first");
    }
}

use camino::{Utf8Path, Utf8PathBuf};

use crate::cmd::Runner;
use crate::error::Result;

/// A loop device with an attached image, detached when dropped.
pub struct LoopDevice<'r> {
    runner: &'r dyn Runner,
    path: Utf8PathBuf,
}

impl<'r> LoopDevice<'r> {
    /// Attach an image to the next free loop device, scanning partitions.
    pub fn attach(runner: &'r dyn Runner, image: &Utf8Path) -> Result<Self> {
        let output = runner.run("losetup", &["--find", "--show", "-P", image.as_str()])?;
        Ok(LoopDevice {
            runner,
            path: output.trim().into(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Device path of the `part`-th partition of the attached image.
    pub fn partition(&self, part: usize) -> String {
        format!("{}p{}", self.path, part)
    }
}

impl Drop for LoopDevice<'_> {
    fn drop(&mut self) {
        // Detach the loop device and ignore any errors.
        self.runner.run("losetup", &["-d", self.path.as_str()]).ok();
    }
}

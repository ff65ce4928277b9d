//! The `write` pipeline: verify, decompress, loop-mount, and copy an update
//! image onto the inactive slot.
//!
//! Every acquired resource (loop attachment, mount, work area) is held in an
//! RAII handle; drop order releases them in reverse acquisition order on
//! every exit path, including early error returns.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use indoc::formatdoc;
use os_update_common::cmd::Runner;
use os_update_common::decompress::decompress_image;
use os_update_common::error::{Result, ToolError};
use os_update_common::fsutils::{self, WorkArea};
use os_update_common::loop_dev::LoopDevice;
use os_update_common::mount::{MountStack, Mounted};
use os_update_common::stream_hasher;
use tracing::{info, warn};

use crate::boot::UkiStore;
use crate::system::blkdev;
use crate::system::protection::Protection;
use crate::system::uki;

/// Base directory of the per-invocation work area.
const WORK_AREA_BASE: &str = "/opt/OS/abupdate";
/// Onboarding state carried over onto the freshly written slot.
const HOSTNAME_FILE: &str = "/etc/hostname";
/// Development login provisioned with `--dev`.
const DEV_USER: &str = "user";
/// Preset crypted password of the development login.
const DEV_PASSWORD_HASH: &str = "$6$BTZupwxuptVcnJ2q$aKz3z0XxjPW0EI7r90/xfgMH.2J5dNB9V2jPbFPu0.NwioQh66VmyjVrG2uQuJnUu2d3MSvHqUiqGdU0VxFKA0";

pub struct Installer<'r> {
    runner: &'r dyn Runner,
    work_base: Utf8PathBuf,
    uki_store: UkiStore,
    hostname_file: Utf8PathBuf,
}

impl<'r> Installer<'r> {
    pub fn new(runner: &'r dyn Runner) -> Self {
        Self {
            runner,
            work_base: WORK_AREA_BASE.into(),
            uki_store: UkiStore::default(),
            hostname_file: HOSTNAME_FILE.into(),
        }
    }

    /// Installer with overridden locations (used by tests).
    pub fn with_paths(
        runner: &'r dyn Runner,
        work_base: impl Into<Utf8PathBuf>,
        uki_store: UkiStore,
        hostname_file: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            runner,
            work_base: work_base.into(),
            uki_store,
            hostname_file: hostname_file.into(),
        }
    }

    /// Run the full write pipeline against the inactive slot.
    pub fn write(&self, image: &Utf8Path, checksum: &str, dev_mode: bool) -> Result<()> {
        if dev_mode {
            info!("development mode is active");
        }
        let target = blkdev::get_target_partition(self.runner)?;
        match blkdev::get_active_partition(self.runner) {
            Ok(active) => info!("current boot partition: {active}"),
            Err(error) => warn!("unable to resolve the active partition: {error}"),
        }
        info!("writing {image} to {target}");

        self.verify_checksum(image, checksum)?;
        info!("checksum verification successful");

        let protection = Protection::detect(self.runner);
        let work_area = WorkArea::create(&self.work_base)?;
        let raw_image = decompress_image(self.runner, work_area.dir(), image)?;
        info!("decompressed image: {raw_image}");

        let loop_device = LoopDevice::attach(self.runner, &raw_image)?;
        info!("attached image to {}", loop_device.path());

        let source_boot_dir = work_area.subdir("sourceBoot")?;
        let source_rootfs_dir = work_area.subdir("sourceRootfs")?;
        let dest_rootfs_dir = work_area.subdir("destRootfs")?;

        let mut mounts = MountStack::new();
        mounts.push(Mounted::mount_read_only(
            self.runner,
            &loop_device.partition(1),
            &source_boot_dir,
        )?);

        // Re-installing an identical image would shadow the active slot, so
        // the image's boot UUID must not be live anywhere but the target.
        let efi_source = fsutils::find_first_file(&source_boot_dir.join("EFI/Linux"))?;
        let boot_uuid = uki::uuid_from_uki(&efi_source)?;
        let target_block = blkdev::get_block_name(self.runner, &target)?;
        if let Some(carrier) = blkdev::find_partition_by_uuid(self.runner, &boot_uuid) {
            if carrier != target_block {
                info!("partition {carrier} already carries UUID {boot_uuid}");
                return Err(ToolError::DuplicateUuid {
                    device: carrier,
                    uuid: boot_uuid,
                });
            }
        }
        info!("update image differs from the live partitions, proceeding");

        mounts.push(Mounted::mount_read_only(
            self.runner,
            &loop_device.partition(2),
            &source_rootfs_dir,
        )?);
        let target_mount = Mounted::mount(self.runner, &target, &dest_rootfs_dir)?;

        self.copy_rootfs(&source_rootfs_dir, &dest_rootfs_dir)?;
        info!("rootfs written to {target}");

        self.copy_onboarding(&dest_rootfs_dir)?;
        self.uki_store.stage(self.runner, &efi_source)?;
        info!("staged UKI at {}", self.uki_store.staged_uki());

        // The metadata operations below need the slot unmounted.
        target_mount.unmount()?;

        if dev_mode {
            self.add_login(work_area.dir(), &target)?;
        }
        self.relabel_selinux(work_area.dir(), &target)?;
        protection.set_uuid(self.runner, &target, &boot_uuid)?;
        protection.build_hash_tree(self.runner, work_area.dir(), &target)?;
        self.runner.run("sync", &[])?;

        mounts.unmount_all()?;
        drop(loop_device);
        drop(work_area);
        info!("write completed for {target}");
        Ok(())
    }

    fn verify_checksum(&self, image: &Utf8Path, expected: &str) -> Result<()> {
        info!("verifying image checksum");
        let computed = stream_hasher::sha256_hex(image)?;
        if computed != expected.to_ascii_lowercase() {
            return Err(ToolError::ChecksumMismatch {
                expected: expected.to_owned(),
                computed,
            });
        }
        Ok(())
    }

    /// Refresh the target's contents from the source mount.
    fn copy_rootfs(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        clear_directory(target);
        self.runner.run("sync", &[])?;
        let copy = format!("cp -rp {source}/* {target}/");
        info!("executing: {copy}");
        if let Err(error) = self.runner.run("sh", &["-c", &copy]) {
            clear_directory(target);
            return Err(error);
        }
        Ok(())
    }

    /// Carry the live system's hostname onto the new rootfs.
    fn copy_onboarding(&self, target: &Utf8Path) -> Result<()> {
        let dest = target.join("etc/hostname");
        self.runner
            .run("cp", &["-r", self.hostname_file.as_str(), dest.as_str()])?;
        info!("onboarding state carried over");
        Ok(())
    }

    /// Provision the development login on the written slot.
    fn add_login(&self, work_dir: &Utf8Path, target: &str) -> Result<()> {
        let script = formatdoc! {r#"
            useradd -m -s /bin/bash "{DEV_USER}"
            echo '{DEV_USER}:{DEV_PASSWORD_HASH}' | chpasswd -e
            usermod -aG sudo "{DEV_USER}"
        "#};
        self.run_in_chroot(work_dir, target, &script)?;
        info!("development login `{DEV_USER}` provisioned");
        Ok(())
    }

    /// Restore SELinux labels on the written slot.
    fn relabel_selinux(&self, work_dir: &Utf8Path, target: &str) -> Result<()> {
        self.run_in_chroot(
            work_dir,
            target,
            "setfiles -m -v /etc/selinux/targeted/contexts/files/file_contexts /",
        )?;
        info!("SELinux relabeling completed");
        Ok(())
    }

    /// Mount the freshly written slot with the pseudo-filesystems bound and
    /// run a script inside a chroot of it.
    fn run_in_chroot(&self, work_dir: &Utf8Path, target: &str, script: &str) -> Result<()> {
        let chroot_dir = work_dir.join("abchroot");
        fsutils::create_secure_dir(&chroot_dir)?;
        let mut mounts = MountStack::new();
        mounts.push(Mounted::mount(self.runner, target, &chroot_dir)?);
        for pseudo in ["/dev", "/dev/pts", "/proc", "/sys"] {
            let dst = chroot_dir.join(pseudo.trim_start_matches('/'));
            mounts.push(Mounted::bind(self.runner, pseudo, &dst)?);
        }
        self.runner
            .run("chroot", &[chroot_dir.as_str(), "/bin/bash", "-c", script])?;
        mounts.unmount_all()?;
        fs::remove_dir_all(&chroot_dir)?;
        Ok(())
    }
}

/// Best-effort removal of a directory's top-level entries.
fn clear_directory(dir: &Utf8Path) {
    let Ok(entries) = dir.read_dir_utf8() else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        if let Err(error) = removed {
            warn!("unable to remove {path}: {error}");
        }
    }
}

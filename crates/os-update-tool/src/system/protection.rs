//! Classification of the disk-protection layout and the operations that
//! differ between the three modes.

use std::fs;

use camino::Utf8Path;
use os_update_common::cmd::Runner;
use os_update_common::error::{Result, ToolError};
use os_update_common::fsutils;
use os_update_common::mount::Mounted;
use tracing::{debug, info};

use crate::system::blkdev::{self, SLOT_INDEX_A, SLOT_INDEX_B};

/// Index of the dm-verity hash partition.
const VERITY_HASH_INDEX: &str = "7";
/// Index of the slot A hash mapping partition.
const VERITY_MAP_INDEX_A: &str = "4";
/// Index of the slot B hash mapping partition.
const VERITY_MAP_INDEX_B: &str = "5";

/// Disk-protection layout of the running system.
///
/// Derived once per invocation, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Plain,
    Verity,
    Encrypted,
}

impl Protection {
    /// Classify the live system. Encrypted takes precedence over verity.
    pub fn detect(runner: &dyn Runner) -> Self {
        if is_encrypted(runner) {
            Protection::Encrypted
        } else if is_verity(runner) {
            Protection::Verity
        } else {
            Protection::Plain
        }
    }

    /// Apply `uuid` to the target slot with the mode-appropriate utility.
    pub fn set_uuid(self, runner: &dyn Runner, target: &str, uuid: &str) -> Result<()> {
        match self {
            Protection::Encrypted => {
                // The LUKS container lives on the backing block device, not
                // on the opened mapper.
                let block = blkdev::get_block_name(runner, target)?;
                info!("setting LUKS UUID of {block}");
                runner.run(
                    "cryptsetup",
                    &["luksUUID", "--batch-mode", &block, "--uuid", uuid],
                )?;
            }
            Protection::Verity => {
                info!("setting filesystem UUID of {target}");
                runner.run("e2fsck", &["-f", "-y", target])?;
                runner.run("tune2fs", &["-U", uuid, target])?;
            }
            Protection::Plain => {
                let (base, index) = blkdev::split_partition_device(target).ok_or_else(|| {
                    ToolError::BadArguments(format!("{target} has no partition index"))
                })?;
                info!("setting partition UUID of {target}");
                runner.run("sfdisk", &["--part-uuid", &base, &index, uuid])?;
            }
        }
        Ok(())
    }

    /// Regenerate the dm-verity hash tree for the freshly written slot and
    /// publish the root hash on the hash-carrier partition.
    pub fn build_hash_tree(
        self,
        runner: &dyn Runner,
        work_dir: &Utf8Path,
        target: &str,
    ) -> Result<()> {
        if self == Protection::Plain {
            debug!("skipping hash tree: no block-integrity layer on {target}");
            return Ok(());
        }
        let hash_dir = work_dir.join("abroothash");
        fsutils::create_secure_dir(&hash_dir)?;
        match self {
            Protection::Encrypted => {
                let mounted = Mounted::mount(runner, "/dev/mapper/ver_roothash", &hash_dir)?;
                let device = target.rsplit('/').next().unwrap_or(target);
                let (source, map, roothash_file) = if device == "rootfs_b" {
                    (
                        "/dev/mapper/rootfs_b",
                        "/dev/mapper/root_b_ver_hash_map",
                        "part_b_roothash",
                    )
                } else {
                    (
                        "/dev/mapper/rootfs_a",
                        "/dev/mapper/root_a_ver_hash_map",
                        "part_a_roothash",
                    )
                };
                info!("formatting verity hash tree for {source}");
                let output = runner.run("veritysetup", &["format", source, map])?;
                fs::write(mounted.path().join(roothash_file), extract_root_hash(&output))?;
                mounted.unmount()?;
            }
            Protection::Verity => {
                let hash_part = blkdev::replace_device_index(target, VERITY_HASH_INDEX);
                let mounted = Mounted::mount(runner, &hash_part, &hash_dir)?;
                let (map_index, roothash_file) = match target.chars().last() {
                    Some(SLOT_INDEX_A) => (VERITY_MAP_INDEX_A, "part_a_roothash"),
                    Some(SLOT_INDEX_B) => (VERITY_MAP_INDEX_B, "part_b_roothash"),
                    _ => {
                        return Err(ToolError::BadArguments(format!(
                            "target {target} is not one of the rootfs slots"
                        )))
                    }
                };
                let map_part = blkdev::replace_device_index(target, map_index);
                info!("formatting verity hash tree for {target}");
                let output = runner.run("veritysetup", &["format", target, &map_part])?;
                fs::write(mounted.path().join(roothash_file), extract_root_hash(&output))?;
                mounted.unmount()?;
            }
            Protection::Plain => unreachable!("handled above"),
        }
        runner.run("sync", &[])?;
        fs::remove_dir_all(&hash_dir).ok();
        Ok(())
    }
}

/// Whether both rootfs mapper slots appear as crypt targets.
pub fn is_encrypted(runner: &dyn Runner) -> bool {
    let Ok(output) = runner.run("dmsetup", &["ls", "--target", "crypt"]) else {
        return false;
    };
    if output.contains("No devices found") || output.trim().is_empty() {
        return false;
    }
    output.contains("rootfs_a") && output.contains("rootfs_b")
}

/// Whether two or more block entries are mounted at `/` (the live rootfs
/// and its verity upper).
pub fn is_verity(runner: &dyn Runner) -> bool {
    let Ok(output) = runner.run("lsblk", &["-nr", "-o", "NAME,FSTYPE,MOUNTPOINT"]) else {
        return false;
    };
    output
        .lines()
        .filter(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            fields.len() >= 3 && fields[2] == "/"
        })
        .count()
        >= 2
}

/// Extract the hash from `veritysetup format`'s `Root hash:` line.
fn extract_root_hash(output: &str) -> &str {
    output
        .lines()
        .find(|line| line.contains("Root hash"))
        .and_then(|line| line.split_whitespace().nth(2))
        .unwrap_or("")
}

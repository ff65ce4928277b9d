//! Block-device inspection via `lsblk`.
//!
//! The inspectors parse the line-oriented `lsblk` listings. Child devices
//! show up behind tree-drawing characters, so column positions shift for
//! nested entries; the scanners track the last seen ancestor name while
//! walking the listing.

use std::io;

use os_update_common::cmd::Runner;
use os_update_common::error::{Result, ToolError};
use tracing::{debug, info, warn};

/// Partition-table index reserved for the slot A rootfs.
pub const SLOT_INDEX_A: char = '2';
/// Partition-table index reserved for the slot B rootfs.
pub const SLOT_INDEX_B: char = '6';

/// Check whether a device name's trailing digit is one of the two slots.
pub fn is_part_index_allowed(device: &str) -> bool {
    matches!(device.chars().last(), Some(SLOT_INDEX_A) | Some(SLOT_INDEX_B))
}

/// Strip tree-drawing characters from an `lsblk` name column.
fn clean_name(name: &str) -> &str {
    name.trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
}

/// Resolve the partition currently mounted as `/`.
///
/// For an encrypted system the mapper chain hangs off the slot partition, so
/// the last seen ancestor whose child is a `rootfs_*` mapper wins. For a
/// verity system the ancestor above the `rootfs_verity` device wins, but
/// only if it carries a slot index. A plain system is mounted directly.
pub fn get_active_partition(runner: &dyn Runner) -> Result<String> {
    let listing = runner.run("lsblk", &["-n", "-o", "NAME,FSTYPE,MOUNTPOINT"])?;
    let mut current_name = "";
    let mut current_subname = "";
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = fields.first() else {
            continue;
        };
        let name = clean_name(first);
        let subname = if fields.len() > 3 {
            clean_name(fields[1])
        } else {
            ""
        };
        let mountpoint = if fields.len() >= 2 {
            fields[fields.len() - 1]
        } else {
            ""
        };
        if mountpoint == "/" {
            if current_subname.starts_with("rootfs") {
                info!("active partition (encrypted): /dev/{current_name}");
                return Ok(format!("/dev/{current_name}"));
            }
            if name.contains("verity") || subname.contains("verity") {
                if !is_part_index_allowed(current_name) {
                    continue;
                }
                info!("active partition (verity): /dev/{current_name}");
                return Ok(format!("/dev/{current_name}"));
            }
            info!("active partition: /dev/{name}");
            return Ok(format!("/dev/{name}"));
        }
        // Mapper children sometimes render with the tree prefix attached to
        // the name column; those are sub-names, not ancestors.
        if !name.is_empty() {
            if name.starts_with("rootfs_") {
                current_subname = name;
            } else {
                current_name = name;
            }
        }
        if !subname.is_empty() {
            current_subname = subname;
        }
    }
    Err(ToolError::ActiveNotFound)
}

/// Resolve the inactive slot.
///
/// The encrypted, verity, and plain layouts are tried in that order; a
/// strategy that does not match the live topology is logged and skipped.
pub fn get_target_partition(runner: &dyn Runner) -> Result<String> {
    match encrypted_target(runner) {
        Ok(target) => {
            info!("target partition (encrypted): {target}");
            return Ok(target);
        }
        Err(error) => warn!("no encrypted target: {error}"),
    }
    match verity_target(runner) {
        Ok(target) => {
            info!("target partition (verity): {target}");
            return Ok(target);
        }
        Err(error) => warn!("no verity target: {error}"),
    }
    match plain_target(runner) {
        Ok(target) => {
            info!("target partition (plain): {target}");
            return Ok(target);
        }
        Err(error) => warn!("no plain target: {error}"),
    }
    Err(ToolError::TargetNotFound)
}

/// Inactive slot of an encrypted system.
///
/// A slot partition is labelled `rootfs*` and carries a `rootfs_a`/`rootfs_b`
/// crypt child; the child of the *active* slot is in turn covered by the
/// `rootfs_verity` device.
fn encrypted_target(runner: &dyn Runner) -> Result<String> {
    let listing = runner.run("lsblk", &["-o", "NAME,FSTYPE,PARTLABEL,MOUNTPOINT"])?;
    if !listing.contains("crypt") {
        return Err(ToolError::TargetNotFound);
    }
    let lines: Vec<&str> = listing.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || !is_part_index_allowed(fields[0]) {
            continue;
        }
        if !fields[2].starts_with("rootfs") {
            continue;
        }
        let Some(next) = lines.get(i + 1) else {
            continue;
        };
        let next_fields: Vec<&str> = next.split_whitespace().collect();
        if next_fields.len() < 2 || !next.contains("rootfs_") {
            continue;
        }
        if let Some(second) = lines.get(i + 2) {
            let second_fields: Vec<&str> = second.split_whitespace().collect();
            if second_fields.len() >= 2 && second_fields[1].contains("rootfs_verity") {
                // The verity child marks the active slot.
                continue;
            }
        }
        if let Some(mapper) = next_fields.iter().find(|field| field.contains("rootfs_")) {
            return Ok(format!("/dev/mapper/{}", clean_name(mapper)));
        }
    }
    Err(ToolError::TargetNotFound)
}

/// Inactive slot of a verity-only system.
fn verity_target(runner: &dyn Runner) -> Result<String> {
    let listing = runner.run("lsblk", &["-n", "-o", "NAME,FSTYPE,PARTLABEL,MOUNTPOINT"])?;
    if !listing.contains("rootfs_verity") {
        return Err(ToolError::TargetNotFound);
    }
    let lines: Vec<&str> = listing.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let part_label = fields.get(2).copied().unwrap_or("");
        let mountpoint = fields.get(3).copied().unwrap_or("");
        if !part_label.starts_with("rootfs") {
            continue;
        }
        let next_is_verity = lines
            .get(i + 1)
            .is_some_and(|next| next.contains("rootfs_verity"));
        if mountpoint == "/" || next_is_verity {
            // The live slot, or the slot backing the live verity device.
            continue;
        }
        if is_part_index_allowed(fields[0]) {
            debug!("valid target partition found: {}", fields[0]);
            return Ok(format!("/dev/{}", clean_name(fields[0])));
        }
    }
    Err(ToolError::TargetNotFound)
}

/// Inactive slot of a plain system: the first unmounted `rootfs` partition.
fn plain_target(runner: &dyn Runner) -> Result<String> {
    let listing = runner.run("lsblk", &["-o", "NAME,FSTYPE,PARTLABEL,MOUNTPOINT"])?;
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let mountpoint = fields.get(3).copied().unwrap_or("");
        if fields[2].starts_with("rootfs") && mountpoint.is_empty() {
            return Ok(format!("/dev/{}", clean_name(fields[0])));
        }
    }
    Err(ToolError::TargetNotFound)
}

/// Probe `blkid` for a partition carrying `uuid` in any of the three UUID
/// namespaces, ignoring loop devices.
pub fn find_partition_by_uuid(runner: &dyn Runner, uuid: &str) -> Option<String> {
    let probes = [
        format!("UUID={uuid}"),
        format!("PARTUUID={uuid}"),
        format!("TYPE=crypto_LUKS,UUID={uuid}"),
    ];
    let mut found = String::new();
    for probe in &probes {
        if let Ok(output) = runner.run("blkid", &["-o", "device", "-t", probe]) {
            if !output.trim().is_empty() {
                found = output.trim().to_owned();
            }
        }
    }
    found
        .lines()
        .map(str::trim)
        .find(|line| !line.starts_with("/dev/loop"))
        .map(str::to_owned)
}

/// Reduce a `rootfs_a`/`rootfs_b` mapper device to its backing partition.
///
/// Any other device is returned as-is.
pub fn get_block_name(runner: &dyn Runner, device: &str) -> Result<String> {
    if !device.contains("rootfs_a") && !device.contains("rootfs_b") {
        return Ok(device.to_owned());
    }
    let base = device.rsplit('/').next().unwrap_or(device);
    let listing = runner.run("lsblk", &["-n", "-o", "NAME,FSTYPE,MOUNTPOINT"])?;
    let mut block_name = "";
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let name = clean_name(fields[0]);
        let subname = if fields.len() > 2 {
            clean_name(fields[1])
        } else {
            ""
        };
        if name == base || subname == base {
            return Ok(format!("/dev/{block_name}"));
        }
        if !name.is_empty() && !name.starts_with("rootfs_") {
            block_name = name;
        }
    }
    Err(ToolError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no block parent found for {device}"),
    )))
}

/// Split a partition device into its disk device and partition number.
///
/// Keeps the `p` separator convention of NVMe-style names: `/dev/nvme0n1p2`
/// splits into `/dev/nvme0n1` and `2`.
pub fn split_partition_device(device: &str) -> Option<(String, String)> {
    let index_start = device.rfind(|c: char| !c.is_ascii_digit()).map(|i| i + 1)?;
    if index_start == device.len() {
        // No trailing partition number.
        return None;
    }
    let (mut base, index) = device.split_at(index_start);
    if let Some(stripped) = base.strip_suffix('p') {
        if stripped.ends_with(|c: char| c.is_ascii_digit()) {
            base = stripped;
        }
    }
    Some((base.to_owned(), index.to_owned()))
}

/// Replace the trailing partition index of a device name.
pub fn replace_device_index(device: &str, new_index: &str) -> String {
    format!(
        "{}{}",
        device.trim_end_matches(|c: char| c.is_ascii_digit()),
        new_index
    )
}

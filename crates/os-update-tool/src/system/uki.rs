//! Inspection of Unified Kernel Images and the bootloader's view of them.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use os_update_common::cmd::Runner;
use os_update_common::error::{Result, ToolError};
use os_update_common::uuid::validate_uuid;
use tracing::debug;

use crate::system::blkdev;

/// Length of a canonical 8-4-4-4-12 UUID.
const UUID_LEN: usize = 36;

/// Extract the boot-identifying UUID embedded in a UKI.
///
/// The kernel command line inside the image carries either a
/// `boot_uuid=<UUID>` or a `root=PARTUUID=<UUID>` option; the first hit
/// wins.
pub fn uuid_from_uki(uki: &Utf8Path) -> Result<String> {
    let contents = fs::read(uki)?;
    for needle in ["boot_uuid=", "PARTUUID="] {
        if let Some(uuid) = scan_for_uuid(&contents, needle) {
            debug!("found `{needle}` UUID {uuid} in {uki}");
            return Ok(uuid);
        }
    }
    Err(ToolError::UuidNotInUki(uki.to_string()))
}

/// Find `needle` in the raw image and validate the 36 bytes after it.
fn scan_for_uuid(contents: &[u8], needle: &str) -> Option<String> {
    let needle_bytes = needle.as_bytes();
    let position = contents
        .windows(needle_bytes.len())
        .position(|window| window == needle_bytes)?;
    let start = position + needle_bytes.len();
    let candidate = contents.get(start..start + UUID_LEN)?;
    let candidate = std::str::from_utf8(candidate).ok()?;
    validate_uuid(candidate).then(|| candidate.to_owned())
}

/// Resolve the UKI the bootloader associates with the active partition.
///
/// Each installed UKI's bootloader-reported UUID is compared against the
/// active partition's LUKS UUID, filesystem UUID, and partition UUID in
/// that order; the first matching UKI wins.
pub fn get_active_uki(runner: &dyn Runner, efi_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    let active = blkdev::get_active_partition(runner)?;
    let listing = runner.run("bootctl", &["list"])?;
    for uki in list_uki_files(efi_dir)? {
        let Some(file_name) = uki.file_name() else {
            continue;
        };
        let Some(uki_uuid) = bootctl_uuid(&listing, file_name) else {
            debug!("no bootloader UUID for {file_name}");
            continue;
        };
        if partition_carries_uuid(runner, &active, &uki_uuid) {
            return Ok(uki);
        }
    }
    Err(ToolError::NoMatchingUki)
}

/// Regular `*.efi` files in the EFI directory, in name order.
pub fn list_uki_files(efi_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    for entry in efi_dir.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_file() && entry.path().extension() == Some("efi") {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Look up the UUID `bootctl list` reports for the given UKI file.
///
/// Entries are paragraphs separated by blank lines; the paragraph naming the
/// UKI carries the UUID in its `root=PARTUUID=` or `boot_uuid=` option.
fn bootctl_uuid(listing: &str, uki_file: &str) -> Option<String> {
    let paragraph = listing
        .split("\n\n")
        .find(|paragraph| paragraph.contains(uki_file))?;
    for key in ["root=PARTUUID=", "boot_uuid="] {
        if let Some(uuid) = extract_value(paragraph, key) {
            return Some(uuid);
        }
    }
    None
}

/// Extract the whitespace-delimited value following `key`, if it is a UUID.
fn extract_value(text: &str, key: &str) -> Option<String> {
    let (_, rest) = text.split_once(key)?;
    let value = rest.split_whitespace().next()?;
    validate_uuid(value).then(|| value.to_owned())
}

fn partition_carries_uuid(runner: &dyn Runner, partition: &str, uuid: &str) -> bool {
    if luks_uuid(runner, partition).is_some_and(|found| found == uuid) {
        return true;
    }
    if filesystem_uuid(runner, partition).is_some_and(|found| found == uuid) {
        return true;
    }
    partition_uuid(runner, partition).is_some_and(|found| found == uuid)
}

fn luks_uuid(runner: &dyn Runner, partition: &str) -> Option<String> {
    let block = blkdev::get_block_name(runner, partition).ok()?;
    let output = runner.run("cryptsetup", &["luksUUID", &block]).ok()?;
    Some(output.trim().to_owned())
}

fn filesystem_uuid(runner: &dyn Runner, partition: &str) -> Option<String> {
    let output = runner.run("tune2fs", &["-l", partition]).ok()?;
    output
        .lines()
        .find(|line| line.contains("Filesystem UUID"))
        .and_then(|line| line.split_whitespace().nth(2))
        .map(str::to_owned)
}

fn partition_uuid(runner: &dyn Runner, partition: &str) -> Option<String> {
    let output = runner
        .run("blkid", &["-s", "PARTUUID", "-o", "value", partition])
        .ok()?;
    Some(output.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use os_update_common::cmd::FakeRunner;

    use super::*;

    const UUID_A: &str = "11111111-2222-4333-8444-555555555555";
    const UUID_B: &str = "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee";

    #[test]
    fn test_scan_for_uuid_at_fixed_offset() {
        let contents = format!("garbage\0\0boot_uuid={UUID_A} ro quiet\0more");
        assert_eq!(
            scan_for_uuid(contents.as_bytes(), "boot_uuid="),
            Some(UUID_A.to_owned())
        );
        assert_eq!(scan_for_uuid(contents.as_bytes(), "PARTUUID="), None);
    }

    #[test]
    fn test_scan_for_uuid_rejects_malformed_candidates() {
        let contents = b"boot_uuid=not-a-uuid-but-thirty-six-chars!! ";
        assert_eq!(scan_for_uuid(contents, "boot_uuid="), None);
        assert_eq!(scan_for_uuid(b"boot_uuid=tooshort", "boot_uuid="), None);
    }

    #[test]
    fn test_uuid_from_uki_falls_back_to_partuuid() {
        let dir = tempfile::tempdir().unwrap();
        let uki = dir.path().join("linux.efi");
        std::fs::write(&uki, format!("\0\0root=PARTUUID={UUID_B} rw\0")).unwrap();
        let found = uuid_from_uki(Utf8Path::from_path(&uki).unwrap()).unwrap();
        assert_eq!(found, UUID_B);
    }

    #[test]
    fn test_uuid_from_uki_without_uuid_fails() {
        let dir = tempfile::tempdir().unwrap();
        let uki = dir.path().join("linux.efi");
        std::fs::write(&uki, b"no identifiers here").unwrap();
        assert!(matches!(
            uuid_from_uki(Utf8Path::from_path(&uki).unwrap()),
            Err(ToolError::UuidNotInUki(_))
        ));
    }

    fn bootctl_listing() -> String {
        format!(
            "Boot Loader Entries:\n\
             \n\
             \u{20} type: Boot Loader Specification Type #2 (.efi)\n\
             \u{20} title: Linux (linux.efi)\n\
             \u{20} source: /boot/efi/EFI/Linux/linux.efi\n\
             \u{20} options: root=PARTUUID={UUID_A} ro\n\
             \n\
             \u{20} type: Boot Loader Specification Type #2 (.efi)\n\
             \u{20} title: Linux (linux-2.efi)\n\
             \u{20} source: /boot/efi/EFI/Linux/linux-2.efi\n\
             \u{20} options: boot_uuid={UUID_B} ro\n"
        )
    }

    #[test]
    fn test_bootctl_uuid_keys_paragraphs_by_file_name() {
        let listing = bootctl_listing();
        assert_eq!(bootctl_uuid(&listing, "linux.efi"), Some(UUID_A.to_owned()));
        assert_eq!(
            bootctl_uuid(&listing, "linux-2.efi"),
            Some(UUID_B.to_owned())
        );
        assert_eq!(bootctl_uuid(&listing, "other.efi"), None);
    }

    #[test]
    fn test_get_active_uki_matches_filesystem_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let efi_dir = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        std::fs::write(efi_dir.join("linux.efi"), b"").unwrap();
        std::fs::write(efi_dir.join("linux-2.efi"), b"").unwrap();

        let listing = bootctl_listing();
        let runner = FakeRunner::new(move |utility, args| match utility {
            "lsblk" => Ok("sda\n├─sda2 ext4 /\n└─sda6 ext4\n".to_owned()),
            "bootctl" if args == ["list"] => Ok(listing.clone()),
            "cryptsetup" => Err("not a LUKS device".to_owned()),
            "tune2fs" => Ok(format!("Filesystem UUID:          {UUID_B}\n")),
            "blkid" => Err("not found".to_owned()),
            _ => Err("unexpected".to_owned()),
        });
        let active = get_active_uki(&runner, &efi_dir).unwrap();
        assert_eq!(active.file_name(), Some("linux-2.efi"));
    }

    #[test]
    fn test_get_active_uki_without_match_fails() {
        let dir = tempfile::tempdir().unwrap();
        let efi_dir = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        std::fs::write(efi_dir.join("linux.efi"), b"").unwrap();

        let listing = bootctl_listing();
        let runner = FakeRunner::new(move |utility, _| match utility {
            "lsblk" => Ok("sda\n├─sda2 ext4 /\n".to_owned()),
            "bootctl" => Ok(listing.clone()),
            _ => Err("no match".to_owned()),
        });
        assert!(matches!(
            get_active_uki(&runner, &efi_dir),
            Err(ToolError::NoMatchingUki)
        ));
    }
}

//! Boot transitions built on the staged UKI stash.
//!
//! `write` leaves a copy of the new UKI in the stash; its presence is the
//! only durable marker that an update is pending. `apply` copies it over the
//! inactive slot's UKI name and arms a one-shot boot. `commit` runs after
//! the device has rebooted onto the new slot: it pins the *currently active*
//! UKI as the default and clears the stash. `rollback` flips the default
//! back to the sibling UKI and leaves the stash alone.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use os_update_common::cmd::Runner;
use os_update_common::error::{Result, ToolError};
use os_update_common::fsutils;
use tracing::info;

use crate::system::uki;

/// UKI name of slot A.
pub const UKI_SLOT_A: &str = "linux.efi";
/// UKI name of slot B.
pub const UKI_SLOT_B: &str = "linux-2.efi";
/// Directory inside the EFI directory holding the staged UKI.
pub const STASH_DIR_NAME: &str = "os-update-tool-data";
/// File name of the staged UKI.
pub const STAGED_UKI_NAME: &str = "linux.bak";

/// The sibling of a UKI name within the canonical pair.
pub fn sibling_uki(name: &str) -> &'static str {
    if name == UKI_SLOT_B {
        UKI_SLOT_A
    } else {
        UKI_SLOT_B
    }
}

/// Locations of the installed UKIs and the staged-UKI stash.
#[derive(Debug, Clone)]
pub struct UkiStore {
    efi_dir: Utf8PathBuf,
}

impl Default for UkiStore {
    fn default() -> Self {
        Self {
            efi_dir: Utf8PathBuf::from("/boot/efi/EFI/Linux"),
        }
    }
}

impl UkiStore {
    pub fn new(efi_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            efi_dir: efi_dir.into(),
        }
    }

    pub fn efi_dir(&self) -> &Utf8Path {
        &self.efi_dir
    }

    pub fn stash_dir(&self) -> Utf8PathBuf {
        self.efi_dir.join(STASH_DIR_NAME)
    }

    pub fn staged_uki(&self) -> Utf8PathBuf {
        self.stash_dir().join(STAGED_UKI_NAME)
    }

    /// Whether a `write` has completed and an apply/commit is outstanding.
    pub fn write_done(&self) -> bool {
        self.staged_uki().is_file()
    }

    /// Stage a new UKI into the stash.
    pub fn stage(&self, runner: &dyn Runner, source: &Utf8Path) -> Result<()> {
        fsutils::create_secure_dir(&self.stash_dir())?;
        if let Err(error) = copy_uki(runner, source, &self.staged_uki()) {
            fs::remove_dir_all(self.stash_dir()).ok();
            return Err(error);
        }
        Ok(())
    }

    /// Remove the stash, clearing the pending-update marker.
    pub fn clear_staged(&self) -> Result<()> {
        fs::remove_dir_all(self.stash_dir())?;
        Ok(())
    }
}

/// Copy a UKI with `dd` and flush it to disk.
fn copy_uki(runner: &dyn Runner, source: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    let input = format!("if={source}");
    let output = format!("of={dest}");
    runner.run("dd", &[input.as_str(), output.as_str(), "bs=4M"])?;
    runner.run("sync", &[])?;
    Ok(())
}

/// Copy the staged UKI over the inactive slot's UKI and boot it once.
pub fn apply(runner: &dyn Runner, store: &UkiStore) -> Result<()> {
    if !store.write_done() {
        return Err(ToolError::NothingToApply);
    }
    if !store.efi_dir().join(UKI_SLOT_A).is_file() {
        migrate_legacy_uki(store)?;
    }
    let active = uki::get_active_uki(runner, store.efi_dir())?;
    let active_name = active.file_name().ok_or(ToolError::NoMatchingUki)?;
    let next_name = sibling_uki(active_name);
    let next = store.efi_dir().join(next_name);
    info!("applying staged UKI to {next}");
    copy_uki(runner, &store.staged_uki(), &next)?;
    runner.run("bootctl", &["set-oneshot", next_name])?;
    info!("one-shot boot set to {next_name}");
    Ok(())
}

/// One-time migration of a legacy single-UKI system: the first `.efi` file
/// takes the canonical slot A name.
fn migrate_legacy_uki(store: &UkiStore) -> Result<()> {
    let files = uki::list_uki_files(store.efi_dir())?;
    let Some(source) = files.first() else {
        return Err(ToolError::NoMatchingUki);
    };
    let dest = store.efi_dir().join(UKI_SLOT_A);
    info!("renaming {source} to {dest}");
    fs::rename(source, dest)?;
    Ok(())
}

/// Pin the currently booted UKI as the permanent default and clear the
/// stash.
pub fn commit(runner: &dyn Runner, store: &UkiStore) -> Result<()> {
    if !store.write_done() {
        return Err(ToolError::NothingToCommit);
    }
    let active = uki::get_active_uki(runner, store.efi_dir())?;
    let active_name = active.file_name().ok_or(ToolError::NoMatchingUki)?;
    runner.run("bootctl", &["set-default", active_name])?;
    info!("default boot set to {active_name}");
    store.clear_staged()?;
    Ok(())
}

/// Set the default boot entry back to the sibling of the active UKI.
pub fn rollback(runner: &dyn Runner, store: &UkiStore) -> Result<()> {
    let active = uki::get_active_uki(runner, store.efi_dir())?;
    let active_name = active.file_name().ok_or(ToolError::NoMatchingUki)?;
    let previous_name = sibling_uki(active_name);
    if !store.efi_dir().join(previous_name).is_file() {
        return Err(ToolError::NoPreviousUki);
    }
    runner.run("bootctl", &["set-default", previous_name])?;
    info!("default boot set back to {previous_name}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use os_update_common::cmd::FakeRunner;

    use super::*;

    const UUID_A: &str = "11111111-2222-4333-8444-555555555555";
    const UUID_B: &str = "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee";

    /// EFI directory with both slot UKIs and a staged UKI present.
    fn store_with_staged(dir: &std::path::Path) -> UkiStore {
        let efi_dir = Utf8Path::from_path(dir).unwrap();
        std::fs::write(efi_dir.join(UKI_SLOT_A), b"uki a").unwrap();
        std::fs::write(efi_dir.join(UKI_SLOT_B), b"uki b").unwrap();
        let store = UkiStore::new(efi_dir.to_path_buf());
        std::fs::create_dir(store.stash_dir()).unwrap();
        std::fs::write(store.staged_uki(), b"staged uki").unwrap();
        store
    }

    /// Runner resolving the active UKI to the slot whose bootloader UUID is
    /// reported by `tune2fs` for the active partition.
    fn runner_with_active(active_uuid: &str) -> FakeRunner {
        let listing = format!(
            "title: Linux (linux.efi)\n\
             \u{20} source: /boot/efi/EFI/Linux/linux.efi\n\
             \u{20} options: root=PARTUUID={UUID_A} ro\n\
             \n\
             title: Linux (linux-2.efi)\n\
             \u{20} source: /boot/efi/EFI/Linux/linux-2.efi\n\
             \u{20} options: root=PARTUUID={UUID_B} ro\n"
        );
        let active_uuid = active_uuid.to_owned();
        FakeRunner::new(move |utility, args| match utility {
            "lsblk" => Ok("sda\n├─sda2 ext4 /\n└─sda6 ext4\n".to_owned()),
            "bootctl" if args == ["list"] => Ok(listing.clone()),
            "bootctl" => Ok(String::new()),
            "cryptsetup" => Err("not a LUKS device".to_owned()),
            "tune2fs" => Ok(format!("Filesystem UUID:          {active_uuid}\n")),
            "blkid" => Err("not found".to_owned()),
            "dd" | "sync" => Ok(String::new()),
            _ => Err("unexpected".to_owned()),
        })
    }

    #[test]
    fn test_apply_from_slot_a_targets_slot_b() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_staged(dir.path());
        let runner = runner_with_active(UUID_A);

        apply(&runner, &store).unwrap();

        let dd = runner.invocations_of("dd");
        assert_eq!(
            dd[0],
            vec![
                format!("if={}", store.staged_uki()),
                format!("of={}", store.efi_dir().join(UKI_SLOT_B)),
                "bs=4M".to_owned(),
            ]
        );
        let bootctl = runner.invocations_of("bootctl");
        assert_eq!(bootctl.last().unwrap(), &["set-oneshot", UKI_SLOT_B]);
    }

    #[test]
    fn test_apply_from_slot_b_targets_slot_a() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_staged(dir.path());
        let runner = runner_with_active(UUID_B);

        apply(&runner, &store).unwrap();

        let dd = runner.invocations_of("dd");
        assert_eq!(dd[0][1], format!("of={}", store.efi_dir().join(UKI_SLOT_A)));
        let bootctl = runner.invocations_of("bootctl");
        assert_eq!(bootctl.last().unwrap(), &["set-oneshot", UKI_SLOT_A]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_staged(dir.path());
        let runner = runner_with_active(UUID_A);

        apply(&runner, &store).unwrap();
        apply(&runner, &store).unwrap();

        let oneshots: Vec<_> = runner
            .invocations_of("bootctl")
            .into_iter()
            .filter(|args| args[0] == "set-oneshot")
            .collect();
        assert_eq!(oneshots.len(), 2);
        assert!(oneshots.iter().all(|args| args[1] == UKI_SLOT_B));
    }

    #[test]
    fn test_apply_without_staged_uki_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = UkiStore::new(Utf8Path::from_path(dir.path()).unwrap().to_path_buf());
        let runner = FakeRunner::new(|_, _| Err("unexpected".to_owned()));
        assert!(matches!(
            apply(&runner, &store),
            Err(ToolError::NothingToApply)
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_apply_migrates_legacy_uki_name() {
        let dir = tempfile::tempdir().unwrap();
        let efi_dir = Utf8Path::from_path(dir.path()).unwrap();
        // A legacy system has a single UKI under a vendor name.
        std::fs::write(efi_dir.join("vendor-os.efi"), b"legacy uki").unwrap();
        let store = UkiStore::new(efi_dir.to_path_buf());
        std::fs::create_dir(store.stash_dir()).unwrap();
        std::fs::write(store.staged_uki(), b"staged uki").unwrap();

        let runner = runner_with_active(UUID_A);
        // The migrated file keeps its content under the canonical name.
        apply(&runner, &store).unwrap();
        assert!(efi_dir.join(UKI_SLOT_A).is_file());
        assert!(!efi_dir.join("vendor-os.efi").exists());
    }

    #[test]
    fn test_commit_sets_default_and_clears_stash() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_staged(dir.path());
        let runner = runner_with_active(UUID_B);

        commit(&runner, &store).unwrap();

        let bootctl = runner.invocations_of("bootctl");
        assert_eq!(bootctl.last().unwrap(), &["set-default", UKI_SLOT_B]);
        assert!(!store.write_done());
        assert!(!store.stash_dir().exists());
    }

    #[test]
    fn test_commit_without_staged_uki_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = UkiStore::new(Utf8Path::from_path(dir.path()).unwrap().to_path_buf());
        let runner = FakeRunner::new(|_, _| Err("unexpected".to_owned()));
        assert!(matches!(
            commit(&runner, &store),
            Err(ToolError::NothingToCommit)
        ));
    }

    #[test]
    fn test_rollback_targets_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_staged(dir.path());
        let runner = runner_with_active(UUID_A);

        rollback(&runner, &store).unwrap();

        let bootctl = runner.invocations_of("bootctl");
        assert_eq!(bootctl.last().unwrap(), &["set-default", UKI_SLOT_B]);
        // The stash is untouched by a rollback.
        assert!(store.write_done());
    }

    #[test]
    fn test_rollback_without_sibling_fails() {
        let dir = tempfile::tempdir().unwrap();
        let efi_dir = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(efi_dir.join(UKI_SLOT_A), b"uki a").unwrap();
        let store = UkiStore::new(efi_dir.to_path_buf());

        let runner = runner_with_active(UUID_A);
        assert!(matches!(
            rollback(&runner, &store),
            Err(ToolError::NoPreviousUki)
        ));
        assert!(runner
            .invocations_of("bootctl")
            .iter()
            .all(|args| args[0] == "list"));
    }

    #[test]
    fn test_sibling_uki_pairing() {
        assert_eq!(sibling_uki(UKI_SLOT_A), UKI_SLOT_B);
        assert_eq!(sibling_uki(UKI_SLOT_B), UKI_SLOT_A);
    }
}

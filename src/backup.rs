//! Crash-recovery safety backups. While a session runs, each editing slot
//! (main canvas, spare page) is periodically snapshotted to a rotating set
//! of GIF files in the backup directory; on startup, leftover snapshots
//! from a crashed session are replayed in order. A lock file keeps two
//! running instances from rotating each other's backups.
//!
//! Backups use GIF because it is compact, keeps every layer, and can
//! carry the original file path in an application extension — so a
//! recovered image knows where "Save" should put it.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::context::{IoContext, Settings};
use crate::formats::FileFormat;
use crate::io::{emergency_backup, load_image, save_image, FlattenDecision};
use crate::page::Document;
use crate::{log_err, log_info, log_warn};

/// How many rotating backup files each slot keeps.
pub const ROTATION_SAFETY_BACKUP: u32 = 8;

/// Low-water mark: this many edits plus [`MIN_INTERVAL_FOR_SAFETY_BACKUP`]
/// of elapsed time trigger a snapshot.
pub const MIN_EDITS_FOR_SAFETY_BACKUP: u32 = 10;
pub const MIN_INTERVAL_FOR_SAFETY_BACKUP: Duration = Duration::from_secs(30);

/// High-water mark: more edits than this trigger a snapshot regardless of
/// time; any edit at all triggers one after
/// [`MAX_INTERVAL_FOR_SAFETY_BACKUP`].
pub const MAX_EDITS_FOR_SAFETY_BACKUP: u32 = 30;
pub const MAX_INTERVAL_FOR_SAFETY_BACKUP: Duration = Duration::from_secs(60);

pub const BACKUP_FILE_EXTENSION: &str = ".gif";
pub const MAIN_BACKUP_PREFIX: char = 'a';
pub const SPARE_BACKUP_PREFIX: char = 'b';

/// Rotation numbers wrap at six digits — the filename field is fixed
/// width.
const BACKUP_NUMBER_MODULO: u32 = 1_000_000;

const LOCK_FILE_NAME: &str = "retropaint.lck";

/// Whether the trigger policy calls for a snapshot. Bounds data loss both
/// in edit count and in wall-clock time, even for a slowly-edited session.
pub fn backup_due(edits_since_backup: u32, elapsed: Duration) -> bool {
    edits_since_backup > MAX_EDITS_FOR_SAFETY_BACKUP
        || (edits_since_backup > MIN_EDITS_FOR_SAFETY_BACKUP
            && elapsed > MIN_INTERVAL_FOR_SAFETY_BACKUP)
        || (edits_since_backup >= 1 && elapsed > MAX_INTERVAL_FOR_SAFETY_BACKUP)
}

/// `<prefix><6-digit number><extension>`. Zero padding makes lexicographic
/// order equal numeric order, which is what recovery sorts by.
pub fn backup_file_name(prefix: char, number: u32) -> String {
    format!("{}{:06}{}", prefix, number % BACKUP_NUMBER_MODULO, BACKUP_FILE_EXTENSION)
}

/// Does `file_name` look like one of our backups for `prefix`? Only the
/// prefix and the digit run matter; the extension is left alone so stray
/// renames still get cleaned up.
fn is_backup_name(file_name: &str, prefix: char) -> bool {
    let mut chars = file_name.chars();
    if chars.next() != Some(prefix) {
        return false;
    }
    for c in chars {
        if c == '.' {
            break;
        }
        if !c.is_ascii_digit() {
            return false;
        }
    }
    true
}

/// One editing slot's snapshot bookkeeping.
pub struct SlotState {
    prefix: char,
    safety_number: u32,
    edits_since_backup: u32,
    last_backup: Instant,
}

impl SlotState {
    fn new(prefix: char) -> Self {
        SlotState { prefix, safety_number: 0, edits_since_backup: 0, last_backup: Instant::now() }
    }

    pub fn safety_number(&self) -> u32 {
        self.safety_number
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Main,
    Spare,
}

/// What startup recovery found.
#[derive(Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Another instance holds the backup directory; this one runs without
    /// safety backups.
    Unavailable,
    /// Number of snapshot files replayed into each slot (both zero on a
    /// clean previous exit).
    Restored { main: usize, spare: usize },
}

/// The safety backup subsystem. Inactive until [`check_recovery`] manages
/// to lock the backup directory.
///
/// [`check_recovery`]: SafetyBackups::check_recovery
pub struct SafetyBackups {
    directory: PathBuf,
    settings: Settings,
    active: bool,
    /// Held for the whole lifetime of the subsystem; the OS drops the
    /// lock with the process, so a crash never strands it.
    lock: Option<File>,
    main: SlotState,
    spare: SlotState,
}

impl SafetyBackups {
    pub fn new(directory: &Path, settings: Settings) -> Self {
        SafetyBackups {
            directory: directory.to_path_buf(),
            settings,
            active: false,
            lock: None,
            main: SlotState::new(MAIN_BACKUP_PREFIX),
            spare: SlotState::new(SPARE_BACKUP_PREFIX),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Lock the backup directory, then replay any snapshots a crashed
    /// session left behind — oldest first, so incrementally-built layer
    /// stacks reconstruct correctly and the newest state wins. The files
    /// themselves stay on disk until a clean shutdown: if the replay
    /// itself goes down, the next start gets another chance.
    pub fn check_recovery(&mut self, main: &mut Document, spare: &mut Document) -> Recovery {
        if !self.create_lock_file() {
            log_warn!(
                "Backup directory {} is locked by another instance; safety backups disabled",
                self.directory.display()
            );
            return Recovery::Unavailable;
        }
        self.active = true;

        let (main_files, spare_files) = self.scan_backup_files();
        let restored_spare = self.replay(&spare_files, spare);
        let restored_main = self.replay(&main_files, main);
        if restored_main + restored_spare > 0 {
            log_info!(
                "Recovered {} main / {} spare snapshot(s) from {}",
                restored_main,
                restored_spare,
                self.directory.display()
            );
        }
        Recovery::Restored { main: restored_main, spare: restored_spare }
    }

    /// Count an edit against a slot.
    pub fn note_edit(&mut self, slot: Slot) {
        self.slot_mut(slot).edits_since_backup += 1;
    }

    /// Snapshot the slot if the trigger policy says so. Call after every
    /// edit event; cheap when nothing is due.
    pub fn rotate(&mut self, slot: Slot, doc: &mut Document) {
        if !self.active {
            return;
        }
        let state = self.slot(slot);
        if !backup_due(state.edits_since_backup, state.last_backup.elapsed()) {
            return;
        }
        let (prefix, number) = (state.prefix, state.safety_number);

        // Bounded retention: the file eight generations back goes first.
        let stale =
            (number + BACKUP_NUMBER_MODULO - ROTATION_SAFETY_BACKUP) % BACKUP_NUMBER_MODULO;
        let _ = fs::remove_file(self.directory.join(backup_file_name(prefix, stale)));

        {
            let state = self.slot_mut(slot);
            state.edits_since_backup = 0;
            state.last_backup = Instant::now();
        }

        let file_name = backup_file_name(prefix, number);
        let original_name = doc.file_name.clone();
        let original_directory = doc.file_directory.clone();
        let mut ctx = IoContext::for_backup_image(doc, &file_name, &self.directory, self.settings);
        ctx.format = Some(FileFormat::Gif);
        ctx.original_file_name = Some(original_name);
        ctx.original_file_directory = Some(original_directory);
        // GIF keeps every layer, so the flatten prompt can never fire.
        if let Err(e) = save_image(&mut ctx, |_| FlattenDecision::CurrentFrame) {
            log_err!("Safety backup {} failed (error {})", file_name, e.code());
        }
        drop(ctx);

        self.slot_mut(slot).safety_number = (number + 1) % BACKUP_NUMBER_MODULO;
    }

    /// Remove every backup file of both slots and release the lock. Call
    /// on normal program exit — and only then.
    pub fn delete_backups(&mut self) {
        if !self.active {
            return;
        }
        let (main_files, spare_files) = self.scan_backup_files();
        for file_name in main_files.iter().chain(spare_files.iter()) {
            if fs::remove_file(self.directory.join(file_name)).is_err() {
                log_warn!("Failed to delete {}", file_name);
            }
        }
        self.release_lock_file();
        self.active = false;
    }

    /// Last-resort dump of both slots, for the panic path: raw IMG files
    /// under the reserved 999999 rotation number. Single-layer only —
    /// this runs when nothing more elaborate can be trusted.
    pub fn emergency_dump(&self, main: &Document, spare: &Document) {
        for (state, doc) in [(&self.main, main), (&self.spare, spare)] {
            if doc.layers.len() != 1 {
                continue;
            }
            let file_name = backup_file_name(state.prefix, BACKUP_NUMBER_MODULO - 1);
            let _ = emergency_backup(
                &self.directory,
                &file_name,
                &doc.layers[0].pixels,
                doc.width,
                doc.height,
                &doc.palette,
            );
        }
    }

    fn slot(&self, slot: Slot) -> &SlotState {
        match slot {
            Slot::Main => &self.main,
            Slot::Spare => &self.spare,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut SlotState {
        match slot {
            Slot::Main => &mut self.main,
            Slot::Spare => &mut self.spare,
        }
    }

    /// Backup files of both slots, each list sorted into replay order.
    fn scan_backup_files(&self) -> (Vec<String>, Vec<String>) {
        let mut main_files = Vec::new();
        let mut spare_files = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.directory) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if is_backup_name(name, self.main.prefix) {
                    main_files.push(name.to_string());
                } else if is_backup_name(name, self.spare.prefix) {
                    spare_files.push(name.to_string());
                }
            }
        }
        main_files.sort();
        spare_files.sort();
        (main_files, spare_files)
    }

    /// Load a sorted run of snapshots into `doc`. Later files overwrite
    /// earlier state; the intermediate loads rebuild layer stacks that
    /// grew across snapshots. A single bad file degrades to "skipped".
    fn replay(&self, files: &[String], doc: &mut Document) -> usize {
        let mut restored = 0;
        for file_name in files {
            let mut ctx =
                IoContext::for_backup_image(doc, file_name, &self.directory, self.settings);
            match load_image(&mut ctx) {
                Ok(()) => restored += 1,
                Err(e) => {
                    log_warn!("Skipping unreadable backup {} (error {})", file_name, e.code());
                    continue;
                }
            }
            drop(ctx);
            // Recovered work is unsaved work.
            doc.modified = true;
        }
        restored
    }

    /// Take an exclusive advisory lock on the lock file. Fail-fast: a
    /// held lock means another live instance, not a retry loop. A stale
    /// file from a crashed session locks fine — the old process's lock
    /// died with it.
    fn create_lock_file(&mut self) -> bool {
        let Ok(file) = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.directory.join(LOCK_FILE_NAME))
        else {
            return false;
        };
        match file.try_lock() {
            Ok(()) => {
                self.lock = Some(file);
                true
            }
            Err(_) => false,
        }
    }

    fn release_lock_file(&mut self) {
        self.lock = None;
        let _ = fs::remove_file(self.directory.join(LOCK_FILE_NAME));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Rgb;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("retropaint-bak-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_backup(dir: &Path, prefix: char, number: u32, color: u8) {
        let mut doc = Document::new(2, 2);
        doc.layers[0].pixels = vec![color; 4];
        doc.palette[color as usize] = Rgb { r: color, g: color, b: color };
        let name = backup_file_name(prefix, number);
        let mut ctx = IoContext::for_backup_image(&mut doc, &name, dir, Settings::default());
        ctx.format = Some(FileFormat::Gif);
        save_image(&mut ctx, |_| FlattenDecision::Cancel).unwrap();
    }

    #[test]
    fn trigger_policy_bounds_loss_in_edits_and_time() {
        let secs = Duration::from_secs;
        assert!(backup_due(31, secs(0))); // many edits, immediately
        assert!(!backup_due(30, secs(0)));
        assert!(backup_due(11, secs(31))); // some edits + min interval
        assert!(!backup_due(11, secs(29)));
        assert!(!backup_due(10, secs(31)));
        assert!(backup_due(1, secs(61))); // any edit + max interval
        assert!(!backup_due(0, secs(3600))); // nothing to lose
        assert!(!backup_due(5, secs(45)));
    }

    #[test]
    fn file_names_sort_numerically() {
        assert_eq!(backup_file_name('a', 3), "a000003.gif");
        assert_eq!(backup_file_name('b', 999_999), "b999999.gif");
        assert_eq!(backup_file_name('a', 1_000_003), "a000003.gif"); // wraps

        assert!(is_backup_name("a000003.gif", 'a'));
        assert!(is_backup_name("a000003.gif", 'a'));
        assert!(!is_backup_name("a000003.gif", 'b'));
        assert!(!is_backup_name("axyz.gif", 'a'));
        assert!(!is_backup_name("image.gif", 'a'));
    }

    #[test]
    fn rotation_keeps_the_eight_newest_files() {
        let dir = scratch_dir("rot");
        let mut backups = SafetyBackups::new(&dir, Settings::default());
        let mut main = Document::new(2, 2);
        let mut spare = Document::new(2, 2);
        assert_eq!(
            backups.check_recovery(&mut main, &mut spare),
            Recovery::Restored { main: 0, spare: 0 }
        );

        for _ in 0..12 {
            backups.main.edits_since_backup = MAX_EDITS_FOR_SAFETY_BACKUP + 1;
            backups.rotate(Slot::Main, &mut main);
        }
        let (main_files, spare_files) = backups.scan_backup_files();
        assert!(spare_files.is_empty());
        assert_eq!(
            main_files,
            (4..12).map(|n| backup_file_name('a', n)).collect::<Vec<_>>()
        );
        assert_eq!(backups.main.safety_number(), 12);

        backups.delete_backups();
        assert_eq!(backups.scan_backup_files().0.len(), 0);
        assert!(!dir.join(LOCK_FILE_NAME).exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn recovery_replays_in_numeric_order() {
        let dir = scratch_dir("order");
        // Written out of order on purpose; replay must go 1, 2, 3.
        write_backup(&dir, 'a', 3, 30);
        write_backup(&dir, 'a', 1, 10);
        write_backup(&dir, 'a', 2, 20);
        write_backup(&dir, 'b', 1, 99);

        let mut backups = SafetyBackups::new(&dir, Settings::default());
        let mut main = Document::new(1, 1);
        let mut spare = Document::new(1, 1);
        let recovery = backups.check_recovery(&mut main, &mut spare);
        assert_eq!(recovery, Recovery::Restored { main: 3, spare: 1 });

        // The highest-numbered snapshot is the final state.
        assert_eq!(main.layers[0].pixels, vec![30; 4]);
        assert_eq!(spare.layers[0].pixels, vec![99; 4]);
        assert!(main.modified);

        // Replay must not delete anything — only a clean shutdown does.
        assert!(dir.join("a000001.gif").exists());
        backups.delete_backups();
        assert!(!dir.join("a000001.gif").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn second_instance_gets_no_lock_and_touches_nothing() {
        let dir = scratch_dir("lock");
        write_backup(&dir, 'a', 1, 42);

        let mut first = SafetyBackups::new(&dir, Settings::default());
        let mut doc_a = Document::new(1, 1);
        let mut doc_b = Document::new(1, 1);
        assert!(matches!(
            first.check_recovery(&mut doc_a, &mut doc_b),
            Recovery::Restored { main: 1, .. }
        ));

        let mut second = SafetyBackups::new(&dir, Settings::default());
        let mut other_a = Document::new(1, 1);
        let mut other_b = Document::new(1, 1);
        assert_eq!(second.check_recovery(&mut other_a, &mut other_b), Recovery::Unavailable);
        assert!(!second.is_active());
        // No replay happened, and the pending file is still there.
        assert_eq!(other_a.layers[0].pixels, vec![0]);
        assert!(dir.join("a000001.gif").exists());
        second.delete_backups(); // inactive: must be a no-op
        assert!(dir.join("a000001.gif").exists());

        first.delete_backups();
        assert!(!dir.join("a000001.gif").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn backups_record_the_original_path_for_recovery() {
        let dir = scratch_dir("origin");
        let mut backups = SafetyBackups::new(&dir, Settings::default());
        let mut main = Document::new(2, 1);
        let mut spare = Document::new(1, 1);
        backups.check_recovery(&mut main, &mut spare);

        main.file_name = "artwork.gif".to_string();
        main.file_directory = PathBuf::from("/home/someone/pics");
        main.layers[0].pixels = vec![3, 4];
        backups.note_edit(Slot::Main);
        backups.main.edits_since_backup = MAX_EDITS_FOR_SAFETY_BACKUP + 1;
        backups.rotate(Slot::Main, &mut main);
        backups.release_lock_file();

        let mut other = SafetyBackups::new(&dir, Settings::default());
        let mut recovered = Document::new(1, 1);
        let mut spare2 = Document::new(1, 1);
        assert!(matches!(
            other.check_recovery(&mut recovered, &mut spare2),
            Recovery::Restored { main: 1, .. }
        ));
        // The replayed document points at the original file, not at the
        // backup file.
        assert_eq!(recovered.file_name, "artwork.gif");
        assert_eq!(recovered.file_directory, PathBuf::from("/home/someone/pics"));
        assert_eq!(recovered.layers[0].pixels, vec![3, 4]);
        other.delete_backups();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn emergency_dump_covers_single_layer_slots() {
        let dir = scratch_dir("emergency");
        let backups = SafetyBackups::new(&dir, Settings::default());
        let mut main = Document::new(2, 1);
        main.layers[0].pixels = vec![8, 9];
        let mut spare = Document::new(1, 1);
        spare.add_layer(); // two layers: skipped by the raw dump
        backups.emergency_dump(&main, &spare);
        assert!(dir.join("a999999.gif").exists());
        assert!(!dir.join("b999999.gif").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}

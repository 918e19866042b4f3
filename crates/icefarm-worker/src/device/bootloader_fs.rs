//! Bootloader mass-storage filesystem access (spec.md §4.1, §6 "Bootloader
//! disk format"). File I/O glue is out of scope per spec.md §1; this trait is
//! the small interface `FlashState` consumes instead of touching the
//! filesystem directly.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

pub trait BootloaderFs: Send + Sync {
    fn mount(&self, partition_path: &str) -> io::Result<PathBuf>;
    fn list_files(&self, mount_point: &Path) -> io::Result<BTreeSet<String>>;
    fn copy_firmware(&self, mount_point: &Path, image: &[u8]) -> io::Result<()>;
    /// Unmount failures are logged by the caller, not fatal (spec.md §4.1).
    fn unmount(&self, mount_point: &Path) -> io::Result<()>;
}

pub struct RealBootloaderFs;

impl BootloaderFs for RealBootloaderFs {
    fn mount(&self, partition_path: &str) -> io::Result<PathBuf> {
        let mount_point = PathBuf::from(format!("/mnt/icefarm-{}", partition_path.replace('/', "_")));
        std::fs::create_dir_all(&mount_point)?;
        let status = Command::new("mount").arg(partition_path).arg(&mount_point).status()?;
        if status.success() {
            Ok(mount_point)
        } else {
            Err(io::Error::new(io::ErrorKind::Other, format!("mount {partition_path} failed: {status}")))
        }
    }

    fn list_files(&self, mount_point: &Path) -> io::Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for entry in std::fs::read_dir(mount_point)? {
            names.insert(entry?.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }

    fn copy_firmware(&self, mount_point: &Path, image: &[u8]) -> io::Result<()> {
        std::fs::write(mount_point.join("FIRMWARE.UF2"), image)
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        let status = Command::new("umount").arg(mount_point).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, format!("umount {} failed: {status}", mount_point.display())))
        }
    }
}

/// Deterministic double for tests. `files` seeds what `list_files` reports;
/// `fail_unmount` exercises spec.md's "unmount failure is logged but not
/// fatal" edge case.
pub struct MockBootloaderFs {
    pub files: BTreeSet<String>,
    pub fail_unmount: bool,
    pub copied: Mutex<Vec<Vec<u8>>>,
}

impl MockBootloaderFs {
    pub fn valid() -> Self {
        MockBootloaderFs {
            files: ["INDEX.HTM", "INFO_UF2.TXT"].into_iter().map(String::from).collect(),
            fail_unmount: false,
            copied: Mutex::new(Vec::new()),
        }
    }

    pub fn with_extra_file() -> Self {
        let mut fs = MockBootloaderFs::valid();
        fs.files.insert("EXTRA.TXT".to_string());
        fs
    }
}

impl BootloaderFs for MockBootloaderFs {
    fn mount(&self, partition_path: &str) -> io::Result<PathBuf> {
        Ok(PathBuf::from(partition_path))
    }

    fn list_files(&self, _mount_point: &Path) -> io::Result<BTreeSet<String>> {
        Ok(self.files.clone())
    }

    fn copy_firmware(&self, _mount_point: &Path, image: &[u8]) -> io::Result<()> {
        self.copied.lock().unwrap().push(image.to_vec());
        Ok(())
    }

    fn unmount(&self, _mount_point: &Path) -> io::Result<()> {
        if self.fail_unmount {
            Err(io::Error::new(io::ErrorKind::Other, "simulated unmount failure"))
        } else {
            Ok(())
        }
    }
}

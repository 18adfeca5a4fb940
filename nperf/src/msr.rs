//! MSR device access and the per-register write ledger.
//!
//! Registers are written through the `/dev/cpu/<n>/msr` device files at the
//! register's byte offset, on every CPU. The ledger enforces the
//! one-writer-per-register-per-run invariant: re-applying the identical
//! value is a no-op, a different value is a conflict the run cannot recover
//! from.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::domain::{errors::EventError, Msr};

#[derive(Debug, Default)]
pub struct MsrLedger {
    committed: HashMap<u32, u64>,
}

impl MsrLedger {
    /// Write `value` to `msr` on all CPUs unless `dry_run`, recording the
    /// write. A second request for the same register with a different value
    /// fails with [`EventError::RegisterConflict`].
    pub fn checked_write(
        &mut self,
        dev_root: &Path,
        msr: Msr,
        value: u64,
        dry_run: bool,
    ) -> Result<(), EventError> {
        match self.committed.get(&msr.0) {
            Some(&prev) if prev == value => return Ok(()),
            Some(&prev) => {
                return Err(EventError::RegisterConflict { msr, previous: prev, requested: value })
            }
            None => {}
        }
        if dry_run {
            println!("msr 0x{:x} = 0x{:x}", msr.0, value);
        } else {
            info!("writing {msr} = 0x{value:x}");
            write_all_cpus(dev_root, msr, value)?;
        }
        self.committed.insert(msr.0, value);
        Ok(())
    }
}

/// Per-CPU msr device files under `dev_root` (normally `/dev/cpu`).
fn msr_devices(dev_root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut devices = Vec::new();
    for entry in std::fs::read_dir(dev_root)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().parse::<u32>().is_ok() {
            let dev = entry.path().join("msr");
            if dev.exists() {
                devices.push(dev);
            }
        }
    }
    devices.sort();
    Ok(devices)
}

/// Write `value` at the register's byte offset on every CPU.
pub fn write_all_cpus(dev_root: &Path, msr: Msr, value: u64) -> std::io::Result<()> {
    let devices = msr_devices(dev_root)?;
    if devices.is_empty() {
        warn!("no msr devices under {} (is the msr module loaded?)", dev_root.display());
    }
    for dev in devices {
        let mut f = OpenOptions::new().write(true).open(&dev)?;
        f.seek(SeekFrom::Start(u64::from(msr.0)))?;
        f.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

/// Read a register on one CPU.
pub fn read_cpu(dev_root: &Path, cpu: u32, msr: Msr) -> std::io::Result<u64> {
    let dev = dev_root.join(cpu.to_string()).join("msr");
    let mut f = OpenOptions::new().read(true).open(dev)?;
    f.seek(SeekFrom::Start(u64::from(msr.0)))?;
    let mut buf = [0u8; 8];
    f.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Set or clear one bit of a register on every CPU (read-modify-write).
pub fn change_bit(dev_root: &Path, msr: Msr, bit: u32, set: bool) -> std::io::Result<()> {
    for dev in msr_devices(dev_root)? {
        let mut f = OpenOptions::new().read(true).write(true).open(&dev)?;
        f.seek(SeekFrom::Start(u64::from(msr.0)))?;
        let mut buf = [0u8; 8];
        f.read_exact(&mut buf)?;
        let mut val = u64::from_le_bytes(buf);
        if set {
            val |= 1 << bit;
        } else {
            val &= !(1 << bit);
        }
        f.seek(SeekFrom::Start(u64::from(msr.0)))?;
        f.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_dev_root(cpus: u32) -> TempDir {
        let dir = TempDir::new().unwrap();
        for cpu in 0..cpus {
            let cpu_dir = dir.path().join(cpu.to_string());
            fs::create_dir(&cpu_dir).unwrap();
            // Sparse-ish register file, large enough for the offsets we poke.
            fs::write(cpu_dir.join("msr"), vec![0u8; 0x1000]).unwrap();
        }
        dir
    }

    #[test]
    fn test_write_and_read_back() {
        let root = fake_dev_root(2);
        let mut ledger = MsrLedger::default();
        ledger.checked_write(root.path(), Msr(0x1a6), 0x10001, false).unwrap();
        assert_eq!(read_cpu(root.path(), 0, Msr(0x1a6)).unwrap(), 0x10001);
        assert_eq!(read_cpu(root.path(), 1, Msr(0x1a6)).unwrap(), 0x10001);
    }

    #[test]
    fn test_identical_rewrite_is_noop() {
        let root = fake_dev_root(1);
        let mut ledger = MsrLedger::default();
        ledger.checked_write(root.path(), Msr(0x1a6), 7, false).unwrap();
        ledger.checked_write(root.path(), Msr(0x1a6), 7, false).unwrap();
    }

    #[test]
    fn test_conflicting_write_fails() {
        let root = fake_dev_root(1);
        let mut ledger = MsrLedger::default();
        ledger.checked_write(root.path(), Msr(0x1a6), 7, false).unwrap();
        let err = ledger.checked_write(root.path(), Msr(0x1a6), 8, false).unwrap_err();
        assert!(matches!(err, EventError::RegisterConflict { .. }));
        // The first write is still committed.
        assert_eq!(read_cpu(root.path(), 0, Msr(0x1a6)).unwrap(), 7);
    }

    #[test]
    fn test_dry_run_does_not_touch_device() {
        let root = fake_dev_root(1);
        let mut ledger = MsrLedger::default();
        ledger.checked_write(root.path(), Msr(0x3f6), 0x20, true).unwrap();
        assert_eq!(read_cpu(root.path(), 0, Msr(0x3f6)).unwrap(), 0);
        // Conflicts are still detected in preview mode.
        let err = ledger.checked_write(root.path(), Msr(0x3f6), 0x40, true).unwrap_err();
        assert!(matches!(err, EventError::RegisterConflict { .. }));
    }

    #[test]
    fn test_change_bit() {
        let root = fake_dev_root(1);
        change_bit(root.path(), Msr(0x39c), 0, true).unwrap();
        assert_eq!(read_cpu(root.path(), 0, Msr(0x39c)).unwrap(), 1);
        change_bit(root.path(), Msr(0x39c), 0, false).unwrap();
        assert_eq!(read_cpu(root.path(), 0, Msr(0x39c)).unwrap(), 0);
    }
}

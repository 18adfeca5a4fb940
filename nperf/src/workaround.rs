//! Errata workaround coordinator for the Sandy Bridge EP load-latency
//! event family.
//!
//! Counting these events reliably requires disabling the uncore bypass
//! optimization (bit 0 of MSR 0x39c) and, for some of them, the
//! direct-to-core path (a PCI config bit on the home agent devices). The
//! workaround is toggled at most once per process and reverted on SIGINT so
//! an interrupted run does not leave the platform reconfigured.

#![allow(unsafe_code)] // signal(2) registration and raise

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use log::{info, warn};

use crate::domain::Msr;
use crate::msr;

pub const BYPASS: u8 = 1 << 0;
pub const D2C: u8 = 1 << 1;

const BYPASS_MSR: Msr = Msr(0x39c);
const BYPASS_BIT: u32 = 0;

/// Candidate buses for the home agent / Cbo devices on 2-socket EP parts.
const PCI_BUSES: [u8; 4] = [0x3f, 0x7f, 0xbf, 0xff];

/// Event codes (umask | event select) needing the workaround.
const AFFECTED_EVENTS: &[(u64, u8)] = &[
    (0x04d1, BYPASS),
    (0x20d1, BYPASS | D2C),
    (0x01d3, BYPASS | D2C),
    (0x04d3, BYPASS | D2C),
    (0x01d2, BYPASS),
    (0x02d2, BYPASS),
    (0x04d2, BYPASS),
    (0x08d2, BYPASS),
    (0x01cd, BYPASS | D2C),
];

/// Which actions are currently applied; read by the signal handler.
static ENABLED: AtomicU8 = AtomicU8::new(0);

/// Coordinator state. One per [`crate::session::Session`].
#[derive(Debug, Default)]
pub struct Workaround {
    msr_dev_root: PathBuf,
    applied: bool,
    signal_installed: bool,
}

impl Workaround {
    pub fn new(msr_dev_root: PathBuf) -> Self {
        Workaround { msr_dev_root, applied: false, signal_installed: false }
    }

    /// Actions required for an event code, if any.
    pub fn needed(event_code: u64) -> Option<u8> {
        AFFECTED_EVENTS.iter().find(|(code, _)| *code == event_code).map(|(_, mask)| *mask)
    }

    /// Apply the workaround for `event_code` if it needs one. Only the first
    /// matching event per process toggles anything; later matches are no-ops.
    pub fn apply(&mut self, event_code: u64, dry_run: bool) {
        let Some(mask) = Self::needed(event_code) else { return };
        if self.applied {
            return;
        }
        if dry_run {
            println!("workaround for event 0x{event_code:x}: mask 0x{mask:x}");
            return;
        }
        if !self.signal_installed {
            install_signal_handlers();
            self.signal_installed = true;
        }
        if mask & BYPASS != 0 {
            info!("disabling bypass optimization");
            set_bypass(&self.msr_dev_root, true);
        }
        if mask & D2C != 0 {
            info!("disabling direct2core");
            set_direct2core(true);
        }
        ENABLED.store(mask, Ordering::SeqCst);
        self.applied = true;
    }

    /// Revert whatever was toggled. Safe to call when nothing was applied.
    pub fn revert(&mut self) {
        revert_enabled(&self.msr_dev_root);
        self.applied = false;
    }
}

impl Drop for Workaround {
    fn drop(&mut self) {
        self.revert();
    }
}

fn revert_enabled(msr_dev_root: &Path) {
    let mask = ENABLED.swap(0, Ordering::SeqCst);
    if mask & BYPASS != 0 {
        set_bypass(msr_dev_root, false);
    }
    if mask & D2C != 0 {
        set_direct2core(false);
    }
}

fn set_bypass(dev_root: &Path, disable: bool) {
    if let Err(e) = msr::change_bit(dev_root, BYPASS_MSR, BYPASS_BIT, disable) {
        warn!("cannot toggle bypass bit: {e}");
    }
}

/// Toggle the direct-to-core path on all discovered home agent devices,
/// keeping every core awake through /dev/cpu_dma_latency while we poke PCI
/// config space.
fn set_direct2core(disable: bool) {
    let _dma = hold_cpu_dma_latency();
    let mut local = 0;
    let mut remote = 0;
    for bus in PCI_BUSES {
        if pci_change_bit(bus, 14, 0, 0x84, 1, disable).is_ok() {
            local += 1;
        }
        if pci_change_bit(bus, 8, 0, 0x80, 1, disable).is_ok() {
            pci_change_bit(bus, 9, 0, 0x80, 1, disable).ok();
            remote += 1;
        }
    }
    if local == 0 && remote == 0 {
        warn!("no home agent PCI devices found, direct2core unchanged");
    }
}

fn hold_cpu_dma_latency() -> Option<std::fs::File> {
    let mut f = OpenOptions::new().write(true).open("/dev/cpu_dma_latency").ok()?;
    f.write_all(&0u32.to_le_bytes()).ok()?;
    Some(f)
}

/// Read-modify-write one bit of a PCI config byte.
fn pci_change_bit(
    bus: u8,
    device: u8,
    function: u8,
    offset: u64,
    bit: u32,
    set: bool,
) -> std::io::Result<()> {
    let path = format!("/sys/bus/pci/devices/0000:{bus:02x}:{device:02x}.{function}/config");
    let mut f = OpenOptions::new().read(true).write(true).open(path)?;
    f.seek(SeekFrom::Start(offset))?;
    let mut byte = [0u8; 1];
    f.read_exact(&mut byte)?;
    if set {
        byte[0] |= 1 << bit;
    } else {
        byte[0] &= !(1 << bit);
    }
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(&byte)
}

extern "C" fn on_signal(sig: libc::c_int) {
    // Revert against the real device tree; the workaround only ever runs
    // against real hardware (tests use dry_run).
    revert_enabled(Path::new("/dev/cpu"));
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

fn install_signal_handlers() {
    unsafe {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affected_event_lookup() {
        assert_eq!(Workaround::needed(0x01cd), Some(BYPASS | D2C));
        assert_eq!(Workaround::needed(0x04d1), Some(BYPASS));
        assert_eq!(Workaround::needed(0x00c0), None);
    }

    #[test]
    fn test_dry_run_applies_nothing() {
        let mut w = Workaround::new(PathBuf::from("/nonexistent"));
        w.apply(0x01cd, true);
        assert!(!w.applied);
        assert_eq!(ENABLED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unaffected_event_is_noop() {
        let mut w = Workaround::new(PathBuf::from("/nonexistent"));
        w.apply(0x00c0, false);
        assert!(!w.applied);
    }
}

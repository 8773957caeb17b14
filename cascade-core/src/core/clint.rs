//! Core Local Interruptor: the per-hart timer and software interrupt source.

use log::{debug, trace};

use crate::core::csr::CsrBank;
use crate::core::interrupts::{Interrupt, InterruptController};

/// Base of the CLINT's memory-mapped register block.
pub const BASE_ADDRESS: u32 = 0x0200_0000;
/// Machine software interrupt pending register (32 bits, bit 0 significant).
pub const MSIP_ADDRESS: u32 = BASE_ADDRESS;
/// Machine timer compare register (64 bits, two little-endian halves).
pub const MTIMECMP_ADDRESS: u32 = 0x0200_4000;
/// Machine time register (64 bits, two little-endian halves).
pub const MTIME_ADDRESS: u32 = 0x0200_BFF8;

const BLOCK_SIZE: u32 = 0xC000;

/// Returns `true` if `address` falls in the CLINT's register block.
pub fn contains(address: u32) -> bool {
    (BASE_ADDRESS..BASE_ADDRESS + BLOCK_SIZE).contains(&address)
}

/// The core-local interruptor.
///
/// mtime advances by one for every `time_scale` simulated cycles; once it
/// reaches mtimecmp, the timer interrupt goes pending (level-triggered, so
/// the controller keeps seeing it until rearmed). Writing mtimecmp — either
/// half over MMIO or the full-width helper — clears the pending timer
/// interrupt, which is how a tick ISR rearms the timer.
#[derive(Debug, Clone)]
pub struct Clint {
    mtime: u64,
    mtimecmp: u64,
    msip: bool,
    /// Cycles accumulated towards the next mtime increment.
    cycle_count: u64,
    time_scale: u64,
    timer_enabled: bool,
}

/// A point-in-time view of the CLINT registers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClintStatus {
    pub mtime: u64,
    pub mtimecmp: u64,
    pub msip: bool,
    pub timer_pending: bool,
}

impl Clint {
    /// Create a CLINT in reset state. `time_scale` is the number of cycles
    /// per mtime increment; zero is treated as one.
    pub fn new(time_scale: u64) -> Self {
        Self {
            mtime: 0,
            mtimecmp: u64::MAX,
            msip: false,
            cycle_count: 0,
            time_scale: time_scale.max(1),
            timer_enabled: true,
        }
    }

    /// Advance the timer by `cycles` simulated cycles.
    pub fn tick(&mut self, cycles: u64, interrupts: &mut InterruptController, csr: &mut CsrBank) {
        if !self.timer_enabled {
            return;
        }
        self.cycle_count += cycles;
        if self.cycle_count >= self.time_scale {
            let increment = self.cycle_count / self.time_scale;
            self.mtime = self.mtime.wrapping_add(increment);
            self.cycle_count %= self.time_scale;
            self.check_timer_expiry(interrupts, csr);
        }
    }

    fn check_timer_expiry(&self, interrupts: &mut InterruptController, csr: &mut CsrBank) {
        if self.mtime >= self.mtimecmp {
            trace!("mtime {} reached mtimecmp {}", self.mtime, self.mtimecmp);
            interrupts.set_pending(csr, Interrupt::Timer.bit(), false);
        }
    }

    /// Read one of the memory-mapped registers as a 32-bit word.
    /// Unmapped offsets inside the block read as 0.
    pub fn read_register(&self, address: u32) -> u32 {
        match address {
            MSIP_ADDRESS => self.msip as u32,
            MTIMECMP_ADDRESS => self.mtimecmp as u32,
            a if a == MTIMECMP_ADDRESS + 4 => (self.mtimecmp >> 32) as u32,
            MTIME_ADDRESS => self.mtime as u32,
            a if a == MTIME_ADDRESS + 4 => (self.mtime >> 32) as u32,
            _ => 0,
        }
    }

    /// Write one of the memory-mapped registers as a 32-bit word.
    /// Writes to unmapped offsets inside the block are ignored.
    pub fn write_register(
        &mut self,
        address: u32,
        value: u32,
        interrupts: &mut InterruptController,
        csr: &mut CsrBank,
    ) {
        match address {
            MSIP_ADDRESS => {
                let was_set = self.msip;
                self.msip = value & 1 != 0;
                if self.msip && !was_set {
                    debug!("msip raised, software interrupt pending");
                    interrupts.set_pending(csr, Interrupt::Software.bit(), false);
                } else if !self.msip && was_set {
                    interrupts.clear_pending(csr, Interrupt::Software.bit());
                }
            }
            MTIMECMP_ADDRESS => {
                self.mtimecmp = self.mtimecmp & 0xFFFF_FFFF_0000_0000 | value as u64;
                interrupts.clear_pending(csr, Interrupt::Timer.bit());
            }
            a if a == MTIMECMP_ADDRESS + 4 => {
                self.mtimecmp = self.mtimecmp & 0xFFFF_FFFF | (value as u64) << 32;
                interrupts.clear_pending(csr, Interrupt::Timer.bit());
            }
            MTIME_ADDRESS => {
                self.mtime = self.mtime & 0xFFFF_FFFF_0000_0000 | value as u64;
            }
            a if a == MTIME_ADDRESS + 4 => {
                self.mtime = self.mtime & 0xFFFF_FFFF | (value as u64) << 32;
            }
            _ => {}
        }
    }

    /// The full 64-bit mtime value.
    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    /// Set the full 64-bit mtime value.
    pub fn set_mtime(&mut self, value: u64) {
        self.mtime = value;
    }

    /// The full 64-bit mtimecmp value.
    pub fn mtimecmp(&self) -> u64 {
        self.mtimecmp
    }

    /// Set the full 64-bit mtimecmp value. Like the MMIO halves, this clears
    /// the pending timer interrupt.
    pub fn set_mtimecmp(
        &mut self,
        value: u64,
        interrupts: &mut InterruptController,
        csr: &mut CsrBank,
    ) {
        self.mtimecmp = value;
        interrupts.clear_pending(csr, Interrupt::Timer.bit());
    }

    /// Arm the timer to fire `interval` mtime units from now.
    pub fn schedule_timer_interrupt(&mut self, interval: u64) {
        self.mtimecmp = self.mtime.wrapping_add(interval);
    }

    /// Disarm the timer (mtimecmp ← all-ones) and clear any pending timer
    /// interrupt.
    pub fn cancel_timer_interrupt(
        &mut self,
        interrupts: &mut InterruptController,
        csr: &mut CsrBank,
    ) {
        self.mtimecmp = u64::MAX;
        interrupts.clear_pending(csr, Interrupt::Timer.bit());
    }

    /// Raise msip and mark the software interrupt pending.
    pub fn trigger_software_interrupt(
        &mut self,
        interrupts: &mut InterruptController,
        csr: &mut CsrBank,
    ) {
        self.msip = true;
        interrupts.set_pending(csr, Interrupt::Software.bit(), false);
    }

    /// Clear msip and the pending software interrupt.
    pub fn clear_software_interrupt(
        &mut self,
        interrupts: &mut InterruptController,
        csr: &mut CsrBank,
    ) {
        self.msip = false;
        interrupts.clear_pending(csr, Interrupt::Software.bit());
    }

    pub fn msip(&self) -> bool {
        self.msip
    }

    pub fn timer_enabled(&self) -> bool {
        self.timer_enabled
    }

    /// Enable or disable the timer; while disabled, `tick` is a no-op.
    pub fn set_timer_enabled(&mut self, enabled: bool) {
        self.timer_enabled = enabled;
    }

    /// Restore the reset state: mtime 0, mtimecmp all-ones, msip clear, and
    /// both interrupt bits cleared.
    pub fn reset(&mut self, interrupts: &mut InterruptController, csr: &mut CsrBank) {
        self.mtime = 0;
        self.mtimecmp = u64::MAX;
        self.msip = false;
        self.cycle_count = 0;
        interrupts.clear_pending(csr, Interrupt::Timer.bit());
        interrupts.clear_pending(csr, Interrupt::Software.bit());
    }

    pub fn status(&self) -> ClintStatus {
        ClintStatus {
            mtime: self.mtime,
            mtimecmp: self.mtimecmp,
            msip: self.msip,
            timer_pending: self.mtime >= self.mtimecmp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Clint, InterruptController, CsrBank) {
        (Clint::new(1), InterruptController::new(), CsrBank::new())
    }

    #[test]
    fn test_address_block() {
        assert!(contains(MSIP_ADDRESS));
        assert!(contains(MTIMECMP_ADDRESS));
        assert!(contains(MTIME_ADDRESS + 4));
        assert!(!contains(BASE_ADDRESS - 4));
        assert!(!contains(BASE_ADDRESS + BLOCK_SIZE));
    }

    #[test]
    fn test_tick_advances_mtime() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.tick(1, &mut irq, &mut csr);
        clint.tick(1, &mut irq, &mut csr);
        assert_eq!(2, clint.mtime());
        // mtimecmp resets to all-ones, so nothing is pending.
        assert!(!irq.is_pending(&csr, 7));
    }

    #[test]
    fn test_time_scale_divides_cycles() {
        let (mut irq, mut csr) = (InterruptController::new(), CsrBank::new());
        let mut clint = Clint::new(1000);
        clint.tick(999, &mut irq, &mut csr);
        assert_eq!(0, clint.mtime());
        clint.tick(1, &mut irq, &mut csr);
        assert_eq!(1, clint.mtime());
        clint.tick(2500, &mut irq, &mut csr);
        assert_eq!(3, clint.mtime());
    }

    #[test]
    fn test_timer_expiry_sets_pending() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.set_mtimecmp(3, &mut irq, &mut csr);
        clint.tick(2, &mut irq, &mut csr);
        assert!(!irq.is_pending(&csr, 7));
        clint.tick(1, &mut irq, &mut csr);
        assert!(irq.is_pending(&csr, 7));
    }

    #[test]
    fn test_mtime_wraps_at_64_bits() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.set_mtime(0xFFFF_FFFF_FFFF_FFFE);
        for _ in 0..3 {
            clint.tick(1, &mut irq, &mut csr);
        }
        assert_eq!(1, clint.mtime());
    }

    #[test]
    fn test_mtimecmp_write_rearms_timer() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.set_mtimecmp(1, &mut irq, &mut csr);
        clint.tick(1, &mut irq, &mut csr);
        assert!(irq.is_pending(&csr, 7));

        // The ISR rearm path: writing either mtimecmp half clears the
        // pending interrupt.
        clint.write_register(MTIMECMP_ADDRESS, 100, &mut irq, &mut csr);
        assert!(!irq.is_pending(&csr, 7));
        assert_eq!(100, clint.mtimecmp());
    }

    #[test]
    fn test_mmio_halves_little_endian() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.write_register(MTIME_ADDRESS, 0xDDCC_BBAA, &mut irq, &mut csr);
        clint.write_register(MTIME_ADDRESS + 4, 0x1122_3344, &mut irq, &mut csr);
        assert_eq!(0x1122_3344_DDCC_BBAA, clint.mtime());
        assert_eq!(0xDDCC_BBAA, clint.read_register(MTIME_ADDRESS));
        assert_eq!(0x1122_3344, clint.read_register(MTIME_ADDRESS + 4));

        clint.write_register(MTIMECMP_ADDRESS + 4, 0x5566_7788, &mut irq, &mut csr);
        assert_eq!(0x5566_7788_FFFF_FFFF, clint.mtimecmp());
        // Unmapped offsets read as zero.
        assert_eq!(0, clint.read_register(BASE_ADDRESS + 8));
    }

    #[test]
    fn test_msip_edges_drive_software_interrupt() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.write_register(MSIP_ADDRESS, 1, &mut irq, &mut csr);
        assert!(clint.msip());
        assert!(irq.is_pending(&csr, 3));
        // Only bit 0 is significant.
        assert_eq!(1, clint.read_register(MSIP_ADDRESS));

        clint.write_register(MSIP_ADDRESS, 0, &mut irq, &mut csr);
        assert!(!clint.msip());
        assert!(!irq.is_pending(&csr, 3));

        clint.write_register(MSIP_ADDRESS, 0xFFFF_FFFE, &mut irq, &mut csr);
        assert!(!clint.msip());
    }

    #[test]
    fn test_software_interrupt_trigger_and_clear() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.trigger_software_interrupt(&mut irq, &mut csr);
        assert!(clint.msip());
        assert!(irq.is_pending(&csr, 3));
        assert_eq!(1, clint.read_register(MSIP_ADDRESS));

        clint.clear_software_interrupt(&mut irq, &mut csr);
        assert!(!clint.msip());
        assert!(!irq.is_pending(&csr, 3));
        assert_eq!(0, clint.read_register(MSIP_ADDRESS));
    }

    #[test]
    fn test_schedule_and_cancel() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.set_mtime(10);
        clint.schedule_timer_interrupt(5);
        assert_eq!(15, clint.mtimecmp());

        clint.set_mtime(20);
        clint.tick(1, &mut irq, &mut csr);
        assert!(irq.is_pending(&csr, 7));
        clint.cancel_timer_interrupt(&mut irq, &mut csr);
        assert_eq!(u64::MAX, clint.mtimecmp());
        assert!(!irq.is_pending(&csr, 7));
    }

    #[test]
    fn test_disabled_timer_does_not_tick() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.set_timer_enabled(false);
        clint.tick(10, &mut irq, &mut csr);
        assert_eq!(0, clint.mtime());
        clint.set_timer_enabled(true);
        clint.tick(10, &mut irq, &mut csr);
        assert_eq!(10, clint.mtime());
    }

    #[test]
    fn test_reset() {
        let (mut clint, mut irq, mut csr) = setup();
        clint.set_mtimecmp(1, &mut irq, &mut csr);
        clint.tick(5, &mut irq, &mut csr);
        clint.trigger_software_interrupt(&mut irq, &mut csr);

        clint.reset(&mut irq, &mut csr);
        let status = clint.status();
        assert_eq!(0, status.mtime);
        assert_eq!(u64::MAX, status.mtimecmp);
        assert!(!status.msip);
        assert!(!status.timer_pending);
        assert!(!irq.is_pending(&csr, 7));
        assert!(!irq.is_pending(&csr, 3));
    }
}

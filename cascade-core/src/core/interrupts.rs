//! Interrupt enable/pending logic on top of the CSR bank.
//!
//! The bank is the source of truth for mip, mie, and mstatus.MIE; the
//! controller only owns the edge/level configuration and the latched-edge
//! set. All mutating operations therefore take the bank as a parameter,
//! which keeps the single-writer-per-sub-phase discipline of the cycle loop
//! visible in the signatures.

use bitvec::{order::Lsb0, view::BitView};
use log::trace;

use crate::core::csr::{self, CsrBank};

/// The machine-level interrupts this single-hart core recognises.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interrupt {
    /// Machine software interrupt, mip/mie bit 3, driven by the CLINT's msip
    /// register.
    Software,
    /// Machine timer interrupt, mip/mie bit 7, driven by mtime/mtimecmp.
    Timer,
    /// Machine external interrupt, mip/mie bit 11.
    External,
}

impl Interrupt {
    /// The mip/mie bit position of this interrupt.
    pub const fn bit(self) -> u32 {
        match self {
            Self::Software => 3,
            Self::Timer => 7,
            Self::External => 11,
        }
    }

    /// The mcause value of this interrupt (bit 31 set).
    pub const fn code(self) -> u32 {
        0x8000_0000 | self.bit()
    }

    /// Map a mip/mie bit position back to the interrupt it belongs to.
    pub fn from_bit(bit: u32) -> Option<Self> {
        match bit {
            3 => Some(Self::Software),
            7 => Some(Self::Timer),
            11 => Some(Self::External),
            _ => None,
        }
    }
}

/// Mask of the mip/mie bits the controller manages.
pub const VALID_INTERRUPT_BITS: u32 =
    (1 << Interrupt::Software.bit()) | (1 << Interrupt::Timer.bit()) | (1 << Interrupt::External.bit());

// Delivery priority, highest first: external > software > timer.
const PRIORITY_ORDER: [Interrupt; 3] = [Interrupt::External, Interrupt::Software, Interrupt::Timer];

/// Interrupt controller: mip/mie/mstatus.MIE manipulation, edge/level
/// triggering, and priority resolution.
#[derive(Debug, Clone)]
pub struct InterruptController {
    /// Bits configured edge-triggered; the complement of the valid set is
    /// level-triggered. All three interrupts are level-triggered by default.
    edge_triggered: u32,
    /// Edge-triggered bits whose pending state was latched by an assert.
    latched_edges: u32,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            edge_triggered: 0,
            latched_edges: 0,
        }
    }

    fn is_valid_bit(bit: u32) -> bool {
        bit < 32 && (1 << bit) & VALID_INTERRUPT_BITS != 0
    }

    /// Mark an interrupt pending in mip. If `edge` is set, the bit is also
    /// recorded as a latched edge, to be cleared on acknowledge.
    pub fn set_pending(&mut self, csr: &mut CsrBank, bit: u32, edge: bool) {
        if !Self::is_valid_bit(bit) {
            return;
        }
        let mut mip = csr.read(csr::MIP);
        mip.view_bits_mut::<Lsb0>().set(bit as usize, true);
        csr.write(csr::MIP, mip);
        if edge {
            self.latched_edges |= 1 << bit;
        }
        trace!("interrupt bit {bit} pending (edge: {edge})");
    }

    /// Clear an interrupt's mip bit and any latched edge for it.
    pub fn clear_pending(&mut self, csr: &mut CsrBank, bit: u32) {
        if !Self::is_valid_bit(bit) {
            return;
        }
        let mut mip = csr.read(csr::MIP);
        mip.view_bits_mut::<Lsb0>().set(bit as usize, false);
        csr.write(csr::MIP, mip);
        self.latched_edges &= !(1 << bit);
    }

    /// Returns `true` if the interrupt's mip bit is set.
    pub fn is_pending(&self, csr: &CsrBank, bit: u32) -> bool {
        Self::is_valid_bit(bit) && csr.read(csr::MIP) & (1 << bit) != 0
    }

    /// Returns `true` if the interrupt's mie bit is set.
    pub fn is_enabled(&self, csr: &CsrBank, bit: u32) -> bool {
        Self::is_valid_bit(bit) && csr.read(csr::MIE) & (1 << bit) != 0
    }

    /// Returns `true` if mstatus.MIE is set.
    pub fn is_globally_enabled(&self, csr: &CsrBank) -> bool {
        csr.read(csr::MSTATUS) & (1 << 3) != 0
    }

    /// The pending interrupts, restricted to the three machine bits.
    pub fn pending_mask(&self, csr: &CsrBank) -> u32 {
        csr.read(csr::MIP) & VALID_INTERRUPT_BITS
    }

    /// The enabled interrupts, restricted to the three machine bits.
    pub fn enabled_mask(&self, csr: &CsrBank) -> u32 {
        csr.read(csr::MIE) & VALID_INTERRUPT_BITS
    }

    /// The interrupts ready for delivery: pending, individually enabled, and
    /// globally enabled. Empty whenever mstatus.MIE is clear.
    pub fn deliverable_mask(&self, csr: &CsrBank) -> u32 {
        match self.is_globally_enabled(csr) {
            true => self.pending_mask(csr) & self.enabled_mask(csr),
            false => 0,
        }
    }

    /// The bit position of the highest-priority deliverable interrupt
    /// (external > software > timer), or `None` if nothing is deliverable.
    pub fn highest_priority(&self, csr: &CsrBank) -> Option<u32> {
        let deliverable = self.deliverable_mask(csr);
        PRIORITY_ORDER
            .iter()
            .map(|interrupt| interrupt.bit())
            .find(|bit| deliverable & (1 << bit) != 0)
    }

    /// Acknowledge a delivered interrupt. Latched edges are cleared from
    /// mip; for level-triggered interrupts the source must be cleared at the
    /// device, so the pending bit stays.
    pub fn acknowledge(&mut self, csr: &mut CsrBank, bit: u32) {
        if !Self::is_valid_bit(bit) {
            return;
        }
        if self.latched_edges & (1 << bit) != 0 {
            self.clear_pending(csr, bit);
        }
    }

    /// Configure an interrupt as edge-triggered.
    pub fn set_edge_triggered(&mut self, bit: u32) {
        if Self::is_valid_bit(bit) {
            self.edge_triggered |= 1 << bit;
        }
    }

    /// Configure an interrupt as level-triggered (the default).
    pub fn set_level_triggered(&mut self, bit: u32) {
        if Self::is_valid_bit(bit) {
            self.edge_triggered &= !(1 << bit);
        }
    }

    pub fn is_edge_triggered(&self, bit: u32) -> bool {
        Self::is_valid_bit(bit) && self.edge_triggered & (1 << bit) != 0
    }

    pub fn is_level_triggered(&self, bit: u32) -> bool {
        Self::is_valid_bit(bit) && !self.is_edge_triggered(bit)
    }

    /// Set an interrupt's mie bit.
    pub fn enable_interrupt(&self, csr: &mut CsrBank, bit: u32) {
        if !Self::is_valid_bit(bit) {
            return;
        }
        let mut mie = csr.read(csr::MIE);
        mie.view_bits_mut::<Lsb0>().set(bit as usize, true);
        csr.write(csr::MIE, mie);
    }

    /// Clear an interrupt's mie bit.
    pub fn disable_interrupt(&self, csr: &mut CsrBank, bit: u32) {
        if !Self::is_valid_bit(bit) {
            return;
        }
        let mut mie = csr.read(csr::MIE);
        mie.view_bits_mut::<Lsb0>().set(bit as usize, false);
        csr.write(csr::MIE, mie);
    }

    /// Set mstatus.MIE.
    pub fn enable_global_interrupts(&self, csr: &mut CsrBank) {
        csr.set_bits(csr::MSTATUS, 1 << 3);
    }

    /// Clear mstatus.MIE.
    pub fn disable_global_interrupts(&self, csr: &mut CsrBank) {
        csr.clear_bits(csr::MSTATUS, 1 << 3);
    }

    /// Replace the three machine interrupt-enable bits of mie with `mask`.
    /// Bits outside the valid set are ignored.
    pub fn mask_interrupts(&self, csr: &mut CsrBank, mask: u32) {
        let mie = csr.read(csr::MIE);
        csr.write(
            csr::MIE,
            mie & !VALID_INTERRUPT_BITS | mask & VALID_INTERRUPT_BITS,
        );
    }

    /// Clear mip, the three interrupt bits of mie, the global enable, and
    /// all latched edges.
    pub fn reset(&mut self, csr: &mut CsrBank) {
        csr.write(csr::MIP, 0);
        let mie = csr.read(csr::MIE);
        csr.write(csr::MIE, mie & !VALID_INTERRUPT_BITS);
        self.disable_global_interrupts(csr);
        self.latched_edges = 0;
    }
}

/// A device-side interrupt line bound to one of the three machine interrupt
/// bits.
///
/// The source remembers only its own line level; how an assert reaches mip
/// depends on the controller's edge/level configuration for the bit.
#[derive(Debug, Clone)]
pub struct InterruptSource {
    name: String,
    bit: u32,
    active: bool,
}

impl InterruptSource {
    pub fn new(name: impl Into<String>, bit: u32) -> Self {
        Self {
            name: name.into(),
            bit,
            active: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bit(&self) -> u32 {
        self.bit
    }

    /// Returns `true` if the line is currently asserted.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Raise the interrupt line.
    pub fn assert_interrupt(&mut self, controller: &mut InterruptController, csr: &mut CsrBank) {
        self.active = true;
        let edge = controller.is_edge_triggered(self.bit);
        trace!("interrupt source {} asserted", self.name);
        controller.set_pending(csr, self.bit, edge);
    }

    /// Lower the interrupt line. For a level-triggered bit this clears the
    /// pending state; a latched edge stays pending until acknowledged.
    pub fn deassert_interrupt(&mut self, controller: &mut InterruptController, csr: &mut CsrBank) {
        self.active = false;
        if controller.is_level_triggered(self.bit) {
            controller.clear_pending(csr, self.bit);
        }
    }

    /// Assert and immediately deassert the line.
    pub fn pulse(&mut self, controller: &mut InterruptController, csr: &mut CsrBank) {
        self.assert_interrupt(controller, csr);
        self.deassert_interrupt(controller, csr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SW: u32 = 3;
    const TIMER: u32 = 7;
    const EXT: u32 = 11;

    fn setup() -> (InterruptController, CsrBank) {
        (InterruptController::new(), CsrBank::new())
    }

    #[test]
    fn test_interrupt_codes() {
        assert_eq!(0x8000_0003, Interrupt::Software.code());
        assert_eq!(0x8000_0007, Interrupt::Timer.code());
        assert_eq!(0x8000_000B, Interrupt::External.code());
        assert_eq!(Some(Interrupt::Timer), Interrupt::from_bit(7));
        assert_eq!(None, Interrupt::from_bit(5));
    }

    #[test]
    fn test_pending_and_enabled() {
        let (mut irq, mut csr) = setup();
        assert!(!irq.is_pending(&csr, TIMER));
        irq.set_pending(&mut csr, TIMER, false);
        assert!(irq.is_pending(&csr, TIMER));
        assert_eq!(1 << TIMER, csr.read(crate::core::csr::MIP));

        irq.enable_interrupt(&mut csr, TIMER);
        assert!(irq.is_enabled(&csr, TIMER));
        irq.disable_interrupt(&mut csr, TIMER);
        assert!(!irq.is_enabled(&csr, TIMER));

        irq.clear_pending(&mut csr, TIMER);
        assert!(!irq.is_pending(&csr, TIMER));
    }

    #[test]
    fn test_invalid_bits_are_ignored() {
        let (mut irq, mut csr) = setup();
        irq.set_pending(&mut csr, 5, false);
        irq.set_pending(&mut csr, 31, true);
        assert_eq!(0, csr.read(crate::core::csr::MIP));
    }

    #[test]
    fn test_deliverable_requires_all_three_gates() {
        let (mut irq, mut csr) = setup();
        irq.set_pending(&mut csr, TIMER, false);
        assert_eq!(0, irq.deliverable_mask(&csr));
        irq.enable_interrupt(&mut csr, TIMER);
        assert_eq!(0, irq.deliverable_mask(&csr));
        irq.enable_global_interrupts(&mut csr);
        assert_eq!(1 << TIMER, irq.deliverable_mask(&csr));
        irq.disable_global_interrupts(&mut csr);
        assert_eq!(0, irq.deliverable_mask(&csr));
    }

    #[test]
    fn test_priority_external_over_software_over_timer() {
        let (mut irq, mut csr) = setup();
        irq.enable_global_interrupts(&mut csr);
        irq.mask_interrupts(&mut csr, VALID_INTERRUPT_BITS);

        irq.set_pending(&mut csr, TIMER, false);
        assert_eq!(Some(TIMER), irq.highest_priority(&csr));
        irq.set_pending(&mut csr, SW, false);
        assert_eq!(Some(SW), irq.highest_priority(&csr));
        irq.set_pending(&mut csr, EXT, false);
        assert_eq!(Some(EXT), irq.highest_priority(&csr));

        irq.clear_pending(&mut csr, EXT);
        assert_eq!(Some(SW), irq.highest_priority(&csr));
    }

    #[test]
    fn test_acknowledge_clears_only_latched_edges() {
        let (mut irq, mut csr) = setup();
        irq.set_edge_triggered(EXT);
        irq.set_pending(&mut csr, EXT, true);
        irq.set_pending(&mut csr, TIMER, false);

        irq.acknowledge(&mut csr, EXT);
        assert!(!irq.is_pending(&csr, EXT));
        irq.acknowledge(&mut csr, TIMER);
        // Level-triggered: the device has to clear the line.
        assert!(irq.is_pending(&csr, TIMER));
    }

    #[test]
    fn test_reset() {
        let (mut irq, mut csr) = setup();
        irq.enable_global_interrupts(&mut csr);
        irq.mask_interrupts(&mut csr, VALID_INTERRUPT_BITS);
        irq.set_pending(&mut csr, SW, true);
        irq.reset(&mut csr);
        assert_eq!(0, csr.read(crate::core::csr::MIP));
        assert_eq!(0, irq.enabled_mask(&csr));
        assert!(!irq.is_globally_enabled(&csr));
    }

    #[test]
    fn test_trigger_mode_configuration_round_trip() {
        let (mut irq, mut csr) = setup();
        // Everything starts level-triggered.
        assert!(irq.is_level_triggered(EXT));
        assert!(!irq.is_edge_triggered(EXT));

        irq.set_edge_triggered(EXT);
        assert!(irq.is_edge_triggered(EXT));
        assert!(!irq.is_level_triggered(EXT));

        // Back to level-triggered: asserts stop latching, so a deassert
        // clears the pending bit again.
        irq.set_level_triggered(EXT);
        assert!(irq.is_level_triggered(EXT));
        let mut source = InterruptSource::new("plic", EXT);
        source.assert_interrupt(&mut irq, &mut csr);
        source.deassert_interrupt(&mut irq, &mut csr);
        assert!(!irq.is_pending(&csr, EXT));

        // Out-of-range bits are neither, and configuring them is a no-op.
        irq.set_level_triggered(5);
        assert!(!irq.is_level_triggered(5));
        assert!(!irq.is_edge_triggered(5));
    }

    #[test]
    fn test_source_level_triggered() {
        let (mut irq, mut csr) = setup();
        let mut source = InterruptSource::new("plic", EXT);
        assert!(!source.is_active());

        source.assert_interrupt(&mut irq, &mut csr);
        assert!(source.is_active());
        assert!(irq.is_pending(&csr, EXT));

        source.deassert_interrupt(&mut irq, &mut csr);
        assert!(!source.is_active());
        assert!(!irq.is_pending(&csr, EXT));
    }

    #[test]
    fn test_source_edge_triggered_latches() {
        let (mut irq, mut csr) = setup();
        irq.set_edge_triggered(SW);
        let mut source = InterruptSource::new("ipi", SW);

        source.pulse(&mut irq, &mut csr);
        // The pulse ended, but the latched edge keeps the bit pending until
        // it is acknowledged.
        assert!(!source.is_active());
        assert!(irq.is_pending(&csr, SW));
        irq.acknowledge(&mut csr, SW);
        assert!(!irq.is_pending(&csr, SW));
    }
}

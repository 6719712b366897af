/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: crd                                                             ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Capability range descriptors and the range intersection math    ║
   ║         used when capabilities are delegated or revoked.                ║
   ║         A Crd names a naturally aligned power-of-two range of           ║
   ║         capabilities of one kind (memory pages, I/O ports or object     ║
   ║         selectors).                                                     ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/

use bitflags::bitflags;
use core::cmp::{max, min};
use num_enum::TryFromPrimitive;

bitflags! {
    /// Permission bits of a memory capability.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct MemAttr: usize {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// All five attribute bits of a Crd.
pub const ATTR_FULL: usize = 0x1f;

/// Access bit of an I/O port capability.
pub const PIO_ACCESS: usize = 1 << 0;

/// Call/control bits of an object capability.
pub const OBJ_CTRL: usize = 1 << 0;
pub const OBJ_CALL: usize = 1 << 1;

#[repr(usize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
pub enum CrdKind {
    Null = 0,
    Mem = 1,
    Pio = 2,
    Obj = 3,
}

/// Capability range descriptor.
///
/// Encoding: bits 1..0 hold the kind, bits 6..2 the order, bits 11..7 the
/// attribute field and the remaining bits the base.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Crd(usize);

const KIND_MASK: usize = 0x3;
const ORDER_SHIFT: usize = 2;
const ORDER_MASK: usize = 0x1f;
const ATTR_SHIFT: usize = 7;
const ATTR_MASK: usize = 0x1f;
const BASE_SHIFT: usize = 12;

impl Crd {
    pub const fn new(kind: CrdKind, base: usize, order: usize, attr: usize) -> Self {
        Self(
            (kind as usize & KIND_MASK)
                | ((order & ORDER_MASK) << ORDER_SHIFT)
                | ((attr & ATTR_MASK) << ATTR_SHIFT)
                | (base << BASE_SHIFT),
        )
    }

    /// The null descriptor, returned when a transfer yields nothing.
    pub const fn null() -> Self {
        Self(0)
    }

    /// A descriptor covering the entire space of `kind` with all rights.
    pub const fn full(kind: CrdKind) -> Self {
        Self::new(kind, 0, ORDER_MASK, ATTR_MASK)
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub fn kind(self) -> CrdKind {
        CrdKind::try_from(self.0 & KIND_MASK).unwrap_or(CrdKind::Null)
    }

    pub const fn order(self) -> usize {
        (self.0 >> ORDER_SHIFT) & ORDER_MASK
    }

    pub const fn attr(self) -> usize {
        (self.0 >> ATTR_SHIFT) & ATTR_MASK
    }

    pub const fn base(self) -> usize {
        self.0 >> BASE_SHIFT
    }
}

impl core::fmt::Debug for Crd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Crd {{ kind: {:?}, base: {:#x}, order: {}, attr: {:#x} }}",
            self.kind(),
            self.base(),
            self.order(),
            self.attr()
        )
    }
}

/// Quantum/priority descriptor for scheduling contexts.
/// Bits 7..0 hold the priority, bits 63..12 the quantum in microseconds.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Qpd(usize);

impl Qpd {
    pub const fn new(prio: usize, quantum: usize) -> Self {
        Self((prio & 0xff) | (quantum << 12))
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn prio(self) -> usize {
        self.0 & 0xff
    }

    pub const fn quantum(self) -> usize {
        self.0 >> 12
    }
}

/// Intersect a send range with a receive range.
///
/// Both bases must agree above the larger order, i.e. the smaller range must
/// lie within the larger one. On success the receive base is completed with
/// the send base's low bits and the effective order is returned; `None`
/// means the ranges do not overlap.
pub fn clamp(snd_base: usize, rcv_base: &mut usize, snd_ord: usize, rcv_ord: usize) -> Option<usize> {
    if (snd_base ^ *rcv_base) >> max(snd_ord, rcv_ord) != 0 {
        return None;
    }

    *rcv_base |= snd_base;

    Some(min(snd_ord, rcv_ord))
}

/// Intersect a send window with a receive window, placing the smaller one
/// inside the larger via the hotspot.
///
/// Both bases are aligned down to their orders first. When the receive
/// window is larger, the hotspot's low bits pick the target slot inside it;
/// when the send window is larger, the hotspot picks the source slot.
pub fn clamp_hotspot(snd_base: &mut usize, rcv_base: &mut usize, snd_ord: usize, rcv_ord: usize, hotspot: usize) -> usize {
    assert!(snd_ord < usize::BITS as usize);
    assert!(rcv_ord < usize::BITS as usize);

    let s = (1usize << snd_ord) - 1;
    let r = (1usize << rcv_ord) - 1;

    *snd_base &= !s;
    *rcv_base &= !r;

    if s < r {
        *rcv_base |= hotspot & r & !s;
        snd_ord
    } else {
        *snd_base |= hotspot & s & !r;
        rcv_ord
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_round_trip() {
        let crd = Crd::new(CrdKind::Mem, 0x100, 4, MemAttr::WRITE.bits());
        assert_eq!(crd.kind(), CrdKind::Mem);
        assert_eq!(crd.base(), 0x100);
        assert_eq!(crd.order(), 4);
        assert_eq!(crd.attr(), 0x2);

        let raw = Crd::from_raw(crd.raw());
        assert_eq!(raw, crd);
    }

    #[test]
    fn crd_null_and_full() {
        assert_eq!(Crd::null().kind(), CrdKind::Null);
        assert_eq!(Crd::null().attr(), 0);

        let full = Crd::full(CrdKind::Obj);
        assert_eq!(full.base(), 0);
        assert_eq!(full.order(), 0x1f);
        assert_eq!(full.attr(), ATTR_FULL);
    }

    #[test]
    fn qpd_fields() {
        let qpd = Qpd::new(0x17, 10_000);
        assert_eq!(qpd.prio(), 0x17);
        assert_eq!(qpd.quantum(), 10_000);
    }

    #[test]
    fn clamp_returns_min_order_on_agreement() {
        // Bases agree above max(so, ro) -> min order.
        let mut rcv = 0x100;
        assert_eq!(clamp(0x100, &mut rcv, 4, 8), Some(4));
        assert_eq!(rcv, 0x100);

        // Sub-range of a larger window: rcv base gets completed.
        let mut rcv = 0x100;
        assert_eq!(clamp(0x130, &mut rcv, 4, 8), Some(4));
        assert_eq!(rcv, 0x130);
    }

    #[test]
    fn clamp_rejects_disjoint_ranges() {
        let mut rcv = 0x200;
        assert_eq!(clamp(0x100, &mut rcv, 4, 4), None);

        let mut rcv = 0x1000;
        assert_eq!(clamp(0x100, &mut rcv, 0, 4), None);
    }

    #[test]
    fn clamp_law() {
        // clamp(sb, rb, so, ro) == min(so, ro) iff (sb ^ rb) >> max(so, ro) == 0.
        for &(sb, rb, so, ro) in &[
            (0x100usize, 0x100usize, 4usize, 4usize),
            (0x100, 0x110, 4, 8),
            (0x100, 0x200, 4, 8),
            (0xabc000, 0xabc700, 8, 12),
            (0x0, 0x0, 0, 0),
        ] {
            let mut rcv = rb;
            let expect = if (sb ^ rb) >> max(so, ro) == 0 { Some(min(so, ro)) } else { None };
            assert_eq!(clamp(sb, &mut rcv, so, ro), expect, "sb={sb:#x} rb={rb:#x} so={so} ro={ro}");
        }
    }

    #[test]
    fn clamp_hotspot_places_small_window_in_large_one() {
        // Receive window larger: the hotspot selects the slot inside it.
        let mut snd = 0x340;
        let mut rcv = 0x8000;
        let ord = clamp_hotspot(&mut snd, &mut rcv, 4, 12, 0x340);
        assert_eq!(ord, 4);
        assert_eq!(snd, 0x340);
        assert_eq!(rcv, 0x8340);

        // Send window larger: the hotspot selects the source slot.
        let mut snd = 0x8000;
        let mut rcv = 0x340;
        let ord = clamp_hotspot(&mut snd, &mut rcv, 12, 4, 0x340);
        assert_eq!(ord, 4);
        assert_eq!(snd, 0x8340);
        assert_eq!(rcv, 0x340);
    }

    #[test]
    fn clamp_hotspot_aligns_bases() {
        let mut snd = 0x123;
        let mut rcv = 0x4567;
        clamp_hotspot(&mut snd, &mut rcv, 4, 4, 0);
        assert_eq!(snd, 0x120);
        assert_eq!(rcv, 0x4560);
    }
}

/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: space                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Per-domain resource spaces. Each space owns a mapping tree      ║
   ║         and the kind-specific shadow structure that user-visible        ║
   ║         hardware consults (page tables, the I/O permission bitmap,      ║
   ║         the capability table). Delegation and revocation are generic    ║
   ║         over the space kind and stay monomorphic on the hot path.       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
pub mod space_mem;
pub mod space_obj;
pub mod space_pio;

use crate::cap::mdb::{Mdb, MdbTree};
use crate::process::pd::Pd;
use spin::RwLock;
use syscall::CrdKind;

#[repr(usize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpaceKind {
    Mem = 0,
    Pio = 1,
    Obj = 2,
}

impl SpaceKind {
    pub fn from_crd(kind: CrdKind) -> Option<SpaceKind> {
        match kind {
            CrdKind::Mem => Some(SpaceKind::Mem),
            CrdKind::Pio => Some(SpaceKind::Pio),
            CrdKind::Obj => Some(SpaceKind::Obj),
            CrdKind::Null => None,
        }
    }
}

pub trait Space {
    const KIND: SpaceKind;

    fn of(pd: &Pd) -> &Self;

    fn tree(&self) -> &RwLock<MdbTree>;

    /// Sub-kind flags a delegation inherits from its parent regardless of
    /// what the transfer requested.
    fn sticky_sub(sub: usize) -> usize;

    /// Replicate the node's current state into the space's shadow
    /// structure. `strip` names the attribute bits being revoked; zero
    /// means install. Returns true iff anything user-visible changed.
    fn update(&self, pd: &Pd, mdb: &Mdb, strip: usize) -> bool;
}

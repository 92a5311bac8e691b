/// Inter-Processor Interrupt (IPI) kinds and broadcast
///
/// Cluster-wide operations run locally on the calling core and are fanned
/// out to every other online core as an IPI; each receiver performs the same
/// operation for itself in `Kernel::handle_ipi`.
use super::percpu::CoreBlock;
use crate::traits::Platform;

/// RESCHEDULE_IPI vector number
pub const RESCHEDULE_IPI_VECTOR: u8 = 0x30;

/// TLB_FLUSH_IPI vector number
pub const TLB_FLUSH_IPI_VECTOR: u8 = 0x31;

/// START_SCHEDULER_IPI vector number
pub const START_SCHEDULER_IPI_VECTOR: u8 = 0x33;

/// SETUP_TIMESLICE_IPI vector number
pub const SETUP_TIMESLICE_IPI_VECTOR: u8 = 0x34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiKind {
    /// Drain the inbox and leave idle if work arrived
    Reschedule,
    StartScheduler,
    InvalidateTlb,
    /// Arm the local timer with the timeslice period
    SetupTimeslice,
}

impl IpiKind {
    pub const fn vector(self) -> u8 {
        match self {
            IpiKind::Reschedule => RESCHEDULE_IPI_VECTOR,
            IpiKind::InvalidateTlb => TLB_FLUSH_IPI_VECTOR,
            IpiKind::StartScheduler => START_SCHEDULER_IPI_VECTOR,
            IpiKind::SetupTimeslice => SETUP_TIMESLICE_IPI_VECTOR,
        }
    }

    pub const fn from_vector(vector: u8) -> Option<Self> {
        match vector {
            RESCHEDULE_IPI_VECTOR => Some(IpiKind::Reschedule),
            TLB_FLUSH_IPI_VECTOR => Some(IpiKind::InvalidateTlb),
            START_SCHEDULER_IPI_VECTOR => Some(IpiKind::StartScheduler),
            SETUP_TIMESLICE_IPI_VECTOR => Some(IpiKind::SetupTimeslice),
            _ => None,
        }
    }
}

/// Send `kind` to every online core except `exclude`
///
/// Returns the number of IPIs sent.
pub fn broadcast_ipi<P: Platform>(
    platform: &P,
    cores: &[CoreBlock],
    kind: IpiKind,
    exclude: usize,
) -> usize {
    let mut sent = 0;
    for core in cores.iter().filter(|core| core.id != exclude && core.is_online()) {
        platform.send_ipi(core.apic_id, kind);
        sent += 1;
    }
    sent
}

//! Packet processor of the simulated agent.
//!
//! One consumer thread per queue: wait for the doorbell to reach the read
//! index, acquire the slot header, execute, reset the slot, advance the read
//! index and only then decrement the completion signal. A waiter released by
//! the signal always observes the read index past its packet.

use super::SimShared;
use super::kernel::KernelContext;
use crate::packet::{DispatchPacket, PacketHeader, PacketType};
use crate::queue::{Queue, QueueFault};
use crate::signal::SignalCondition;
use crate::status::HsaStatus;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub(crate) fn process_queue(queue: Arc<Queue>, shared: Arc<SimShared>, workgroup_max_size: u32) {
    let mut read_index = queue.load_read_index();
    debug!(queue = queue.id(), "sim agent packet processor started");
    loop {
        queue.doorbell().wait_acquire(SignalCondition::Gte, read_index as i64, None);
        if !queue.is_active() {
            break;
        }

        let slot = queue.slot(read_index);
        let words = slot.snapshot();
        if PacketHeader::decode(words[0] as u16).map(|h| h.packet_type) == Some(PacketType::Invalid)
        {
            // Doorbell rung for a later index; this slot is still being written.
            std::thread::yield_now();
            continue;
        }

        let packet = DispatchPacket::from_words(&words);
        let completion = packet.map(|p| p.completion_signal).unwrap_or_default();
        if let Err((status, message)) = execute(packet, &shared, workgroup_max_size) {
            warn!(queue = queue.id(), index = read_index, ?status, "{message}");
            queue.record_fault(QueueFault { packet_index: read_index, status, message });
        }

        slot.retire();
        let index = read_index;
        read_index += 1;
        queue.store_read_index(read_index);

        if completion != 0 {
            match shared.signal(completion) {
                Some(signal) => {
                    signal.subtract_release(1);
                }
                None => queue.record_fault(QueueFault {
                    packet_index: index,
                    status: HsaStatus::InvalidSignal,
                    message: format!("unknown completion signal {completion:#x}"),
                }),
            }
        }
    }
    debug!(queue = queue.id(), "sim agent packet processor stopped");
}

fn execute(
    packet: Option<DispatchPacket>,
    shared: &SimShared,
    workgroup_max_size: u32,
) -> Result<(), (HsaStatus, String)> {
    let packet =
        packet.ok_or((HsaStatus::InvalidPacketFormat, "unknown packet type".to_string()))?;
    if packet.header.packet_type != PacketType::KernelDispatch {
        return Err((
            HsaStatus::InvalidPacketFormat,
            format!("unsupported packet type {:?}", packet.header.packet_type),
        ));
    }
    validate_shape(&packet, workgroup_max_size)?;

    let kernel = shared.kernel(packet.kernel_object).ok_or_else(|| {
        (HsaStatus::Exception, format!("no kernel at object {:#x}", packet.kernel_object.0))
    })?;

    trace!(
        kernel_object = packet.kernel_object.0,
        grid = ?packet.grid_size,
        workgroup = ?packet.workgroup_size,
        "executing dispatch"
    );
    let ctx = KernelContext::new(&packet, &shared.memory);
    match catch_unwind(AssertUnwindSafe(|| kernel(&ctx))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(fault)) => Err((fault.status, fault.message)),
        Err(_) => Err((HsaStatus::Exception, "kernel panicked".to_string())),
    }
}

fn validate_shape(packet: &DispatchPacket, workgroup_max_size: u32) -> Result<(), (HsaStatus, String)> {
    let bad = |msg: String| (HsaStatus::IncompatibleArguments, msg);
    if !(1..=3).contains(&packet.dimensions) {
        return Err(bad(format!("invalid dimension count {}", packet.dimensions)));
    }
    if packet.workgroup_size.contains(&0) || packet.grid_size.contains(&0) {
        return Err(bad(format!(
            "zero extent in workgroup {:?} or grid {:?}",
            packet.workgroup_size, packet.grid_size
        )));
    }
    let items: u32 = packet.workgroup_size.iter().map(|&d| u32::from(d)).product();
    if items > workgroup_max_size {
        return Err(bad(format!("workgroup of {items} exceeds maximum {workgroup_max_size}")));
    }
    Ok(())
}

//! The TIME producer/consumer service
//!
//! Object 0x1012 holds the TIME COB-ID: bit 31 enables the consumer, bit 30
//! the producer. The engine has no wall clock, so the producer derives the
//! broadcast [`TimeOfDay`] from a host-supplied reference pair (monotonic µs,
//! wall time) and the host-armed production period. Object 0x1013, when
//! present, is refreshed with the µs since service start on every
//! production.

use std::cell::RefCell;
use std::rc::Rc;

use stillcan_common::messages::TimeMessage;
use stillcan_common::sdo::AbortCode;
use stillcan_common::{CanFrame, CanId, TimeOfDay, Value};

use crate::object_dict::{Device, DeviceError, DnRequest};
use crate::pdo::cobid_to_can_id;

/// Bit 31 of the TIME COB-ID entry: this device consumes TIME
pub const COBID_CONSUMER: u32 = 1 << 31;
/// Bit 30 of the TIME COB-ID entry: this device produces TIME
pub const COBID_PRODUCER: u32 = 1 << 30;
/// Bit 29 of the TIME COB-ID entry: the CAN-ID is 29-bit
pub const COBID_FRAME: u32 = 1 << 29;

const MILLIS_PER_DAY: u64 = 86_400_000;

/// Advance a [`TimeOfDay`] by a number of microseconds
fn advance(base: TimeOfDay, delta_us: u64) -> TimeOfDay {
    let total_ms = base.millis() as u64 + delta_us / 1000;
    let days = base.days() as u64 + total_ms / MILLIS_PER_DAY;
    TimeOfDay::new(days.min(u16::MAX as u64) as u16, (total_ms % MILLIS_PER_DAY) as u32)
}

/// The indication raised for every consumed TIME frame
pub type TimeIndication = Box<dyn FnMut(TimeOfDay)>;

struct TimeCore {
    cobid: u32,
    interval_us: Option<u64>,
    next_produce: Option<u64>,
    start_us: Option<u64>,
    clock_ref: Option<(u64, TimeOfDay)>,
    ind: Option<TimeIndication>,
}

/// The TIME service
pub struct TimeService {
    core: Rc<RefCell<TimeCore>>,
}

impl core::fmt::Debug for TimeService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("TimeService")
            .field("cobid", &core.cobid)
            .field("interval_us", &core.interval_us)
            .finish()
    }
}

impl TimeService {
    /// Attach to the TIME objects of `dev`; object 0x1012 must exist
    pub fn attach(dev: &mut Device) -> Result<Self, DeviceError> {
        let cobid = dev
            .read(0x1012, 0)
            .ok()
            .and_then(|v| v.as_u64())
            .ok_or(DeviceError::NotFound {
                index: 0x1012,
                sub: Some(0),
            })? as u32;

        let core = Rc::new(RefCell::new(TimeCore {
            cobid,
            interval_us: None,
            next_produce: None,
            start_us: None,
            clock_ref: None,
            ind: None,
        }));

        let hook_core = core.clone();
        dev.set_dn_hook(
            0x1012,
            0,
            Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                write_time_cobid(&hook_core, dev, req)
            })),
        )?;

        Ok(Self { core })
    }

    /// Register the consumer indication
    pub fn set_indication(&self, ind: Option<TimeIndication>) {
        self.core.borrow_mut().ind = ind;
    }

    /// Provide the wall-clock reference the producer extrapolates from
    pub fn set_clock(&self, now_us: u64, time: TimeOfDay) {
        self.core.borrow_mut().clock_ref = Some((now_us, time));
    }

    /// Start producing at `interval_us`
    ///
    /// Fails unless the producer bit of the stored COB-ID is set and a clock
    /// reference was provided.
    pub fn start_producer(&self, interval_us: u64, now: u64) -> Result<(), DeviceError> {
        let mut core = self.core.borrow_mut();
        if core.cobid & COBID_PRODUCER == 0 || interval_us == 0 || core.clock_ref.is_none() {
            return Err(DeviceError::Inval);
        }
        core.interval_us = Some(interval_us);
        core.next_produce = Some(now + interval_us);
        core.start_us.get_or_insert(now);
        Ok(())
    }

    /// Stop producing
    pub fn stop_producer(&self) {
        let mut core = self.core.borrow_mut();
        core.interval_us = None;
        core.next_produce = None;
    }

    /// True when the consumer bit of the stored COB-ID is set
    pub fn is_consumer(&self) -> bool {
        self.core.borrow().cobid & COBID_CONSUMER != 0
    }

    /// The configured TIME COB-ID
    pub fn can_id(&self) -> CanId {
        cobid_to_can_id(self.core.borrow().cobid)
    }

    /// The next production instant, when producing
    pub fn deadline(&self) -> Option<u64> {
        self.core.borrow().next_produce
    }

    /// Produce one TIME frame and schedule the next
    pub fn on_timer(&self, dev: &mut Device, now: u64, out: &mut Vec<CanFrame>) {
        let (id, time, start) = {
            let mut core = self.core.borrow_mut();
            let (Some(next), Some(interval)) = (core.next_produce, core.interval_us) else {
                return;
            };
            if now < next {
                return;
            }
            let Some((ref_us, ref_time)) = core.clock_ref else {
                return;
            };
            core.next_produce = Some(next + interval);
            (
                cobid_to_can_id(core.cobid),
                advance(ref_time, now.saturating_sub(ref_us)),
                core.start_us.unwrap_or(now),
            )
        };

        // Refresh the high resolution time stamp when the device carries one
        if dev.find_sub(0x1013, 0).is_some() {
            let elapsed = (now - start) as u32;
            let _ = dev.write(0x1013, 0, Value::UInt32(elapsed));
        }

        out.push(TimeMessage { time }.to_frame(id));
    }

    /// Consume an inbound TIME frame
    pub fn on_frame(&self, frame: &CanFrame) {
        if frame.rtr {
            return;
        }
        let Ok(msg) = TimeMessage::try_from(frame) else {
            return;
        };
        let mut core = self.core.borrow_mut();
        if core.cobid & COBID_CONSUMER == 0 {
            return;
        }
        if let Some(ind) = core.ind.as_mut() {
            ind(msg.time);
        }
    }
}

fn write_time_cobid(
    core: &Rc<RefCell<TimeCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    let bytes: [u8; 4] = req
        .data
        .try_into()
        .map_err(|_| AbortCode::DataTypeMismatch)?;
    let raw = u32::from_le_bytes(bytes);
    {
        let core = core.borrow();
        let old = core.cobid;
        let was_active = old & (COBID_PRODUCER | COBID_CONSUMER) != 0;
        // Renumbering requires the service to be disabled first: while
        // either side is active, any write that moves the CAN-ID is refused
        if was_active && cobid_to_can_id(raw) != cobid_to_can_id(old) {
            return Err(AbortCode::InvalidValue);
        }
        if raw & COBID_FRAME == 0 && raw & 0x1FFF_F800 != 0 {
            return Err(AbortCode::InvalidValue);
        }
    }
    dev.default_download(req.index, req.sub, req.data)?;
    core.borrow_mut().cobid = raw;
    Ok(())
}

//! The SYNC producer/consumer service
//!
//! Configuration lives in the dictionary: object 0x1005 (COB-ID, bit 30 set
//! when this device produces SYNC), 0x1006 (cycle period in µs) and 0x1019
//! (counter overflow). The consumer side counts every inbound SYNC and
//! hands the wire counter to the node for fan-out to the PDO engine.
//! Object 0x1007 (synchronous window length) is not consulted: synchronous
//! PDO activity completes inside the SYNC indication itself, so a device
//! may carry the object but it is plain storage here.

use std::cell::RefCell;
use std::rc::Rc;

use stillcan_common::messages::SyncMessage;
use stillcan_common::sdo::AbortCode;
use stillcan_common::{CanFrame, CanId};

use crate::object_dict::{Device, DeviceError, DnRequest};
use crate::pdo::cobid_to_can_id;

/// Bit 30 of the SYNC COB-ID entry: this device generates SYNC
pub const COBID_PRODUCER: u32 = 1 << 30;
/// Bit 29 of the SYNC COB-ID entry: the CAN-ID is 29-bit
pub const COBID_FRAME: u32 = 1 << 29;

struct SyncCore {
    cobid: u32,
    period_us: u32,
    counter_overflow: u8,
    active: bool,
    restart: bool,
    next_produce: Option<u64>,
    counter: u8,
    consumed: u64,
}

impl SyncCore {
    fn is_producer(&self) -> bool {
        self.cobid & COBID_PRODUCER != 0
    }
}

/// The SYNC service
pub struct SyncService {
    core: Rc<RefCell<SyncCore>>,
}

impl core::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("SyncService")
            .field("cobid", &core.cobid)
            .field("active", &core.active)
            .finish()
    }
}

impl SyncService {
    /// Attach to the SYNC objects of `dev`; object 0x1005 must exist
    pub fn attach(dev: &mut Device) -> Result<Self, DeviceError> {
        let cobid = dev
            .read(0x1005, 0)
            .ok()
            .and_then(|v| v.as_u64())
            .ok_or(DeviceError::NotFound {
                index: 0x1005,
                sub: Some(0),
            })? as u32;
        let period_us = dev
            .read(0x1006, 0)
            .ok()
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let counter_overflow = dev
            .read(0x1019, 0)
            .ok()
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u8;

        let core = Rc::new(RefCell::new(SyncCore {
            cobid,
            period_us,
            counter_overflow,
            active: false,
            restart: false,
            next_produce: None,
            counter: 0,
            consumed: 0,
        }));

        let hook_core = core.clone();
        dev.set_dn_hook(
            0x1005,
            0,
            Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                write_sync_cobid(&hook_core, dev, req)
            })),
        )?;

        if dev.find_sub(0x1006, 0).is_some() {
            let hook_core = core.clone();
            dev.set_dn_hook(
                0x1006,
                0,
                Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                    write_sync_period(&hook_core, dev, req)
                })),
            )?;
        }

        if dev.find_sub(0x1019, 0).is_some() {
            let hook_core = core.clone();
            dev.set_dn_hook(
                0x1019,
                0,
                Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                    write_sync_counter(&hook_core, dev, req)
                })),
            )?;
        }

        Ok(Self { core })
    }

    /// Start or stop the service
    pub fn set_active(&self, active: bool) {
        let mut core = self.core.borrow_mut();
        core.active = active;
        core.restart = true;
        if !active {
            core.next_produce = None;
        }
    }

    /// True while the service runs
    pub fn is_active(&self) -> bool {
        self.core.borrow().active
    }

    /// True when this device is the SYNC producer
    pub fn is_producer(&self) -> bool {
        self.core.borrow().is_producer()
    }

    /// The configured SYNC COB-ID
    pub fn can_id(&self) -> CanId {
        cobid_to_can_id(self.core.borrow().cobid)
    }

    /// Number of SYNC frames consumed since attach
    pub fn consumed_count(&self) -> u64 {
        self.core.borrow().consumed
    }

    /// Recompute the production schedule after a configuration change
    pub fn refresh(&self, now: u64) {
        let mut core = self.core.borrow_mut();
        if !core.active || !core.is_producer() || core.period_us == 0 {
            core.next_produce = None;
            core.restart = false;
            return;
        }
        if core.restart || core.next_produce.is_none() {
            core.next_produce = Some(now + core.period_us as u64);
            core.counter = 0;
            core.restart = false;
        }
    }

    /// The next production instant, when producing
    pub fn deadline(&self) -> Option<u64> {
        self.core.borrow().next_produce
    }

    /// Produce one SYNC frame and schedule the next
    pub fn on_timer(&self, now: u64, out: &mut Vec<CanFrame>) {
        let mut core = self.core.borrow_mut();
        let Some(next) = core.next_produce else {
            return;
        };
        if now < next {
            return;
        }
        let counter = if core.counter_overflow >= 2 {
            core.counter = core.counter % core.counter_overflow + 1;
            Some(core.counter)
        } else {
            None
        };
        out.push(SyncMessage { counter }.to_frame(cobid_to_can_id(core.cobid)));
        core.next_produce = Some(next + core.period_us as u64);
    }

    /// Consume an inbound SYNC frame, returning the wire counter for fan-out
    pub fn on_frame(&self, frame: &CanFrame) -> Option<Option<u8>> {
        let mut core = self.core.borrow_mut();
        if !core.active || frame.rtr {
            return None;
        }
        let msg = SyncMessage::try_from(frame).ok()?;
        core.consumed += 1;
        Some(msg.counter)
    }
}

fn decode_u32(req: &DnRequest) -> Result<u32, AbortCode> {
    let bytes: [u8; 4] = req
        .data
        .try_into()
        .map_err(|_| AbortCode::DataTypeMismatch)?;
    Ok(u32::from_le_bytes(bytes))
}

fn write_sync_cobid(
    core: &Rc<RefCell<SyncCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    let raw = decode_u32(req)?;
    {
        let core = core.borrow();
        let old = core.cobid;
        // The CAN-ID cannot be changed while this device produces SYNC
        if old & COBID_PRODUCER != 0
            && raw & COBID_PRODUCER != 0
            && cobid_to_can_id(raw) != cobid_to_can_id(old)
        {
            return Err(AbortCode::InvalidValue);
        }
        if raw & COBID_FRAME == 0 && raw & 0x1FFF_F800 != 0 {
            return Err(AbortCode::InvalidValue);
        }
    }
    dev.default_download(req.index, req.sub, req.data)?;
    let mut core = core.borrow_mut();
    core.cobid = raw;
    core.restart = true;
    Ok(())
}

fn write_sync_period(
    core: &Rc<RefCell<SyncCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    let raw = decode_u32(req)?;
    dev.default_download(req.index, req.sub, req.data)?;
    let mut core = core.borrow_mut();
    core.period_us = raw;
    core.restart = true;
    Ok(())
}

fn write_sync_counter(
    core: &Rc<RefCell<SyncCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    if req.data.len() != 1 {
        return Err(AbortCode::DataTypeMismatch);
    }
    let value = req.data[0];
    {
        let core = core.borrow();
        // The overflow value may only change while no cycle period is set
        if core.period_us != 0 {
            return Err(AbortCode::CantStoreDeviceState);
        }
    }
    if value == 1 || value > 240 {
        return Err(AbortCode::InvalidValue);
    }
    dev.default_download(req.index, req.sub, req.data)?;
    let mut core = core.borrow_mut();
    core.counter_overflow = value;
    core.counter = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dict::{AccessType, Object, ObjectCode, SubObject};
    use stillcan_common::{DataType, NodeId, Value};

    fn sync_device(cobid: u32, period: u32, overflow: u8) -> Device {
        let mut dev = Device::new(NodeId::new(1).unwrap());
        let mut obj = Object::new(0x1005, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32, AccessType::Rw)
                .with_default(Value::UInt32(cobid)),
        )
        .unwrap();
        dev.insert_object(obj).unwrap();

        let mut obj = Object::new(0x1006, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32, AccessType::Rw)
                .with_default(Value::UInt32(period)),
        )
        .unwrap();
        dev.insert_object(obj).unwrap();

        let mut obj = Object::new(0x1019, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt8, AccessType::Rw)
                .with_default(Value::UInt8(overflow)),
        )
        .unwrap();
        dev.insert_object(obj).unwrap();
        dev
    }

    #[test]
    fn test_producer_schedule() {
        let mut dev = sync_device(COBID_PRODUCER | 0x80, 10_000, 0);
        let sync = SyncService::attach(&mut dev).unwrap();
        sync.set_active(true);
        sync.refresh(1000);
        assert_eq!(sync.deadline(), Some(11_000));

        let mut out = Vec::new();
        sync.on_timer(11_000, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), CanId::Std(0x80));
        assert_eq!(out[0].dlc, 0);
        assert_eq!(sync.deadline(), Some(21_000));
    }

    #[test]
    fn test_producer_counter() {
        let mut dev = sync_device(COBID_PRODUCER | 0x80, 10_000, 3);
        let sync = SyncService::attach(&mut dev).unwrap();
        sync.set_active(true);
        sync.refresh(0);

        let mut out = Vec::new();
        for _ in 0..4 {
            let deadline = sync.deadline().unwrap();
            sync.on_timer(deadline, &mut out);
        }
        let counters: Vec<u8> = out.iter().map(|f| f.data()[0]).collect();
        assert_eq!(counters, vec![1, 2, 3, 1]);
    }

    #[test]
    fn test_not_producing_without_period() {
        let mut dev = sync_device(COBID_PRODUCER | 0x80, 0, 0);
        let sync = SyncService::attach(&mut dev).unwrap();
        sync.set_active(true);
        sync.refresh(0);
        assert_eq!(sync.deadline(), None);
    }

    #[test]
    fn test_consumer_counts() {
        let mut dev = sync_device(0x80, 0, 0);
        let sync = SyncService::attach(&mut dev).unwrap();
        sync.set_active(true);

        let frame = SyncMessage { counter: Some(7) }.to_frame(CanId::Std(0x80));
        assert_eq!(sync.on_frame(&frame), Some(Some(7)));
        assert_eq!(sync.on_frame(&frame), Some(Some(7)));
        assert_eq!(sync.consumed_count(), 2);
    }

    #[test]
    fn test_cobid_change_rejected_while_producing() {
        let mut dev = sync_device(COBID_PRODUCER | 0x80, 10_000, 0);
        let _sync = SyncService::attach(&mut dev).unwrap();

        // Changing the CAN-ID while the producer bit stays set is refused
        let raw = (COBID_PRODUCER | 0x81u32).to_le_bytes();
        assert_eq!(
            dev.download(0x1005, 0, &raw),
            Err(AbortCode::InvalidValue)
        );

        // Dropping the producer bit first is fine
        let raw = 0x81u32.to_le_bytes();
        dev.download(0x1005, 0, &raw).unwrap();
        assert_eq!(dev.read(0x1005, 0).unwrap(), Value::UInt32(0x81));
    }

    #[test]
    fn test_counter_overflow_locked_by_period() {
        let mut dev = sync_device(0x80, 10_000, 0);
        let _sync = SyncService::attach(&mut dev).unwrap();
        assert_eq!(
            dev.download(0x1019, 0, &[5]),
            Err(AbortCode::CantStoreDeviceState)
        );

        dev.download(0x1006, 0, &0u32.to_le_bytes()).unwrap();
        dev.download(0x1019, 0, &[5]).unwrap();
        assert_eq!(dev.read(0x1019, 0).unwrap(), Value::UInt8(5));
    }
}

//! The EMCY producer/consumer service
//!
//! The producer side records error events: each [`EmcyService::push`] ORs
//! the error register (0x1001), prepends the error code to the pre-defined
//! error field (0x1003, newest first, bounded by the object's sub-object
//! capacity) and emits the 8-byte emergency frame on the 0x1014 COB-ID,
//! respecting the 0x1015 inhibit time. The consumer side watches the
//! COB-IDs listed in 0x1028 and raises an indication per received event.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::warn;

use stillcan_common::messages::{default_emcy_id, EmcyMessage};
use stillcan_common::sdo::AbortCode;
use stillcan_common::{CanFrame, CanId, Value};

use crate::object_dict::{Device, DeviceError, DnRequest};
use crate::pdo::cobid_to_can_id;

/// Bit 31 of an EMCY COB-ID entry: the entry is not in use
pub const COBID_INVALID: u32 = 1 << 31;

/// The indication raised for every consumed EMCY frame
pub type EmcyIndication = Box<dyn FnMut(CanId, EmcyMessage)>;

struct EmcyCore {
    cobid: u32,
    inhibit_100us: u16,
    last_tx_us: Option<u64>,
    queued: VecDeque<EmcyMessage>,
    consumers: Vec<u32>,
    ind: Option<EmcyIndication>,
}

impl EmcyCore {
    fn enabled(&self) -> bool {
        self.cobid & COBID_INVALID == 0
    }

    fn inhibit_deadline(&self) -> Option<u64> {
        if self.inhibit_100us == 0 {
            return None;
        }
        self.last_tx_us
            .map(|last| last + self.inhibit_100us as u64 * 100)
    }
}

/// The EMCY service
pub struct EmcyService {
    core: Rc<RefCell<EmcyCore>>,
}

impl core::fmt::Debug for EmcyService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("EmcyService")
            .field("cobid", &core.cobid)
            .field("queued", &core.queued.len())
            .finish()
    }
}

impl EmcyService {
    /// Attach to the EMCY objects of `dev`; object 0x1001 must exist
    pub fn attach(dev: &mut Device) -> Result<Self, DeviceError> {
        dev.find_sub(0x1001, 0).ok_or(DeviceError::NotFound {
            index: 0x1001,
            sub: Some(0),
        })?;

        let cobid = dev
            .read(0x1014, 0)
            .ok()
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or_else(|| {
                dev.node_id()
                    .configured()
                    .map(|id| default_emcy_id(id).raw())
                    .unwrap_or(COBID_INVALID)
            });
        let inhibit_100us = dev
            .read(0x1015, 0)
            .ok()
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u16;

        let mut consumers = Vec::new();
        if let Some(obj) = dev.find_object(0x1028) {
            for sub in 1..=obj.sub0_count() {
                if let Some(raw) = obj.get_value(sub).ok().and_then(|v| v.as_u64()) {
                    consumers.push(raw as u32);
                }
            }
        }

        let core = Rc::new(RefCell::new(EmcyCore {
            cobid,
            inhibit_100us,
            last_tx_us: None,
            queued: VecDeque::new(),
            consumers,
            ind: None,
        }));

        if dev.find_sub(0x1003, 0).is_some() {
            let hook = move |dev: &mut Device, req: &DnRequest| write_history_count(dev, req);
            dev.set_dn_hook(0x1003, 0, Some(Rc::new(hook)))?;
        }

        if dev.find_sub(0x1014, 0).is_some() {
            let hook_core = core.clone();
            dev.set_dn_hook(
                0x1014,
                0,
                Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                    write_emcy_cobid(&hook_core, dev, req)
                })),
            )?;
        }

        if dev.find_sub(0x1015, 0).is_some() {
            let hook_core = core.clone();
            dev.set_dn_hook(
                0x1015,
                0,
                Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                    write_emcy_inhibit(&hook_core, dev, req)
                })),
            )?;
        }

        let consumer_subs = dev
            .find_object(0x1028)
            .and_then(|o| o.max_sub_index())
            .unwrap_or(0);
        for sub in 1..=consumer_subs {
            let hook_core = core.clone();
            dev.set_dn_hook(
                0x1028,
                sub,
                Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                    write_consumer_cobid(&hook_core, dev, req, sub)
                })),
            )?;
        }

        Ok(Self { core })
    }

    /// Register the consumer indication
    pub fn set_indication(&self, ind: Option<EmcyIndication>) {
        self.core.borrow_mut().ind = ind;
    }

    /// The producer COB-ID, when enabled
    pub fn can_id(&self) -> Option<CanId> {
        let core = self.core.borrow();
        core.enabled().then(|| cobid_to_can_id(core.cobid))
    }

    /// The COB-IDs of the active consumer entries
    pub fn consumer_ids(&self) -> Vec<CanId> {
        self.core
            .borrow()
            .consumers
            .iter()
            .filter(|raw| **raw & COBID_INVALID == 0)
            .map(|raw| cobid_to_can_id(*raw))
            .collect()
    }

    /// Record an error event and emit the emergency frame
    ///
    /// `eec` is the emergency error code, `er` the error register bits to
    /// set, `msef` the manufacturer specific bytes.
    pub fn push(
        &self,
        dev: &mut Device,
        eec: u16,
        er: u8,
        msef: [u8; 5],
        now: u64,
        out: &mut Vec<CanFrame>,
    ) -> Result<(), DeviceError> {
        // Error register: OR in the new condition bits (plus the generic bit)
        let register = match dev.read(0x1001, 0) {
            Ok(Value::UInt8(reg)) => reg | er | 0x01,
            _ => er | 0x01,
        };
        dev.write(0x1001, 0, Value::UInt8(register))?;

        push_history(dev, eec);

        let msg = EmcyMessage {
            eec,
            register,
            msef,
        };
        self.emit(msg, now, out);
        Ok(())
    }

    /// Reset the error state: clear the register and the history, and
    /// broadcast the "error reset" event
    pub fn clear(&self, dev: &mut Device, now: u64, out: &mut Vec<CanFrame>) -> Result<(), DeviceError> {
        dev.write(0x1001, 0, Value::UInt8(0))?;
        if dev.find_sub(0x1003, 0).is_some() {
            let _ = dev.write(0x1003, 0, Value::UInt8(0));
        }
        self.emit(
            EmcyMessage {
                eec: 0,
                register: 0,
                msef: [0; 5],
            },
            now,
            out,
        );
        Ok(())
    }

    fn emit(&self, msg: EmcyMessage, now: u64, out: &mut Vec<CanFrame>) {
        let mut core = self.core.borrow_mut();
        if !core.enabled() {
            return;
        }
        if let Some(deadline) = core.inhibit_deadline() {
            if now < deadline {
                core.queued.push_back(msg);
                return;
            }
        }
        out.push(msg.to_frame(cobid_to_can_id(core.cobid)));
        core.last_tx_us = Some(now);
    }

    /// The next instant a deferred frame becomes sendable
    pub fn deadline(&self) -> Option<u64> {
        let core = self.core.borrow();
        if core.queued.is_empty() {
            None
        } else {
            core.inhibit_deadline()
        }
    }

    /// Send deferred frames whose inhibit time has passed
    pub fn process(&self, now: u64, out: &mut Vec<CanFrame>) {
        loop {
            let mut core = self.core.borrow_mut();
            if core.queued.is_empty() || !core.enabled() {
                return;
            }
            if let Some(deadline) = core.inhibit_deadline() {
                if now < deadline {
                    return;
                }
            }
            let msg = core.queued.pop_front().unwrap();
            out.push(msg.to_frame(cobid_to_can_id(core.cobid)));
            core.last_tx_us = Some(now);
        }
    }

    /// Consume an inbound emergency frame
    pub fn on_frame(&self, frame: &CanFrame) {
        if frame.rtr {
            return;
        }
        let Ok(msg) = EmcyMessage::try_from(frame) else {
            warn!("Dropping malformed EMCY frame");
            return;
        };
        let mut core = self.core.borrow_mut();
        if let Some(ind) = core.ind.as_mut() {
            ind(frame.id(), msg);
        }
    }
}

/// Prepend `eec` to the 0x1003 history, shifting older entries down
fn push_history(dev: &mut Device, eec: u16) {
    let Some(obj) = dev.find_object(0x1003) else {
        return;
    };
    let cap = obj.max_sub_index().unwrap_or(0);
    if cap == 0 {
        return;
    }
    let count = obj.sub0_count().min(cap);
    let new_count = (count + 1).min(cap);

    for i in (1..new_count).rev() {
        if let Ok(v) = dev.read(0x1003, i) {
            let _ = dev.write(0x1003, i + 1, v);
        }
    }
    let _ = dev.write(0x1003, 1, Value::UInt32(eec as u32));
    let _ = dev.write(0x1003, 0, Value::UInt8(new_count));
}

/// Sub 0 of the error history accepts only 0, which clears the list
fn write_history_count(dev: &mut Device, req: &DnRequest) -> Result<(), AbortCode> {
    if req.data.len() != 1 {
        return Err(AbortCode::DataTypeMismatch);
    }
    if req.data[0] != 0 {
        return Err(AbortCode::InvalidValue);
    }
    dev.default_download(req.index, req.sub, req.data)
}

fn write_emcy_cobid(
    core: &Rc<RefCell<EmcyCore>>,
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
        let old_active = old & COBID_INVALID == 0;
        let new_active = raw & COBID_INVALID == 0;
        if old_active && new_active && cobid_to_can_id(raw) != cobid_to_can_id(old) {
            return Err(AbortCode::InvalidValue);
        }
    }
    dev.default_download(req.index, req.sub, req.data)?;
    core.borrow_mut().cobid = raw;
    Ok(())
}

fn write_emcy_inhibit(
    core: &Rc<RefCell<EmcyCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    dev.default_download(req.index, req.sub, req.data)?;
    let bytes: [u8; 2] = req
        .data
        .try_into()
        .map_err(|_| AbortCode::DataTypeMismatch)?;
    core.borrow_mut().inhibit_100us = u16::from_le_bytes(bytes);
    Ok(())
}

fn write_consumer_cobid(
    core: &Rc<RefCell<EmcyCore>>,
    dev: &mut Device,
    req: &DnRequest,
    sub: u8,
) -> Result<(), AbortCode> {
    let bytes: [u8; 4] = req
        .data
        .try_into()
        .map_err(|_| AbortCode::DataTypeMismatch)?;
    let raw = u32::from_le_bytes(bytes);
    dev.default_download(req.index, req.sub, req.data)?;
    let mut core = core.borrow_mut();
    let slot = (sub - 1) as usize;
    if slot < core.consumers.len() {
        core.consumers[slot] = raw;
    } else {
        core.consumers.resize(slot + 1, COBID_INVALID);
        core.consumers[slot] = raw;
    }
    Ok(())
}

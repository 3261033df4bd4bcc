//! Receive and transmit PDO services
//!
//! Each PDO is configured through a communication parameter record (0x1400+n
//! for RPDOs, 0x1800+n for TPDOs) and a mapping record (0x1600+n /
//! 0x1A00+n) in the dictionary. The service installs download hooks on those
//! records so that every reconfiguration, local or over SDO, is validated
//! before it takes effect. Mapping is bit-granular: each entry names
//! `index << 16 | sub << 8 | bit_length`, and values are packed
//! little-endian-first into the frame payload.

use std::cell::RefCell;
use std::rc::Rc;

use log::warn;

use stillcan_common::sdo::AbortCode;
use stillcan_common::values::ValueError;
use stillcan_common::{CanFrame, CanId, DataType, Value};

use crate::object_dict::{Device, DeviceError, DnRequest};

/// Bit 31 of a PDO COB-ID entry: set means the PDO is not in use
pub const COBID_INVALID: u32 = 1 << 31;
/// Bit 30 of a PDO COB-ID entry: set means RTR is not allowed on this PDO
pub const COBID_NO_RTR: u32 = 1 << 30;
/// Bit 29 of a PDO COB-ID entry: set means the CAN-ID is 29-bit
pub const COBID_FRAME: u32 = 1 << 29;

/// Largest number of mapping entries a single PDO supports
pub const MAX_MAPPINGS: usize = 64;

/// Largest mapped payload, in bits, of a classic frame
const MAX_PDO_BITS: usize = 64;

pub(crate) fn cobid_to_can_id(raw: u32) -> CanId {
    if raw & COBID_FRAME != 0 {
        CanId::Extended(raw & 0x1FFF_FFFF)
    } else {
        CanId::Std((raw & 0x7FF) as u16)
    }
}

/// Copy `nbits` bits from `src` starting at `src_bit` into `dst` starting at
/// `dst_bit`, little-endian bit order (bit i lives in byte i/8, bit i%8)
fn copy_bits(dst: &mut [u8], dst_bit: usize, src: &[u8], src_bit: usize, nbits: usize) {
    for i in 0..nbits {
        let s = src_bit + i;
        let d = dst_bit + i;
        let bit = (src[s / 8] >> (s % 8)) & 1;
        dst[d / 8] |= bit << (d % 8);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MapEntry {
    index: u16,
    sub: u8,
    bits: u8,
}

impl MapEntry {
    fn from_raw(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            sub: ((raw >> 8) & 0xFF) as u8,
            bits: (raw & 0xFF) as u8,
        }
    }

    /// Dummy entries map one of the static data types as padding
    fn is_dummy(&self) -> bool {
        self.index < 0x1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PdoDir {
    Receive,
    Transmit,
}

struct PdoCore {
    dir: PdoDir,
    comm_index: u16,
    map_index: u16,
    cob_id_raw: u32,
    transmission_type: u8,
    inhibit_100us: u16,
    event_timer_ms: u16,
    sync_start: u8,
    maps: Vec<u32>,
    nmap: u8,
    // Runtime state
    staged: Option<([u8; 8], u8)>,
    sync_count: u8,
    sync_started: bool,
    event_pending: bool,
    last_tx_us: Option<u64>,
    pending_tx: bool,
    event_deadline: Option<u64>,
}

impl PdoCore {
    fn enabled(&self) -> bool {
        self.cob_id_raw & COBID_INVALID == 0
    }

    fn can_id(&self) -> CanId {
        cobid_to_can_id(self.cob_id_raw)
    }

    fn rtr_allowed(&self) -> bool {
        self.cob_id_raw & COBID_NO_RTR == 0
    }

    fn entries(&self) -> Vec<MapEntry> {
        self.maps[0..self.nmap as usize]
            .iter()
            .map(|raw| MapEntry::from_raw(*raw))
            .collect()
    }

    fn mapped_bits(&self) -> usize {
        self.entries().iter().map(|e| e.bits as usize).sum()
    }

    fn inhibit_deadline(&self) -> Option<u64> {
        let last = self.last_tx_us?;
        if self.inhibit_100us == 0 {
            return None;
        }
        Some(last + self.inhibit_100us as u64 * 100)
    }
}

/// Validate a mapping entry against the dictionary
fn check_map_entry(dev: &Device, entry: MapEntry) -> Result<(), AbortCode> {
    if entry.is_dummy() {
        return Ok(());
    }
    let obj = dev
        .find_object(entry.index)
        .ok_or(AbortCode::NoSuchObject)?;
    let sub = obj
        .find_sub(entry.sub)
        .ok_or(AbortCode::NoSuchSubIndex)?;
    if !sub.is_pdo_mappable() {
        return Err(AbortCode::UnmappablePdo);
    }
    // A mapping may narrow a value but never widen it
    let declared_bits = match sub.data_type().wire_size() {
        Some(n) => n * 8,
        None => dev
            .find_object(entry.index)
            .and_then(|o| o.current_len(entry.sub))
            .unwrap_or(0)
            * 8,
    };
    if entry.bits as usize > declared_bits {
        return Err(AbortCode::UnmappablePdo);
    }
    Ok(())
}

/// One PDO service instance, receive or transmit
///
/// The configuration lives in the dictionary; this object holds the decoded
/// copy plus runtime state, shared with the hooks guarding the
/// communication and mapping records.
pub struct Pdo {
    core: Rc<RefCell<PdoCore>>,
}

impl core::fmt::Debug for Pdo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("Pdo")
            .field("dir", &core.dir)
            .field("comm_index", &core.comm_index)
            .field("enabled", &core.enabled())
            .finish()
    }
}

impl Pdo {
    /// Attach the `num`th receive PDO to its 0x1400+n / 0x1600+n records
    pub fn attach_rpdo(dev: &mut Device, num: u16) -> Result<Self, DeviceError> {
        Self::attach(dev, PdoDir::Receive, 0x1400 + num, 0x1600 + num)
    }

    /// Attach the `num`th transmit PDO to its 0x1800+n / 0x1A00+n records
    pub fn attach_tpdo(dev: &mut Device, num: u16) -> Result<Self, DeviceError> {
        Self::attach(dev, PdoDir::Transmit, 0x1800 + num, 0x1A00 + num)
    }

    fn attach(
        dev: &mut Device,
        dir: PdoDir,
        comm_index: u16,
        map_index: u16,
    ) -> Result<Self, DeviceError> {
        let read_u64 = |dev: &Device, index: u16, sub: u8| {
            dev.read(index, sub).ok().and_then(|v| v.as_u64())
        };

        let cob_id_raw = read_u64(dev, comm_index, 1).ok_or(DeviceError::NotFound {
            index: comm_index,
            sub: Some(1),
        })? as u32;
        let transmission_type = read_u64(dev, comm_index, 2).unwrap_or(255) as u8;
        let inhibit_100us = read_u64(dev, comm_index, 3).unwrap_or(0) as u16;
        let event_timer_ms = read_u64(dev, comm_index, 5).unwrap_or(0) as u16;
        let sync_start = read_u64(dev, comm_index, 6).unwrap_or(0) as u8;

        let map_obj = dev.find_object(map_index).ok_or(DeviceError::NotFound {
            index: map_index,
            sub: None,
        })?;
        let nmap = map_obj.sub0_count();
        let mut maps = Vec::new();
        for sub in 1..=MAX_MAPPINGS as u8 {
            match read_u64(dev, map_index, sub) {
                Some(raw) => maps.push(raw as u32),
                None => break,
            }
        }
        if (nmap as usize) > maps.len() {
            return Err(DeviceError::Inval);
        }

        let core = Rc::new(RefCell::new(PdoCore {
            dir,
            comm_index,
            map_index,
            cob_id_raw,
            transmission_type,
            inhibit_100us,
            event_timer_ms,
            sync_start,
            maps,
            nmap,
            staged: None,
            sync_count: 0,
            sync_started: false,
            event_pending: false,
            last_tx_us: None,
            pending_tx: false,
            event_deadline: None,
        }));

        let pdo = Self { core };
        pdo.install_hooks(dev)?;
        Ok(pdo)
    }

    fn install_hooks(&self, dev: &mut Device) -> Result<(), DeviceError> {
        let (comm_index, map_index, map_subs) = {
            let core = self.core.borrow();
            (core.comm_index, core.map_index, core.maps.len() as u8)
        };

        let core = self.core.clone();
        dev.set_dn_hook(
            comm_index,
            1,
            Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                write_cob_id(&core, dev, req)
            })),
        )?;

        let core = self.core.clone();
        dev.set_dn_hook(
            comm_index,
            2,
            Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                write_transmission_type(&core, dev, req)
            })),
        )?;

        if dev.find_sub(comm_index, 3).is_some() {
            let core = self.core.clone();
            dev.set_dn_hook(
                comm_index,
                3,
                Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                    write_inhibit_time(&core, dev, req)
                })),
            )?;
        }

        if dev.find_sub(comm_index, 5).is_some() {
            let core = self.core.clone();
            dev.set_dn_hook(
                comm_index,
                5,
                Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                    write_event_timer(&core, dev, req)
                })),
            )?;
        }

        let core = self.core.clone();
        dev.set_dn_hook(
            map_index,
            0,
            Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                write_map_count(&core, dev, req)
            })),
        )?;

        for sub in 1..=map_subs {
            let core = self.core.clone();
            dev.set_dn_hook(
                map_index,
                sub,
                Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                    write_map_entry(&core, dev, req, sub)
                })),
            )?;
        }
        Ok(())
    }

    /// The CAN-ID this PDO listens or transmits on, when enabled
    pub fn cob_id(&self) -> Option<CanId> {
        let core = self.core.borrow();
        core.enabled().then(|| core.can_id())
    }

    /// True for a transmit PDO that answers remote requests
    pub fn answers_rtr(&self) -> bool {
        let core = self.core.borrow();
        core.dir == PdoDir::Transmit
            && core.enabled()
            && core.rtr_allowed()
            && matches!(core.transmission_type, 252 | 253)
    }

    /// The next instant this PDO needs a timer tick, if any
    pub fn deadline(&self) -> Option<u64> {
        let core = self.core.borrow();
        if core.dir != PdoDir::Transmit || !core.enabled() {
            return None;
        }
        let inhibit = core.pending_tx.then(|| core.inhibit_deadline()).flatten();
        match (inhibit, core.event_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Handle a frame received on this PDO's COB-ID
    pub fn on_frame(
        &self,
        dev: &mut Device,
        frame: &CanFrame,
        now: u64,
        out: &mut Vec<CanFrame>,
    ) {
        let (dir, enabled, ttype, rtr_allowed) = {
            let core = self.core.borrow();
            (
                core.dir,
                core.enabled(),
                core.transmission_type,
                core.rtr_allowed(),
            )
        };
        if !enabled {
            return;
        }

        match dir {
            PdoDir::Receive => {
                if frame.rtr {
                    return;
                }
                let needed = self.core.borrow().mapped_bits().div_ceil(8);
                if (frame.dlc as usize) < needed {
                    warn!(
                        "Dropping too-short PDO frame ({} < {} bytes)",
                        frame.dlc, needed
                    );
                    return;
                }
                let mut data = [0u8; 8];
                data[0..frame.data().len().min(8)]
                    .copy_from_slice(&frame.data()[0..frame.data().len().min(8)]);
                if ttype <= 240 {
                    // Synchronous: stage, commit on the next SYNC. A newer
                    // frame replaces a staged one.
                    self.core.borrow_mut().staged = Some((data, frame.dlc));
                } else {
                    self.commit(dev, &data);
                }
            }
            PdoDir::Transmit => {
                if !frame.rtr || !rtr_allowed {
                    return;
                }
                match ttype {
                    252 => {
                        // Synchronous RTR: answer with the value sampled at
                        // the last SYNC
                        let staged = self.core.borrow_mut().staged.take();
                        if let Some((data, dlc)) = staged {
                            let id = self.core.borrow().can_id();
                            out.push(CanFrame::new(id, &data[0..dlc as usize]));
                            self.core.borrow_mut().staged = Some((data, dlc));
                        }
                    }
                    253 => {
                        // Event RTR: sample now
                        self.transmit(dev, now, out);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Handle a SYNC event
    pub fn on_sync(&self, dev: &mut Device, counter: Option<u8>, now: u64, out: &mut Vec<CanFrame>) {
        let (dir, enabled, ttype) = {
            let core = self.core.borrow();
            (core.dir, core.enabled(), core.transmission_type)
        };
        if !enabled {
            return;
        }

        match dir {
            PdoDir::Receive => {
                if ttype <= 240 {
                    let staged = self.core.borrow_mut().staged.take();
                    if let Some((data, _dlc)) = staged {
                        self.commit(dev, &data);
                    }
                }
            }
            PdoDir::Transmit => match ttype {
                0 => {
                    let pending = {
                        let mut core = self.core.borrow_mut();
                        core.event_pending.then(|| {
                            core.event_pending = false;
                        })
                    };
                    if pending.is_some() {
                        self.transmit(dev, now, out);
                    }
                }
                1..=240 => {
                    let due = {
                        let mut core = self.core.borrow_mut();
                        if !core.sync_started {
                            match (core.sync_start, counter) {
                                (0, _) | (_, None) => core.sync_started = true,
                                (start, Some(cnt)) => {
                                    if cnt == start {
                                        core.sync_started = true;
                                    }
                                }
                            }
                            if !core.sync_started {
                                return;
                            }
                        }
                        core.sync_count += 1;
                        if core.sync_count >= ttype {
                            core.sync_count = 0;
                            true
                        } else {
                            false
                        }
                    };
                    if due {
                        self.transmit(dev, now, out);
                    }
                }
                252 => {
                    // Sample for a later RTR answer
                    if let Some(frame) = self.build_frame(dev) {
                        let mut data = [0u8; 8];
                        data[0..frame.data().len()].copy_from_slice(frame.data());
                        self.core.borrow_mut().staged = Some((data, frame.dlc));
                    }
                }
                _ => {}
            },
        }
    }

    /// Signal an application event on a transmit PDO
    pub fn trigger_event(&self) {
        let mut core = self.core.borrow_mut();
        if core.dir == PdoDir::Transmit {
            core.event_pending = true;
        }
    }

    /// Notify the PDO of a committed dictionary write; returns true when the
    /// write marks this PDO due for event-driven transmission
    pub fn on_mapped_write(&self, index: u16, sub: u8) -> bool {
        let mut core = self.core.borrow_mut();
        if core.dir != PdoDir::Transmit
            || !core.enabled()
            || !matches!(core.transmission_type, 0 | 254 | 255)
        {
            return false;
        }
        let mapped = core
            .entries()
            .iter()
            .any(|e| e.index == index && e.sub == sub);
        if mapped {
            core.event_pending = true;
        }
        mapped
    }

    /// Run pending transmissions: deferred (inhibited) frames, event
    /// triggers and the event timer
    pub fn process(&self, dev: &mut Device, now: u64, out: &mut Vec<CanFrame>) {
        let (dir, enabled, ttype) = {
            let core = self.core.borrow();
            (core.dir, core.enabled(), core.transmission_type)
        };
        if dir != PdoDir::Transmit || !enabled {
            return;
        }

        let send = {
            let mut core = self.core.borrow_mut();
            let mut send = false;
            if core.pending_tx {
                let due = core.inhibit_deadline().map(|d| now >= d).unwrap_or(true);
                if due {
                    core.pending_tx = false;
                    send = true;
                }
            }
            if matches!(ttype, 254 | 255) {
                if core.event_pending {
                    core.event_pending = false;
                    send = true;
                }
                if let Some(deadline) = core.event_deadline {
                    if now >= deadline {
                        core.event_deadline = None;
                        send = true;
                    }
                }
            }
            send
        };
        if send {
            self.transmit(dev, now, out);
        }
    }

    /// Transmit now, unless the inhibit time defers it
    fn transmit(&self, dev: &mut Device, now: u64, out: &mut Vec<CanFrame>) {
        {
            let mut core = self.core.borrow_mut();
            if let Some(deadline) = core.inhibit_deadline() {
                if now < deadline {
                    core.pending_tx = true;
                    return;
                }
            }
            core.pending_tx = false;
        }
        if let Some(frame) = self.build_frame(dev) {
            out.push(frame);
            let mut core = self.core.borrow_mut();
            core.last_tx_us = Some(now);
            core.event_deadline = (core.event_timer_ms > 0
                && matches!(core.transmission_type, 254 | 255))
            .then(|| now + core.event_timer_ms as u64 * 1000);
        }
    }

    /// Pack the mapped values into a frame
    fn build_frame(&self, dev: &mut Device) -> Option<CanFrame> {
        let (entries, id) = {
            let core = self.core.borrow();
            (core.entries(), core.can_id())
        };
        let total_bits: usize = entries.iter().map(|e| e.bits as usize).sum();
        let mut data = [0u8; 8];
        let mut bit = 0usize;
        for entry in entries {
            if entry.is_dummy() {
                bit += entry.bits as usize;
                continue;
            }
            let bytes = match dev.upload(entry.index, entry.sub) {
                Ok(bytes) => bytes,
                Err(_) => {
                    warn!(
                        "PDO upload of 0x{:04X}:{} failed, sending zeros",
                        entry.index, entry.sub
                    );
                    bit += entry.bits as usize;
                    continue;
                }
            };
            let nbits = (entry.bits as usize).min(bytes.len() * 8);
            copy_bits(&mut data, bit, &bytes, 0, nbits);
            bit += entry.bits as usize;
        }
        Some(CanFrame::new(id, &data[0..total_bits.div_ceil(8)]))
    }

    /// Unpack a received payload and deliver every value through the target
    /// sub-object's download hook
    fn commit(&self, dev: &mut Device, data: &[u8; 8]) {
        let entries = self.core.borrow().entries();
        let mut bit = 0usize;
        for entry in entries {
            let nbits = entry.bits as usize;
            if entry.is_dummy() {
                bit += nbits;
                continue;
            }
            let Ok(info) = dev.sub_info(entry.index, entry.sub) else {
                bit += nbits;
                continue;
            };
            let width = info.size.unwrap_or(nbits.div_ceil(8));
            let mut bytes = vec![0u8; width];
            copy_bits(&mut bytes, 0, data, bit, nbits);
            bit += nbits;

            // Narrow signed values must be sign-extended to the target width
            if needs_sign_extension(info.data_type, nbits, width) {
                sign_extend_bits(&mut bytes, nbits);
            }

            if let Err(code) = dev.download(entry.index, entry.sub, &bytes) {
                warn!(
                    "PDO write to 0x{:04X}:{} rejected: {:?}",
                    entry.index, entry.sub, code
                );
            }
        }
    }
}

fn needs_sign_extension(ty: DataType, nbits: usize, width: usize) -> bool {
    use DataType::*;
    matches!(
        ty,
        Int8 | Int16 | Int24 | Int32 | Int40 | Int48 | Int56 | Int64
    ) && nbits < width * 8
}

fn sign_extend_bits(bytes: &mut [u8], nbits: usize) {
    if nbits == 0 {
        return;
    }
    let sign = (bytes[(nbits - 1) / 8] >> ((nbits - 1) % 8)) & 1;
    if sign == 0 {
        return;
    }
    for i in nbits..bytes.len() * 8 {
        bytes[i / 8] |= 1 << (i % 8);
    }
}

fn decode_u32(req: &DnRequest) -> Result<u32, AbortCode> {
    match Value::decode(DataType::UInt32, req.data) {
        Ok(Value::UInt32(v)) => Ok(v),
        Ok(_) => Err(AbortCode::DataTypeMismatch),
        Err(ValueError::WrongLength { expected, actual }) if actual > expected => {
            Err(AbortCode::DataTypeMismatchLengthHigh)
        }
        Err(_) => Err(AbortCode::DataTypeMismatchLengthLow),
    }
}

fn write_cob_id(
    core: &Rc<RefCell<PdoCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    let raw = decode_u32(req)?;
    {
        let core = core.borrow();
        let old = core.cob_id_raw;
        let old_active = old & COBID_INVALID == 0;
        let new_active = raw & COBID_INVALID == 0;
        let id_changed = cobid_to_can_id(raw) != cobid_to_can_id(old);
        // The CAN-ID of a PDO in use cannot be changed on the fly
        if old_active && new_active && id_changed {
            return Err(AbortCode::InvalidValue);
        }
        // A 29-bit CAN-ID requires the frame bit
        if raw & COBID_FRAME == 0 && raw & 0x1FFF_F800 != 0 {
            return Err(AbortCode::InvalidValue);
        }
    }
    dev.default_download(req.index, req.sub, req.data)?;
    let mut core = core.borrow_mut();
    core.cob_id_raw = raw;
    if !core.enabled() {
        core.staged = None;
        core.pending_tx = false;
        core.event_pending = false;
        core.event_deadline = None;
        core.sync_count = 0;
        core.sync_started = false;
    }
    Ok(())
}

fn write_transmission_type(
    core: &Rc<RefCell<PdoCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    if req.data.len() != 1 {
        return Err(AbortCode::DataTypeMismatch);
    }
    let ttype = req.data[0];
    if (241..=251).contains(&ttype) {
        return Err(AbortCode::InvalidValue);
    }
    dev.default_download(req.index, req.sub, req.data)?;
    let mut core = core.borrow_mut();
    core.transmission_type = ttype;
    core.sync_count = 0;
    core.staged = None;
    Ok(())
}

fn write_inhibit_time(
    core: &Rc<RefCell<PdoCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    if core.borrow().enabled() {
        // The inhibit time may only be changed while the PDO is not in use
        return Err(AbortCode::InvalidValue);
    }
    dev.default_download(req.index, req.sub, req.data)?;
    let raw = u16::from_le_bytes(req.data.try_into().map_err(|_| AbortCode::DataTypeMismatch)?);
    core.borrow_mut().inhibit_100us = raw;
    Ok(())
}

fn write_event_timer(
    core: &Rc<RefCell<PdoCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    dev.default_download(req.index, req.sub, req.data)?;
    let raw = u16::from_le_bytes(req.data.try_into().map_err(|_| AbortCode::DataTypeMismatch)?);
    let mut core = core.borrow_mut();
    core.event_timer_ms = raw;
    core.event_deadline = None;
    Ok(())
}

fn write_map_count(
    core: &Rc<RefCell<PdoCore>>,
    dev: &mut Device,
    req: &DnRequest,
) -> Result<(), AbortCode> {
    if req.data.len() != 1 {
        return Err(AbortCode::DataTypeMismatch);
    }
    let count = req.data[0];
    {
        let core = core.borrow();
        if core.enabled() {
            return Err(AbortCode::InvalidValue);
        }
        if count as usize > core.maps.len() {
            return Err(AbortCode::NoSuchSubIndex);
        }
        // Activating a mapping validates the whole set
        let total: usize = core.maps[0..count as usize]
            .iter()
            .map(|raw| MapEntry::from_raw(*raw).bits as usize)
            .sum();
        if total > MAX_PDO_BITS {
            return Err(AbortCode::PdoTooLong);
        }
        for raw in &core.maps[0..count as usize] {
            check_map_entry(dev, MapEntry::from_raw(*raw))?;
        }
    }
    dev.default_download(req.index, req.sub, req.data)?;
    core.borrow_mut().nmap = count;
    Ok(())
}

fn write_map_entry(
    core: &Rc<RefCell<PdoCore>>,
    dev: &mut Device,
    req: &DnRequest,
    map_sub: u8,
) -> Result<(), AbortCode> {
    let raw = decode_u32(req)?;
    {
        let core = core.borrow();
        // Entries may only change while the mapping is deactivated
        if core.enabled() || core.nmap != 0 {
            return Err(AbortCode::InvalidValue);
        }
    }
    if raw != 0 {
        check_map_entry(dev, MapEntry::from_raw(raw))?;
    }
    dev.default_download(req.index, req.sub, req.data)?;
    core.borrow_mut().maps[(map_sub - 1) as usize] = raw;
    Ok(())
}

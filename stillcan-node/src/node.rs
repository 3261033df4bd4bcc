//! The node: dictionary, services and dispatcher wired together
//!
//! [`Node`] owns the [`Device`] and one instance of every service the
//! dictionary carries configuration for, and brokers between them and the
//! [`CanNet`] dispatcher. The host surface is small: push a frame, tick the
//! clock, read and write sub-objects, start and stop services, drive the
//! SDO client. After every entry point the node re-derives each service's
//! receive filter and timer deadline and re-registers them with the
//! dispatcher, so configuration writes take effect immediately.

use log::warn;

use stillcan_common::constants::{SDO_REQ_BASE, SDO_RESP_BASE};
use stillcan_common::sdo::AbortCode;
use stillcan_common::{CanFrame, CanId, Value};

use crate::emcy::EmcyService;
use crate::net::{CanFilter, CanNet, SendFn};
use crate::object_dict::{Device, DeviceError, DnHook, UpHook};
use crate::pdo::Pdo;
use crate::sdo_client::{SdoClient, SdoClientError, SdoTransferOutcome};
use crate::sdo_server::SdoServer;
use crate::sync::SyncService;
use crate::time::TimeService;

/// Identifies a service registration inside the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceTag {
    /// The SDO server's request COB-ID
    SdoServerReq,
    /// The SDO client's response COB-ID
    SdoClientResp,
    /// A receive PDO's data COB-ID
    Rpdo(u16),
    /// A transmit PDO's COB-ID (for RTR requests)
    Tpdo(u16),
    /// The SYNC COB-ID
    SyncRecv,
    /// The TIME COB-ID
    TimeRecv,
    /// An EMCY consumer COB-ID
    EmcyRecv(u8),
    /// The SDO server transfer timeout
    SdoServerTimer,
    /// The SDO client exchange timeout
    SdoClientTimer,
    /// The SYNC production period
    SyncTimer,
    /// The TIME production period
    TimeTimer,
    /// A transmit PDO's inhibit/event timer
    TpdoTimer(u16),
    /// The EMCY inhibit timer
    EmcyTimer,
}

/// A CANopen node
pub struct Node {
    dev: Device,
    net: CanNet<ServiceTag>,
    sdo_server: SdoServer,
    sdo_server_active: bool,
    sdo_client: SdoClient,
    sdo_client_target: Option<u8>,
    rpdos: Vec<Pdo>,
    tpdos: Vec<Pdo>,
    sync: Option<SyncService>,
    time: Option<TimeService>,
    emcy: Option<EmcyService>,
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("dev", &self.dev)
            .field("rpdos", &self.rpdos.len())
            .field("tpdos", &self.tpdos.len())
            .finish()
    }
}

impl Node {
    /// Build a node around a device
    ///
    /// Every service whose configuration objects exist in the dictionary is
    /// attached: PDOs for each 0x1400/0x1800 record, SYNC for 0x1005, TIME
    /// for 0x1012, EMCY for 0x1001. Outbound frames go to `send_fn`.
    pub fn new(mut dev: Device, send_fn: SendFn) -> Result<Self, DeviceError> {
        let net = CanNet::new(send_fn);

        let mut rpdos = Vec::new();
        for num in 0..512 {
            if dev.find_object(0x1400 + num).is_none() {
                break;
            }
            rpdos.push(Pdo::attach_rpdo(&mut dev, num)?);
        }
        let mut tpdos = Vec::new();
        for num in 0..512 {
            if dev.find_object(0x1800 + num).is_none() {
                break;
            }
            tpdos.push(Pdo::attach_tpdo(&mut dev, num)?);
        }

        let sync = dev
            .find_object(0x1005)
            .is_some()
            .then(|| SyncService::attach(&mut dev))
            .transpose()?;
        let time = dev
            .find_object(0x1012)
            .is_some()
            .then(|| TimeService::attach(&mut dev))
            .transpose()?;
        let emcy = dev
            .find_object(0x1001)
            .is_some()
            .then(|| EmcyService::attach(&mut dev))
            .transpose()?;

        let mut node = Self {
            dev,
            net,
            sdo_server: SdoServer::new(),
            sdo_server_active: false,
            sdo_client: SdoClient::new(),
            sdo_client_target: None,
            rpdos,
            tpdos,
            sync,
            time,
            emcy,
        };
        node.resync(0);
        Ok(node)
    }

    /// The device and its dictionary
    pub fn device(&self) -> &Device {
        &self.dev
    }

    /// Read the current value of a sub-object
    pub fn read(&self, index: u16, sub: u8) -> Result<Value, DeviceError> {
        self.dev.read(index, sub)
    }

    /// Write a value to a sub-object, running its download hooks
    ///
    /// Access modes are not checked (they guard network access), but every
    /// configuration rule enforced by a hook applies. Event-driven transmit
    /// PDOs mapping the written sub-object are triggered.
    pub fn write(&mut self, index: u16, sub: u8, value: &Value, now: u64) -> Result<(), DeviceError> {
        let bytes = value.to_bytes();
        self.dev
            .download_local(index, sub, &bytes)
            .map_err(|_| DeviceError::Inval)?;
        let mut out = Vec::new();
        for tpdo in &self.tpdos {
            if tpdo.on_mapped_write(index, sub) {
                tpdo.process(&mut self.dev, now, &mut out);
            }
        }
        self.flush(out);
        self.resync(now);
        Ok(())
    }

    /// Register a download indication hook on a sub-object
    pub fn set_dn_hook(
        &mut self,
        index: u16,
        sub: u8,
        hook: Option<DnHook>,
    ) -> Result<(), DeviceError> {
        self.dev.set_dn_hook(index, sub, hook)
    }

    /// Register an upload indication hook on a sub-object
    pub fn set_up_hook(
        &mut self,
        index: u16,
        sub: u8,
        hook: Option<UpHook>,
    ) -> Result<(), DeviceError> {
        self.dev.set_up_hook(index, sub, hook)
    }

    /// The SDO server: configuration access
    pub fn sdo_server_mut(&mut self) -> &mut SdoServer {
        &mut self.sdo_server
    }

    /// The SDO client: configuration access
    pub fn sdo_client_mut(&mut self) -> &mut SdoClient {
        &mut self.sdo_client
    }

    /// The SYNC service, when the dictionary carries object 0x1005
    pub fn sync(&self) -> Option<&SyncService> {
        self.sync.as_ref()
    }

    /// The TIME service, when the dictionary carries object 0x1012
    pub fn time(&self) -> Option<&TimeService> {
        self.time.as_ref()
    }

    /// The EMCY service, when the dictionary carries object 0x1001
    pub fn emcy(&self) -> Option<&EmcyService> {
        self.emcy.as_ref()
    }

    /// Start serving SDO requests on 0x600 + node-ID
    pub fn start_sdo_server(&mut self, now: u64) -> Result<(), DeviceError> {
        if !self.dev.node_id().is_configured() {
            return Err(DeviceError::Inval);
        }
        self.sdo_server_active = true;
        self.resync(now);
        Ok(())
    }

    /// Stop the SDO server, aborting a running transfer
    pub fn stop_sdo_server(&mut self, now: u64) {
        let out = self.sdo_server.abort_transfer(AbortCode::GeneralError);
        self.emit_server_frames(out.frames);
        self.sdo_server_active = false;
        self.resync(now);
    }

    /// Start the SYNC service (consumer, and producer when configured so)
    pub fn start_sync(&mut self, now: u64) -> Result<(), DeviceError> {
        let sync = self.sync.as_ref().ok_or(DeviceError::NotFound {
            index: 0x1005,
            sub: None,
        })?;
        if sync.is_producer() && !self.dev.node_id().is_configured() {
            return Err(DeviceError::Inval);
        }
        sync.set_active(true);
        self.resync(now);
        Ok(())
    }

    /// Stop the SYNC service
    pub fn stop_sync(&mut self, now: u64) {
        if let Some(sync) = self.sync.as_ref() {
            sync.set_active(false);
        }
        self.resync(now);
    }

    /// Start the TIME producer at the given period
    pub fn start_time_producer(&mut self, interval_us: u64, now: u64) -> Result<(), DeviceError> {
        let time = self.time.as_ref().ok_or(DeviceError::NotFound {
            index: 0x1012,
            sub: None,
        })?;
        time.start_producer(interval_us, now)?;
        self.resync(now);
        Ok(())
    }

    /// Stop the TIME producer
    pub fn stop_time_producer(&mut self, now: u64) {
        if let Some(time) = self.time.as_ref() {
            time.stop_producer();
        }
        self.resync(now);
    }

    /// Record an error event and emit the emergency frame
    pub fn emcy_push(
        &mut self,
        eec: u16,
        er: u8,
        msef: [u8; 5],
        now: u64,
    ) -> Result<(), DeviceError> {
        let emcy = self.emcy.as_ref().ok_or(DeviceError::NotFound {
            index: 0x1001,
            sub: None,
        })?;
        let mut out = Vec::new();
        emcy.push(&mut self.dev, eec, er, msef, now, &mut out)?;
        self.flush(out);
        self.resync(now);
        Ok(())
    }

    /// Clear the error state
    pub fn emcy_clear(&mut self, now: u64) -> Result<(), DeviceError> {
        let emcy = self.emcy.as_ref().ok_or(DeviceError::NotFound {
            index: 0x1001,
            sub: None,
        })?;
        let mut out = Vec::new();
        emcy.clear(&mut self.dev, now, &mut out)?;
        self.flush(out);
        self.resync(now);
        Ok(())
    }

    /// Signal an application event on the `num`th transmit PDO
    pub fn tpdo_event(&mut self, num: u16, now: u64) -> Result<(), DeviceError> {
        let tpdo = self
            .tpdos
            .get(num as usize)
            .ok_or(DeviceError::NotFound {
                index: 0x1800 + num,
                sub: None,
            })?;
        tpdo.trigger_event();
        let mut out = Vec::new();
        tpdo.process(&mut self.dev, now, &mut out);
        self.flush(out);
        self.resync(now);
        Ok(())
    }

    /// Point the SDO client at a server node
    pub fn sdo_client_connect(&mut self, server_node: u8, now: u64) -> Result<(), DeviceError> {
        if !self.sdo_client.is_idle() {
            return Err(DeviceError::Busy);
        }
        self.sdo_client_target = Some(server_node);
        self.resync(now);
        Ok(())
    }

    /// Start a client download (write) to the connected server
    pub fn sdo_download(
        &mut self,
        index: u16,
        sub: u8,
        data: Vec<u8>,
        now: u64,
    ) -> Result<(), DeviceError> {
        let frames = self.sdo_client.download(index, sub, data, now)?;
        self.emit_client_frames(frames);
        self.resync(now);
        Ok(())
    }

    /// Start a client upload (read) from the connected server
    pub fn sdo_upload(&mut self, index: u16, sub: u8, now: u64) -> Result<(), DeviceError> {
        let frames = self.sdo_client.upload(index, sub, now)?;
        self.emit_client_frames(frames);
        self.resync(now);
        Ok(())
    }

    /// Start a client block download to the connected server
    pub fn sdo_block_download(
        &mut self,
        index: u16,
        sub: u8,
        data: Vec<u8>,
        now: u64,
    ) -> Result<(), DeviceError> {
        let frames = self.sdo_client.block_download(index, sub, data, now)?;
        self.emit_client_frames(frames);
        self.resync(now);
        Ok(())
    }

    /// Start a client block upload from the connected server
    pub fn sdo_block_upload(&mut self, index: u16, sub: u8, now: u64) -> Result<(), DeviceError> {
        let frames = self.sdo_client.block_upload(index, sub, now)?;
        self.emit_client_frames(frames);
        self.resync(now);
        Ok(())
    }

    /// Cancel the running client transfer
    pub fn sdo_abort(&mut self, code: AbortCode, now: u64) {
        let frames = self.sdo_client.abort(code);
        self.emit_client_frames(frames);
        self.resync(now);
    }

    /// Collect the outcome of the last finished client transfer
    pub fn sdo_take_result(&mut self) -> Option<Result<SdoTransferOutcome, SdoClientError>> {
        self.sdo_client.take_result()
    }

    /// Hand a received CAN frame to the engine
    pub fn on_frame(&mut self, frame: &CanFrame, now: u64) {
        let tags = self.net.route(frame);
        let mut out: Vec<CanFrame> = Vec::new();

        for tag in tags {
            match tag {
                ServiceTag::SdoServerReq => {
                    if frame.rtr {
                        continue;
                    }
                    let result = self.sdo_server.on_frame(frame.data(), &mut self.dev, now);
                    let resp_id = self.sdo_server_resp_id();
                    for bytes in result.frames {
                        out.push(CanFrame::new(resp_id, &bytes));
                    }
                    if let Some((index, sub)) = result.updated {
                        self.notify_mapped_write(index, sub, now, &mut out);
                    }
                }
                ServiceTag::SdoClientResp => {
                    if frame.rtr {
                        continue;
                    }
                    let frames = self.sdo_client.on_frame(frame.data(), now);
                    let req_id = self.sdo_client_req_id();
                    for bytes in frames {
                        out.push(CanFrame::new(req_id, &bytes));
                    }
                }
                ServiceTag::Rpdo(n) => {
                    if let Some(rpdo) = self.rpdos.get(n as usize) {
                        rpdo.on_frame(&mut self.dev, frame, now, &mut out);
                    }
                }
                ServiceTag::Tpdo(n) => {
                    if let Some(tpdo) = self.tpdos.get(n as usize) {
                        tpdo.on_frame(&mut self.dev, frame, now, &mut out);
                    }
                }
                ServiceTag::SyncRecv => {
                    let counter = self.sync.as_ref().and_then(|s| s.on_frame(frame));
                    if let Some(counter) = counter {
                        for pdo in self.rpdos.iter().chain(self.tpdos.iter()) {
                            pdo.on_sync(&mut self.dev, counter, now, &mut out);
                        }
                    }
                }
                ServiceTag::TimeRecv => {
                    if let Some(time) = self.time.as_ref() {
                        time.on_frame(frame);
                    }
                }
                ServiceTag::EmcyRecv(_) => {
                    if let Some(emcy) = self.emcy.as_ref() {
                        emcy.on_frame(frame);
                    }
                }
                _ => {}
            }
        }

        self.flush(out);
        self.resync(now);
    }

    /// Run every timer whose deadline has passed
    pub fn tick(&mut self, now: u64) {
        let due = self.net.pop_due(now);
        let mut out: Vec<CanFrame> = Vec::new();

        for tag in due {
            match tag {
                ServiceTag::SdoServerTimer => {
                    let result = self.sdo_server.on_timeout(now);
                    let resp_id = self.sdo_server_resp_id();
                    for bytes in result.frames {
                        out.push(CanFrame::new(resp_id, &bytes));
                    }
                }
                ServiceTag::SdoClientTimer => {
                    let frames = self.sdo_client.on_timeout(now);
                    let req_id = self.sdo_client_req_id();
                    for bytes in frames {
                        out.push(CanFrame::new(req_id, &bytes));
                    }
                }
                ServiceTag::SyncTimer => {
                    if let Some(sync) = self.sync.as_ref() {
                        let before = out.len();
                        sync.on_timer(now, &mut out);
                        // The producer's own SYNC drives its PDOs too
                        if out.len() > before {
                            for pdo in self.rpdos.iter().chain(self.tpdos.iter()) {
                                pdo.on_sync(&mut self.dev, None, now, &mut out);
                            }
                        }
                    }
                }
                ServiceTag::TimeTimer => {
                    if let Some(time) = self.time.as_ref() {
                        time.on_timer(&mut self.dev, now, &mut out);
                    }
                }
                ServiceTag::TpdoTimer(n) => {
                    if let Some(tpdo) = self.tpdos.get(n as usize) {
                        tpdo.process(&mut self.dev, now, &mut out);
                    }
                }
                ServiceTag::EmcyTimer => {
                    if let Some(emcy) = self.emcy.as_ref() {
                        emcy.process(now, &mut out);
                    }
                }
                _ => {}
            }
        }

        self.flush(out);
        self.resync(now);
    }

    /// The earliest pending deadline, for hosts that wait externally
    pub fn next_deadline(&self) -> Option<u64> {
        self.net.next_deadline()
    }

    fn sdo_server_resp_id(&self) -> CanId {
        let id = self.dev.node_id().configured().unwrap_or(0);
        CanId::Std(SDO_RESP_BASE + id as u16)
    }

    fn sdo_client_req_id(&self) -> CanId {
        let id = self.sdo_client_target.unwrap_or(0);
        CanId::Std(SDO_REQ_BASE + id as u16)
    }

    fn notify_mapped_write(&mut self, index: u16, sub: u8, now: u64, out: &mut Vec<CanFrame>) {
        for tpdo in &self.tpdos {
            if tpdo.on_mapped_write(index, sub) {
                tpdo.process(&mut self.dev, now, out);
            }
        }
    }

    fn emit_server_frames(&mut self, frames: Vec<[u8; 8]>) {
        let resp_id = self.sdo_server_resp_id();
        let frames: Vec<CanFrame> = frames
            .into_iter()
            .map(|bytes| CanFrame::new(resp_id, &bytes))
            .collect();
        self.flush(frames);
    }

    fn emit_client_frames(&mut self, frames: Vec<[u8; 8]>) {
        let req_id = self.sdo_client_req_id();
        let frames: Vec<CanFrame> = frames
            .into_iter()
            .map(|bytes| CanFrame::new(req_id, &bytes))
            .collect();
        self.flush(frames);
    }

    /// Send queued frames in production order
    fn flush(&mut self, frames: Vec<CanFrame>) {
        for frame in frames {
            if self.net.send(&frame).is_err() {
                warn!("Host send callback failed, dropping frame");
            }
        }
    }

    /// Re-derive every receive filter and timer from current service state
    fn resync(&mut self, now: u64) {
        // Receive filters
        if self.sdo_server_active {
            if let Some(id) = self.dev.node_id().configured() {
                self.net.register_recv(
                    ServiceTag::SdoServerReq,
                    CanFilter::exact(CanId::Std(SDO_REQ_BASE + id as u16)),
                );
            }
        } else {
            self.net.unregister_recv(ServiceTag::SdoServerReq);
        }

        match self.sdo_client_target {
            Some(target) => self.net.register_recv(
                ServiceTag::SdoClientResp,
                CanFilter::exact(CanId::Std(SDO_RESP_BASE + target as u16)),
            ),
            None => self.net.unregister_recv(ServiceTag::SdoClientResp),
        }

        for (n, rpdo) in self.rpdos.iter().enumerate() {
            let tag = ServiceTag::Rpdo(n as u16);
            match rpdo.cob_id() {
                Some(id) => self.net.register_recv(tag, CanFilter::exact(id)),
                None => self.net.unregister_recv(tag),
            }
        }
        for (n, tpdo) in self.tpdos.iter().enumerate() {
            let tag = ServiceTag::Tpdo(n as u16);
            match tpdo.cob_id().filter(|_| tpdo.answers_rtr()) {
                Some(id) => self.net.register_recv(tag, CanFilter::exact(id)),
                None => self.net.unregister_recv(tag),
            }
        }

        match self.sync.as_ref().filter(|s| s.is_active() && !s.is_producer()) {
            Some(sync) => self
                .net
                .register_recv(ServiceTag::SyncRecv, CanFilter::exact(sync.can_id())),
            None => self.net.unregister_recv(ServiceTag::SyncRecv),
        }

        match self.time.as_ref().filter(|t| t.is_consumer()) {
            Some(time) => self
                .net
                .register_recv(ServiceTag::TimeRecv, CanFilter::exact(time.can_id())),
            None => self.net.unregister_recv(ServiceTag::TimeRecv),
        }

        for n in 0..8u8 {
            self.net.unregister_recv(ServiceTag::EmcyRecv(n));
        }
        if let Some(emcy) = self.emcy.as_ref() {
            for (n, id) in emcy.consumer_ids().into_iter().enumerate().take(8) {
                self.net
                    .register_recv(ServiceTag::EmcyRecv(n as u8), CanFilter::exact(id));
            }
        }

        // Timers
        self.sync_timer(ServiceTag::SdoServerTimer, self.sdo_server.deadline());
        self.sync_timer(ServiceTag::SdoClientTimer, self.sdo_client.deadline());

        let sync_deadline = self.sync.as_ref().and_then(|s| {
            s.refresh(now);
            s.deadline()
        });
        self.sync_timer(ServiceTag::SyncTimer, sync_deadline);

        let time_deadline = self.time.as_ref().and_then(|t| t.deadline());
        self.sync_timer(ServiceTag::TimeTimer, time_deadline);

        for n in 0..self.tpdos.len() {
            let deadline = self.tpdos[n].deadline();
            self.sync_timer(ServiceTag::TpdoTimer(n as u16), deadline);
        }

        let emcy_deadline = self.emcy.as_ref().and_then(|e| e.deadline());
        self.sync_timer(ServiceTag::EmcyTimer, emcy_deadline);
    }

    fn sync_timer(&mut self, tag: ServiceTag, deadline: Option<u64>) {
        match deadline {
            Some(deadline) => self.net.arm(tag, deadline),
            None => self.net.disarm(tag),
        }
    }
}

//! Constants for standard objects and well-known COB-IDs

/// Object indices for the standard communication profile objects
pub mod object_ids {
    /// The device type object index
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// The error register object index
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// The pre-defined error field (EMCY history) object index
    pub const ERROR_HISTORY: u16 = 0x1003;
    /// The SYNC COB-ID object index
    pub const SYNC_COBID: u16 = 0x1005;
    /// The SYNC communication cycle period object index
    pub const SYNC_PERIOD: u16 = 0x1006;
    /// The synchronous window length object index
    pub const SYNC_WINDOW: u16 = 0x1007;
    /// The TIME COB-ID object index
    pub const TIME_COBID: u16 = 0x1012;
    /// The high resolution time stamp object index
    pub const TIME_HIRES: u16 = 0x1013;
    /// The EMCY COB-ID object index
    pub const EMCY_COBID: u16 = 0x1014;
    /// The EMCY inhibit time object index
    pub const EMCY_INHIBIT: u16 = 0x1015;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// The SYNC counter overflow object index
    pub const SYNC_COUNTER: u16 = 0x1019;
    /// The emergency consumer object index
    pub const EMCY_CONSUMER: u16 = 0x1028;
    /// The first RPDO communication parameter object index
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// The first RPDO mapping parameter object index
    pub const RPDO_MAP_BASE: u16 = 0x1600;
    /// The first TPDO communication parameter object index
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// The first TPDO mapping parameter object index
    pub const TPDO_MAP_BASE: u16 = 0x1A00;
}

/// The default SYNC CAN-ID
pub const SYNC_ID: u16 = 0x80;
/// The default TIME CAN-ID
pub const TIME_ID: u16 = 0x100;
/// The base CAN-ID for EMCY frames (producer node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// The base CAN-ID for SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The base CAN-ID for SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;

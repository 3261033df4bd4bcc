//! The device: an object dictionary plus identity

use std::collections::BTreeMap;

use snafu::Snafu;

use stillcan_common::sdo::AbortCode;
use stillcan_common::{DataType, NodeId, Value};

use super::object::decode_for_sub;
use super::{AccessType, DnHook, Object, SubObject, UpHook};

/// An assembled SDO write, as seen by a download indication hook
#[derive(Debug, Clone, Copy)]
pub struct DnRequest<'a> {
    /// Target object index
    pub index: u16,
    /// Target sub-index
    pub sub: u8,
    /// The transferred bytes
    pub data: &'a [u8],
    /// Offset of `data` within the whole transfer. Always 0: the engine
    /// assembles transfers before indicating them.
    pub offset: usize,
    /// True when `data` completes the transfer. Always true today, see
    /// `offset`.
    pub last: bool,
}

/// A summary of a sub-object's transfer-relevant attributes
#[derive(Debug, Clone, Copy)]
pub struct SubInfo {
    /// The declared value type
    pub data_type: DataType,
    /// The access mode
    pub access: AccessType,
    /// True when mappable into a PDO
    pub pdo_mappable: bool,
    /// The fixed wire size, or `None` for variable-size types
    pub size: Option<usize>,
    /// The wire length of the value currently stored
    pub current_len: usize,
}

/// A CANopen device: the dictionary, its identity, and the default hooks
///
/// The device owns every object. All engine services operate on the
/// dictionary exclusively through [`Device::download`] and
/// [`Device::upload`], so host-registered hooks observe every protocol
/// access.
pub struct Device {
    node_id: NodeId,
    vendor_id: u32,
    product_code: u32,
    revision_number: u32,
    objects: BTreeMap<u16, Object>,
    default_dn_hook: Option<DnHook>,
    default_up_hook: Option<UpHook>,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("node_id", &self.node_id)
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl Device {
    /// Create an empty device
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            vendor_id: 0,
            product_code: 0,
            revision_number: 0,
            objects: BTreeMap::new(),
            default_dn_hook: None,
            default_up_hook: None,
        }
    }

    /// Set the identity fields reported in object 0x1018
    pub fn with_identity(mut self, vendor_id: u32, product_code: u32, revision: u32) -> Self {
        self.vendor_id = vendor_id;
        self.product_code = product_code;
        self.revision_number = revision;
        self
    }

    /// The configured node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Change the node ID
    pub fn set_node_id(&mut self, node_id: NodeId) {
        self.node_id = node_id;
    }

    /// The vendor ID
    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    /// The product code
    pub fn product_code(&self) -> u32 {
        self.product_code
    }

    /// The revision number
    pub fn revision_number(&self) -> u32 {
        self.revision_number
    }

    /// Insert an object, consuming it
    ///
    /// Fails with [`DeviceError::AlreadyExists`] when the index is taken.
    pub fn insert_object(&mut self, object: Object) -> Result<(), DeviceError> {
        if self.objects.contains_key(&object.index) {
            return Err(DeviceError::AlreadyExists {
                index: object.index,
                sub: 0,
            });
        }
        self.objects.insert(object.index, object);
        Ok(())
    }

    /// Remove an object, destroying its sub-objects and storage
    pub fn remove_object(&mut self, index: u16) -> Option<Object> {
        self.objects.remove(&index)
    }

    /// Look up an object
    pub fn find_object(&self, index: u16) -> Option<&Object> {
        self.objects.get(&index)
    }

    /// Look up an object mutably
    pub fn find_object_mut(&mut self, index: u16) -> Option<&mut Object> {
        self.objects.get_mut(&index)
    }

    /// Look up a sub-object
    pub fn find_sub(&self, index: u16, sub: u8) -> Option<&SubObject> {
        self.objects.get(&index)?.find_sub(sub)
    }

    /// Iterate objects in index order
    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Read the current value of a sub-object (host access, no access-mode
    /// check)
    pub fn read(&self, index: u16, sub: u8) -> Result<Value, DeviceError> {
        self.objects
            .get(&index)
            .ok_or(DeviceError::NotFound { index, sub: None })?
            .get_value(sub)
    }

    /// Write a value to a sub-object (host access, no access-mode check)
    ///
    /// The value is still type- and range-checked.
    pub fn write(&mut self, index: u16, sub: u8, value: Value) -> Result<(), DeviceError> {
        let obj = self
            .objects
            .get_mut(&index)
            .ok_or(DeviceError::NotFound { index, sub: None })?;
        {
            let s = obj.find_sub(sub).ok_or(DeviceError::NotFound {
                index,
                sub: Some(sub),
            })?;
            if value.data_type() != s.data_type() {
                return Err(DeviceError::Inval);
            }
            if s.check_range(&value).is_err() {
                return Err(DeviceError::Inval);
            }
        }
        obj.set_value(sub, value)
    }

    /// Summarize a sub-object for the transfer machinery
    ///
    /// A sub-object whose download hook owns the write reports no fixed
    /// size, since the hook may accept payloads the declared type would not.
    pub fn sub_info(&self, index: u16, sub: u8) -> Result<SubInfo, AbortCode> {
        let obj = self.objects.get(&index).ok_or(AbortCode::NoSuchObject)?;
        let s = obj.find_sub(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        Ok(SubInfo {
            data_type: s.data_type(),
            access: s.access(),
            pdo_mappable: s.is_pdo_mappable(),
            size: if s.flags().hook_owns_write {
                None
            } else {
                s.data_type().wire_size()
            },
            current_len: obj.current_len(sub).unwrap_or(0),
        })
    }

    /// Register a download indication hook on a sub-object
    pub fn set_dn_hook(
        &mut self,
        index: u16,
        sub: u8,
        hook: Option<DnHook>,
    ) -> Result<(), DeviceError> {
        self.objects
            .get_mut(&index)
            .and_then(|o| o.find_sub_mut(sub))
            .ok_or(DeviceError::NotFound {
                index,
                sub: Some(sub),
            })?
            .set_dn_hook(hook);
        Ok(())
    }

    /// Register an upload indication hook on a sub-object
    pub fn set_up_hook(
        &mut self,
        index: u16,
        sub: u8,
        hook: Option<UpHook>,
    ) -> Result<(), DeviceError> {
        self.objects
            .get_mut(&index)
            .and_then(|o| o.find_sub_mut(sub))
            .ok_or(DeviceError::NotFound {
                index,
                sub: Some(sub),
            })?
            .set_up_hook(hook);
        Ok(())
    }

    /// Register device-global fallback hooks, used by sub-objects that carry
    /// none of their own
    pub fn set_default_hooks(&mut self, dn: Option<DnHook>, up: Option<UpHook>) {
        self.default_dn_hook = dn;
        self.default_up_hook = up;
    }

    /// Deliver an SDO write to a sub-object
    ///
    /// Checks the access mode, then runs the sub-object's download hook (or
    /// the device default hook, or [`Device::default_download`]).
    pub fn download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let (access, hook) = {
            let obj = self.objects.get(&index).ok_or(AbortCode::NoSuchObject)?;
            let s = obj.find_sub(sub).ok_or(AbortCode::NoSuchSubIndex)?;
            (
                s.access(),
                s.dn_hook.clone().or_else(|| self.default_dn_hook.clone()),
            )
        };
        if !access.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        let req = DnRequest {
            index,
            sub,
            data,
            offset: 0,
            last: true,
        };
        match hook {
            Some(h) => h(self, &req),
            None => self.default_download(index, sub, data),
        }
    }

    /// Deliver a local (host-side) write through the download hooks
    ///
    /// Identical to [`Device::download`] except that the access mode is not
    /// checked: read-only marks protect a value from the network, not from
    /// the application. Hooks still run, so configuration guards hold for
    /// local writes too.
    pub fn download_local(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let hook = {
            let obj = self.objects.get(&index).ok_or(AbortCode::NoSuchObject)?;
            let s = obj.find_sub(sub).ok_or(AbortCode::NoSuchSubIndex)?;
            s.dn_hook.clone().or_else(|| self.default_dn_hook.clone())
        };
        let req = DnRequest {
            index,
            sub,
            data,
            offset: 0,
            last: true,
        };
        match hook {
            Some(h) => h(self, &req),
            None => self.default_download(index, sub, data),
        }
    }

    /// Serve an SDO read from a sub-object
    ///
    /// Checks the access mode, then runs the sub-object's upload hook (or
    /// the device default hook, or [`Device::default_upload`]).
    pub fn upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>, AbortCode> {
        let (access, hook) = {
            let obj = self.objects.get(&index).ok_or(AbortCode::NoSuchObject)?;
            let s = obj.find_sub(sub).ok_or(AbortCode::NoSuchSubIndex)?;
            (
                s.access(),
                s.up_hook.clone().or_else(|| self.default_up_hook.clone()),
            )
        };
        if !access.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        match hook {
            Some(h) => {
                let mut out = Vec::new();
                h(self, index, sub, &mut out)?;
                Ok(out)
            }
            None => self.default_upload(index, sub),
        }
    }

    /// The default download behavior: decode, range-check and commit
    ///
    /// Custom hooks that only want side effects call this to store the
    /// value.
    pub fn default_download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let obj = self
            .objects
            .get_mut(&index)
            .ok_or(AbortCode::NoSuchObject)?;
        let value = {
            let s = obj.find_sub(sub).ok_or(AbortCode::NoSuchSubIndex)?;
            let value = decode_for_sub(s.data_type(), data)?;
            s.check_range(&value)?;
            value
        };
        obj.set_value(sub, value)
            .map_err(|_| AbortCode::GeneralError)
    }

    /// The default upload behavior: encode the current slot
    pub fn default_upload(&mut self, index: u16, sub: u8) -> Result<Vec<u8>, AbortCode> {
        let obj = self.objects.get(&index).ok_or(AbortCode::NoSuchObject)?;
        obj.find_sub(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        let value = obj.get_value(sub).map_err(|_| AbortCode::NoData)?;
        Ok(value.to_bytes())
    }
}

/// Errors returned to the host by dictionary and service entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum DeviceError {
    /// An argument is invalid, or the device is in a state that forbids the
    /// operation
    Inval,
    /// Out of memory
    NoMem,
    /// The addressed object or sub-object does not exist
    #[snafu(display("Object 0x{index:04X} (sub {sub:?}) not found"))]
    NotFound {
        /// The addressed index
        index: u16,
        /// The addressed sub-index, when one was given
        sub: Option<u8>,
    },
    /// The addressed index/sub-index pair is already occupied
    #[snafu(display("Object 0x{index:04X} sub {sub} already exists"))]
    AlreadyExists {
        /// The occupied index
        index: u16,
        /// The occupied sub-index
        sub: u8,
    },
    /// The resource is busy with another operation
    Busy,
    /// The operation timed out
    Timeout,
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::object_dict::ObjectCode;

    fn test_device() -> Device {
        let mut dev = Device::new(NodeId::new(5).unwrap());
        let mut obj = Object::new(0x2000, ObjectCode::Var);
        obj.insert_sub(
            SubObject::new(0, DataType::UInt32, AccessType::Rw)
                .with_limits(Some(Value::UInt32(0)), Some(Value::UInt32(1000))),
        )
        .unwrap();
        dev.insert_object(obj).unwrap();

        let mut obj = Object::new(0x2001, ObjectCode::Var);
        obj.insert_sub(SubObject::new(0, DataType::UInt16, AccessType::Ro)).unwrap();
        dev.insert_object(obj).unwrap();

        let mut obj = Object::new(0x2002, ObjectCode::Var);
        obj.insert_sub(SubObject::new(0, DataType::UInt8, AccessType::Wo)).unwrap();
        dev.insert_object(obj).unwrap();
        dev
    }

    #[test]
    fn test_download_upload() {
        let mut dev = test_device();
        dev.download(0x2000, 0, &100u32.to_le_bytes()).unwrap();
        assert_eq!(dev.read(0x2000, 0).unwrap(), Value::UInt32(100));
        assert_eq!(dev.upload(0x2000, 0).unwrap(), 100u32.to_le_bytes());
    }

    #[test]
    fn test_access_checked_before_type() {
        let mut dev = test_device();
        // Write to RO fails with ReadOnly even though the payload length is
        // also wrong
        assert_eq!(
            dev.download(0x2001, 0, &[1]),
            Err(AbortCode::ReadOnly)
        );
        assert_eq!(dev.upload(0x2002, 0), Err(AbortCode::WriteOnly));
    }

    #[test]
    fn test_missing_addresses() {
        let mut dev = test_device();
        assert_eq!(dev.download(0x3000, 0, &[0]), Err(AbortCode::NoSuchObject));
        assert_eq!(
            dev.download(0x2000, 9, &[0]),
            Err(AbortCode::NoSuchSubIndex)
        );
    }

    #[test]
    fn test_range_enforced() {
        let mut dev = test_device();
        assert_eq!(
            dev.download(0x2000, 0, &1001u32.to_le_bytes()),
            Err(AbortCode::ValueTooHigh)
        );
        // Rejected writes must not disturb the stored value
        assert_eq!(dev.read(0x2000, 0).unwrap(), Value::UInt32(0));
    }

    #[test]
    fn test_length_mismatch() {
        let mut dev = test_device();
        assert_eq!(
            dev.download(0x2000, 0, &[1, 2]),
            Err(AbortCode::DataTypeMismatchLengthLow)
        );
        assert_eq!(
            dev.download(0x2000, 0, &[1, 2, 3, 4, 5]),
            Err(AbortCode::DataTypeMismatchLengthHigh)
        );
    }

    #[test]
    fn test_dn_hook_overrides() {
        let mut dev = test_device();
        let seen = Rc::new(Cell::new(0u32));
        let seen_in_hook = seen.clone();
        dev.set_dn_hook(
            0x2000,
            0,
            Some(Rc::new(move |dev: &mut Device, req: &DnRequest| {
                seen_in_hook.set(seen_in_hook.get() + 1);
                if req.data == 13u32.to_le_bytes() {
                    return Err(AbortCode::CantStore);
                }
                dev.default_download(req.index, req.sub, req.data)
            })),
        )
        .unwrap();

        dev.download(0x2000, 0, &7u32.to_le_bytes()).unwrap();
        assert_eq!(dev.read(0x2000, 0).unwrap(), Value::UInt32(7));
        assert_eq!(
            dev.download(0x2000, 0, &13u32.to_le_bytes()),
            Err(AbortCode::CantStore)
        );
        assert_eq!(dev.read(0x2000, 0).unwrap(), Value::UInt32(7));
        assert_eq!(seen.get(), 2);
    }

    #[test]
    fn test_up_hook_overrides() {
        let mut dev = test_device();
        dev.set_up_hook(
            0x2000,
            0,
            Some(Rc::new(
                |_dev: &mut Device, _index, _sub, out: &mut Vec<u8>| {
                    out.extend_from_slice(&99u32.to_le_bytes());
                    Ok(())
                },
            )),
        )
        .unwrap();
        assert_eq!(dev.upload(0x2000, 0).unwrap(), 99u32.to_le_bytes());
    }

    #[test]
    fn test_hook_owned_write_relaxes_size() {
        use crate::object_dict::SubFlags;

        let mut dev = test_device();
        assert_eq!(dev.sub_info(0x2000, 0).unwrap().size, Some(4));
        dev.find_object_mut(0x2000)
            .unwrap()
            .find_sub_mut(0)
            .unwrap()
            .flags = SubFlags {
            hook_owns_write: true,
            ..Default::default()
        };
        assert_eq!(dev.sub_info(0x2000, 0).unwrap().size, None);
    }

    #[test]
    fn test_host_write_checks() {
        let mut dev = test_device();
        assert_eq!(
            dev.write(0x2000, 0, Value::UInt16(5)),
            Err(DeviceError::Inval)
        );
        assert_eq!(
            dev.write(0x2000, 0, Value::UInt32(100_000)),
            Err(DeviceError::Inval)
        );
        dev.write(0x2000, 0, Value::UInt32(5)).unwrap();
        assert_eq!(dev.read(0x2000, 0).unwrap(), Value::UInt32(5));
    }
}

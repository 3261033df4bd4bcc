//! Sub-object attributes

use std::rc::Rc;

use stillcan_common::sdo::AbortCode;
use stillcan_common::{DataType, Value};

use super::device::{Device, DnRequest};

/// The kind of an object in the dictionary
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectCode {
    /// A placeholder without data
    Null = 0,
    /// A large block of application data
    Domain = 2,
    /// A type definition
    DefType = 5,
    /// A record type definition
    DefStruct = 6,
    /// A single value
    #[default]
    Var = 7,
    /// Multiple values of one type
    Array = 8,
    /// Multiple values of mixed types
    Record = 9,
}

impl TryFrom<u8> for ObjectCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectCode::Null),
            2 => Ok(ObjectCode::Domain),
            5 => Ok(ObjectCode::DefType),
            6 => Ok(ObjectCode::DefStruct),
            7 => Ok(ObjectCode::Var),
            8 => Ok(ObjectCode::Array),
            9 => Ok(ObjectCode::Record),
            _ => Err(()),
        }
    }
}

/// The access mode of a sub-object
///
/// Access is checked before anything else: an SDO write to a read-only
/// sub-object aborts with [`AbortCode::ReadOnly`] and an SDO read of a
/// write-only sub-object aborts with [`AbortCode::WriteOnly`], regardless of
/// the payload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-write, readable as process data
    Rwr,
    /// Read-write, writable as process data
    Rww,
    /// Read-only, and never changed by the device either
    Const,
}

impl AccessType {
    /// Can the value be read over SDO?
    pub fn is_readable(&self) -> bool {
        !matches!(self, AccessType::Wo)
    }

    /// Can the value be written over SDO?
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Wo | AccessType::Rw | AccessType::Rwr | AccessType::Rww)
    }
}

/// Behavior switches for a sub-object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubFlags {
    /// The download hook fully owns the write; the default commit is not
    /// expected to run after it
    pub hook_owns_write: bool,
    /// Mark a DOMAIN value whose contents live outside the dictionary (for
    /// example in a file); the host's hooks carry the payload
    pub external_domain: bool,
}

/// The download indication hook signature
///
/// Receives the device and the assembled write. Returning `Ok(())` means the
/// write has been accepted (and committed, if the hook wants it stored);
/// returning an abort code rejects it and aborts the transfer.
pub type DnHook = Rc<dyn Fn(&mut Device, &DnRequest) -> Result<(), AbortCode>>;

/// The upload indication hook signature
///
/// Fills `out` with the bytes to transfer for a read of (index, sub).
pub type UpHook = Rc<dyn Fn(&mut Device, u16, u8, &mut Vec<u8>) -> Result<(), AbortCode>>;

/// One sub-object: a typed value slot plus its access policy
///
/// A sub-object is created free-standing and bound to its parent object by
/// [`Object::insert_sub`](super::Object::insert_sub), which consumes it;
/// ownership makes re-parenting unrepresentable. The current value lives in
/// the parent object's packed buffer at `offset()`.
pub struct SubObject {
    pub(crate) sub_index: u8,
    pub(crate) data_type: DataType,
    pub(crate) name: Option<String>,
    pub(crate) access: AccessType,
    pub(crate) pdo_mappable: bool,
    pub(crate) flags: SubFlags,
    pub(crate) default: Value,
    pub(crate) min: Option<Value>,
    pub(crate) max: Option<Value>,
    /// Slot position in the parent's packed buffer, maintained on rebuild
    pub(crate) offset: usize,
    pub(crate) slot_len: usize,
    pub(crate) dn_hook: Option<DnHook>,
    pub(crate) up_hook: Option<UpHook>,
}

impl core::fmt::Debug for SubObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubObject")
            .field("sub_index", &self.sub_index)
            .field("data_type", &self.data_type)
            .field("access", &self.access)
            .field("offset", &self.offset)
            .field("slot_len", &self.slot_len)
            .finish()
    }
}

impl SubObject {
    /// Create a sub-object holding the zero/empty value of its type
    pub fn new(sub_index: u8, data_type: DataType, access: AccessType) -> Self {
        Self {
            sub_index,
            data_type,
            name: None,
            access,
            pdo_mappable: false,
            flags: SubFlags::default(),
            default: data_type.default_value(),
            min: None,
            max: None,
            offset: 0,
            slot_len: 0,
            dn_hook: None,
            up_hook: None,
        }
    }

    /// Set the human readable name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Set the default (and initial) value
    ///
    /// # Panics
    /// Panics if the value's type does not match the sub-object's type.
    pub fn with_default(mut self, value: Value) -> Self {
        assert_eq!(
            value.data_type(),
            self.data_type,
            "default value type mismatch"
        );
        self.default = value;
        self
    }

    /// Restrict the accepted value range. Only meaningful for basic numeric
    /// types; array types have no defined range.
    pub fn with_limits(mut self, min: Option<Value>, max: Option<Value>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Allow this sub-object to be mapped into a PDO
    pub fn pdo_mappable(mut self) -> Self {
        self.pdo_mappable = true;
        self
    }

    /// Set the behavior flags
    pub fn with_flags(mut self, flags: SubFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The sub-index within the parent object
    pub fn sub_index(&self) -> u8 {
        self.sub_index
    }

    /// The value type
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The access mode
    pub fn access(&self) -> AccessType {
        self.access
    }

    /// The name, if one was set
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True if this sub-object may be mapped into a PDO
    pub fn is_pdo_mappable(&self) -> bool {
        self.pdo_mappable
    }

    /// The behavior flags
    pub fn flags(&self) -> SubFlags {
        self.flags
    }

    /// The default value
    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// The lower limit, if one was set
    pub fn min(&self) -> Option<&Value> {
        self.min.as_ref()
    }

    /// The upper limit, if one was set
    pub fn max(&self) -> Option<&Value> {
        self.max.as_ref()
    }

    /// Offset of this sub-object's slot in the parent's packed buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of this sub-object's slot in the parent's packed buffer
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Check a candidate value against the declared limits
    ///
    /// An inverted range (min > max) rejects every write with
    /// [`AbortCode::RangeError`].
    pub fn check_range(&self, value: &Value) -> Result<(), AbortCode> {
        use core::cmp::Ordering;
        if let (Some(min), Some(max)) = (&self.min, &self.max) {
            if min.partial_cmp_typed(max) == Some(Ordering::Greater) {
                return Err(AbortCode::RangeError);
            }
        }
        if let Some(min) = &self.min {
            if value.partial_cmp_typed(min) == Some(Ordering::Less) {
                return Err(AbortCode::ValueTooLow);
            }
        }
        if let Some(max) = &self.max {
            if value.partial_cmp_typed(max) == Some(Ordering::Greater) {
                return Err(AbortCode::ValueTooHigh);
            }
        }
        Ok(())
    }

    /// Register the download indication hook
    pub fn set_dn_hook(&mut self, hook: Option<DnHook>) {
        self.dn_hook = hook;
    }

    /// Register the upload indication hook
    pub fn set_up_hook(&mut self, hook: Option<UpHook>) {
        self.up_hook = hook;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_type() {
        assert!(AccessType::Ro.is_readable());
        assert!(!AccessType::Ro.is_writable());
        assert!(!AccessType::Wo.is_readable());
        assert!(AccessType::Wo.is_writable());
        assert!(AccessType::Rwr.is_writable());
        assert!(AccessType::Const.is_readable());
        assert!(!AccessType::Const.is_writable());
    }

    #[test]
    fn test_range_check() {
        let sub = SubObject::new(0, DataType::UInt8, AccessType::Rw)
            .with_limits(Some(Value::UInt8(10)), Some(Value::UInt8(20)));
        assert_eq!(sub.check_range(&Value::UInt8(10)), Ok(()));
        assert_eq!(sub.check_range(&Value::UInt8(20)), Ok(()));
        assert_eq!(
            sub.check_range(&Value::UInt8(9)),
            Err(AbortCode::ValueTooLow)
        );
        assert_eq!(
            sub.check_range(&Value::UInt8(21)),
            Err(AbortCode::ValueTooHigh)
        );
    }

    #[test]
    fn test_inverted_range() {
        let sub = SubObject::new(0, DataType::Int16, AccessType::Rw)
            .with_limits(Some(Value::Int16(5)), Some(Value::Int16(-5)));
        assert_eq!(
            sub.check_range(&Value::Int16(0)),
            Err(AbortCode::RangeError)
        );
    }
}

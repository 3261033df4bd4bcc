//! Concise-DCF dictionary snapshots
//!
//! A snapshot is the concise-DCF layout: a little-endian u32 entry count
//! followed by `(u16 index, u8 sub, u32 size, bytes)` records. Loading
//! installs each record through the value codec, skipping entries the
//! dictionary no longer carries; the application decides where the bytes
//! live in between.

use log::warn;

use stillcan_common::Value;

use crate::object_dict::{AccessType, Device, DeviceError};

/// Serialize every non-constant sub-object value
///
/// Constants and externally backed DOMAINs (whose payload lives outside the
/// dictionary) are skipped.
pub fn save(dev: &Device) -> Vec<u8> {
    let mut entries: Vec<(u16, u8, Vec<u8>)> = Vec::new();
    for obj in dev.objects() {
        for sub in obj.subs() {
            if sub.access() == AccessType::Const || sub.flags().external_domain {
                continue;
            }
            let Ok(value) = obj.get_value(sub.sub_index()) else {
                continue;
            };
            entries.push((obj.index(), sub.sub_index(), value.to_bytes()));
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (index, sub, bytes) in entries {
        out.extend_from_slice(&index.to_le_bytes());
        out.push(sub);
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytes);
    }
    out
}

/// Install a snapshot, returning the number of values restored
///
/// Records addressing missing sub-objects or carrying undecodable payloads
/// are skipped with a warning. A truncated snapshot fails with
/// [`DeviceError::Inval`] without touching the remaining records.
pub fn load(dev: &mut Device, data: &[u8]) -> Result<usize, DeviceError> {
    fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], DeviceError> {
        if *pos + n > data.len() {
            return Err(DeviceError::Inval);
        }
        let slice = &data[*pos..*pos + n];
        *pos += n;
        Ok(slice)
    }

    let mut pos = 0usize;
    let count = u32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap());
    let mut restored = 0usize;
    for _ in 0..count {
        let index = u16::from_le_bytes(take(data, &mut pos, 2)?.try_into().unwrap());
        let sub = take(data, &mut pos, 1)?[0];
        let size = u32::from_le_bytes(take(data, &mut pos, 4)?.try_into().unwrap()) as usize;
        let bytes = take(data, &mut pos, size)?;

        let Some(ty) = dev.find_sub(index, sub).map(|s| s.data_type()) else {
            warn!("Snapshot entry 0x{index:04X}:{sub} has no sub-object, skipping");
            continue;
        };
        let value = match Value::decode(ty, bytes) {
            Ok(value) => value,
            Err(_) => {
                warn!("Snapshot entry 0x{index:04X}:{sub} does not decode, skipping");
                continue;
            }
        };
        match dev
            .find_object_mut(index)
            .expect("sub-object implies object")
            .set_value(sub, value)
        {
            Ok(()) => restored += 1,
            Err(_) => warn!("Snapshot entry 0x{index:04X}:{sub} rejected, skipping"),
        }
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dict::{Object, ObjectCode, SubObject};
    use stillcan_common::{DataType, NodeId};

    fn snapshot_device() -> Device {
        let mut dev = Device::new(NodeId::new(1).unwrap());
        let mut obj = Object::new(0x2000, ObjectCode::Record);
        obj.insert_sub(SubObject::new(0, DataType::UInt32, AccessType::Rw)).unwrap();
        obj.insert_sub(
            SubObject::new(1, DataType::VisibleString, AccessType::Rw)
                .with_default(Value::VisibleString("hi".into())),
        )
        .unwrap();
        obj.insert_sub(
            SubObject::new(2, DataType::UInt8, AccessType::Const)
                .with_default(Value::UInt8(3)),
        )
        .unwrap();
        dev.insert_object(obj).unwrap();
        dev
    }

    #[test]
    fn test_roundtrip() {
        let mut dev = snapshot_device();
        dev.write(0x2000, 0, Value::UInt32(0xAABB)).unwrap();
        dev.write(0x2000, 1, Value::VisibleString("snapshot".into()))
            .unwrap();
        let blob = save(&dev);

        let mut fresh = snapshot_device();
        let restored = load(&mut fresh, &blob).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(fresh.read(0x2000, 0).unwrap(), Value::UInt32(0xAABB));
        assert_eq!(
            fresh.read(0x2000, 1).unwrap(),
            Value::VisibleString("snapshot".into())
        );
    }

    #[test]
    fn test_const_not_saved() {
        let dev = snapshot_device();
        let blob = save(&dev);
        let count = u32::from_le_bytes(blob[0..4].try_into().unwrap());
        assert_eq!(count, 2);
    }

    #[test]
    fn test_unknown_entry_skipped() {
        let mut dev = snapshot_device();
        let mut blob = Vec::new();
        blob.extend_from_slice(&2u32.to_le_bytes());
        // An entry for an object this dictionary does not carry
        blob.extend_from_slice(&0x5555u16.to_le_bytes());
        blob.push(0);
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.push(0xFF);
        // A valid entry after it
        blob.extend_from_slice(&0x2000u16.to_le_bytes());
        blob.push(0);
        blob.extend_from_slice(&4u32.to_le_bytes());
        blob.extend_from_slice(&7u32.to_le_bytes());

        let restored = load(&mut dev, &blob).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(dev.read(0x2000, 0).unwrap(), Value::UInt32(7));
    }

    #[test]
    fn test_truncated_snapshot_fails() {
        let mut dev = snapshot_device();
        let blob = save(&dev);
        assert_eq!(
            load(&mut dev, &blob[0..blob.len() - 1]),
            Err(DeviceError::Inval)
        );
    }
}

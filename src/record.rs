//! Wire codec (§4.1): the fixed-layout `RpcRecord` blob and the opcode tag
//! that precedes it on every request.
//!
//! Every field is present on every call regardless of opcode (§3 invariant:
//! "the wire record is a single fixed-layout blob"). The codec is symmetric:
//! `decode(encode(r)) == r` for every well-formed record. The wire is pinned
//! little-endian (§9 "Endianness" — this rewrite documents the break rather
//! than keeping native order).

use packed_struct::prelude::*;

use crate::error::RpcError;
use crate::usb::DeviceDescriptor;

/// Upper bound on any single transfer buffer carried in `RpcRecord::data`.
pub const MAX_DATA: usize = 8192;
/// Upper bound on `DeviceList` length.
pub const MAX_DEVICES: usize = 64;

const DEVICES_RAW_BYTES: usize = MAX_DEVICES * 4;
/// Total size in bytes of one `RpcRecord` on the wire.
pub const RECORD_SIZE: usize = 334 + MAX_DATA;

/// Opaque, wire-stable reference to one enumerated device on the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceRef(pub u32);

/// Opaque, wire-stable reference to one opened device handle on the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleRef(pub u32);

/// The 16 remote operations, tag values contiguous from 0 in catalog order
/// (§4.3). Serialized as a 32-bit tag ahead of the record on every request;
/// never echoed in the response.
#[derive(PrimitiveEnum_u32, Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    UsbInit = 0,
    UsbExit = 1,
    UsbGetDeviceList = 2,
    UsbGetDeviceDescriptor = 3,
    UsbOpen = 4,
    UsbOpenDeviceWithVidPid = 5,
    UsbClose = 6,
    UsbClaimInterface = 7,
    UsbReleaseInterface = 8,
    UsbGetConfiguration = 9,
    UsbSetConfiguration = 10,
    UsbSetInterfaceAltSetting = 11,
    UsbResetDevice = 12,
    UsbClearHalt = 13,
    UsbGetStringDescriptorAscii = 14,
    UsbControlTransfer = 15,
    UsbBulkTransfer = 16,
}

/// Encode the opcode tag as it appears on the wire ahead of a request.
pub fn encode_opcode(op: OpCode) -> [u8; 4] {
    (op.to_primitive()).to_le_bytes()
}

/// Decode an opcode tag read off the wire. An out-of-range value is an
/// operation-level failure (`ILLEGAL_OPCODE`), not a transport failure.
pub fn decode_opcode(buf: [u8; 4]) -> Result<OpCode, RpcError> {
    let raw = u32::from_le_bytes(buf);
    OpCode::from_primitive(raw).ok_or_else(|| RpcError::InvalidArg(format!("illegal opcode {raw}")))
}

/// The single shared, fixed-layout record carrying inputs and outputs for
/// any operation (§3, §6). Layout (byte offsets, all multi-byte fields
/// little-endian):
///
/// ```text
/// 0..4      role
/// 4..8      server_error
/// 8..12     n_devices
/// 12..268   devices (MAX_DEVICES * u32, little-endian)
/// 268..272  dev
/// 272..276  dh
/// 276..294  dd (DeviceDescriptor, 18 bytes)
/// 294..296  vid
/// 296..298  pid
/// 298..302  intf
/// 302..306  alt_setting
/// 306..310  conf
/// 310..312  endpoint
/// 312..314  idx
/// 314..316  req_type
/// 316..318  req
/// 318..320  val
/// 320..322  len
/// 322..326  timeout
/// 326..330  length
/// 330..334  transferred
/// 334..     data[MAX_DATA]
/// ```
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8526")]
pub struct RpcRecord {
    #[packed_field(bytes = "0..=3", endian = "lsb")]
    pub role: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "4..=7", endian = "lsb")]
    pub server_error: Integer<u32, packed_bits::Bits<32>>,

    #[packed_field(bytes = "8..=11", endian = "lsb")]
    pub n_devices: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "12..=267", element_size_bytes = "1")]
    pub devices_raw: [u8; DEVICES_RAW_BYTES],

    #[packed_field(bytes = "268..=271", endian = "lsb")]
    pub dev: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "272..=275", endian = "lsb")]
    pub dh: Integer<u32, packed_bits::Bits<32>>,

    #[packed_field(bytes = "276..=293", element_size_bytes = "18")]
    pub dd: DeviceDescriptor,

    #[packed_field(bytes = "294..=295", endian = "lsb")]
    pub vid: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "296..=297", endian = "lsb")]
    pub pid: Integer<u16, packed_bits::Bits<16>>,

    #[packed_field(bytes = "298..=301", endian = "lsb")]
    pub intf: Integer<i32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "302..=305", endian = "lsb")]
    pub alt_setting: Integer<i32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "306..=309", endian = "lsb")]
    pub conf: Integer<i32, packed_bits::Bits<32>>,

    #[packed_field(bytes = "310..=311", endian = "lsb")]
    pub endpoint: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "312..=313", endian = "lsb")]
    pub idx: Integer<u16, packed_bits::Bits<16>>,

    #[packed_field(bytes = "314..=315", endian = "lsb")]
    pub req_type: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "316..=317", endian = "lsb")]
    pub req: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "318..=319", endian = "lsb")]
    pub val: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "320..=321", endian = "lsb")]
    pub len: Integer<u16, packed_bits::Bits<16>>,

    #[packed_field(bytes = "322..=325", endian = "lsb")]
    pub timeout: Integer<u32, packed_bits::Bits<32>>,

    #[packed_field(bytes = "326..=329", endian = "lsb")]
    pub length: Integer<i32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "330..=333", endian = "lsb")]
    pub transferred: Integer<i32, packed_bits::Bits<32>>,

    #[packed_field(bytes = "334..=8525", element_size_bytes = "1")]
    pub data: [u8; MAX_DATA],
}

impl RpcRecord {
    /// A zeroed record with the given role, ready to have one operation's
    /// input fields populated.
    pub fn new(role: u32) -> Self {
        Self {
            role: Integer::from_primitive(role),
            server_error: Integer::from_primitive(0),
            n_devices: Integer::from_primitive(0),
            devices_raw: [0; DEVICES_RAW_BYTES],
            dev: Integer::from_primitive(0),
            dh: Integer::from_primitive(0),
            dd: DeviceDescriptor::default(),
            vid: Integer::from_primitive(0),
            pid: Integer::from_primitive(0),
            intf: Integer::from_primitive(0),
            alt_setting: Integer::from_primitive(0),
            conf: Integer::from_primitive(0),
            endpoint: Integer::from_primitive(0),
            idx: Integer::from_primitive(0),
            req_type: Integer::from_primitive(0),
            req: Integer::from_primitive(0),
            val: Integer::from_primitive(0),
            len: Integer::from_primitive(0),
            timeout: Integer::from_primitive(0),
            length: Integer::from_primitive(0),
            transferred: Integer::from_primitive(0),
            data: [0; MAX_DATA],
        }
    }

    pub fn encode(&self) -> Result<[u8; RECORD_SIZE], RpcError> {
        self.pack()
            .map_err(|e| RpcError::Wire(format!("failed to pack record: {e}")))
    }

    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Result<Self, RpcError> {
        Self::unpack(buf).map_err(|e| RpcError::Wire(format!("failed to unpack record: {e}")))
    }

    /// The device list currently carried by `n_devices`/`devices_raw`.
    pub fn device_list(&self) -> Vec<DeviceRef> {
        let n = (self.n_devices.to_primitive() as usize).min(MAX_DEVICES);
        self.devices_raw[..n * 4]
            .chunks_exact(4)
            .map(|c| DeviceRef(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect()
    }

    /// Populates `n_devices`/`devices_raw` from a freshly taken device list.
    /// `refs.len()` must not exceed `MAX_DEVICES` (caller's responsibility,
    /// enforced by the identity table at `GET_DEVICE_LIST` time).
    pub fn set_device_list(&mut self, refs: &[DeviceRef]) {
        let n = refs.len().min(MAX_DEVICES);
        self.n_devices = Integer::from_primitive(n as u32);
        self.devices_raw = [0; DEVICES_RAW_BYTES];
        for (i, r) in refs.iter().take(n).enumerate() {
            self.devices_raw[i * 4..i * 4 + 4].copy_from_slice(&r.0.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RpcRecord {
        let mut r = RpcRecord::new(0);
        r.server_error = Integer::from_primitive(0);
        r.dev = Integer::from_primitive(7);
        r.dh = Integer::from_primitive(3);
        r.vid = Integer::from_primitive(0x1d6b);
        r.pid = Integer::from_primitive(0x0002);
        r.len = Integer::from_primitive(18);
        r.data[0] = 0xAB;
        r.data[17] = 0xCD;
        r.set_device_list(&[DeviceRef(0), DeviceRef(1), DeviceRef(2)]);
        r
    }

    #[test]
    fn decode_of_encode_is_identity() {
        let r = sample_record();
        let bytes = r.encode().expect("encode");
        let back = RpcRecord::decode(&bytes).expect("decode");
        assert_eq!(r, back);
    }

    #[test]
    fn device_list_round_trips() {
        let mut r = RpcRecord::new(0);
        let refs = vec![DeviceRef(5), DeviceRef(9), DeviceRef(42)];
        r.set_device_list(&refs);
        assert_eq!(r.device_list(), refs);
    }

    #[test]
    fn opcode_tag_round_trips() {
        for op in [
            OpCode::UsbInit,
            OpCode::UsbBulkTransfer,
            OpCode::UsbControlTransfer,
        ] {
            let bytes = encode_opcode(op);
            assert_eq!(decode_opcode(bytes).unwrap(), op);
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let bytes = 0xFFFF_FFFFu32.to_le_bytes();
        assert!(decode_opcode(bytes).is_err());
    }
}

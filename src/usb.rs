//! Standard USB descriptor types consumed by the RPC record (§3, §6).
use packed_struct::prelude::*;

/// Descriptor type (bDescriptorType, wValue [high bytes])
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
}

/// The Device Descriptor is the root of the descriptor tree and contains basic
/// device information. The unique numbers, idVendor and idProduct, identify the
/// connected device. It is 18 bytes in size.
///
/// This is exactly the subset of the standard device descriptor surfaced to
/// RPC clients: every field here rides unchanged inside `RpcRecord::dd` on
/// the wire.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "18")]
pub struct DeviceDescriptor {
    /// Size of this descriptor in bytes.
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    /// Device Descriptor Type = 1.
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// USB Specification Release Number in Binary-Coded Decimal (i.e., 2.10 is 210h).
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    /// Class code (assigned by the USB-IF).
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    /// Subclass code (assigned by the USB-IF).
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    /// Protocol code (assigned by the USB-IF).
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    /// Maximum packet size for Endpoint zero (only 8, 16, 32, or 64 are valid).
    #[packed_field(bytes = "7")]
    pub b_max_packet_size_0: u8,
    /// Vendor ID (assigned by the USB-IF).
    #[packed_field(bytes = "8..=9", endian = "lsb")]
    pub id_vendor: Integer<u16, packed_bits::Bits<16>>,
    /// Product ID (assigned by the manufacturer).
    #[packed_field(bytes = "10..=11", endian = "lsb")]
    pub id_product: Integer<u16, packed_bits::Bits<16>>,
    /// Device release number in binary-coded decimal.
    #[packed_field(bytes = "12..=13", endian = "lsb")]
    pub bcd_device: Integer<u16, packed_bits::Bits<16>>,
    /// Index of string descriptor describing manufacturer.
    #[packed_field(bytes = "14")]
    pub i_manufacturer: u8,
    /// Index of string descriptor describing product.
    #[packed_field(bytes = "15")]
    pub i_product: u8,
    /// Index of string descriptor describing the device's serial number.
    #[packed_field(bytes = "16")]
    pub i_serial_number: u8,
    /// Number of possible configurations.
    #[packed_field(bytes = "17")]
    pub b_num_configurations: u8,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            b_length: 18,
            b_descriptor_type: DescriptorType::Device as u8,
            bcd_usb: Integer::from_primitive(0),
            b_device_class: 0,
            b_device_sub_class: 0,
            b_device_protocol: 0,
            b_max_packet_size_0: 0,
            id_vendor: Integer::from_primitive(0),
            id_product: Integer::from_primitive(0),
            bcd_device: Integer::from_primitive(0),
            i_manufacturer: 0,
            i_product: 0,
            i_serial_number: 0,
            b_num_configurations: 0,
        }
    }
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            id_vendor: Integer::from_primitive(vendor_id),
            id_product: Integer::from_primitive(product_id),
            bcd_usb: Integer::from_primitive(0x0200),
            b_max_packet_size_0: 0x40,
            b_num_configurations: 0x01,
            ..Default::default()
        }
    }
}

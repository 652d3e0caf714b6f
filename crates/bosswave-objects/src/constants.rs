//! Tag allocations and hard bounds for the wire codec.

/// Routing object tag: access DOT chain, hash form.
pub const RO_ACCESS_DCHAIN_HASH: u8 = 0x01;
/// Routing object tag: access DOT chain, full form.
pub const RO_ACCESS_DCHAIN: u8 = 0x02;
/// Routing object tag: permission DOT chain, hash form.
pub const RO_PERMISSION_DCHAIN_HASH: u8 = 0x11;
/// Routing object tag: permission DOT chain, full form.
pub const RO_PERMISSION_DCHAIN: u8 = 0x12;
/// Routing object tag: access DOT.
pub const RO_ACCESS_DOT: u8 = 0x20;
/// Routing object tag: permission DOT.
pub const RO_PERMISSION_DOT: u8 = 0x21;
/// Routing object tag: entity.
pub const RO_ENTITY: u8 = 0x30;
/// Routing object tag: origin VK (32-byte body).
pub const RO_ORIGIN_VK: u8 = 0x51;
/// Routing object tag: message expiry (8-byte ms-epoch body).
pub const RO_EXPIRY: u8 = 0x52;

/// DOT/entity TLV tag: publish limits (17-byte body).
pub const TLV_PUBLISH_LIMITS: u8 = 0x01;
/// DOT/entity TLV tag: creation timestamp (8-byte ms-epoch body).
pub const TLV_CREATED: u8 = 0x02;
/// DOT/entity TLV tag: expiry timestamp (8-byte ms-epoch body).
pub const TLV_EXPIRES: u8 = 0x03;
/// DOT/entity TLV tag: delegated revoker VK (32-byte body).
pub const TLV_REVOKER: u8 = 0x04;
/// DOT/entity TLV tag: contact string (up to 255 bytes).
pub const TLV_CONTACT: u8 = 0x05;
/// DOT/entity TLV tag: comment string (up to 255 bytes).
pub const TLV_COMMENT: u8 = 0x06;
/// TLV terminator.
pub const TLV_END: u8 = 0x00;

/// Hard ceiling on any single object body. Bigger inputs are rejected
/// before any allocation happens.
pub const MAX_OBJECT_SIZE: usize = 16 * 1024 * 1024;

/// Maximum key length in a permission DOT's table.
pub const MAX_PERMISSION_KEY_LEN: usize = 255;
/// Maximum value length in a permission DOT's table.
pub const MAX_PERMISSION_VALUE_LEN: usize = 65_535;

/// Maximum contact/comment length carried in a TLV block.
pub const MAX_TLV_STRING_LEN: usize = 255;

/// Maximum hop budget a DOT may carry.
pub const MAX_TTL: u8 = 255;

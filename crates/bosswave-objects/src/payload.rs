//! Payload objects: the typed content block of a message.
//!
//! On the wire each payload object is `ponum u32 | len u32 | body[len]`
//! and a PO number renders in dotted `a.b.c.d` form. The number
//! `0.0.0.0` terminates the payload block and is not a valid PO number.

use crate::constants::MAX_OBJECT_SIZE;
use crate::error::ObjectError;
use crate::error::Result;

/// An opaque payload object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadObject {
    ponum: u32,
    content: Vec<u8>,
}

impl PayloadObject {
    /// Construct a payload object.
    ///
    /// # Errors
    ///
    /// Rejects the reserved terminator number `0.0.0.0` and bodies over
    /// the object size ceiling.
    pub fn new(ponum: u32, content: Vec<u8>) -> Result<PayloadObject> {
        if ponum == 0 {
            return Err(ObjectError::InvalidField {
                what: "PO number",
                reason: "0.0.0.0 is the payload block terminator".to_string(),
            });
        }
        if content.len() > MAX_OBJECT_SIZE {
            return Err(ObjectError::ObjectTooLarge { size: content.len() });
        }
        Ok(PayloadObject { ponum, content })
    }

    pub fn ponum(&self) -> u32 {
        self.ponum
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Dotted form of this object's number.
    pub fn dot_form(&self) -> String {
        ponum_dot_form(self.ponum)
    }
}

/// Render a PO number in dotted form: `1.2.3.4`.
pub fn ponum_dot_form(ponum: u32) -> String {
    format!("{}.{}.{}.{}", ponum >> 24, (ponum >> 16) & 0xFF, (ponum >> 8) & 0xFF, ponum & 0xFF)
}

/// Parse a dotted-form PO number.
pub fn ponum_from_dot_form(s: &str) -> Result<u32> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return Err(ObjectError::InvalidField {
            what: "PO number",
            reason: format!("expected a.b.c.d, got {s:?}"),
        });
    }
    let mut rv: u32 = 0;
    for p in parts {
        let octet: u8 = p.parse().map_err(|_| ObjectError::InvalidField {
            what: "PO number",
            reason: format!("bad octet {p:?}"),
        })?;
        rv = (rv << 8) | octet as u32;
    }
    Ok(rv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_form_roundtrip() {
        for n in [1u32, 0x0102_0304, 0xFFFF_FFFF, 64 << 24] {
            assert_eq!(ponum_from_dot_form(&ponum_dot_form(n)).unwrap(), n);
        }
        assert_eq!(ponum_dot_form(0x0102_0304), "1.2.3.4");
    }

    #[test]
    fn test_dot_form_rejects_garbage() {
        assert!(ponum_from_dot_form("1.2.3").is_err());
        assert!(ponum_from_dot_form("1.2.3.4.5").is_err());
        assert!(ponum_from_dot_form("1.2.3.256").is_err());
        assert!(ponum_from_dot_form("a.b.c.d").is_err());
    }

    #[test]
    fn test_terminator_rejected() {
        assert!(PayloadObject::new(0, vec![1, 2, 3]).is_err());
    }
}

//! Bounds-checked little-endian reader used by every object parser.

use bosswave_crypto::HASH_LEN;
use bosswave_crypto::ObjHash;
use bosswave_crypto::SIG_LEN;
use bosswave_crypto::VK_LEN;
use bosswave_crypto::Vk;

use crate::error::ObjectError;
use crate::error::Result;

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ObjectError::Truncated {
                offset: self.pos,
                need: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u64_le(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn vk(&mut self) -> Result<Vk> {
        let b = self.take(VK_LEN)?;
        // take() guarantees the length.
        Ok(Vk::from_slice(b).unwrap())
    }

    pub fn hash(&mut self) -> Result<ObjHash> {
        let b = self.take(HASH_LEN)?;
        Ok(ObjHash::from_slice(b).unwrap())
    }

    pub fn signature(&mut self) -> Result<[u8; SIG_LEN]> {
        let b = self.take(SIG_LEN)?;
        Ok(b.try_into().unwrap())
    }

    pub fn utf8(&mut self, n: usize) -> Result<String> {
        let b = self.take(n)?;
        String::from_utf8(b.to_vec()).map_err(|_| ObjectError::InvalidField {
            what: "string",
            reason: "not valid UTF-8".to_string(),
        })
    }
}

pub(crate) fn put_u16_le(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64_le(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

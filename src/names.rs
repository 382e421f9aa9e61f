//! Wire codec for the handover name list.
//!
//! The name pipe carries an ordered sequence of UTF-8 strings in a
//! self-describing, length-prefixed encoding that is byte-compatible with
//! Go's `encoding/gob` representation of a `[]string`. That is the framing
//! daemons already deployed on this handover protocol speak, so binaries
//! built at different times (and from different codebases) can take over
//! from each other during a rolling upgrade.
//!
//! On the wire:
//!
//! * unsigned integers below 128 are a single byte; larger values are the
//!   minimal big-endian bytes preceded by the negated byte count,
//! * signed integers fold the sign into the low bit of an unsigned value,
//! * strings are an unsigned byte count followed by raw UTF-8,
//! * the stream is a series of messages, each prefixed by its byte length:
//!   first a descriptor assigning type id 65 to "slice of string", then a
//!   value message carrying the id, a zero delimiter, the element count and
//!   the elements.
//!
//! The empty list is an explicit zero-count value message, never zero
//! bytes, so a successor can always distinguish "no fds" from a dead pipe.

use std::io::{self, Read, Write};

use derive_more::{Display, From};

/// Type id the descriptor message assigns to the string-slice type.
const SLICE_OF_STRING_ID: i64 = 65;
/// Predefined type id for a UTF-8 string.
const STRING_ID: i64 = 6;

const MAX_MESSAGE_BYTES: u64 = 1 << 20;
const MAX_NAMES: u64 = 1 << 16;

#[derive(Debug, Display, From)]
pub enum DecodeError {
    #[display("can't read name list: {_0}")]
    #[from]
    Io(io::Error),
    #[display("invalid integer prefix in name list")]
    BadPrefix,
    #[display("name list message exceeds {MAX_MESSAGE_BYTES} bytes")]
    OversizedMessage,
    #[display("handover list announces more than {MAX_NAMES} names")]
    TooManyNames,
    #[display("inherited name is not valid UTF-8")]
    BadUtf8,
    #[display("unexpected type id {_0} in name list")]
    BadTypeId(i64),
    #[display("malformed name list framing")]
    BadFraming,
}

impl std::error::Error for DecodeError {}

fn put_uint(buf: &mut Vec<u8>, v: u64) {
    if v < 0x80 {
        buf.push(v as u8);
        return;
    }
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    buf.push(((8 - skip) as u8).wrapping_neg());
    buf.extend_from_slice(&bytes[skip..]);
}

fn put_int(buf: &mut Vec<u8>, v: i64) {
    let folded = if v < 0 {
        (!(v as u64) << 1) | 1
    } else {
        (v as u64) << 1
    };
    put_uint(buf, folded);
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_uint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn put_message<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    put_uint(&mut frame, payload.len() as u64);
    frame.extend_from_slice(payload);
    w.write_all(&frame)
}

/// Descriptor introducing the string-slice type: the negated new id, then a
/// slice definition whose element type is the predefined string id.
fn type_descriptor() -> Vec<u8> {
    let mut p = Vec::new();
    put_int(&mut p, -SLICE_OF_STRING_ID);
    p.push(2); // slice-definition field
    p.push(1); //   common block
    p.push(2); //     assigned id
    put_int(&mut p, SLICE_OF_STRING_ID);
    p.push(0); //   end of common block
    p.push(1); //   element type
    put_int(&mut p, STRING_ID);
    p.push(0); // end of slice definition
    p.push(0); // end of descriptor
    p
}

pub(crate) fn encode_names<W: Write>(w: &mut W, names: &[String]) -> io::Result<()> {
    put_message(w, &type_descriptor())?;

    let mut p = Vec::new();
    put_int(&mut p, SLICE_OF_STRING_ID);
    p.push(0); // top-level value delimiter
    put_uint(&mut p, names.len() as u64);
    for name in names {
        put_string(&mut p, name);
    }
    put_message(w, &p)?;
    w.flush()
}

/// A single framed message, consumed front to back.
struct Payload {
    buf: Vec<u8>,
    pos: usize,
}

impl Payload {
    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::BadFraming)?;
        self.pos += 1;
        Ok(b)
    }

    fn get_uint(&mut self) -> Result<u64, DecodeError> {
        let first = self.get_u8()?;
        if first < 0x80 {
            return Ok(first as u64);
        }
        let count = first.wrapping_neg() as usize;
        if count == 0 || count > 8 {
            return Err(DecodeError::BadPrefix);
        }
        let mut bytes = [0u8; 8];
        for slot in &mut bytes[8 - count..] {
            *slot = self.get_u8()?;
        }
        Ok(u64::from_be_bytes(bytes))
    }

    fn get_int(&mut self) -> Result<i64, DecodeError> {
        let folded = self.get_uint()?;
        if folded & 1 == 1 {
            Ok(!((folded >> 1) as i64))
        } else {
            Ok((folded >> 1) as i64)
        }
    }

    fn take(&mut self, n: usize) -> Result<Vec<u8>, DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::BadFraming)?;
        if end > self.buf.len() {
            return Err(DecodeError::BadFraming);
        }
        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn read_uint<R: Read>(r: &mut R) -> Result<u64, DecodeError> {
    let mut first = [0u8; 1];
    r.read_exact(&mut first)?;
    if first[0] < 0x80 {
        return Ok(first[0] as u64);
    }
    let count = first[0].wrapping_neg() as usize;
    if count == 0 || count > 8 {
        return Err(DecodeError::BadPrefix);
    }
    let mut bytes = [0u8; 8];
    r.read_exact(&mut bytes[8 - count..])?;
    Ok(u64::from_be_bytes(bytes))
}

fn read_message<R: Read>(r: &mut R) -> Result<Payload, DecodeError> {
    let len = read_uint(r)?;
    if len > MAX_MESSAGE_BYTES {
        return Err(DecodeError::OversizedMessage);
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(Payload { buf, pos: 0 })
}

/// Reads exactly one encoded name list from `r` and nothing more; the
/// stream is left positioned after the value message so the caller can keep
/// watching the pipe for EOF.
pub(crate) fn decode_names<R: Read>(r: &mut R) -> Result<Vec<String>, DecodeError> {
    let mut descriptor = read_message(r)?;
    let id = descriptor.get_int()?;
    if id >= 0 {
        return Err(DecodeError::BadTypeId(id));
    }
    // Only a single slice-of-string type is ever announced; the body of the
    // descriptor carries nothing the value message doesn't repeat.
    let id = -id;

    let mut value = read_message(r)?;
    let got = value.get_int()?;
    if got != id {
        return Err(DecodeError::BadTypeId(got));
    }
    if value.get_u8()? != 0 {
        return Err(DecodeError::BadFraming);
    }

    let count = value.get_uint()?;
    if count > MAX_NAMES {
        return Err(DecodeError::TooManyNames);
    }
    let mut names = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let len = value.get_uint()?;
        if len > MAX_MESSAGE_BYTES {
            return Err(DecodeError::OversizedMessage);
        }
        let bytes = value.take(len as usize)?;
        names.push(String::from_utf8(bytes).map_err(|_| DecodeError::BadUtf8)?);
    }
    if value.remaining() != 0 {
        return Err(DecodeError::BadFraming);
    }
    Ok(names)
}

//! Just enough netlink framing to read queue messages and write verdicts.
//!
//! Message headers are in host byte order, nfnetlink payloads (the
//! `res_id` field and attribute values) are big-endian.

pub const NLMSG_HDRLEN: usize = 16;
pub const NFGENMSG_LEN: usize = 4;
pub const NLA_HDRLEN: usize = 4;

const NLA_TYPE_MASK: u16 = 0x3fff;

pub const fn align(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("truncated netlink header ({0} bytes left)")]
    TruncatedHeader(usize),

    #[error("netlink length {len} does not fit in {available} bytes")]
    BadLength { len: usize, available: usize },

    #[error("truncated nfgenmsg header")]
    TruncatedNfGen,
}

#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    pub payload: &'a [u8],
}

/// Iterates over the netlink messages batched in one frame.
///
/// Stops after the first malformed header, since nothing behind it can be
/// located reliably.
pub struct Messages<'a> {
    buf: &'a [u8],
}

pub fn messages(frame: &[u8]) -> Messages<'_> {
    Messages { buf: frame }
}

impl<'a> Iterator for Messages<'a> {
    type Item = Result<Message<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        let buf = std::mem::take(&mut self.buf);
        if buf.len() < NLMSG_HDRLEN {
            return Some(Err(ParseError::TruncatedHeader(buf.len())));
        }

        let len = read_u32_ne(buf, 0) as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            return Some(Err(ParseError::BadLength {
                len,
                available: buf.len(),
            }));
        }

        let message = Message {
            kind: read_u16_ne(buf, 4),
            flags: read_u16_ne(buf, 6),
            seq: read_u32_ne(buf, 8),
            pid: read_u32_ne(buf, 12),
            payload: &buf[NLMSG_HDRLEN..len],
        };
        self.buf = buf.get(align(len)..).unwrap_or_default();

        Some(Ok(message))
    }
}

/// The nfnetlink header that follows the netlink header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NfGenMsg {
    pub family: u8,
    pub version: u8,
    /// Queue number for queue messages.
    pub res_id: u16,
}

impl NfGenMsg {
    /// Split a message payload into its nfgenmsg header and attributes.
    pub fn parse(payload: &[u8]) -> Result<(NfGenMsg, &[u8]), ParseError> {
        if payload.len() < NFGENMSG_LEN {
            return Err(ParseError::TruncatedNfGen);
        }

        let header = NfGenMsg {
            family: payload[0],
            version: payload[1],
            res_id: u16::from_be_bytes([payload[2], payload[3]]),
        };
        Ok((header, &payload[NFGENMSG_LEN..]))
    }
}

/// Iterates `(type, value)` pairs of a netlink attribute stream.
pub struct Attributes<'a> {
    buf: &'a [u8],
}

pub fn attributes(buf: &[u8]) -> Attributes<'_> {
    Attributes { buf }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<(u16, &'a [u8]), ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        let buf = std::mem::take(&mut self.buf);
        if buf.len() < NLA_HDRLEN {
            return Some(Err(ParseError::TruncatedHeader(buf.len())));
        }

        let len = read_u16_ne(buf, 0) as usize;
        if len < NLA_HDRLEN || len > buf.len() {
            return Some(Err(ParseError::BadLength {
                len,
                available: buf.len(),
            }));
        }

        let kind = read_u16_ne(buf, 2) & NLA_TYPE_MASK;
        self.buf = buf.get(align(len)..).unwrap_or_default();

        Some(Ok((kind, &buf[NLA_HDRLEN..len])))
    }
}

/// Builds one netlink message; the length field is patched in `finish`.
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(kind: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        Self { buf }
    }

    pub fn nfgen(mut self, header: NfGenMsg) -> Self {
        self.buf.push(header.family);
        self.buf.push(header.version);
        self.buf.extend_from_slice(&header.res_id.to_be_bytes());
        self
    }

    pub fn attr(mut self, kind: u16, value: &[u8]) -> Self {
        let len = NLA_HDRLEN + value.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(value);
        self.buf.resize(align(self.buf.len()), 0);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

pub(crate) fn read_u16_ne(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn read_u32_ne(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn read_u32_be(value: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(value.get(..4)?.try_into().ok()?))
}

pub(crate) fn read_u64_be(value: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_be_bytes(value.get(at..at + 8)?.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_output_parses_back() {
        let msg = MessageBuilder::new(0x0300, 0, 7)
            .nfgen(NfGenMsg {
                family: 2,
                version: 0,
                res_id: 513,
            })
            .attr(10, b"abcde")
            .attr(3, &9u32.to_be_bytes())
            .finish();

        assert_eq!(msg.len() % 4, 0);

        let parsed: Vec<_> = messages(&msg).collect();
        assert_eq!(parsed.len(), 1);
        let message = parsed[0].as_ref().unwrap();
        assert_eq!(message.kind, 0x0300);
        assert_eq!(message.seq, 7);

        let (nfgen, attrs) = NfGenMsg::parse(message.payload).unwrap();
        assert_eq!(nfgen.res_id, 513);

        let attrs: Vec<_> = attributes(attrs).map(Result::unwrap).collect();
        assert_eq!(attrs[0], (10, b"abcde".as_ref()));
        assert_eq!(attrs[1].0, 3);
        assert_eq!(read_u32_be(attrs[1].1), Some(9));
    }

    #[test]
    fn batched_messages_are_split() {
        let mut frame = MessageBuilder::new(1, 0, 1).attr(1, b"x").finish();
        frame.extend(MessageBuilder::new(2, 0, 2).finish());

        let kinds: Vec<u16> = messages(&frame).map(|m| m.unwrap().kind).collect();
        assert_eq!(kinds, [1, 2]);
    }

    #[test]
    fn oversized_length_stops_iteration() {
        let mut frame = MessageBuilder::new(1, 0, 1).finish();
        frame[..4].copy_from_slice(&1000u32.to_ne_bytes());

        let mut iter = messages(&frame);
        assert!(matches!(
            iter.next(),
            Some(Err(ParseError::BadLength { len: 1000, .. }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn short_tail_is_truncated_header() {
        let mut iter = messages(&[0u8; 6]);
        assert!(matches!(
            iter.next(),
            Some(Err(ParseError::TruncatedHeader(6)))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn attribute_flags_are_masked() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u16.to_ne_bytes());
        buf.extend_from_slice(&(0x8000u16 | 5).to_ne_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);

        let (kind, value) = attributes(&buf).next().unwrap().unwrap();
        assert_eq!(kind, 5);
        assert_eq!(value, [1, 2, 3, 4]);
    }
}

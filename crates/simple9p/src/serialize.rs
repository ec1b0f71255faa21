//! Serialize/deserialize 9P messages into/from binary.
//!
//! Every read goes through `byteorder` on a bounded reader, so a short or
//! truncated buffer surfaces as an `UnexpectedEof` error instead of a partial
//! message. Variable-length fields are checked against the protocol maxima
//! (`MAXSTRLEN`, `MAXWELEM`) on both sides.

use crate::{fcall::*, io_err, res};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::Shl;
use tokio_util::codec::{Decoder as FrameDecoder, Encoder as FrameEncoder};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_retain(decode!($buf))
    };
}

/// Read exactly `size` bytes, never allocating more than the reader can supply
fn read_exact<R: Read>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(size as u64).read_to_end(&mut buf)?;
    if buf.len() != size {
        return res!(io_err!(UnexpectedEof, "Truncated field"));
    }
    Ok(buf)
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: decoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > MAXSTRLEN {
            return res!(io_err!(InvalidInput, "String too long"));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > MAXWELEM {
            return res!(io_err!(InvalidInput, "Too many walk elements"));
        }
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Encode the `stat[n]` field of `RStat`/`TWStat`: nstat[2] then the record
fn encode_nstat<W: WriteBytesExt>(w: &mut W, stat: &Stat) -> Result<usize> {
    let nstat = stat.size() as usize + mem::size_of::<u16>();
    Ok((nstat as u16).encode(w)? + stat.encode(w)?)
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => match buf {
                SResult(Ok(mut enc)) => {
                    let n = encode_nstat(&mut enc.writer, stat);
                    match n {
                        Ok(n) => {
                            enc.bytes += n;
                            SResult(Ok(enc))
                        }
                        Err(e) => SResult(Err(e)),
                    }
                }
                err => err,
            },
            TWStat { ref fid, ref stat } => match buf << fid {
                SResult(Ok(mut enc)) => {
                    let n = encode_nstat(&mut enc.writer, stat);
                    match n {
                        Ok(n) => {
                            enc.bytes += n;
                            SResult(Ok(enc))
                        }
                        Err(e) => SResult(Err(e)),
                    }
                }
                err => err,
            },
            RWStat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        if len as usize > MAXSTRLEN {
            return res!(io_err!(InvalidData, "String too long"));
        }
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        // Fields are parsed inside the declared record length only
        let size: u16 = Decodable::decode(r)?;
        let record = read_exact(r, size as usize)?;
        let mut buf = &record[..];

        Ok(Stat {
            typ: decode!(buf),
            dev: decode!(buf),
            qid: decode!(buf),
            mode: decode!(buf),
            atime: decode!(buf),
            mtime: decode!(buf),
            length: decode!(buf),
            name: decode!(buf),
            uid: decode!(buf),
            gid: decode!(buf),
            muid: decode!(buf),
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        if len as usize > MAXWELEM {
            return res!(io_err!(InvalidData, "Too many walk elements"));
        }
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Decode the `stat[n]` field of `RStat`/`TWStat`
fn decode_nstat<R: ReadBytesExt>(r: &mut R) -> Result<Stat> {
    let nstat: u16 = Decodable::decode(r)?;
    let bytes = read_exact(r, nstat as usize)?;
    let mut buf = &bytes[..];
    Ok(decode!(buf))
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => FCall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat { fid: decode!(buf) },
            Some(RStat) => FCall::RStat {
                stat: decode_nstat(buf)?,
            },
            Some(TWStat) => FCall::TWStat {
                fid: decode!(buf),
                stat: decode_nstat(buf)?,
            },
            Some(RWStat) => FCall::RWStat,
            Some(TError) | None => return res!(io_err!(InvalidData, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Read a 9P message body (no size prefix) from a byte-oriented stream
fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Write a 9P message body (no size prefix) into a byte-oriented stream
fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

/// Encode `msg` into a complete frame, size prefix included.
///
/// Fails if the frame would be larger than `max`.
pub fn encode_msg(msg: &Msg, max: u32) -> Result<BytesMut> {
    let size = msg.size();
    if size > max {
        return res!(io_err!(
            InvalidInput,
            format!("Message of {} bytes exceeds limit of {}", size, max)
        ));
    }

    let mut writer = BytesMut::with_capacity(size as usize).writer();
    size.encode(&mut writer)?;
    write_msg(&mut writer, msg)?;

    let frame = writer.into_inner();
    if frame.len() != size as usize {
        return res!(io_err!(InvalidData, "Encoded size disagrees with computed size"));
    }
    Ok(frame)
}

/// Decode a complete frame, size prefix included.
///
/// The declared size must match the frame length exactly.
pub fn decode_msg(frame: &[u8]) -> Result<Msg> {
    if frame.len() < HEADERSZ as usize {
        return res!(io_err!(InvalidData, "Frame shorter than header"));
    }

    let mut buf = frame;
    let size: u32 = decode!(buf);
    if size as usize != frame.len() {
        return res!(io_err!(
            InvalidData,
            format!("Declared size {} but frame has {} bytes", size, frame.len())
        ));
    }

    read_msg(&mut buf)
}

/// Frame codec for the peer side of a connection, usable with `tokio_util::codec::Framed`.
///
/// Bytes left over when the stream ends are an error; an empty buffer at EOF is a clean end.
#[derive(Clone, Copy, Debug)]
pub struct Codec {
    max: u32,
}

impl Codec {
    pub fn new(max: u32) -> Codec {
        Codec { max }
    }

    /// Adjust the frame limit, e.g. after version negotiation
    pub fn set_max(&mut self, max: u32) {
        self.max = max;
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new(MAXMSG)
    }
}

impl FrameDecoder for Codec {
    type Item = Msg;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>> {
        if src.len() < mem::size_of::<u32>() {
            return Ok(None);
        }

        let size = LittleEndian::read_u32(&src[..4]);
        if size < HEADERSZ || size > self.max {
            return res!(io_err!(InvalidData, format!("Invalid frame size {}", size)));
        }

        let size = size as usize;
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let frame = src.split_to(size);
        decode_msg(&frame).map(Some)
    }
}

impl FrameEncoder<Msg> for Codec {
    type Error = std::io::Error;

    fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<()> {
        let frame = encode_msg(&msg, self.max)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: QId {
                typ: QIdType::DIR,
                version: 7,
                path: 0x1234,
            },
            mode: dm::DIR | 0o755,
            atime: 100,
            mtime: 200,
            length: 4096,
            name: "usr".to_owned(),
            uid: NOUSER.to_owned(),
            gid: NOUSER.to_owned(),
            muid: NOUSER.to_owned(),
        }
    }

    fn every_message() -> Vec<FCall> {
        let qid = QId {
            typ: QIdType::FILE,
            version: 3,
            path: 99,
        };
        vec![
            FCall::TVersion { msize: MAXMSG, version: P92000.to_owned() },
            FCall::RVersion { msize: 4096, version: VERSION_UNKNOWN.to_owned() },
            FCall::TAuth { afid: 5, uname: "glenda".to_owned(), aname: String::new() },
            FCall::RAuth { aqid: qid },
            FCall::TAttach { fid: 1, afid: NOFID, uname: "glenda".to_owned(), aname: "/".to_owned() },
            FCall::RAttach { qid },
            FCall::RError { ename: "file not found".to_owned() },
            FCall::TFlush { oldtag: 12 },
            FCall::RFlush,
            FCall::TWalk {
                fid: 1,
                newfid: 2,
                wnames: (0..MAXWELEM).map(|i| format!("d{}", i)).collect(),
            },
            FCall::RWalk { wqids: vec![qid; MAXWELEM] },
            FCall::TOpen { fid: 2, mode: om::RDWR | om::TRUNC },
            FCall::ROpen { qid, iounit: MAXMSG - IOHDRSZ },
            FCall::TCreate { fid: 2, name: "new".to_owned(), perm: dm::DIR | 0o700, mode: om::READ },
            FCall::RCreate { qid, iounit: 0 },
            FCall::TRead { fid: 2, offset: u64::MAX, count: 8168 },
            FCall::RRead { data: Data(b"hello".to_vec()) },
            FCall::TWrite { fid: 2, offset: 3, data: Data(vec![0xff; 300]) },
            FCall::RWrite { count: 300 },
            FCall::TClunk { fid: 2 },
            FCall::RClunk,
            FCall::TRemove { fid: 3 },
            FCall::RRemove,
            FCall::TStat { fid: 1 },
            FCall::RStat { stat: sample_stat() },
            FCall::TWStat { fid: 1, stat: Stat::dont_touch() },
            FCall::RWStat,
        ]
    }

    #[test]
    fn every_message_survives_a_frame() {
        for (i, body) in every_message().into_iter().enumerate() {
            let msg = Msg { tag: i as u16, body };
            let frame = encode_msg(&msg, MAXMSG).unwrap();
            assert_eq!(frame.len() as u32, msg.size(), "{:?}", msg);
            assert_eq!(decode_msg(&frame).unwrap(), msg);
        }
    }

    #[test]
    fn qid_fields_are_little_endian() {
        let qid = QId {
            typ: QIdType::DIR,
            version: 0x0102_0304,
            path: 0x0a0b,
        };
        let mut buf = Vec::new();
        assert_eq!(qid.encode(&mut buf).unwrap(), 13);
        assert_eq!(buf, [0x80, 4, 3, 2, 1, 0x0b, 0x0a, 0, 0, 0, 0, 0, 0]);

        let decoded: QId = Decodable::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, qid);
    }

    #[test]
    fn stat_size_prefix_counts_the_rest() {
        let stat = sample_stat();
        let mut buf = Vec::new();
        let n = stat.encode(&mut buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(LittleEndian::read_u16(&buf[..2]) as usize, buf.len() - 2);
    }

    #[test]
    fn rstat_carries_nstat_before_the_record() {
        let msg = Msg {
            tag: 1,
            body: FCall::RStat { stat: sample_stat() },
        };
        let frame = encode_msg(&msg, MAXMSG).unwrap();
        let nstat = LittleEndian::read_u16(&frame[7..9]) as usize;
        let size = LittleEndian::read_u16(&frame[9..11]) as usize;
        assert_eq!(nstat, frame.len() - 9);
        assert_eq!(size, nstat - 2);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let msg = Msg {
            tag: 9,
            body: FCall::TWalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["a".to_owned(), "bb".to_owned()],
            },
        };
        let frame = encode_msg(&msg, MAXMSG).unwrap();

        for len in 0..frame.len() {
            let mut short = frame[..len].to_vec();
            if len >= 4 {
                // Keep the prefix honest so only the body is short
                LittleEndian::write_u32(&mut short[..4], len as u32);
            }
            assert!(decode_msg(&short).is_err(), "accepted {} bytes", len);
        }
    }

    #[test]
    fn declared_size_must_match() {
        let msg = Msg {
            tag: 1,
            body: FCall::TClunk { fid: 4 },
        };
        let mut frame = encode_msg(&msg, MAXMSG).unwrap().to_vec();
        frame.push(0);
        assert!(decode_msg(&frame).is_err());
    }

    #[test]
    fn unknown_types_are_rejected() {
        let mut frame = vec![0u8; 7];
        LittleEndian::write_u32(&mut frame[..4], 7);
        for typ in [0u8, 99, MsgType::TError as u8, 128, 255] {
            frame[4] = typ;
            assert!(decode_msg(&frame).is_err(), "accepted type {}", typ);
        }
    }

    #[test]
    fn walk_bound_is_enforced() {
        let too_many = Msg {
            tag: 1,
            body: FCall::TWalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["x".to_owned(); MAXWELEM + 1],
            },
        };
        assert!(encode_msg(&too_many, MAXMSG).is_err());

        // Hand-build the same request to check the decoder side
        let mut frame = Vec::new();
        let size = HEADERSZ + 4 + 4 + 2 + (MAXWELEM as u32 + 1) * 3;
        size.encode(&mut frame).unwrap();
        (MsgType::TWalk as u8).encode(&mut frame).unwrap();
        1u16.encode(&mut frame).unwrap();
        1u32.encode(&mut frame).unwrap();
        2u32.encode(&mut frame).unwrap();
        (MAXWELEM as u16 + 1).encode(&mut frame).unwrap();
        for _ in 0..=MAXWELEM {
            "x".to_owned().encode(&mut frame).unwrap();
        }
        assert_eq!(frame.len() as u32, size);
        assert!(decode_msg(&frame).is_err());
    }

    #[test]
    fn oversized_messages_fail_to_encode() {
        let msg = Msg {
            tag: 1,
            body: FCall::RRead {
                data: Data(vec![0; MAXMSG as usize]),
            },
        };
        assert!(encode_msg(&msg, MAXMSG).is_err());
        assert!(encode_msg(&msg, MAXMSG * 2).is_ok());
    }

    #[test]
    fn data_count_larger_than_frame_is_an_error() {
        let mut frame = Vec::new();
        let size = HEADERSZ + 4 + 8 + 4 + 2;
        size.encode(&mut frame).unwrap();
        (MsgType::TWrite as u8).encode(&mut frame).unwrap();
        1u16.encode(&mut frame).unwrap();
        1u32.encode(&mut frame).unwrap();
        0u64.encode(&mut frame).unwrap();
        u32::MAX.encode(&mut frame).unwrap();
        frame.extend_from_slice(b"hi");
        assert!(decode_msg(&frame).is_err());
    }

    #[test]
    fn stat_fields_stay_inside_the_record() {
        // A record claiming 4 bytes cannot supply the fixed fields
        let mut frame = Vec::new();
        let size = HEADERSZ + 4 + 2 + 2 + 4;
        size.encode(&mut frame).unwrap();
        (MsgType::TWStat as u8).encode(&mut frame).unwrap();
        1u16.encode(&mut frame).unwrap();
        1u32.encode(&mut frame).unwrap();
        6u16.encode(&mut frame).unwrap();
        4u16.encode(&mut frame).unwrap();
        frame.extend_from_slice(&[0; 4]);
        assert_eq!(frame.len() as u32, size);
        assert!(decode_msg(&frame).is_err());
    }

    #[test]
    fn codec_waits_for_whole_frames() {
        let msg = Msg {
            tag: 3,
            body: FCall::TRead {
                fid: 1,
                offset: 0,
                count: 10,
            },
        };
        let frame = encode_msg(&msg, MAXMSG).unwrap();
        let mut codec = Codec::default();

        let mut src = BytesMut::from(&frame[..5]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&frame[5..]);
        assert_eq!(codec.decode(&mut src).unwrap(), Some(msg.clone()));
        assert!(src.is_empty());

        let mut out = BytesMut::new();
        FrameEncoder::encode(&mut codec, msg, &mut out).unwrap();
        assert_eq!(&out[..], &frame[..]);
    }

    #[test]
    fn codec_rejects_bad_sizes() {
        let mut codec = Codec::new(64);
        let mut src = BytesMut::from(&[3u8, 0, 0, 0][..]);
        assert!(codec.decode(&mut src).is_err());

        let mut src = BytesMut::from(&[65u8, 0, 0, 0][..]);
        assert!(codec.decode(&mut src).is_err());
    }
}

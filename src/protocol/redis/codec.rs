use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::types::RespValue;

/// RESP2 framing for node connections.
///
/// Decoding is restartable: an incomplete frame leaves the buffer untouched
/// and yields `None` until more bytes arrive.
#[derive(Debug, Clone, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut pos = 0usize;
        match parse_value(&src[..], &mut pos)? {
            Some(frame) => {
                src.advance(pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<()> {
        write_value(&item, dst);
        Ok(())
    }
}

fn parse_value(src: &[u8], pos: &mut usize) -> Result<Option<RespValue>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    match prefix {
        b'+' => match read_line(src, pos) {
            Some(line) => Ok(Some(RespValue::SimpleString(Bytes::copy_from_slice(line)))),
            None => {
                *pos = start;
                Ok(None)
            }
        },
        b'-' => match read_line(src, pos) {
            Some(line) => Ok(Some(RespValue::Error(Bytes::copy_from_slice(line)))),
            None => {
                *pos = start;
                Ok(None)
            }
        },
        b':' => {
            let line = match read_line(src, pos) {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            };
            let text = std::str::from_utf8(line)?;
            let value = text
                .parse::<i64>()
                .map_err(|err| anyhow!("invalid integer frame: {err}"))?;
            Ok(Some(RespValue::Integer(value)))
        }
        b'$' => parse_bulk_string(src, pos, start),
        b'*' => parse_array(src, pos, start),
        _ => Err(anyhow!("unsupported RESP prefix '{}'", prefix as char)),
    }
}

fn parse_bulk_string(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "bulk string")?;
    if len < 0 {
        return Ok(Some(RespValue::NullBulk));
    }
    let len = len as usize;
    if *pos + len + 2 > src.len() {
        *pos = start;
        return Ok(None);
    }
    let data = Bytes::copy_from_slice(&src[*pos..*pos + len]);
    *pos += len + 2;
    Ok(Some(RespValue::BulkString(data)))
}

fn parse_array(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<RespValue>> {
    let mut local_pos = *pos;
    let line = match read_line(src, &mut local_pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "array")?;
    if len < 0 {
        *pos = local_pos;
        return Ok(Some(RespValue::NullArray));
    }
    let mut values = Vec::with_capacity(len as usize);
    let mut element_pos = local_pos;
    for _ in 0..len {
        match parse_value(src, &mut element_pos)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    *pos = element_pos;
    Ok(Some(RespValue::Array(values)))
}

fn parse_length(bytes: &[u8], kind: &str) -> Result<isize> {
    let text = std::str::from_utf8(bytes)?;
    text.parse::<isize>()
        .map_err(|err| anyhow!("invalid {kind} length: {err}"))
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Some(line);
        }
        idx += 1;
    }
    None
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => {
            dst.extend_from_slice(b"+");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Error(data) => {
            dst.extend_from_slice(b"-");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(value) => {
            dst.extend_from_slice(b":");
            dst.extend_from_slice(value.to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(data) => {
            dst.extend_from_slice(b"$");
            dst.extend_from_slice(data.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(values) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(values.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            for value in values {
                write_value(value, dst);
            }
        }
        RespValue::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<RespValue>, usize) {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        (frames, buf.len())
    }

    #[test]
    fn decodes_simple_frames() {
        let (frames, rest) = decode_all(b"+OK\r\n-ERR nope\r\n:42\r\n");
        assert_eq!(
            frames,
            vec![
                RespValue::simple("OK"),
                RespValue::error("ERR nope"),
                RespValue::Integer(42),
            ]
        );
        assert_eq!(rest, 0);
    }

    #[test]
    fn decodes_bulk_and_array() {
        let (frames, _) = decode_all(b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nNODES\r\n$-1\r\n");
        assert_eq!(
            frames,
            vec![
                RespValue::Array(vec![RespValue::bulk("CLUSTER"), RespValue::bulk("NODES")]),
                RespValue::NullBulk,
            ]
        );
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"$10\r\nhello"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(b"world\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(RespValue::bulk("helloworld"))
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let cmd = RespValue::Array(vec![RespValue::bulk("AUTH"), RespValue::bulk("secret")]);
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec.encode(cmd.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(cmd));
    }

    #[test]
    fn rejects_unknown_prefix() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}

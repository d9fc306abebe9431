//! Size-prefixed binary columnar frames.
//!
//! Layout (little-endian):
//!
//! ```text
//! u32 size | u8 version | u8 kind | body
//! data   body: u16 name count, (u16 len, utf8)*, u8 rank, u32 dims*, f64 values*
//! status body: i32 code, u8 status (0 success, 1 failure), u16 len, utf8 info
//! ```
//!
//! `size` counts every byte after the prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::array::{CanonicalArray, element_count};
use crate::error::GatewayError;

pub const PROTOCOL_VERSION: u8 = 1;

const KIND_DATA: u8 = 0;
const KIND_STATUS: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnarMessage {
    Data {
        names: Vec<String>,
        array: CanonicalArray,
    },
    Status {
        code: i32,
        success: bool,
        info: String,
    },
}

/// Encodes a data frame. Values are written as `f64`.
///
/// # Errors
///
/// `MalformedPayload` when the names, a name, the rank or a dimension do
/// not fit their fixed-width fields.
pub fn encode_data(array: &CanonicalArray, names: &[String]) -> Result<Bytes, GatewayError> {
    let mut body = BytesMut::new();
    body.put_u8(PROTOCOL_VERSION);
    body.put_u8(KIND_DATA);
    body.put_u16_le(fit(names.len(), "name count")?);
    for name in names {
        let len: u16 = fit(name.len(), "name length")?;
        body.put_u16_le(len);
        body.extend_from_slice(name.as_bytes());
    }
    body.put_u8(fit(array.ndim(), "rank")?);
    for &dim in array.shape() {
        body.put_u32_le(fit(dim, "dimension")?);
    }
    for value in array.to_f64_vec() {
        body.put_f64_le(value);
    }
    Ok(with_prefix(body))
}

fn fit<T: TryFrom<usize>>(value: usize, what: &str) -> Result<T, GatewayError> {
    T::try_from(value).map_err(|_| {
        GatewayError::malformed(format!("{what} {value} does not fit in a columnar frame"))
    })
}

/// Encodes a status frame.
pub fn encode_status(code: i32, success: bool, info: &str) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(PROTOCOL_VERSION);
    body.put_u8(KIND_STATUS);
    body.put_i32_le(code);
    body.put_u8(if success { 0 } else { 1 });
    put_str(&mut body, info);
    with_prefix(body)
}

/// Failure frame for an error raised while serving a columnar request.
pub fn encode_error(err: &GatewayError) -> Bytes {
    encode_status(err.envelope_code(), false, &err.to_string())
}

pub fn decode(frame: &[u8]) -> Result<ColumnarMessage, GatewayError> {
    let mut buf = frame;
    need(&buf, 4, "size prefix")?;
    let size = buf.get_u32_le() as usize;
    if size != buf.remaining() {
        return Err(GatewayError::malformed(format!(
            "size prefix {size} does not match {} body bytes",
            buf.remaining()
        )));
    }

    need(&buf, 2, "header")?;
    if buf.get_u8() != PROTOCOL_VERSION {
        return Err(GatewayError::malformed("Message does not have correct protocol"));
    }
    match buf.get_u8() {
        KIND_DATA => decode_data_body(&mut buf),
        KIND_STATUS => decode_status_body(&mut buf),
        other => Err(GatewayError::malformed(format!("unknown frame kind {other}"))),
    }
}

/// Decodes a frame that must carry data.
pub fn decode_data(frame: &[u8]) -> Result<(CanonicalArray, Vec<String>), GatewayError> {
    match decode(frame)? {
        ColumnarMessage::Data { names, array } => Ok((array, names)),
        ColumnarMessage::Status { .. } => Err(GatewayError::malformed(
            "Message is not of type DefaultData",
        )),
    }
}

fn decode_data_body(buf: &mut &[u8]) -> Result<ColumnarMessage, GatewayError> {
    need(buf, 2, "name count")?;
    let count = usize::from(buf.get_u16_le());
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        names.push(get_str(buf)?);
    }

    need(buf, 1, "rank")?;
    let rank = usize::from(buf.get_u8());
    need(buf, rank * 4, "dims")?;
    let shape: Vec<usize> = (0..rank).map(|_| buf.get_u32_le() as usize).collect();

    let n = element_count(&shape)?;
    let bytes = n
        .checked_mul(8)
        .ok_or_else(|| GatewayError::malformed("frame element count overflows"))?;
    need(buf, bytes, "values")?;
    let values: Vec<f64> = (0..n).map(|_| buf.get_f64_le()).collect();
    if buf.has_remaining() {
        return Err(GatewayError::malformed(format!(
            "{} trailing bytes after values",
            buf.remaining()
        )));
    }

    let array = CanonicalArray::from_shape_vec(&shape, values)?;
    Ok(ColumnarMessage::Data { names, array })
}

fn decode_status_body(buf: &mut &[u8]) -> Result<ColumnarMessage, GatewayError> {
    need(buf, 5, "status")?;
    let code = buf.get_i32_le();
    let success = buf.get_u8() == 0;
    let info = get_str(buf)?;
    Ok(ColumnarMessage::Status {
        code,
        success,
        info,
    })
}

fn with_prefix(body: BytesMut) -> Bytes {
    let mut frame = BytesMut::with_capacity(body.len() + 4);
    frame.put_u32_le(body.len() as u32);
    frame.extend_from_slice(&body);
    frame.freeze()
}

/// Writes a length-prefixed string, truncated on a char boundary to the
/// `u16` limit.
fn put_str(buf: &mut BytesMut, s: &str) {
    let mut len = s.len().min(usize::from(u16::MAX));
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_u16_le(len as u16);
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

fn get_str(buf: &mut &[u8]) -> Result<String, GatewayError> {
    need(buf, 2, "string length")?;
    let len = usize::from(buf.get_u16_le());
    need(buf, len, "string")?;
    let text = std::str::from_utf8(&buf[..len])
        .map_err(|e| GatewayError::malformed(format!("invalid utf-8 in frame: {e}")))?
        .to_string();
    buf.advance(len);
    Ok(text)
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<(), GatewayError> {
    if buf.remaining() < n {
        return Err(GatewayError::malformed(format!("frame truncated reading {what}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_round_trip() {
        let array = CanonicalArray::from_shape_vec(&[2, 2], vec![1.0f64, 2.0, 3.0, 4.0]).unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        let frame = encode_data(&array, &names).unwrap();

        let size = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(size, frame.len() - 4);

        let (decoded, decoded_names) = decode_data(&frame).unwrap();
        assert_eq!(decoded, array);
        assert_eq!(decoded_names, names);
    }

    #[test]
    fn test_wrong_version() {
        let mut frame = encode_status(200, true, "ok").to_vec();
        frame[4] = 9;
        let err = decode(&frame).unwrap_err();
        assert!(err.to_string().contains("Message does not have correct protocol"));
    }

    #[test]
    fn test_status_where_data_expected() {
        let frame = encode_status(500, false, "boom");
        let err = decode_data(&frame).unwrap_err();
        assert!(err.to_string().contains("Message is not of type DefaultData"));

        match decode(&frame).unwrap() {
            ColumnarMessage::Status {
                code,
                success,
                info,
            } => {
                assert_eq!(code, 500);
                assert!(!success);
                assert_eq!(info, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncated_frame() {
        let array = CanonicalArray::from_shape_vec(&[3], vec![1.0f64, 2.0, 3.0]).unwrap();
        let frame = encode_data(&array, &[]).unwrap();
        let mut cut = frame[..frame.len() - 8].to_vec();
        let size = (cut.len() - 4) as u32;
        cut[..4].copy_from_slice(&size.to_le_bytes());
        assert!(decode(&cut).unwrap_err().to_string().contains("truncated"));
    }

    #[test]
    fn test_size_prefix_mismatch() {
        let frame = encode_status(200, true, "ok");
        assert!(decode(&frame[..frame.len() - 1]).is_err());
        assert!(decode(&[1, 0]).is_err());
    }

    #[test]
    fn test_oversized_fields_rejected() {
        let array = CanonicalArray::from_shape_vec(&[1], vec![1.0f64]).unwrap();
        let long_name = "n".repeat(usize::from(u16::MAX) + 1);
        let err = encode_data(&array, &[long_name]).unwrap_err();
        assert!(err.to_string().contains("name length"));

        let too_many: Vec<String> = (0..=usize::from(u16::MAX)).map(|i| i.to_string()).collect();
        let err = encode_data(&array, &too_many).unwrap_err();
        assert!(err.to_string().contains("name count"));

        let deep = CanonicalArray::from_shape_vec(&[1; 256], vec![1.0f64]).unwrap();
        let err = encode_data(&deep, &[]).unwrap_err();
        assert!(err.to_string().contains("rank"));
    }

    #[test]
    fn test_status_info_truncated_on_char_boundary() {
        // 'é' is two bytes, so the byte limit falls inside a character.
        let info = "é".repeat(40_000);
        let frame = encode_status(500, false, &info);
        match decode(&frame).unwrap() {
            ColumnarMessage::Status { info: decoded, .. } => {
                assert_eq!(decoded.len(), usize::from(u16::MAX) - 1);
                assert!(info.starts_with(&decoded));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_frame_uses_envelope_code() {
        let frame = encode_error(&GatewayError::malformed("bad"));
        match decode(&frame).unwrap() {
            ColumnarMessage::Status { code, success, .. } => {
                assert_eq!(code, 400);
                assert!(!success);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

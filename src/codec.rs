use std::io::{ErrorKind, Read, Write};

use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use crate::{GkdError, Result};

// 帧格式：[u32 小端长度][压缩编码]
pub const LEN_PREFIX: usize = 4;
pub const DEFAULT_MAX_ELEMENT_LEN: usize = 1024;

// ====================== 元素编解码 ======================

pub fn encode_element<T: CanonicalSerialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(value.compressed_size());
    value
        .serialize_compressed(&mut bytes)
        .map_err(|_| GkdError::SerializationError)?;
    Ok(bytes)
}

// 输入必须恰好是一个元素
pub fn decode_element<T: CanonicalDeserialize>(bytes: &[u8]) -> Result<T> {
    let mut reader = bytes;
    let value = T::deserialize_compressed(&mut reader)
        .map_err(|e| GkdError::Decode(format!("invalid element: {e}")))?;
    if !reader.is_empty() {
        return Err(GkdError::Decode(format!(
            "{} trailing bytes after element",
            reader.len()
        )));
    }
    Ok(value)
}

// ====================== 长度前缀帧 ======================

pub fn frame(body: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(body.len()).map_err(|_| GkdError::SerializationError)?;
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

// 返回 (帧体, 已消耗字节数含前缀)
pub fn split_frame(buf: &[u8], max_len: usize) -> Result<(&[u8], usize)> {
    let prefix: [u8; LEN_PREFIX] = buf
        .get(..LEN_PREFIX)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| GkdError::Decode(format!("{} bytes is too short for a length prefix", buf.len())))?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_len {
        return Err(GkdError::Decode(format!(
            "declared length {len} exceeds limit {max_len}"
        )));
    }
    let end = LEN_PREFIX + len;
    let body = buf.get(LEN_PREFIX..end).ok_or_else(|| {
        GkdError::Decode(format!(
            "declared length {len} but only {} bytes follow",
            buf.len() - LEN_PREFIX
        ))
    })?;
    Ok((body, end))
}

pub fn encode_framed<T: CanonicalSerialize>(value: &T) -> Result<Vec<u8>> {
    frame(&encode_element(value)?)
}

pub fn decode_framed<T: CanonicalDeserialize>(buf: &[u8], max_len: usize) -> Result<(T, usize)> {
    let (body, consumed) = split_frame(buf, max_len)?;
    Ok((decode_element(body)?, consumed))
}

// ====================== 流式读写 ======================

pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    writer.write_all(&frame(body)?)?;
    Ok(())
}

pub fn write_framed<W: Write, T: CanonicalSerialize>(writer: &mut W, value: &T) -> Result<()> {
    write_frame(writer, &encode_element(value)?)
}

// 按声明长度分配缓冲区，不读取超出部分
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Vec<u8>> {
    let mut prefix = [0u8; LEN_PREFIX];
    read_exact(reader, &mut prefix)?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_len {
        return Err(GkdError::Decode(format!(
            "declared length {len} exceeds limit {max_len}"
        )));
    }
    let mut body = vec![0u8; len];
    read_exact(reader, &mut body)?;
    Ok(body)
}

pub fn read_framed<R: Read, T: CanonicalDeserialize>(reader: &mut R, max_len: usize) -> Result<T> {
    decode_element(&read_frame(reader, max_len)?)
}

pub fn write_u64_framed<W: Write>(writer: &mut W, value: u64) -> Result<()> {
    write_frame(writer, &value.to_le_bytes())
}

pub fn read_u64_framed<R: Read>(reader: &mut R) -> Result<u64> {
    let body = read_frame(reader, 8)?;
    let bytes: [u8; 8] = body
        .as_slice()
        .try_into()
        .map_err(|_| GkdError::Decode(format!("expected 8-byte integer, got {} bytes", body.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

// EOF -> Decode，套接字超时 -> Timeout
pub fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => GkdError::Decode("stream ended inside a frame".into()),
        ErrorKind::WouldBlock | ErrorKind::TimedOut => GkdError::Timeout,
        _ => GkdError::Transport(e),
    })
}

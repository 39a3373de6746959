//! Length-prefixed record framing.
//!
//! One record per frame: a 4-byte big-endian length followed by the wire
//! bytes. The prefix keeps record boundaries intact across TCP segmentation
//! instead of trusting one `recv` to return one record. Frames are capped;
//! an oversized length is treated as a protocol violation and the caller
//! drops the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;
use crate::record::Record;

pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Read one record. `Ok(None)` means the stream closed cleanly between
/// frames; EOF inside a frame is an error.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Record>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut length = [0u8; 4];
    match reader.read_exact(&mut length).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(length) as usize;
    if length == 0 || length > MAX_FRAME_BYTES {
        return Err(ProtoError::Oversized);
    }

    let mut frame = vec![0u8; length];
    reader.read_exact(&mut frame).await?;
    Record::from_bytes(&frame).map(Some)
}

pub async fn write_record<W>(writer: &mut W, record: &Record) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = record.to_bytes()?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ProtoError::Oversized);
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Kind, SERVER_NAME};
    use crate::value::Value;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn frames_roundtrip_back_to_back() {
        let first = Record::new(
            "alice",
            SERVER_NAME,
            Kind::Identity,
            BTreeMap::from([("username".to_string(), Value::from("alice"))]),
        );
        let second = Record::new("alice", "bob", Kind::Message, BTreeMap::new());

        let mut buffer = Vec::new();
        write_record(&mut buffer, &first).await.unwrap();
        write_record(&mut buffer, &second).await.unwrap();

        let mut cursor = buffer.as_slice();
        assert_eq!(read_record(&mut cursor).await.unwrap().unwrap(), first);
        assert_eq!(read_record(&mut cursor).await.unwrap().unwrap(), second);
        assert!(read_record(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_and_truncated_frames_error() {
        let mut oversized = Vec::new();
        oversized.extend_from_slice(&(MAX_FRAME_BYTES as u32 + 1).to_be_bytes());
        let mut cursor = oversized.as_slice();
        assert!(read_record(&mut cursor).await.is_err());

        let record = Record::new("alice", SERVER_NAME, Kind::Login, BTreeMap::new());
        let mut buffer = Vec::new();
        write_record(&mut buffer, &record).await.unwrap();
        buffer.truncate(buffer.len() - 1);
        let mut cursor = buffer.as_slice();
        assert!(read_record(&mut cursor).await.is_err());
    }
}

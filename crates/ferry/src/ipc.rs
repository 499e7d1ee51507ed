//! Framing of encapsulated Arrow IPC messages inside a file.
//!
//! Every message starts with an optional `0xFFFFFFFF` continuation marker and
//! a little-endian `i32` metadata length, followed by the flatbuffer metadata
//! and the message body. A reported batch offset points at the first byte of
//! that prefix.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use arrow::buffer::Buffer;
use arrow::ipc::{Block, MessageHeader, root_as_message};
use snafu::ResultExt;

use crate::error::{ExchangeError, IoSnafu, Result};

const CONTINUATION_MARKER: [u8; 4] = [0xFF; 4];

/// Location and kind of one message inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MessageFrame {
    pub offset: u64,
    /// Prefix plus flatbuffer metadata, padding included.
    pub metadata_len: usize,
    pub body_len: usize,
    pub header: MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Schema,
    DictionaryBatch,
    RecordBatch,
    Other,
}

impl MessageFrame {
    pub fn total_len(&self) -> usize {
        self.metadata_len + self.body_len
    }

    pub fn block(&self) -> Block {
        Block::new(self.offset as i64, self.metadata_len as i32, self.body_len as i64)
    }
}

/// Decode the frame of the message starting at `bytes[0]`.
///
/// Returns `None` if `bytes` ends before the metadata does.
fn parse_frame(bytes: &[u8], offset: u64, path: &Path) -> Result<Option<MessageFrame>> {
    if bytes.len() < 8 {
        return Ok(None);
    }
    let (prefix_len, len_bytes) = if bytes[..4] == CONTINUATION_MARKER {
        (8, &bytes[4..8])
    } else {
        (4, &bytes[..4])
    };
    let meta_len = i32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
    if meta_len <= 0 {
        return Err(ExchangeError::MalformedFile {
            path: path.to_path_buf(),
            offset,
            message: format!("invalid metadata length {meta_len}"),
        });
    }
    let meta_len = meta_len as usize;
    let Some(metadata) = bytes.get(prefix_len..prefix_len + meta_len) else {
        return Ok(None);
    };

    let message = root_as_message(metadata).map_err(|e| ExchangeError::MalformedFile {
        path: path.to_path_buf(),
        offset,
        message: e.to_string(),
    })?;

    let header = match message.header_type() {
        MessageHeader::Schema => MessageKind::Schema,
        MessageHeader::DictionaryBatch => MessageKind::DictionaryBatch,
        MessageHeader::RecordBatch => MessageKind::RecordBatch,
        _ => MessageKind::Other,
    };

    Ok(Some(MessageFrame {
        offset,
        metadata_len: prefix_len + meta_len,
        body_len: message.bodyLength().max(0) as usize,
        header,
    }))
}

/// Split a contiguous run of written bytes into message frames.
///
/// `base` is the file offset of `bytes[0]`. Trailing bytes that do not form a
/// complete message are an error.
pub(crate) fn scan_messages(bytes: &[u8], base: u64, path: &Path) -> Result<Vec<MessageFrame>> {
    let mut frames = Vec::new();
    let mut position = 0usize;

    while position < bytes.len() {
        let offset = base + position as u64;
        let frame = parse_frame(&bytes[position..], offset, path)?.ok_or_else(|| {
            ExchangeError::MalformedFile {
                path: path.to_path_buf(),
                offset,
                message: "truncated message".to_string(),
            }
        })?;
        if position + frame.total_len() > bytes.len() {
            return Err(ExchangeError::MalformedFile {
                path: path.to_path_buf(),
                offset,
                message: "message body extends past written bytes".to_string(),
            });
        }
        position += frame.total_len();
        frames.push(frame);
    }

    Ok(frames)
}

/// Read the frame header of the message at `offset`.
pub(crate) fn read_frame(file: &mut File, offset: u64, path: &Path) -> Result<MessageFrame> {
    let mut prefix = [0u8; 8];
    file.seek(SeekFrom::Start(offset)).context(IoSnafu { path })?;
    file.read_exact(&mut prefix).context(IoSnafu { path })?;

    let (prefix_len, meta_len) = if prefix[..4] == CONTINUATION_MARKER {
        (8, i32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]))
    } else {
        (4, i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]))
    };
    if meta_len <= 0 {
        return Err(ExchangeError::MalformedFile {
            path: path.to_path_buf(),
            offset,
            message: format!("invalid metadata length {meta_len}"),
        });
    }
    let remaining = ensure_within_file(file, offset, prefix_len + meta_len as u64, path)?;

    let mut head = vec![0u8; (8 + meta_len as u64).min(remaining) as usize];
    file.seek(SeekFrom::Start(offset)).context(IoSnafu { path })?;
    let read = read_up_to(file, &mut head).context(IoSnafu { path })?;
    head.truncate(read);

    parse_frame(&head, offset, path)?.ok_or_else(|| ExchangeError::MalformedFile {
        path: path.to_path_buf(),
        offset,
        message: "truncated message metadata".to_string(),
    })
}

/// Read the whole message described by `frame` into an Arrow buffer.
pub(crate) fn read_message(file: &mut File, frame: &MessageFrame, path: &Path) -> Result<Buffer> {
    ensure_within_file(file, frame.offset, frame.total_len() as u64, path)?;
    let mut data = vec![0u8; frame.total_len()];
    file.seek(SeekFrom::Start(frame.offset))
        .context(IoSnafu { path })?;
    file.read_exact(&mut data).context(IoSnafu { path })?;
    Ok(Buffer::from_vec(data))
}

/// Fail unless `len` bytes starting at `offset` lie inside the file.
///
/// Returns the number of bytes from `offset` to the end of the file.
fn ensure_within_file(file: &File, offset: u64, len: u64, path: &Path) -> Result<u64> {
    let file_len = file.metadata().context(IoSnafu { path })?.len();
    let remaining = file_len.saturating_sub(offset);
    if len > remaining {
        return Err(ExchangeError::MalformedFile {
            path: path.to_path_buf(),
            offset,
            message: format!("message of {len} bytes runs past the end of the file ({file_len} bytes)"),
        });
    }
    Ok(remaining)
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

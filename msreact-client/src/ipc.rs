//! Length-prefixed msgpack frames over a byte stream, used on the stdio of
//! acquisition worker processes.
//!
//! Frame: `[u32 big-endian length][msgpack body]`.

use std::io::{ErrorKind, Read, Write};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::IpcError;

/// Larger frames are rejected instead of allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// # Errors
/// - [`IpcError::Encode`] if `message` cannot be serialized
/// - [`IpcError::FrameTooLarge`] if the encoded message exceeds [`MAX_FRAME_LEN`]
/// - [`IpcError::IOError`] if writing fails
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), IpcError> {
    let body = rmp_serde::to_vec_named(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge { len: body.len() });
    }
    let len = u32::try_from(body.len()).map_err(|_| IpcError::FrameTooLarge { len: body.len() })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read the next frame. `Ok(None)` means the stream ended before a new frame
/// started.
///
/// # Errors
/// - [`IpcError::FrameTooLarge`] if the announced length exceeds [`MAX_FRAME_LEN`]
/// - [`IpcError::Decode`] if the body is not a valid message
/// - [`IpcError::IOError`] if the stream fails or ends mid-frame
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, IpcError> {
    let mut header = [0u8; 4];
    if !read_header(reader, &mut header)? {
        return Ok(None);
    }
    let len = usize::try_from(u32::from_be_bytes(header)).unwrap_or(usize::MAX);
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge { len });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(rmp_serde::from_slice(&body)?))
}

/// Fill `header`. `Ok(false)` if the stream ended before its first byte.
fn read_header<R: Read>(reader: &mut R, header: &mut [u8; 4]) -> Result<bool, IpcError> {
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("stream ended after {filled} header bytes"),
                )
                .into())
            }
            Ok(n) => filled = filled.saturating_add(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod unit {
    use std::io::{Cursor, ErrorKind};

    use assert_matches::assert_matches;
    use chrono::Utc;
    use rmpv::Value;

    use super::{read_frame, write_frame};
    use crate::{
        acquisition::{settings::AcquisitionSettings, workflow::AcquisitionWorkflow},
        command::{AcqMessage, AcqRequest, LogLevel, LogRecord},
        error::IpcError,
    };

    #[test]
    fn messages_cross_the_stream_in_order() {
        let scan = Value::Map(vec![
            (Value::from("ScanNumber"), Value::from(3)),
            (Value::from("Raw"), Value::Binary(vec![1, 2, 3])),
        ]);
        let sent = vec![
            AcqMessage::Scan(scan.into()),
            AcqMessage::RawFileNames(vec!["a.raw".to_string()]),
            AcqMessage::AcquisitionEnded,
        ];
        let mut stream = Vec::new();
        for m in &sent {
            write_frame(&mut stream, m).expect("should write");
        }

        let mut reader = Cursor::new(stream);
        let mut received = Vec::new();
        while let Some(m) = read_frame::<_, AcqMessage>(&mut reader).expect("should read") {
            received.push(m);
        }
        assert_eq!(received, sent);
    }

    #[test]
    fn requests_with_settings_and_logs_decode() {
        let sent = vec![
            AcqRequest::ReadyForAcquisitionStart(AcquisitionSettings::new(
                AcquisitionWorkflow::LimitedByDuration(12.5),
            )),
            AcqRequest::Log(LogRecord {
                level: LogLevel::Warn,
                target: "msreact_client::algorithms::monitor".to_string(),
                message: "slow scan".to_string(),
                timestamp: Utc::now(),
            }),
        ];
        let mut stream = Vec::new();
        for r in &sent {
            write_frame(&mut stream, r).expect("should write");
        }
        let mut reader = Cursor::new(stream);
        for expected in &sent {
            let got: AcqRequest = read_frame(&mut reader)
                .expect("should read")
                .expect("frame present");
            assert_eq!(&got, expected);
        }
    }

    #[test]
    fn truncated_body_is_an_io_error() {
        let mut stream = Vec::new();
        write_frame(&mut stream, &AcqMessage::Error(Some("x".to_string()))).expect("should write");
        stream.truncate(stream.len() - 1);
        assert_matches!(
            read_frame::<_, AcqMessage>(&mut Cursor::new(stream)),
            Err(IpcError::IOError { .. })
        );
    }

    #[test]
    fn empty_stream_is_a_clean_end() {
        assert_matches!(
            read_frame::<_, AcqMessage>(&mut Cursor::new(Vec::new())),
            Ok(None)
        );
    }

    #[test]
    fn truncated_header_is_an_io_error() {
        let mut stream = Vec::new();
        write_frame(&mut stream, &AcqMessage::AcquisitionEnded).expect("should write");
        stream.truncate(2);
        assert_matches!(
            read_frame::<_, AcqMessage>(&mut Cursor::new(stream)),
            Err(IpcError::IOError { source }) if source.kind() == ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn oversized_length_is_rejected() {
        let stream = u32::MAX.to_be_bytes().to_vec();
        assert_matches!(
            read_frame::<_, AcqMessage>(&mut Cursor::new(stream)),
            Err(IpcError::FrameTooLarge { .. })
        );
    }
}

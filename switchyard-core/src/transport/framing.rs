//! Streaming frames: `<byte length>\n<json>`, back to back.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Largest frame a decoder accepts.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Longest length header a decoder waits on before giving up.
const MAX_HEADER_BYTES: usize = digits(MAX_FRAME_BYTES);

const fn digits(mut n: usize) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    InvalidLength { reason: String },
    #[error("frame body is not json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

pub fn encode_frame(value: &Value) -> Vec<u8> {
    let json = value.to_string();
    let mut frame = Vec::with_capacity(json.len() + 8);
    frame.extend_from_slice(json.len().to_string().as_bytes());
    frame.push(b'\n');
    frame.extend_from_slice(json.as_bytes());
    frame
}

/// Write every value as one frame, flushing after each so readers see
/// messages as they are produced.
pub async fn write_frames<W, I>(writer: &mut W, values: I) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = Value>,
{
    let mut written = 0;
    for value in values {
        let frame = encode_frame(&value);
        writer.write_all(&frame).await?;
        writer.flush().await?;
        written += frame.len();
    }
    Ok(written)
}

/// Incremental decoder. Chunks may split frames anywhere, including inside
/// the length header.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `chunk` and return every frame it completes.
    ///
    /// Frames decoded before a bad one are returned first and the error is
    /// reported by the next call. A frame whose body is not JSON is skipped
    /// once reported, so decoding resumes after it. A bad length header is
    /// not skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Value>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut values = Vec::new();
        let mut consumed = 0;
        let mut error = None;

        loop {
            let rest = &self.buffer[consumed..];
            let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
                if rest.len() > MAX_HEADER_BYTES {
                    error = Some(FrameError::InvalidLength {
                        reason: format!("no length within {MAX_HEADER_BYTES} bytes"),
                    });
                }
                break;
            };
            let length = match parse_length(&rest[..newline]) {
                Ok(length) => length,
                Err(err) => {
                    error = Some(err);
                    break;
                }
            };
            let start = newline + 1;
            if rest.len() < start + length {
                break;
            }
            match serde_json::from_slice(&rest[start..start + length]) {
                Ok(value) => {
                    values.push(value);
                    consumed += start + length;
                }
                Err(err) => {
                    if values.is_empty() {
                        consumed += start + length;
                        error = Some(err.into());
                    }
                    break;
                }
            }
        }

        self.buffer.drain(..consumed);
        match error {
            Some(err) if values.is_empty() => Err(err),
            _ => Ok(values),
        }
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// End of stream. Fails if a partial frame is left over.
    pub fn finish(self) -> Result<(), FrameError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated {
                buffered: self.buffer.len(),
            })
        }
    }
}

fn parse_length(header: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(header).map_err(|_| FrameError::InvalidLength {
        reason: "length header is not utf-8".to_string(),
    })?;
    let length: usize = text.trim().parse().map_err(|_| FrameError::InvalidLength {
        reason: format!("{text:?} is not a length"),
    })?;
    if length > MAX_FRAME_BYTES {
        return Err(FrameError::InvalidLength {
            reason: format!("{length} exceeds {MAX_FRAME_BYTES} bytes"),
        });
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_carry_their_byte_length() {
        assert_eq!(encode_frame(&json!({"a": 1})), b"7\n{\"a\":1}".to_vec());
        assert_eq!(encode_frame(&json!("é")), "4\n\"é\"".as_bytes().to_vec());
    }

    #[test]
    fn decoder_handles_arbitrary_splits() {
        let mut stream = encode_frame(&json!({"n": 1}));
        stream.extend(encode_frame(&json!(["x", null])));
        stream.extend(encode_frame(&json!("ünïcode")));

        for split in 1..stream.len() {
            let mut decoder = FrameDecoder::new();
            let mut values = decoder.push(&stream[..split]).unwrap();
            values.extend(decoder.push(&stream[split..]).unwrap());
            assert_eq!(values, vec![json!({"n": 1}), json!(["x", null]), json!("ünïcode")]);
            decoder.finish().unwrap();
        }
    }

    #[test]
    fn bad_headers_and_truncation_are_errors() {
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.push(b"abc\n{}"),
            Err(FrameError::InvalidLength { .. })
        ));

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"10\n{\"a\"").unwrap().is_empty());
        assert_eq!(decoder.buffered(), 7);
        assert!(matches!(
            decoder.finish(),
            Err(FrameError::Truncated { buffered: 7 })
        ));
    }

    #[test]
    fn good_frames_ahead_of_a_bad_one_are_kept() {
        let mut stream = encode_frame(&json!(1));
        stream.extend_from_slice(b"3\n{x}");
        stream.extend(encode_frame(&json!(2)));

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&stream).unwrap(), vec![json!(1)]);
        assert_eq!(decoder.buffered(), stream.len() - 3);

        assert!(matches!(decoder.push(&[]), Err(FrameError::Json(_))));
        assert_eq!(decoder.push(&[]).unwrap(), vec![json!(2)]);
        decoder.finish().unwrap();
    }

    #[test]
    fn endless_length_headers_are_rejected() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"1677721").unwrap().is_empty());
        assert!(matches!(
            decoder.push(b"60"),
            Err(FrameError::InvalidLength { .. })
        ));
    }

    #[tokio::test]
    async fn write_frames_streams_into_a_writer() {
        let mut out = Vec::new();
        let written = write_frames(&mut out, vec![json!(1), json!({"done": true})])
            .await
            .unwrap();
        assert_eq!(written, out.len());

        let mut decoder = FrameDecoder::new();
        assert_eq!(
            decoder.push(&out).unwrap(),
            vec![json!(1), json!({"done": true})]
        );
    }
}

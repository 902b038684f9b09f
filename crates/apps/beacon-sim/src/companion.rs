//! The phone side of the link.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use beacon_link::codec::{decode_reply, request};
use beacon_link::fragment::split;
use beacon_link::ota::{additive_checksum, MAX_CHUNK_BYTES};
use beacon_link::{Fragment, LinkConfig, Reply};
use rmpv::Value;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::SimError;
use crate::radio::GattOp;

/// Room left in an `ota_chunk` request for everything but the chunk text.
const CHUNK_REQUEST_OVERHEAD: usize = 64;

/// Largest chunk whose `ota_chunk` request fits in `max_request_bytes`.
pub fn max_chunk_size(max_request_bytes: usize) -> usize {
    let encoded = max_request_bytes.saturating_sub(CHUNK_REQUEST_OVERHEAD);
    (encoded / 4 * 3).clamp(1, MAX_CHUNK_BYTES)
}

/// Summary of a completed firmware push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashReport {
    pub partition: String,
    pub bytes: u64,
    pub chunks: usize,
}

pub struct Companion {
    ops: mpsc::Sender<GattOp>,
    conn_handle: u16,
    max_payload: usize,
    max_chunk: usize,
}

impl Companion {
    /// Fragments and chunks are sized to what the device accepts under `link`.
    pub fn new(ops: mpsc::Sender<GattOp>, conn_handle: u16, link: &LinkConfig) -> Self {
        Self {
            ops,
            conn_handle,
            max_payload: link.max_fragment_payload,
            max_chunk: max_chunk_size(link.max_request_bytes),
        }
    }

    async fn send(&self, op: GattOp) -> Result<(), SimError> {
        self.ops.send(op).await.map_err(|_| SimError::RadioClosed)
    }

    /// Connect, enter the displayed passkey and complete bonding.
    pub async fn connect_and_pair(&self) -> Result<u32, SimError> {
        self.send(GattOp::Connect { conn_handle: self.conn_handle }).await?;
        let (reply, passkey) = oneshot::channel();
        self.send(GattOp::PasskeyRequest { reply }).await?;
        let passkey = passkey.await.map_err(|_| SimError::RadioClosed)?;
        self.send(GattOp::AuthenticationComplete { conn_handle: self.conn_handle, bonded: true })
            .await?;
        Ok(passkey)
    }

    pub async fn disconnect(&self, reason: i32) -> Result<(), SimError> {
        self.send(GattOp::Disconnect { conn_handle: self.conn_handle, reason }).await
    }

    /// Write one request and read back its reply, without interpreting errors.
    pub async fn exchange(
        &self,
        function_name: &str,
        args: Vec<(&str, Value)>,
    ) -> Result<Reply, SimError> {
        let bytes = request(function_name, args)?;
        for value in split(&bytes, self.max_payload) {
            self.send(GattOp::Write { value }).await?;
        }

        let mut response = Vec::new();
        loop {
            let (reply, value) = oneshot::channel();
            self.send(GattOp::Read { reply }).await?;
            let raw = value.await.map_err(|_| SimError::RadioClosed)?;
            let fragment = Fragment::parse(&raw)?;
            response.extend_from_slice(fragment.payload);
            if !fragment.more_fragments {
                break;
            }
        }
        Ok(decode_reply(&response)?)
    }

    /// Like [`Companion::exchange`], but an `error` reply becomes `Err`.
    pub async fn call(
        &self,
        function_name: &str,
        args: Vec<(&str, Value)>,
    ) -> Result<Reply, SimError> {
        let reply = self.exchange(function_name, args).await?;
        if let Some(message) = reply.error_message() {
            return Err(SimError::Remote {
                function: function_name.to_string(),
                message: message.to_string(),
                code: reply.code(),
            });
        }
        Ok(reply)
    }

    /// Push `image` through `ota_begin`, `ota_chunk` and `ota_end`.
    pub async fn flash_image(
        &self,
        image: &[u8],
        chunk_size: usize,
    ) -> Result<FlashReport, SimError> {
        if image.is_empty() {
            return Err(SimError::EmptyImage);
        }
        let size = image.len() as u64;
        let begin = self.call("ota_begin", vec![("size", Value::from(size))]).await?;
        let partition = begin
            .str("partition")
            .ok_or_else(|| SimError::MalformedReply {
                function: "ota_begin".into(),
                field: "partition",
            })?
            .to_string();
        let chunk_size = chunk_size.clamp(1, self.max_chunk);
        log::info!("sim: writing {} bytes to {} in {} byte chunks", size, partition, chunk_size);

        let mut chunks = 0;
        for chunk in image.chunks(chunk_size) {
            let reply = self
                .call(
                    "ota_chunk",
                    vec![
                        ("chunk", Value::from(BASE64_STANDARD.encode(chunk))),
                        ("checksum", Value::from(additive_checksum(chunk))),
                    ],
                )
                .await?;
            chunks += 1;
            let remaining = reply.u64("remaining").ok_or_else(|| SimError::MalformedReply {
                function: "ota_chunk".into(),
                field: "remaining",
            })?;
            log::debug!("sim: chunk {} accepted, {} bytes remaining", chunks, remaining);
        }

        self.call("ota_end", Vec::new()).await?;
        log::info!("sim: image committed to {}", partition);
        Ok(FlashReport { partition, bytes: size, chunks })
    }

    /// Fetch the display and render it one text line per pixel row.
    pub async fn screen(&self) -> Result<Vec<String>, SimError> {
        let reply = self.call("display_contents", Vec::new()).await?;
        render_screen(&reply)
    }
}

fn malformed(field: &'static str) -> SimError {
    SimError::MalformedReply { function: "display_contents".into(), field }
}

/// `#` for a lit pixel, `.` otherwise.
pub fn render_screen(reply: &Reply) -> Result<Vec<String>, SimError> {
    let width = reply.u64("width").ok_or_else(|| malformed("width"))? as usize;
    let height = reply.u64("height").ok_or_else(|| malformed("height"))? as usize;
    let pages = reply
        .get("buffer")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("buffer"))?;
    if pages.len() * 8 != height {
        return Err(malformed("buffer"));
    }
    let mut rows = Vec::with_capacity(pages.len());
    for page in pages {
        let bytes = page
            .as_array()
            .filter(|row| row.len() == width)
            .ok_or_else(|| malformed("buffer"))?
            .iter()
            .map(|cell| cell.as_u64().and_then(|byte| u8::try_from(byte).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| malformed("buffer"))?;
        rows.push(bytes);
    }
    Ok((0..height)
        .map(|y| {
            rows[y / 8]
                .iter()
                .map(|byte| if byte & (1 << (y % 8)) != 0 { '#' } else { '.' })
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_limit_follows_request_bound() {
        assert_eq!(max_chunk_size(4096), 3024);
        assert_eq!(max_chunk_size(65_536), MAX_CHUNK_BYTES);
        assert_eq!(max_chunk_size(16), 1);
    }

    #[test]
    fn largest_chunk_request_fits() {
        let chunk = vec![0xAB; max_chunk_size(4096)];
        let bytes = request(
            "ota_chunk",
            vec![
                ("chunk", Value::from(BASE64_STANDARD.encode(&chunk))),
                ("checksum", Value::from(u64::from(u32::MAX))),
            ],
        )
        .expect("encode");
        assert!(bytes.len() <= 4096, "{} bytes", bytes.len());
    }

    #[test]
    fn screen_renders_page_bits_top_down() {
        let reply = Reply::new()
            .with("cmd", 0u8)
            .with("width", 2u64)
            .with("height", 8u64)
            .with(
                "buffer",
                Value::Array(vec![Value::Array(vec![Value::from(0x81u8), Value::from(0x02u8)])]),
            );
        let lines = render_screen(&reply).expect("render");
        assert_eq!(lines.len(), 8);
        assert_eq!(lines[0], "#.");
        assert_eq!(lines[1], ".#");
        assert_eq!(lines[7], "#.");
    }

    #[test]
    fn screen_with_short_row_is_malformed() {
        let reply = Reply::new()
            .with("width", 3u64)
            .with("height", 8u64)
            .with("buffer", Value::Array(vec![Value::Array(vec![Value::from(1u8)])]));
        assert!(matches!(
            render_screen(&reply),
            Err(SimError::MalformedReply { field: "buffer", .. })
        ));
    }
}

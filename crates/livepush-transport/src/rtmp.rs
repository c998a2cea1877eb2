//! RTMP client connection.
//!
//! Connects, performs the RTMP handshake and the
//! connect/createStream/publish command flow, then carries complete FLV
//! tags as RTMP messages on the publish stream. FLV tag types are the
//! RTMP message type ids (8 audio, 9 video, 18 script data), so forwarding
//! a tag is a matter of re-framing its header fields as a message payload
//! and letting the chunk serializer do the rest.
//!
//! The connection owns a small tokio runtime and exposes a blocking
//! facade; the publisher session calls it from the sender thread.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use rml_amf0::Amf0Value;
use rml_rtmp::chunk_io::{ChunkDeserializer, ChunkSerializer};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::messages::{MessagePayload, RtmpMessage, UserControlEventType};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use livepush_codec::flv::{TagStream, PREV_TAG_SIZE_LEN, TAG_HEADER_LEN};

use crate::{TransportError, TransportResult};

/// Default RTMP port.
pub const DEFAULT_PORT: u16 = 1935;

/// Chunk size announced to the server.
const OUTBOUND_CHUNK_SIZE: u32 = 4096;

/// Timeout applied to each phase of connection establishment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Host, application and stream key parsed from an RTMP URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RtmpTarget {
    host: String,
    port: u16,
    app: String,
    stream_key: String,
}

fn parse_url(raw: &str) -> TransportResult<RtmpTarget> {
    let parsed = Url::parse(raw).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    if parsed.scheme() != "rtmp" {
        return Err(TransportError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl("missing host".into()))?
        .to_string();
    let port = parsed.port().unwrap_or(DEFAULT_PORT);

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();
    if segments.len() < 2 {
        return Err(TransportError::InvalidUrl(
            "expected rtmp://host[:port]/app/stream".into(),
        ));
    }

    let app = segments[..segments.len() - 1].join("/");
    let mut stream_key = segments[segments.len() - 1].to_string();
    if let Some(query) = parsed.query() {
        // Stream-key parameters (auth tokens) ride along with the key.
        stream_key = format!("{stream_key}?{query}");
    }

    Ok(RtmpTarget {
        host,
        port,
        app,
        stream_key,
    })
}

/// An established RTMP publish connection.
pub struct RtmpConnection {
    // The socket must drop before the runtime that drives it.
    stream: TcpStream,
    serializer: ChunkSerializer,
    deserializer: ChunkDeserializer,
    stream_id: u32,
    runtime: tokio::runtime::Runtime,
}

impl RtmpConnection {
    /// Connect to `url` and complete the publish handshake (blocking).
    #[instrument(name = "rtmp_connect", skip_all, fields(url = %url))]
    pub fn connect(url: &str) -> TransportResult<Self> {
        let target = parse_url(url)?;
        info!(
            host = %target.host,
            port = target.port,
            app = %target.app,
            "connecting to RTMP server"
        );

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(TransportError::Io)?;

        let (stream, serializer, deserializer, stream_id) =
            runtime.block_on(establish(&target))?;

        info!(stream_id, "RTMP publish stream established");
        Ok(Self {
            runtime,
            stream,
            serializer,
            deserializer,
            stream_id,
        })
    }

    /// Message stream id of the publish stream.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Drain whatever the server has sent without blocking, answering
    /// pings and chunk-size updates. A closed socket surfaces as an error
    /// so a rejected publish is caught at the next write rather than
    /// much later.
    fn service_inbound(&mut self) -> std::io::Result<()> {
        use std::io::{Error, ErrorKind};

        let mut buf = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    ));
                }
                Ok(read) => {
                    let mut input: &[u8] = &buf[..read];
                    loop {
                        let payload = self
                            .deserializer
                            .get_next_message(input)
                            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("{e:?}")))?;
                        input = &[];
                        let Some(payload) = payload else { break };
                        let Ok(message) = payload.to_rtmp_message() else {
                            continue;
                        };
                        match message {
                            RtmpMessage::SetChunkSize { size } => {
                                debug!(size, "server chunk size while publishing");
                                self.deserializer.set_max_chunk_size(size as usize).map_err(
                                    |e| Error::new(ErrorKind::InvalidData, format!("{e:?}")),
                                )?;
                            }
                            RtmpMessage::UserControl {
                                event_type: UserControlEventType::PingRequest,
                                timestamp,
                                ..
                            } => {
                                let response = RtmpMessage::UserControl {
                                    event_type: UserControlEventType::PingResponse,
                                    stream_id: None,
                                    buffer_length: None,
                                    timestamp,
                                };
                                let payload = response
                                    .into_message_payload(RtmpTimestamp::new(0), 0)
                                    .map_err(|e| {
                                        Error::new(ErrorKind::InvalidData, format!("{e:?}"))
                                    })?;
                                let packet =
                                    self.serializer.serialize(&payload, false, false).map_err(
                                        |e| Error::new(ErrorKind::InvalidData, format!("{e:?}")),
                                    )?;
                                self.runtime
                                    .block_on(self.stream.write_all(&packet.bytes))?;
                            }
                            other => {
                                trace!(?other, "ignoring inbound message while publishing");
                            }
                        }
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl TagStream for RtmpConnection {
    /// Forward one complete FLV tag as an RTMP message.
    fn write(&mut self, tag: &[u8]) -> std::io::Result<usize> {
        use std::io::{Error, ErrorKind};

        self.service_inbound()?;

        if tag.len() < TAG_HEADER_LEN + PREV_TAG_SIZE_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "truncated FLV tag"));
        }
        let payload_len =
            ((tag[1] as usize) << 16) | ((tag[2] as usize) << 8) | tag[3] as usize;
        if tag.len() != TAG_HEADER_LEN + payload_len + PREV_TAG_SIZE_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "FLV tag length mismatch"));
        }
        let timestamp = ((tag[7] as u32) << 24)
            | ((tag[4] as u32) << 16)
            | ((tag[5] as u32) << 8)
            | tag[6] as u32;

        let message = MessagePayload {
            timestamp: RtmpTimestamp::new(timestamp),
            message_stream_id: self.stream_id,
            type_id: tag[0],
            data: Bytes::copy_from_slice(&tag[TAG_HEADER_LEN..TAG_HEADER_LEN + payload_len]),
        };
        let packet = self
            .serializer
            .serialize(&message, false, false)
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("{e:?}")))?;

        trace!(
            tag_type = tag[0],
            timestamp,
            payload_len,
            "sending FLV tag"
        );
        self.runtime
            .block_on(self.stream.write_all(&packet.bytes))?;
        Ok(tag.len())
    }
}

impl Drop for RtmpConnection {
    fn drop(&mut self) {
        debug!(stream_id = self.stream_id, "closing RTMP connection");
    }
}

async fn establish(
    target: &RtmpTarget,
) -> TransportResult<(TcpStream, ChunkSerializer, ChunkDeserializer, u32)> {
    let addr = format!("{}:{}", target.host, target.port);
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| TransportError::Timeout("TCP connect"))?
        .map_err(|e| TransportError::ConnectFailed(format!("TCP connect failed: {e}")))?;
    stream.set_nodelay(true).ok();

    let leftover = do_handshake(&mut stream).await?;
    debug!("handshake complete");

    let mut serializer = ChunkSerializer::new();
    let mut deserializer = ChunkDeserializer::new();

    // Announce our chunk size before the first command.
    let packet = serializer
        .set_max_chunk_size(OUTBOUND_CHUNK_SIZE, RtmpTimestamp::new(0))
        .map_err(|e| TransportError::Protocol(format!("{e:?}")))?;
    stream.write_all(&packet.bytes).await?;

    let mut pump = MessagePump {
        stream: &mut stream,
        serializer: &mut serializer,
        deserializer: &mut deserializer,
        pending: leftover,
    };

    // connect("app")
    let mut command_object = HashMap::new();
    command_object.insert("app".to_string(), Amf0Value::Utf8String(target.app.clone()));
    command_object.insert(
        "type".to_string(),
        Amf0Value::Utf8String("nonprivate".to_string()),
    );
    command_object.insert(
        "flashVer".to_string(),
        Amf0Value::Utf8String("FMLE/3.0 (compatible; livepush)".to_string()),
    );
    command_object.insert(
        "tcUrl".to_string(),
        Amf0Value::Utf8String(format!(
            "rtmp://{}:{}/{}",
            target.host, target.port, target.app
        )),
    );
    pump.send(
        RtmpMessage::Amf0Command {
            command_name: "connect".to_string(),
            transaction_id: 1.0,
            command_object: Amf0Value::Object(command_object),
            additional_arguments: Vec::new(),
        },
        0,
    )
    .await?;

    pump.wait_for("connect accepted", |message| match message {
        RtmpMessage::Amf0Command {
            command_name,
            transaction_id,
            ..
        } if command_name == "_result" && *transaction_id == 1.0 => Some(Ok(())),
        RtmpMessage::Amf0Command { command_name, .. } if command_name == "_error" => Some(Err(
            TransportError::ConnectFailed("connect rejected by server".into()),
        )),
        _ => None,
    })
    .await??;
    debug!(app = %target.app, "connection accepted");

    // createStream()
    pump.send(
        RtmpMessage::Amf0Command {
            command_name: "createStream".to_string(),
            transaction_id: 2.0,
            command_object: Amf0Value::Null,
            additional_arguments: Vec::new(),
        },
        0,
    )
    .await?;

    let stream_id = pump
        .wait_for("createStream result", |message| match message {
            RtmpMessage::Amf0Command {
                command_name,
                transaction_id,
                additional_arguments,
                ..
            } if command_name == "_result" && *transaction_id == 2.0 => {
                match additional_arguments.first() {
                    Some(Amf0Value::Number(id)) => Some(Ok(*id as u32)),
                    _ => Some(Err(TransportError::Protocol(
                        "createStream result without a stream id".into(),
                    ))),
                }
            }
            _ => None,
        })
        .await??;
    debug!(stream_id, "publish stream created");

    // publish("key", "live")
    pump.send(
        RtmpMessage::Amf0Command {
            command_name: "publish".to_string(),
            transaction_id: 0.0,
            command_object: Amf0Value::Null,
            additional_arguments: vec![
                Amf0Value::Utf8String(target.stream_key.clone()),
                Amf0Value::Utf8String("live".to_string()),
            ],
        },
        stream_id,
    )
    .await?;

    pump.wait_for("publish accepted", |message| match message {
        RtmpMessage::Amf0Command {
            command_name,
            additional_arguments,
            ..
        } if command_name == "onStatus" => {
            let code = additional_arguments.iter().find_map(|arg| match arg {
                Amf0Value::Object(info) => match info.get("code") {
                    Some(Amf0Value::Utf8String(code)) => Some(code.clone()),
                    _ => None,
                },
                _ => None,
            })?;
            if code == "NetStream.Publish.Start" {
                Some(Ok(()))
            } else if code.contains("Failed") || code.contains("Error") || code.contains("BadName")
            {
                Some(Err(TransportError::ConnectFailed(format!(
                    "publish rejected: {code}"
                ))))
            } else {
                None
            }
        }
        _ => None,
    })
    .await??;

    Ok((stream, serializer, deserializer, stream_id))
}

/// Perform the client side of the RTMP handshake, returning any bytes the
/// server sent past its end.
async fn do_handshake(stream: &mut TcpStream) -> TransportResult<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Client);

    let p0_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| TransportError::ConnectFailed(format!("handshake generation: {e:?}")))?;
    stream.write_all(&p0_p1).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let read = timeout(CONNECT_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout("RTMP handshake"))??;
        if read == 0 {
            return Err(TransportError::ConnectFailed(
                "connection closed during handshake".into(),
            ));
        }

        match handshake.process_bytes(&buf[..read]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
                return Ok(remaining_bytes);
            }
            Err(e) => {
                return Err(TransportError::ConnectFailed(format!(
                    "handshake failed: {e:?}"
                )));
            }
        }
    }
}

/// Shared read/write state for the command phase.
struct MessagePump<'a> {
    stream: &'a mut TcpStream,
    serializer: &'a mut ChunkSerializer,
    deserializer: &'a mut ChunkDeserializer,
    pending: Vec<u8>,
}

impl MessagePump<'_> {
    async fn send(&mut self, message: RtmpMessage, stream_id: u32) -> TransportResult<()> {
        let payload = message
            .into_message_payload(RtmpTimestamp::new(0), stream_id)
            .map_err(|e| TransportError::Protocol(format!("{e:?}")))?;
        let packet = self
            .serializer
            .serialize(&payload, false, false)
            .map_err(|e| TransportError::Protocol(format!("{e:?}")))?;
        self.stream.write_all(&packet.bytes).await?;
        Ok(())
    }

    /// Read messages until `predicate` yields a value, answering protocol
    /// housekeeping (chunk size, pings) along the way.
    async fn wait_for<T>(
        &mut self,
        what: &'static str,
        mut predicate: impl FnMut(&RtmpMessage) -> Option<T>,
    ) -> TransportResult<T> {
        let mut buf = vec![0u8; 4096];
        loop {
            let mut input = std::mem::take(&mut self.pending);
            loop {
                let payload = self
                    .deserializer
                    .get_next_message(&input)
                    .map_err(|e| TransportError::Protocol(format!("{e:?}")))?;
                input.clear();

                let Some(payload) = payload else { break };
                let message = match payload.to_rtmp_message() {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(type_id = payload.type_id, "undecodable message: {e:?}");
                        continue;
                    }
                };
                self.handle_housekeeping(&message).await?;
                if let Some(value) = predicate(&message) {
                    return Ok(value);
                }
                trace!(?message, "ignoring message while waiting for {what}");
            }

            let read = timeout(CONNECT_TIMEOUT, self.stream.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout(what))??;
            if read == 0 {
                return Err(TransportError::ConnectFailed(format!(
                    "connection closed waiting for {what}"
                )));
            }
            self.pending = buf[..read].to_vec();
        }
    }

    async fn handle_housekeeping(&mut self, message: &RtmpMessage) -> TransportResult<()> {
        match message {
            RtmpMessage::SetChunkSize { size } => {
                debug!(size, "server chunk size");
                self.deserializer
                    .set_max_chunk_size(*size as usize)
                    .map_err(|e| TransportError::Protocol(format!("{e:?}")))?;
            }
            RtmpMessage::UserControl {
                event_type: UserControlEventType::PingRequest,
                timestamp,
                ..
            } => {
                let response = RtmpMessage::UserControl {
                    event_type: UserControlEventType::PingResponse,
                    stream_id: None,
                    buffer_length: None,
                    timestamp: *timestamp,
                };
                self.send(response, 0).await?;
            }
            RtmpMessage::WindowAcknowledgement { size } => {
                trace!(size, "window acknowledgement size");
            }
            RtmpMessage::SetPeerBandwidth { .. } => {}
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_url() {
        let target = parse_url("rtmp://live.example.com/app/stream1").unwrap();
        assert_eq!(
            target,
            RtmpTarget {
                host: "live.example.com".into(),
                port: DEFAULT_PORT,
                app: "app".into(),
                stream_key: "stream1".into(),
            }
        );
    }

    #[test]
    fn parses_port_nested_app_and_query() {
        let target = parse_url("rtmp://10.0.0.2:1936/live/ingest/key123?token=abc").unwrap();
        assert_eq!(target.port, 1936);
        assert_eq!(target.app, "live/ingest");
        assert_eq!(target.stream_key, "key123?token=abc");
    }

    #[test]
    fn rejects_other_schemes_and_short_paths() {
        assert!(parse_url("rtmps://host/app/stream").is_err());
        assert!(parse_url("http://host/app/stream").is_err());
        assert!(parse_url("rtmp://host/justapp").is_err());
        assert!(parse_url("not a url").is_err());
    }
}

//! Engine.IO v4 HTTP long-polling transport over blocking reqwest.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use reqwest::{StatusCode, blocking::Client, header::CONTENT_TYPE};
use serde_json::Value;

use super::{
    EventSink, EventSource,
    codec::{self, EnginePacket, OpenPayload, SocketPacket},
};
use crate::error::StreamError;

const ENGINE_PATH: &str = "/socket.io/";

#[derive(Clone, Debug)]
pub struct PollingOptions {
    /// Relay base URL, e.g. `http://localhost:5000`.
    pub server: String,
    pub request_timeout: Duration,
}

struct EngineSession {
    http: Client,
    url: String,
    open: OpenPayload,
    request_timeout: Duration,
    closed: AtomicBool,
    // The relay rejects overlapping POSTs on one session.
    post_lock: Mutex<()>,
}

impl EngineSession {
    fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.open.ping_interval + self.open.ping_timeout)
            + self.request_timeout
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn post(&self, packets: &[EnginePacket]) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let _guard = self.post_lock.lock();
        let response = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(codec::encode_payload(packets))
            .timeout(self.request_timeout)
            .send()?;
        check_status(response.status())?;
        Ok(())
    }

    fn get(&self) -> Result<Vec<EnginePacket>, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let response = self
            .http
            .get(&self.url)
            .timeout(self.long_poll_timeout())
            .send()?;
        check_status(response.status())?;
        codec::decode_payload(&response.text()?)
    }
}

fn check_status(status: StatusCode) -> Result<(), StreamError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::BAD_REQUEST {
        // Unknown or expired sid.
        Err(StreamError::Closed)
    } else {
        Err(StreamError::Status(status.as_u16()))
    }
}

fn engine_url(server: &str) -> String {
    format!(
        "{}{ENGINE_PATH}?EIO=4&transport=polling",
        server.trim_end_matches('/')
    )
}

/// Opens an Engine.IO session and joins the default Socket.IO namespace.
pub fn connect(options: &PollingOptions) -> Result<(PollingSink, PollingSource), StreamError> {
    let http = Client::builder().build()?;
    let base = engine_url(&options.server);

    let response = http.get(&base).timeout(options.request_timeout).send()?;
    check_status(response.status())?;
    let open = match codec::decode_payload(&response.text()?)?.into_iter().next() {
        Some(EnginePacket::Open(open)) => open,
        other => {
            return Err(StreamError::Protocol(format!(
                "expected open packet, got {other:?}"
            )));
        }
    };

    log::info!(
        "relay session {} opened (ping interval {} ms)",
        open.sid,
        open.ping_interval
    );
    log::debug!(
        "relay offers upgrades {:?}, max payload {:?}; staying on polling",
        open.upgrades,
        open.max_payload
    );

    let session = Arc::new(EngineSession {
        url: format!("{base}&sid={}", open.sid),
        http,
        open,
        request_timeout: options.request_timeout,
        closed: AtomicBool::new(false),
        post_lock: Mutex::new(()),
    });

    session.post(&[EnginePacket::Message(SocketPacket::Connect(None).encode()?)])?;

    // The namespace acknowledgement arrives on the next poll; anything else
    // in the same batch is kept for the first `poll` call.
    let mut pending = Vec::new();
    let mut connected = false;
    while !connected {
        for packet in session.get()? {
            match packet {
                EnginePacket::Message(raw) => match SocketPacket::decode(&raw)? {
                    SocketPacket::Connect(_) => connected = true,
                    SocketPacket::ConnectError(reason) => {
                        session.mark_closed();
                        return Err(StreamError::Protocol(format!(
                            "relay refused connection: {reason}"
                        )));
                    }
                    SocketPacket::Event { name, args } => pending.push((name, args)),
                    _ => {}
                },
                EnginePacket::Ping(data) => session.post(&[EnginePacket::Pong(data)])?,
                EnginePacket::Close => {
                    session.mark_closed();
                    return Err(StreamError::Closed);
                }
                _ => {}
            }
        }
    }

    Ok((
        PollingSink {
            session: session.clone(),
        },
        PollingSource { session, pending },
    ))
}

pub struct PollingSink {
    session: Arc<EngineSession>,
}

impl EventSink for PollingSink {
    fn emit(&mut self, name: &str, payload: &Value) -> Result<(), StreamError> {
        let packet = SocketPacket::event(name, payload)?;
        self.session.post(&[EnginePacket::Message(packet)])
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if self.session.is_closed() {
            return Ok(());
        }
        let result = self.session.post(&[
            EnginePacket::Message(SocketPacket::Disconnect.encode()?),
            EnginePacket::Close,
        ]);
        self.session.mark_closed();
        log::info!("relay session {} closed", self.session.open.sid);
        result
    }
}

pub struct PollingSource {
    session: Arc<EngineSession>,
    pending: Vec<(String, Vec<Value>)>,
}

impl EventSource for PollingSource {
    fn poll(&mut self) -> Result<Vec<(String, Vec<Value>)>, StreamError> {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }

        let mut events = Vec::new();
        let mut closed = false;
        for packet in self.session.get()? {
            match packet {
                EnginePacket::Ping(data) => self.session.post(&[EnginePacket::Pong(data)])?,
                EnginePacket::Close => closed = true,
                EnginePacket::Message(raw) => match SocketPacket::decode(&raw) {
                    Ok(SocketPacket::Event { name, args }) => events.push((name, args)),
                    Ok(SocketPacket::Disconnect) => closed = true,
                    Ok(other) => log::trace!("ignoring socket packet {other:?}"),
                    Err(err) => log::warn!("dropping undecodable relay packet: {err}"),
                },
                EnginePacket::Noop => {}
                other => log::trace!("ignoring engine packet {other:?}"),
            }
        }

        if closed {
            self.session.mark_closed();
            if events.is_empty() {
                return Err(StreamError::Closed);
            }
        }
        Ok(events)
    }
}

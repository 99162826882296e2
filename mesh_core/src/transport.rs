//! C5 — the service handoff protocol.
//!
//! The wire framing (4-byte big-endian length prefix, then that many bytes)
//! and the token/JSON vocabulary live here; actual sockets are supplied by
//! the caller through [`Connection`] so this crate never touches
//! `std::net` directly.

use crate::error::TransportError;
use crate::types::ServiceId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Status tokens exchanged over the transport connection. Serialized as the
/// literal ASCII bytes named in the external interface, not as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Accepted,
    Okay,
    Conflict,
    NotFound,
    TransportError,
    InternalServerError,
    Locked,
    ServiceUnavailable,
    GatewayTimedOut,
}

impl Token {
    fn as_str(self) -> &'static str {
        match self {
            Token::Accepted => "ACCEPTED",
            Token::Okay => "OKAY",
            Token::Conflict => "CONFLICT",
            Token::NotFound => "NOT_FOUND",
            Token::TransportError => "TRANSPORT_ERROR",
            Token::InternalServerError => "INTERNAL_SERVER_ERROR",
            Token::Locked => "LOCKED",
            Token::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Token::GatewayTimedOut => "GATEWAY_TIMED_OUT",
        }
    }

    fn parse(bytes: &[u8]) -> Option<Token> {
        match bytes {
            b"ACCEPTED" => Some(Token::Accepted),
            b"OKAY" => Some(Token::Okay),
            b"CONFLICT" => Some(Token::Conflict),
            b"NOT_FOUND" => Some(Token::NotFound),
            b"TRANSPORT_ERROR" => Some(Token::TransportError),
            b"INTERNAL_SERVER_ERROR" => Some(Token::InternalServerError),
            b"LOCKED" => Some(Token::Locked),
            b"SERVICE_UNAVAILABLE" => Some(Token::ServiceUnavailable),
            b"GATEWAY_TIMED_OUT" => Some(Token::GatewayTimedOut),
            _ => None,
        }
    }
}

/// The handoff payload: the service generation counter, its discovered
/// ports, and the raw executable bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePayload {
    pub counter: ServiceId,
    pub ports: HashSet<u16>,
    pub service: Vec<u8>,
}

/// A framed, timeout-capable duplex byte stream. `mesh_runtime` implements
/// this over `std::net::TcpStream`; tests implement it over an in-memory
/// pipe.
pub trait Connection: Read + Write + Send {
    /// Sets the read/write deadline used for every subsequent framed
    /// operation on this connection.
    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()>;
}

fn write_frame(conn: &mut dyn Connection, bytes: &[u8]) -> Result<(), TransportError> {
    let len = (bytes.len() as u32).to_be_bytes();
    conn.write_all(&len).map_err(|e| TransportError::Io(e.to_string()))?;
    conn.write_all(bytes).map_err(|e| TransportError::Io(e.to_string()))
}

fn read_frame(conn: &mut dyn Connection) -> Result<Vec<u8>, TransportError> {
    let mut len_bytes = [0u8; 4];
    conn.read_exact(&mut len_bytes).map_err(|e| TransportError::Io(e.to_string()))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(TransportError::TransportError);
    }
    let mut buf = vec![0u8; len];
    conn.read_exact(&mut buf).map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(buf)
}

fn write_token(conn: &mut dyn Connection, token: Token) -> Result<(), TransportError> {
    write_frame(conn, token.as_str().as_bytes())
}

fn read_token(conn: &mut dyn Connection) -> Result<Token, TransportError> {
    let bytes = read_frame(conn)?;
    Token::parse(&bytes).ok_or(TransportError::TransportError)
}

const GLOBAL_TIMEOUT: Duration = Duration::from_secs(180);
const CONNECT_RETRIES: u32 = 10;

/// Either end of a send: who the candidate is, and how to open a fresh
/// connection to it. Kept abstract so `mesh_core` never has to resolve a
/// node ID to an IP address itself.
pub trait Dialer: std::fmt::Debug + Send + Sync {
    /// Opens a new connection to `node`, or `None` on a connect-level
    /// failure (the caller retries up to the fixed retry budget).
    fn dial(&self, node: crate::types::NodeId) -> Option<Box<dyn Connection>>;
}

/// One outcome of accepting a connection on the receive side, handed to the
/// mediator so it can drive the service handler and report back.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A well-formed payload was persisted; the mediator should attempt to
    /// start the service and report back whether it came up.
    Received(ServicePayload),
    /// The connection was rejected or failed before any payload arrived.
    /// `attempted` is `true` when the handshake had already moved status to
    /// `InTransmission` (a framed read was attempted and failed or the body
    /// was malformed), in which case the mediator must reset the service
    /// state; `false` when rejected immediately (already running, or the
    /// receive lock was held) and nothing changed.
    Rejected { attempted: bool },
}

/// Runs the at-most-one-outstanding send protocol and the at-most-one-active
/// receive handshake described in the handoff design.
#[derive(Debug)]
pub struct Transporter {
    sending: AtomicBool,
    receiving: AtomicBool,
}

impl Default for Transporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Transporter {
    pub fn new() -> Self {
        Transporter { sending: AtomicBool::new(false), receiving: AtomicBool::new(false) }
    }

    /// Tries to send `payload` to each candidate in `ranked` in order,
    /// stopping at the first accepted connection, a `CONFLICT`, or
    /// exhausting the list. Returns `Locked` immediately if a send is
    /// already in progress elsewhere.
    pub fn send(
        &self,
        dialer: &dyn Dialer,
        ranked: &[crate::types::NodeId],
        own_service_id: ServiceId,
        ports: HashSet<u16>,
        service_bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        if self.sending.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            return Err(TransportError::Locked);
        }
        let result = self.send_locked(dialer, ranked, own_service_id, ports, service_bytes);
        self.sending.store(false, Ordering::SeqCst);
        result
    }

    fn send_locked(
        &self,
        dialer: &dyn Dialer,
        ranked: &[crate::types::NodeId],
        own_service_id: ServiceId,
        ports: HashSet<u16>,
        service_bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        for &candidate in ranked {
            let mut conn = match self.connect_with_retries(dialer, candidate) {
                Some(conn) => conn,
                None => continue,
            };
            if conn.set_timeout(GLOBAL_TIMEOUT).is_err() {
                continue;
            }

            match read_token(&mut *conn) {
                Ok(Token::Accepted) => {
                    let payload = ServicePayload {
                        counter: own_service_id + 1,
                        ports: ports.clone(),
                        service: service_bytes.clone(),
                    };
                    let body = serde_json::to_vec(&payload)
                        .map_err(|_| TransportError::TransportError)?;
                    write_frame(&mut *conn, &body)?;
                    return match read_token(&mut *conn) {
                        Ok(Token::Okay) => Ok(()),
                        Ok(Token::InternalServerError) => {
                            Err(TransportError::InternalServerError)
                        }
                        _ => Err(TransportError::TransportError),
                    };
                }
                Ok(Token::Conflict) => return Err(TransportError::Conflict),
                _ => continue,
            }
        }
        Err(TransportError::NotFound)
    }

    fn connect_with_retries(
        &self,
        dialer: &dyn Dialer,
        candidate: crate::types::NodeId,
    ) -> Option<Box<dyn Connection>> {
        for _ in 0..CONNECT_RETRIES {
            if let Some(conn) = dialer.dial(candidate) {
                return Some(conn);
            }
        }
        None
    }

    /// Handles one accepted connection on the receive side. `current_status`
    /// reflects the service handler's status at the moment of accept;
    /// `on_accepted` is called right after the `ACCEPTED` token is sent,
    /// before anything is read, so the caller can move status to
    /// `InTransmission` at the same point the wire protocol does (§4.5 step
    /// 3); `persist` is called with the parsed payload if one arrives
    /// successfully, and should write the service bytes to disk and update
    /// the service config. Returns what the mediator should do next; the
    /// caller is responsible for writing the final `OKAY` /
    /// `INTERNAL_SERVER_ERROR` token once the mediator resolves the start.
    pub fn accept<A, F>(
        &self,
        conn: &mut dyn Connection,
        already_running: bool,
        on_accepted: A,
        persist: F,
    ) -> Result<ReceiveOutcome, TransportError>
    where
        A: FnOnce(),
        F: FnOnce(&ServicePayload),
    {
        if already_running {
            write_token(conn, Token::Conflict)?;
            return Ok(ReceiveOutcome::Rejected { attempted: false });
        }
        if self.receiving.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            write_token(conn, Token::Conflict)?;
            return Ok(ReceiveOutcome::Rejected { attempted: false });
        }
        let result = self.accept_locked(conn, on_accepted, persist);
        self.receiving.store(false, Ordering::SeqCst);
        result
    }

    fn accept_locked<A, F>(
        &self,
        conn: &mut dyn Connection,
        on_accepted: A,
        persist: F,
    ) -> Result<ReceiveOutcome, TransportError>
    where
        A: FnOnce(),
        F: FnOnce(&ServicePayload),
    {
        conn.set_timeout(GLOBAL_TIMEOUT).map_err(|e| TransportError::Io(e.to_string()))?;
        write_token(conn, Token::Accepted)?;
        on_accepted();

        let body = match read_frame(conn) {
            Ok(body) if !body.is_empty() => body,
            _ => {
                write_token(conn, Token::TransportError)?;
                return Ok(ReceiveOutcome::Rejected { attempted: true });
            }
        };
        let payload: ServicePayload = match serde_json::from_slice::<ServicePayload>(&body) {
            Ok(payload) if !payload.service.is_empty() => payload,
            _ => {
                write_token(conn, Token::TransportError)?;
                return Ok(ReceiveOutcome::Rejected { attempted: true });
            }
        };
        persist(&payload);
        Ok(ReceiveOutcome::Received(payload))
    }

    /// Sends the final token back to a receive-side peer once the mediator
    /// knows whether the service actually came up.
    pub fn respond_final(
        &self,
        conn: &mut dyn Connection,
        started: bool,
    ) -> Result<(), TransportError> {
        write_token(conn, if started { Token::Okay } else { Token::InternalServerError })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// An in-memory duplex pipe standing in for a TCP connection in tests:
    /// writes on one end become reads on the other.
    #[derive(Debug)]
    struct PipeEnd {
        inbound: std::sync::Arc<Mutex<VecDeque<u8>>>,
        outbound: std::sync::Arc<Mutex<VecDeque<u8>>>,
    }

    impl Read for PipeEnd {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            loop {
                let mut inbound = self.inbound.lock().unwrap();
                if !inbound.is_empty() {
                    let n = buf.len().min(inbound.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = inbound.pop_front().unwrap();
                    }
                    return Ok(n);
                }
                drop(inbound);
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    impl Write for PipeEnd {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.lock().unwrap().extend(buf.iter().copied());
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    impl Connection for PipeEnd {
        fn set_timeout(&mut self, _timeout: Duration) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn pipe() -> (PipeEnd, PipeEnd) {
        let a_to_b = std::sync::Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a = std::sync::Arc::new(Mutex::new(VecDeque::new()));
        (
            PipeEnd { inbound: b_to_a.clone(), outbound: a_to_b.clone() },
            PipeEnd { inbound: a_to_b, outbound: b_to_a },
        )
    }

    #[test]
    fn accept_rejects_when_already_running() {
        let (mut server, mut client) = pipe();
        let transporter = Transporter::new();
        let outcome = transporter.accept(&mut server, true, || {}, |_| {}).unwrap();
        assert!(matches!(outcome, ReceiveOutcome::Rejected { attempted: false }));
        assert_eq!(read_token(&mut client).unwrap(), Token::Conflict);
    }

    #[test]
    fn accept_persists_well_formed_payload() {
        let (mut server, mut client) = pipe();
        let transporter = Transporter::new();

        let handle = std::thread::spawn(move || transporter.accept(
            &mut server,
            false,
            || {},
            |payload| assert_eq!(payload.counter, 8),
        ));

        assert_eq!(read_token(&mut client).unwrap(), Token::Accepted);
        let payload = ServicePayload { counter: 8, ports: [9000].into_iter().collect(), service: vec![1, 2, 3] };
        write_frame(&mut client, &serde_json::to_vec(&payload).unwrap()).unwrap();

        let outcome = handle.join().unwrap().unwrap();
        match outcome {
            ReceiveOutcome::Received(p) => assert_eq!(p.service, vec![1, 2, 3]),
            ReceiveOutcome::Rejected { .. } => panic!("expected Received"),
        }
    }

    #[test]
    fn accept_rejects_empty_body() {
        let (mut server, mut client) = pipe();
        let transporter = Transporter::new();

        let handle = std::thread::spawn(move || transporter.accept(&mut server, false, || {}, |_| {}));
        assert_eq!(read_token(&mut client).unwrap(), Token::Accepted);
        write_frame(&mut client, b"{}").unwrap();

        let outcome = handle.join().unwrap().unwrap();
        assert!(matches!(outcome, ReceiveOutcome::Rejected { attempted: true }));
        assert_eq!(read_token(&mut client).unwrap(), Token::TransportError);
    }

    #[test]
    fn accept_sets_in_transmission_before_reading_payload() {
        let (mut server, mut client) = pipe();
        let transporter = Transporter::new();
        let moved = Arc::new(AtomicBool::new(false));
        let moved_in_thread = Arc::clone(&moved);

        let handle = std::thread::spawn(move || {
            transporter.accept(&mut server, false, move || moved_in_thread.store(true, Ordering::SeqCst), |_| {})
        });

        assert_eq!(read_token(&mut client).unwrap(), Token::Accepted);
        assert!(moved.load(Ordering::SeqCst), "status must move to InTransmission before the payload is read");
        let payload = ServicePayload { counter: 1, ports: HashSet::new(), service: vec![9] };
        write_frame(&mut client, &serde_json::to_vec(&payload).unwrap()).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[derive(Debug)]
    struct StaticDialer {
        conns: Mutex<Vec<Option<PipeEnd>>>,
    }
    impl Dialer for StaticDialer {
        fn dial(&self, node: crate::types::NodeId) -> Option<Box<dyn Connection>> {
            let mut conns = self.conns.lock().unwrap();
            conns.get_mut(node as usize)?.take().map(|c| Box::new(c) as Box<dyn Connection>)
        }
    }

    #[test]
    fn send_returns_conflict_without_trying_next_candidate() {
        let (mut b_server, b_client) = pipe();
        let dialer =
            StaticDialer { conns: Mutex::new(vec![None, None, Some(b_client), None]) };

        let server_thread = std::thread::spawn(move || {
            write_token(&mut b_server, Token::Conflict).unwrap();
        });

        let transporter = Transporter::new();
        let result = transporter.send(&dialer, &[2, 3], 7, HashSet::new(), vec![1]);
        server_thread.join().unwrap();
        assert_eq!(result, Err(TransportError::Conflict));
    }

    #[test]
    fn send_returns_not_found_when_no_candidate_dials() {
        let dialer = StaticDialer { conns: Mutex::new(vec![None, None, None]) };
        let transporter = Transporter::new();
        let result = transporter.send(&dialer, &[1, 2], 7, HashSet::new(), vec![1]);
        assert_eq!(result, Err(TransportError::NotFound));
    }

    #[test]
    fn locked_send_rejects_concurrent_attempt() {
        let transporter = Transporter::new();
        transporter.sending.store(true, Ordering::SeqCst);
        let dialer = StaticDialer { conns: Mutex::new(vec![None, None]) };
        let result = transporter.send(&dialer, &[1], 7, HashSet::new(), vec![1]);
        assert_eq!(result, Err(TransportError::Locked));
    }
}

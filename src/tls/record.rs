//! Record layer: framing, protection and alert handling on a [`Socket`].
//!
//! # Responsibilities
//! - Frame outgoing data as records, encrypting once a send key is set
//! - Read one record at a time, decrypt it and check its content type
//! - Reassemble handshake messages that span records (or share one)
//! - Turn received alerts into a close reason and protocol failures into
//!   an outgoing alert followed by a transport close

use crate::error::NetError;
use crate::net::socket::{RecvCallback, Socket};
use crate::observability::metrics;
use crate::tls::alert::{Alert, AlertDescription};
use crate::tls::wire::{self, ContentType, RecordHeader, HANDSHAKE_HEADER_LEN, RECORD_HEADER_LEN};

/// Largest handshake message we are willing to buffer.
pub const MAX_HANDSHAKE_LEN: usize = 1 << 18;

/// Continuation receiving one complete handshake message: its type byte
/// and its raw bytes, header included.
pub(crate) type HandshakeCallback = Box<dyn FnOnce(&mut Socket, u8, Vec<u8>) + Send>;

impl Socket {
    /// Send one record, encrypted if a send key is active. A failure to
    /// protect the record is fatal to the connection.
    pub fn tls_send_record(&mut self, content_type: ContentType, data: &[u8]) -> Result<(), NetError> {
        match self.write_record(content_type, data) {
            Err(RecordError::Protect(alert)) => {
                self.tls_close(alert);
                Err(NetError::NotConnected)
            }
            Err(RecordError::Net(err)) => Err(err),
            Ok(()) => Ok(()),
        }
    }

    fn write_record(&mut self, content_type: ContentType, data: &[u8]) -> Result<(), RecordError> {
        let body = if self.tls_send.is_active() {
            self.tls_send.encrypt(content_type, data).map_err(RecordError::Protect)?
        } else {
            data.to_vec()
        };
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
        record.extend_from_slice(&RecordHeader::new(content_type, body.len()).encode());
        record.extend_from_slice(&body);
        self.transport_send(&record).map_err(RecordError::Net)
    }

    /// Receive one record of type `expected` and pass its plaintext to `cb`.
    ///
    /// An alert from the peer ends the connection: the close reason names
    /// the alert and `cb` gets an empty buffer if
    /// [`callback_recv_on_close`](Socket::callback_recv_on_close) is set.
    /// Any other unexpected type is answered with `unexpected_message`.
    pub fn tls_recv_record(&mut self, expected: ContentType, cb: RecvCallback) {
        self.transport_recv_exact(
            RECORD_HEADER_LEN,
            Box::new(move |s: &mut Socket, header: Vec<u8>| {
                if header.len() < RECORD_HEADER_LEN {
                    s.deliver_close(cb);
                    return;
                }
                let header = match RecordHeader::decode(&header) {
                    Ok(header) => header,
                    Err(alert) => return s.tls_close(alert),
                };
                let length = header.length as usize;
                s.transport_recv_exact(
                    length,
                    Box::new(move |s: &mut Socket, body: Vec<u8>| {
                        if body.len() != length {
                            s.deliver_close(cb);
                            return;
                        }
                        let plaintext = if s.tls_recv.is_active() {
                            match s.tls_recv.decrypt(header.content_type, body) {
                                Ok(plaintext) => plaintext,
                                Err(alert) => return s.tls_close(alert),
                            }
                        } else {
                            body
                        };
                        s.dispatch_record(expected, header.content_type, plaintext, cb);
                    }),
                );
            }),
        );
    }

    fn dispatch_record(&mut self, expected: ContentType, actual: ContentType, plaintext: Vec<u8>, cb: RecvCallback) {
        if actual == expected {
            cb(self, plaintext);
            return;
        }

        let handshaking = self.handshaker.is_some();
        if actual == ContentType::Alert {
            let alert = match Alert::parse(&plaintext) {
                Ok(alert) => alert,
                Err(desc) => return self.tls_close(desc),
            };
            metrics::alert_received();
            self.last_alert_received = Some(alert.description);
            self.close_reason = Some(alert.close_reason());
            tracing::debug!(
                peer = %self.describe(),
                alert = alert.description,
                fatal = alert.is_fatal(),
                "Received TLS alert"
            );
            if handshaking {
                return self.tls_close(AlertDescription::UnexpectedMessage);
            }
            self.remote_closed = true;
            self.close();
            self.deliver_close(cb);
            return;
        }

        if handshaking {
            self.close_reason = Some(format!("Unexpected content type during handshake: {}", actual as u8));
        }
        self.tls_close(AlertDescription::UnexpectedMessage);
    }

    /// Next non-empty application data record.
    pub(crate) fn tls_recv_application_data(&mut self, cb: RecvCallback) {
        self.tls_recv_record(
            ContentType::ApplicationData,
            Box::new(move |s: &mut Socket, data: Vec<u8>| {
                if data.is_empty() && s.has_connection() && !s.remote_closed {
                    return s.tls_recv_application_data(cb);
                }
                cb(s, data);
            }),
        );
    }

    /// Receive one complete handshake message.
    ///
    /// Bytes following the message in the same record are kept for the
    /// next call: pushed back as a synthetic plaintext record while reads
    /// are unencrypted, or held in the carry buffer otherwise.
    pub(crate) fn tls_recv_handshake(&mut self, cb: HandshakeCallback) {
        let pending = std::mem::take(&mut self.handshake_carry);
        self.recv_handshake_with(pending, cb);
    }

    fn recv_handshake_with(&mut self, mut pending: Vec<u8>, cb: HandshakeCallback) {
        if pending.len() >= HANDSHAKE_HEADER_LEN {
            let (handshake_type, length) = match wire::decode_handshake_header(&pending) {
                Ok(header) => header,
                Err(alert) => return self.tls_close(alert),
            };
            if length > MAX_HANDSHAKE_LEN {
                return self.tls_close(AlertDescription::RecordOverflow);
            }
            let total = HANDSHAKE_HEADER_LEN + length;
            if pending.len() >= total {
                let rest = pending.split_off(total);
                self.stash_handshake_leftover(rest);
                cb(self, handshake_type, pending);
                return;
            }
        }

        self.tls_recv_record(
            ContentType::Handshake,
            Box::new(move |s: &mut Socket, data: Vec<u8>| {
                if data.is_empty() {
                    // Zero-length handshake fragments are not allowed.
                    if s.has_connection() && !s.remote_closed {
                        s.tls_close(AlertDescription::UnexpectedMessage);
                    }
                    return;
                }
                let mut pending = pending;
                pending.extend_from_slice(&data);
                s.recv_handshake_with(pending, cb);
            }),
        );
    }

    fn stash_handshake_leftover(&mut self, rest: Vec<u8>) {
        if rest.is_empty() {
            return;
        }
        if self.tls_recv.is_active() {
            self.handshake_carry = rest;
            return;
        }
        let mut record = RecordHeader::new(ContentType::Handshake, rest.len()).encode().to_vec();
        record.extend_from_slice(&rest);
        self.transport_unrecv(record);
    }

    /// Abort the connection: send `desc` (best effort), drop all keys and
    /// close the transport.
    pub fn tls_close(&mut self, desc: AlertDescription) {
        if self.has_connection() {
            if desc != AlertDescription::CloseNotify {
                if self.close_reason.is_none() {
                    self.close_reason = Some("TLS protocol error".to_string());
                }
                metrics::alert_sent(desc.as_str());
                tracing::debug!(peer = %self.describe(), alert = ?desc, "Sending TLS alert");
            }
            self.last_alert_sent = Some(desc);
            if let Err(err) = self.write_record(ContentType::Alert, &desc.to_record_body()) {
                tracing::trace!(peer = %self.describe(), error = ?err, "Could not send alert");
            }
        }
        if let Some(handshaker) = self.handshaker.take() {
            handshaker.record_outcome("failed");
        }
        self.tls_send.reset();
        self.tls_recv.reset();
        self.handshake_carry.clear();
        self.deadline = None;
        self.transport_close();
    }
}

#[derive(Debug)]
enum RecordError {
    /// The record could not be encrypted.
    Protect(AlertDescription),
    Net(NetError),
}

//! TLS alerts.
//!
//! Every protocol failure in the handshake or record layer resolves to one
//! [`AlertDescription`], which is sent to the peer as a fatal alert before
//! the transport is closed.

use thiserror::Error;

/// Alert level byte for fatal alerts.
pub const LEVEL_FATAL: u8 = 2;
/// Alert level byte for warnings.
pub const LEVEL_WARNING: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum AlertDescription {
    #[error("close notify")]
    CloseNotify = 0,
    #[error("unexpected message")]
    UnexpectedMessage = 10,
    #[error("bad record MAC")]
    BadRecordMac = 20,
    #[error("record overflow")]
    RecordOverflow = 22,
    #[error("handshake failure")]
    HandshakeFailure = 40,
    #[error("bad certificate")]
    BadCertificate = 42,
    #[error("unsupported certificate")]
    UnsupportedCertificate = 43,
    #[error("certificate expired")]
    CertificateExpired = 45,
    #[error("certificate unknown")]
    CertificateUnknown = 46,
    #[error("illegal parameter")]
    IllegalParameter = 47,
    #[error("unknown CA")]
    UnknownCa = 48,
    #[error("decode error")]
    DecodeError = 50,
    #[error("decrypt error")]
    DecryptError = 51,
    #[error("protocol version")]
    ProtocolVersion = 70,
    #[error("internal error")]
    InternalError = 80,
    #[error("unsupported extension")]
    UnsupportedExtension = 110,
    #[error("unrecognized name")]
    UnrecognizedName = 112,
}

impl AlertDescription {
    pub fn from_u8(value: u8) -> Option<Self> {
        use AlertDescription::*;
        Some(match value {
            0 => CloseNotify,
            10 => UnexpectedMessage,
            20 => BadRecordMac,
            22 => RecordOverflow,
            40 => HandshakeFailure,
            42 => BadCertificate,
            43 => UnsupportedCertificate,
            45 => CertificateExpired,
            46 => CertificateUnknown,
            47 => IllegalParameter,
            48 => UnknownCa,
            50 => DecodeError,
            51 => DecryptError,
            70 => ProtocolVersion,
            80 => InternalError,
            110 => UnsupportedExtension,
            112 => UnrecognizedName,
            _ => return None,
        })
    }

    /// Stable snake_case name, used as a metrics label.
    pub fn as_str(self) -> &'static str {
        use AlertDescription::*;
        match self {
            CloseNotify => "close_notify",
            UnexpectedMessage => "unexpected_message",
            BadRecordMac => "bad_record_mac",
            RecordOverflow => "record_overflow",
            HandshakeFailure => "handshake_failure",
            BadCertificate => "bad_certificate",
            UnsupportedCertificate => "unsupported_certificate",
            CertificateExpired => "certificate_expired",
            CertificateUnknown => "certificate_unknown",
            IllegalParameter => "illegal_parameter",
            UnknownCa => "unknown_ca",
            DecodeError => "decode_error",
            DecryptError => "decrypt_error",
            ProtocolVersion => "protocol_version",
            InternalError => "internal_error",
            UnsupportedExtension => "unsupported_extension",
            UnrecognizedName => "unrecognized_name",
        }
    }

    /// The two-byte alert record body we send: always fatal, except for
    /// close_notify which is a warning.
    pub fn to_record_body(self) -> [u8; 2] {
        let level = if self == AlertDescription::CloseNotify {
            LEVEL_WARNING
        } else {
            LEVEL_FATAL
        };
        [level, self as u8]
    }
}

/// An alert received from the peer. The description is kept raw since
/// peers may send values we do not name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: u8,
    pub description: u8,
}

impl Alert {
    pub fn parse(body: &[u8]) -> Result<Self, AlertDescription> {
        match body {
            [level, description] => Ok(Self {
                level: *level,
                description: *description,
            }),
            _ => Err(AlertDescription::DecodeError),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.level == LEVEL_FATAL
    }

    pub fn description(&self) -> Option<AlertDescription> {
        AlertDescription::from_u8(self.description)
    }

    pub fn is_close_notify(&self) -> bool {
        self.description == AlertDescription::CloseNotify as u8
    }

    /// Human-readable close reason recorded on the socket.
    pub fn close_reason(&self) -> String {
        format!(
            "Received {}TLS alert: {}",
            if self.is_fatal() { "fatal " } else { "" },
            self.description
        )
    }
}

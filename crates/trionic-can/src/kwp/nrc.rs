//! KWP2000 Negative Response Codes (NRC)

use std::fmt;

/// KWP2000 Negative Response Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RoutineNotComplete,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    DownloadNotAccepted,
    UploadNotAccepted,
    TransferSuspended,
    TransferAborted,
    IllegalAddressInBlockTransfer,
    IllegalByteCountInBlockTransfer,
    ResponsePending,
    ServiceNotSupportedInActiveMode,

    /// Unknown/manufacturer specific NRC
    Unknown(u8),
}

impl NegativeResponseCode {
    /// Whether the ECU is refusing further seed/key attempts
    pub fn is_lockout(&self) -> bool {
        matches!(
            self,
            Self::ExceededNumberOfAttempts | Self::RequiredTimeDelayNotExpired
        )
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x23 => Self::RoutineNotComplete,
            0x24 => Self::RequestSequenceError,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceededNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x40 => Self::DownloadNotAccepted,
            0x50 => Self::UploadNotAccepted,
            0x71 => Self::TransferSuspended,
            0x72 => Self::TransferAborted,
            0x74 => Self::IllegalAddressInBlockTransfer,
            0x75 => Self::IllegalByteCountInBlockTransfer,
            0x78 => Self::ResponsePending,
            0x80 => Self::ServiceNotSupportedInActiveMode,
            other => Self::Unknown(other),
        }
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        match nrc {
            NegativeResponseCode::GeneralReject => 0x10,
            NegativeResponseCode::ServiceNotSupported => 0x11,
            NegativeResponseCode::SubFunctionNotSupported => 0x12,
            NegativeResponseCode::BusyRepeatRequest => 0x21,
            NegativeResponseCode::ConditionsNotCorrect => 0x22,
            NegativeResponseCode::RoutineNotComplete => 0x23,
            NegativeResponseCode::RequestSequenceError => 0x24,
            NegativeResponseCode::RequestOutOfRange => 0x31,
            NegativeResponseCode::SecurityAccessDenied => 0x33,
            NegativeResponseCode::InvalidKey => 0x35,
            NegativeResponseCode::ExceededNumberOfAttempts => 0x36,
            NegativeResponseCode::RequiredTimeDelayNotExpired => 0x37,
            NegativeResponseCode::DownloadNotAccepted => 0x40,
            NegativeResponseCode::UploadNotAccepted => 0x50,
            NegativeResponseCode::TransferSuspended => 0x71,
            NegativeResponseCode::TransferAborted => 0x72,
            NegativeResponseCode::IllegalAddressInBlockTransfer => 0x74,
            NegativeResponseCode::IllegalByteCountInBlockTransfer => 0x75,
            NegativeResponseCode::ResponsePending => 0x78,
            NegativeResponseCode::ServiceNotSupportedInActiveMode => 0x80,
            NegativeResponseCode::Unknown(v) => v,
        }
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GeneralReject => write!(f, "GeneralReject"),
            Self::ServiceNotSupported => write!(f, "ServiceNotSupported"),
            Self::SubFunctionNotSupported => write!(f, "SubFunctionNotSupported"),
            Self::BusyRepeatRequest => write!(f, "BusyRepeatRequest"),
            Self::ConditionsNotCorrect => write!(f, "ConditionsNotCorrect"),
            Self::RoutineNotComplete => write!(f, "RoutineNotComplete"),
            Self::RequestSequenceError => write!(f, "RequestSequenceError"),
            Self::RequestOutOfRange => write!(f, "RequestOutOfRange"),
            Self::SecurityAccessDenied => write!(f, "SecurityAccessDenied"),
            Self::InvalidKey => write!(f, "InvalidKey"),
            Self::ExceededNumberOfAttempts => write!(f, "ExceededNumberOfAttempts"),
            Self::RequiredTimeDelayNotExpired => write!(f, "RequiredTimeDelayNotExpired"),
            Self::DownloadNotAccepted => write!(f, "DownloadNotAccepted"),
            Self::UploadNotAccepted => write!(f, "UploadNotAccepted"),
            Self::TransferSuspended => write!(f, "TransferSuspended"),
            Self::TransferAborted => write!(f, "TransferAborted"),
            Self::IllegalAddressInBlockTransfer => write!(f, "IllegalAddressInBlockTransfer"),
            Self::IllegalByteCountInBlockTransfer => write!(f, "IllegalByteCountInBlockTransfer"),
            Self::ResponsePending => write!(f, "ResponsePending"),
            Self::ServiceNotSupportedInActiveMode => write!(f, "ServiceNotSupportedInActiveMode"),
            Self::Unknown(v) => write!(f, "Unknown(0x{:02X})", v),
        }
    }
}

//! UDS Negative Response Codes (ISO 14229-1 Annex A)

use std::fmt;

macro_rules! nrc_table {
    ($($variant:ident = $code:literal => $text:literal,)*) => {
        /// UDS Negative Response Code carried in `0x7F <sid> <nrc>`
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NegativeResponseCode {
            $($variant,)*
            /// Reserved or manufacturer-specific code
            Unknown(u8),
        }

        impl NegativeResponseCode {
            pub fn as_u8(self) -> u8 {
                match self {
                    $(Self::$variant => $code,)*
                    Self::Unknown(code) => code,
                }
            }

            /// Human-readable ISO name of the code
            pub fn description(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)*
                    Self::Unknown(_) => "unknown",
                }
            }
        }

        impl From<u8> for NegativeResponseCode {
            fn from(value: u8) -> Self {
                match value {
                    $($code => Self::$variant,)*
                    other => Self::Unknown(other),
                }
            }
        }
    };
}

nrc_table! {
    GeneralReject = 0x10 => "generalReject",
    ServiceNotSupported = 0x11 => "serviceNotSupported",
    SubFunctionNotSupported = 0x12 => "subFunctionNotSupported",
    IncorrectMessageLengthOrFormat = 0x13 => "incorrectMessageLengthOrInvalidFormat",
    ResponseTooLong = 0x14 => "responseTooLong",
    BusyRepeatRequest = 0x21 => "busyRepeatRequest",
    ConditionsNotCorrect = 0x22 => "conditionsNotCorrect",
    RequestSequenceError = 0x24 => "requestSequenceError",
    NoResponseFromSubnet = 0x25 => "noResponseFromSubnetComponent",
    FailurePreventsExecution = 0x26 => "failurePreventsExecutionOfRequestedAction",
    RequestOutOfRange = 0x31 => "requestOutOfRange",
    SecurityAccessDenied = 0x33 => "securityAccessDenied",
    AuthenticationRequired = 0x34 => "authenticationRequired",
    InvalidKey = 0x35 => "invalidKey",
    ExceededNumberOfAttempts = 0x36 => "exceededNumberOfAttempts",
    RequiredTimeDelayNotExpired = 0x37 => "requiredTimeDelayNotExpired",
    UploadDownloadNotAccepted = 0x70 => "uploadDownloadNotAccepted",
    TransferDataSuspended = 0x71 => "transferDataSuspended",
    GeneralProgrammingFailure = 0x72 => "generalProgrammingFailure",
    WrongBlockSequenceCounter = 0x73 => "wrongBlockSequenceCounter",
    ResponsePending = 0x78 => "requestCorrectlyReceived-ResponsePending",
    SubFunctionNotSupportedInActiveSession = 0x7E => "subFunctionNotSupportedInActiveSession",
    ServiceNotSupportedInActiveSession = 0x7F => "serviceNotSupportedInActiveSession",
    RpmTooHigh = 0x81 => "rpmTooHigh",
    RpmTooLow = 0x82 => "rpmTooLow",
    EngineRunning = 0x83 => "engineIsRunning",
    EngineNotRunning = 0x84 => "engineIsNotRunning",
    EngineRunTimeTooLow = 0x85 => "engineRunTimeTooLow",
    TemperatureTooHigh = 0x86 => "temperatureTooHigh",
    TemperatureTooLow = 0x87 => "temperatureTooLow",
    VehicleSpeedTooHigh = 0x88 => "vehicleSpeedTooHigh",
    VehicleSpeedTooLow = 0x89 => "vehicleSpeedTooLow",
    ThrottleTooHigh = 0x8A => "throttle/PedalTooHigh",
    ThrottleTooLow = 0x8B => "throttle/PedalTooLow",
    TransmissionNotInNeutral = 0x8C => "transmissionRangeNotInNeutral",
    TransmissionNotInGear = 0x8D => "transmissionRangeNotInGear",
    BrakeSwitchNotClosed = 0x8F => "brakeSwitch(es)NotClosed",
    ShifterNotInPark = 0x90 => "shifterLeverNotInPark",
    TorqueConverterClutchLocked = 0x91 => "torqueConverterClutchLocked",
    VoltageTooHigh = 0x92 => "voltageTooHigh",
    VoltageTooLow = 0x93 => "voltageTooLow",
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        nrc.as_u8()
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.as_u8(), f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown(0x{:02X})", code),
            other => f.write_str(other.description()),
        }
    }
}

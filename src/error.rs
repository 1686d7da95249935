// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

use std::error;
use std::fmt;

// Cycle-local transient codes
pub(crate) const CYC_TELEGRAM_OVERRUN: i32 = 0x0001;
pub(crate) const CYC_TOPOLOGY_CHANGE: i32 = 0x0002;
pub(crate) const CYC_NO_LINK_ATTACHED: i32 = 0x0003;
pub(crate) const CYC_NO_TELEGRAMS_RECEIVED: i32 = 0x0004;
pub(crate) const CYC_MST_MISS: i32 = 0x0005;
pub(crate) const CYC_MST_WINDOW_ERROR: i32 = 0x0006;

// Connection API codes
pub(crate) const CON_WRONG_PHASE: i32 = 0x0010;
pub(crate) const CON_NOT_CONFIGURED: i32 = 0x0011;
pub(crate) const CON_NOT_MASTER_PRODUCED: i32 = 0x0012;
pub(crate) const CON_NOT_SLAVE_PRODUCED: i32 = 0x0013;
pub(crate) const CON_ILLEGAL_STATE: i32 = 0x0014;
pub(crate) const CON_DATA_INVALID: i32 = 0x0015;

// Layout builder codes
pub(crate) const CFG_INSUFFICIENT_RX_RAM: i32 = 0x0020;
pub(crate) const CFG_INSUFFICIENT_TX_RAM: i32 = 0x0021;
pub(crate) const CFG_FAULTY_MDT_LENGTH: i32 = 0x0022;
pub(crate) const CFG_FAULTY_AT_LENGTH: i32 = 0x0023;
pub(crate) const CFG_CYCLE_TIME_UNEQUAL: i32 = 0x0024;

// Binary configuration codec codes
pub(crate) const BIN_NO_BIN_CONFIG: i32 = 0x0040;
pub(crate) const BIN_WRONG_VERSION: i32 = 0x0041;
pub(crate) const BIN_WRONG_FORMAT: i32 = 0x0042;
pub(crate) const BIN_WRONG_SLAVE_ADDRESS: i32 = 0x0043;
pub(crate) const BIN_NO_PRODUCER_KEY: i32 = 0x0044;
pub(crate) const BIN_NO_CONSUMER_LIST_KEY: i32 = 0x0045;
pub(crate) const BIN_NO_CONSUMER_KEY: i32 = 0x0046;
pub(crate) const BIN_NO_CONFIGURATION_KEY: i32 = 0x0047;
pub(crate) const BIN_NO_RTB_CONFIG_KEY: i32 = 0x0048;
pub(crate) const BIN_DOUBLE_PRODUCER: i32 = 0x0049;
pub(crate) const BIN_NO_PRODUCER: i32 = 0x004A;
pub(crate) const BIN_NO_CONSUMER: i32 = 0x004B;
pub(crate) const BIN_APP_ID_UNAVAILABLE: i32 = 0x004C;
pub(crate) const BIN_VERSION_UNAVAILABLE: i32 = 0x004D;
pub(crate) const BIN_BUFFER_TOO_SMALL: i32 = 0x004E;
pub(crate) const BIN_CONN_INST_ALREADY_USED: i32 = 0x004F;
pub(crate) const BIN_CONN_INST_TOO_HIGH: i32 = 0x0050;
pub(crate) const BIN_CONN_NBR_ALREADY_USED: i32 = 0x0051;
pub(crate) const BIN_TOO_MANY_CONN_MASTER: i32 = 0x0052;
pub(crate) const BIN_TOO_MANY_CONN_SLAVE: i32 = 0x0053;
pub(crate) const BIN_TOO_MANY_CONNECTIONS: i32 = 0x0054;
pub(crate) const BIN_TOO_MANY_CONFIGURATIONS: i32 = 0x0055;
pub(crate) const BIN_TOO_MANY_RTB_CONFIG: i32 = 0x0056;
pub(crate) const BIN_TOO_MANY_IDN_FOR_CONN: i32 = 0x0057;
pub(crate) const BIN_TOO_MANY_SLAVE_SETUP: i32 = 0x0058;
pub(crate) const BIN_NO_SETUP_PARAMETER_KEY: i32 = 0x0059;
pub(crate) const BIN_NO_SETUP_LIST_KEY: i32 = 0x005A;
pub(crate) const BIN_TOO_MANY_PARAMETER_IN_LIST: i32 = 0x005B;
pub(crate) const BIN_TOO_MANY_PARAMETER_DATA: i32 = 0x005C;
pub(crate) const BIN_TOO_MANY_SETUP_PARAMETER: i32 = 0x005D;
pub(crate) const BIN_TOO_MANY_SETUP_LISTS: i32 = 0x005E;

pub(crate) const SYS_ERROR: i32 = 0x00F0;

/// Result of one cyclic handler run.
///
/// Everything except `Ok` is a cycle-local transient condition; the engine
/// keeps running and reports the same or a new condition next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclicResult {
    Ok,
    TopologyChange,
    TelegramOverrun,
    NoLinkAttached,
    NoTelegramsReceived,
    MstMiss,
    MstWindowError,
}

/// Error of a configuration or connection call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    WrongPhase,
    ConnectionNotConfigured,
    ConnectionNotMasterProduced,
    ConnectionNotSlaveProduced,
    IllegalConnectionState,
    ConnectionDataInvalid,
    InsufficientRxRam,
    InsufficientTxRam,
    FaultyMdtLength,
    FaultyAtLength,
    CycleTimeUnequal,
    NoBinConfig,
    WrongBinConfigVersion,
    WrongBinConfigFormat,
    WrongSlaveAddress(u16),
    NoProducerKey,
    NoConsumerListKey,
    NoConsumerKey,
    NoConfigurationKey,
    NoRtbConfigKey,
    DoubleProducer,
    NoProducer,
    NoConsumer,
    ApplicationIdUnavailable,
    BinConfigVersionUnavailable,
    BufferTooSmall,
    ConnInstAlreadyUsed,
    ConnInstTooHigh,
    ConnNbrAlreadyUsed,
    TooManyConnForMaster,
    TooManyConnForSlave,
    TooManyConnections,
    TooManyConfigurations,
    TooManyRtbConfig,
    TooManyIdnForConn,
    TooManySlaveSetup,
    NoSetupParameterKey,
    NoSetupListKey,
    TooManyParameterInList,
    TooManyParameterData,
    TooManySetupParameter,
    TooManySetupLists,
    SystemError,
}

impl Error {
    /// numeric code, stable across releases
    pub fn code(&self) -> i32 {
        match self {
            Error::WrongPhase => CON_WRONG_PHASE,
            Error::ConnectionNotConfigured => CON_NOT_CONFIGURED,
            Error::ConnectionNotMasterProduced => CON_NOT_MASTER_PRODUCED,
            Error::ConnectionNotSlaveProduced => CON_NOT_SLAVE_PRODUCED,
            Error::IllegalConnectionState => CON_ILLEGAL_STATE,
            Error::ConnectionDataInvalid => CON_DATA_INVALID,
            Error::InsufficientRxRam => CFG_INSUFFICIENT_RX_RAM,
            Error::InsufficientTxRam => CFG_INSUFFICIENT_TX_RAM,
            Error::FaultyMdtLength => CFG_FAULTY_MDT_LENGTH,
            Error::FaultyAtLength => CFG_FAULTY_AT_LENGTH,
            Error::CycleTimeUnequal => CFG_CYCLE_TIME_UNEQUAL,
            Error::NoBinConfig => BIN_NO_BIN_CONFIG,
            Error::WrongBinConfigVersion => BIN_WRONG_VERSION,
            Error::WrongBinConfigFormat => BIN_WRONG_FORMAT,
            Error::WrongSlaveAddress(_) => BIN_WRONG_SLAVE_ADDRESS,
            Error::NoProducerKey => BIN_NO_PRODUCER_KEY,
            Error::NoConsumerListKey => BIN_NO_CONSUMER_LIST_KEY,
            Error::NoConsumerKey => BIN_NO_CONSUMER_KEY,
            Error::NoConfigurationKey => BIN_NO_CONFIGURATION_KEY,
            Error::NoRtbConfigKey => BIN_NO_RTB_CONFIG_KEY,
            Error::DoubleProducer => BIN_DOUBLE_PRODUCER,
            Error::NoProducer => BIN_NO_PRODUCER,
            Error::NoConsumer => BIN_NO_CONSUMER,
            Error::ApplicationIdUnavailable => BIN_APP_ID_UNAVAILABLE,
            Error::BinConfigVersionUnavailable => BIN_VERSION_UNAVAILABLE,
            Error::BufferTooSmall => BIN_BUFFER_TOO_SMALL,
            Error::ConnInstAlreadyUsed => BIN_CONN_INST_ALREADY_USED,
            Error::ConnInstTooHigh => BIN_CONN_INST_TOO_HIGH,
            Error::ConnNbrAlreadyUsed => BIN_CONN_NBR_ALREADY_USED,
            Error::TooManyConnForMaster => BIN_TOO_MANY_CONN_MASTER,
            Error::TooManyConnForSlave => BIN_TOO_MANY_CONN_SLAVE,
            Error::TooManyConnections => BIN_TOO_MANY_CONNECTIONS,
            Error::TooManyConfigurations => BIN_TOO_MANY_CONFIGURATIONS,
            Error::TooManyRtbConfig => BIN_TOO_MANY_RTB_CONFIG,
            Error::TooManyIdnForConn => BIN_TOO_MANY_IDN_FOR_CONN,
            Error::TooManySlaveSetup => BIN_TOO_MANY_SLAVE_SETUP,
            Error::NoSetupParameterKey => BIN_NO_SETUP_PARAMETER_KEY,
            Error::NoSetupListKey => BIN_NO_SETUP_LIST_KEY,
            Error::TooManyParameterInList => BIN_TOO_MANY_PARAMETER_IN_LIST,
            Error::TooManyParameterData => BIN_TOO_MANY_PARAMETER_DATA,
            Error::TooManySetupParameter => BIN_TOO_MANY_SETUP_PARAMETER,
            Error::TooManySetupLists => BIN_TOO_MANY_SETUP_LISTS,
            Error::SystemError => SYS_ERROR,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::WrongSlaveAddress(add) => {
                write!(f, "{} (address {})", error_text(self.code()), add)
            }
            _ => write!(f, "{}", error_text(self.code())),
        }
    }
}

// This is important for other errors to wrap this one.
impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

//ErrorText return a string error text from error code integer
pub fn error_text(err: i32) -> &'static str {
    match err {
        0 => "OK",
        CYC_TELEGRAM_OVERRUN => "CYC : Telegram overrun",
        CYC_TOPOLOGY_CHANGE => "CYC : Topology change detected",
        CYC_NO_LINK_ATTACHED => "CYC : No link attached on either port",
        CYC_NO_TELEGRAMS_RECEIVED => "CYC : No telegrams received",
        CYC_MST_MISS => "CYC : MST miss",
        CYC_MST_WINDOW_ERROR => "CYC : MST outside monitoring window",

        CON_WRONG_PHASE => "CON : Function not allowed in current communication phase",
        CON_NOT_CONFIGURED => "CON : Connection is not configured",
        CON_NOT_MASTER_PRODUCED => "CON : Connection is not produced by the master",
        CON_NOT_SLAVE_PRODUCED => "CON : Connection is not produced by a slave",
        CON_ILLEGAL_STATE => "CON : Illegal commanded connection state",
        CON_DATA_INVALID => "CON : Connection data invalid in current cycle",

        CFG_INSUFFICIENT_RX_RAM => "CFG : Telegram layout exceeds Rx RAM",
        CFG_INSUFFICIENT_TX_RAM => "CFG : Telegram layout exceeds Tx RAM",
        CFG_FAULTY_MDT_LENGTH => "CFG : MDT data field length out of range",
        CFG_FAULTY_AT_LENGTH => "CFG : AT data field length out of range",
        CFG_CYCLE_TIME_UNEQUAL => "CFG : Connection cycle time is no multiple of the communication cycle",

        BIN_NO_BIN_CONFIG => "BIN : No binary configuration (bad header or length)",
        BIN_WRONG_VERSION => "BIN : Wrong binary configuration version",
        BIN_WRONG_FORMAT => "BIN : Wrong binary configuration format",
        BIN_WRONG_SLAVE_ADDRESS => "BIN : Sercos address not in projected slave list",
        BIN_NO_PRODUCER_KEY => "BIN : Producer key not resolvable",
        BIN_NO_CONSUMER_LIST_KEY => "BIN : Consumer list key not resolvable",
        BIN_NO_CONSUMER_KEY => "BIN : Consumer key not resolvable",
        BIN_NO_CONFIGURATION_KEY => "BIN : Configuration key not resolvable",
        BIN_NO_RTB_CONFIG_KEY => "BIN : Real-time bit key not resolvable",
        BIN_DOUBLE_PRODUCER => "BIN : Connection has more than one producer",
        BIN_NO_PRODUCER => "BIN : Connection has no producer",
        BIN_NO_CONSUMER => "BIN : Connection has no consumer",
        BIN_APP_ID_UNAVAILABLE => "BIN : No connection matches the application ID",
        BIN_VERSION_UNAVAILABLE => "BIN : Requested format version not available",
        BIN_BUFFER_TOO_SMALL => "BIN : Target buffer too small",
        BIN_CONN_INST_ALREADY_USED => "BIN : Connection instance already in use",
        BIN_CONN_INST_TOO_HIGH => "BIN : Connection instance out of range",
        BIN_CONN_NBR_ALREADY_USED => "BIN : Connection number already in use",
        BIN_TOO_MANY_CONN_MASTER => "BIN : No free connection instance for the master",
        BIN_TOO_MANY_CONN_SLAVE => "BIN : No free connection instance for the slave",
        BIN_TOO_MANY_CONNECTIONS => "BIN : Global connection table exhausted",
        BIN_TOO_MANY_CONFIGURATIONS => "BIN : Configuration table exhausted",
        BIN_TOO_MANY_RTB_CONFIG => "BIN : Real-time bit table exhausted",
        BIN_TOO_MANY_IDN_FOR_CONN => "BIN : Too many IDNs for one connection",
        BIN_TOO_MANY_SLAVE_SETUP => "BIN : Slave setup table exhausted",
        BIN_NO_SETUP_PARAMETER_KEY => "BIN : Setup parameter key not resolvable",
        BIN_NO_SETUP_LIST_KEY => "BIN : Setup parameter list key not resolvable",
        BIN_TOO_MANY_PARAMETER_IN_LIST => "BIN : Too many parameters in one setup list",
        BIN_TOO_MANY_PARAMETER_DATA => "BIN : Setup parameter data too long",
        BIN_TOO_MANY_SETUP_PARAMETER => "BIN : Setup parameter table exhausted",
        BIN_TOO_MANY_SETUP_LISTS => "BIN : Setup list table exhausted",

        SYS_ERROR => "SYS : Internal consistency error",
        _ => "SYS : Unknown error",
    }
}

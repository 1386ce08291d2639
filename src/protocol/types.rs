//! Common MySQL wire protocol constants and types.

/// Capability flags negotiated during the handshake.
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities this client always asks for (masked by what the server offers).
    pub const BASE_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_DEPRECATE_EOF;
}

/// Server status flags carried by OK and EOF packets.
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// Column definition flags.
pub mod column_flags {
    pub const NOT_NULL: u16 = 0x0001;
    pub const PRIMARY_KEY: u16 = 0x0002;
    pub const UNSIGNED: u16 = 0x0020;
    pub const BINARY: u16 = 0x0080;
}

/// Flags for COM_REFRESH.
pub mod refresh {
    pub const GRANT: u8 = 0x01;
    pub const LOG: u8 = 0x02;
    pub const TABLES: u8 = 0x04;
    pub const HOSTS: u8 = 0x08;
    pub const STATUS: u8 = 0x10;
    pub const THREADS: u8 = 0x20;
    pub const SLAVE: u8 = 0x40;
    pub const MASTER: u8 = 0x80;
}

/// MySQL command codes (COM_xxx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Close the session
    Quit = 0x01,
    /// Switch default database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Flush tables, logs, etc.
    Refresh = 0x07,
    /// Liveness check
    Ping = 0x0E,
    /// Prepare a statement
    StmtPrepare = 0x16,
    /// Execute a prepared statement
    StmtExecute = 0x17,
    /// Close a prepared statement (no response)
    StmtClose = 0x19,
    /// Reset accumulated long data of a prepared statement
    StmtReset = 0x1A,
}

/// MySQL column/parameter type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl ColumnType {
    /// Create a ColumnType from a raw byte. Unknown codes map to `VarString`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => ColumnType::Decimal,
            0x01 => ColumnType::Tiny,
            0x02 => ColumnType::Short,
            0x03 => ColumnType::Long,
            0x04 => ColumnType::Float,
            0x05 => ColumnType::Double,
            0x06 => ColumnType::Null,
            0x07 => ColumnType::Timestamp,
            0x08 => ColumnType::LongLong,
            0x09 => ColumnType::Int24,
            0x0A => ColumnType::Date,
            0x0B => ColumnType::Time,
            0x0C => ColumnType::DateTime,
            0x0D => ColumnType::Year,
            0x0F => ColumnType::VarChar,
            0x10 => ColumnType::Bit,
            0xF5 => ColumnType::Json,
            0xF6 => ColumnType::NewDecimal,
            0xF7 => ColumnType::Enum,
            0xF8 => ColumnType::Set,
            0xF9 => ColumnType::TinyBlob,
            0xFA => ColumnType::MediumBlob,
            0xFB => ColumnType::LongBlob,
            0xFC => ColumnType::Blob,
            0xFE => ColumnType::String,
            0xFF => ColumnType::Geometry,
            _ => ColumnType::VarString,
        }
    }

    /// Integer types.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColumnType::Tiny
                | ColumnType::Short
                | ColumnType::Long
                | ColumnType::LongLong
                | ColumnType::Int24
                | ColumnType::Year
        )
    }

    /// BLOB-family types (binary unless the column has a text charset).
    pub fn is_blob(self) -> bool {
        matches!(
            self,
            ColumnType::TinyBlob
                | ColumnType::MediumBlob
                | ColumnType::LongBlob
                | ColumnType::Blob
                | ColumnType::Geometry
                | ColumnType::Bit
        )
    }
}

impl From<u8> for ColumnType {
    fn from(value: u8) -> Self {
        Self::from_u8(value)
    }
}

/// Charset id of the `binary` pseudo-charset.
pub const BINARY_CHARSET: u16 = 63;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// READ UNCOMMITTED
    ReadUncommitted,
    /// READ COMMITTED
    ReadCommitted,
    /// REPEATABLE READ (InnoDB default)
    #[default]
    RepeatableRead,
    /// SERIALIZABLE
    Serializable,
}

impl IsolationLevel {
    /// SQL keywords for `SET SESSION TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = crate::error::Error;

    /// Accepts `uncommitted`, `committed`, `repeatable`, `serializable`
    /// and the full SQL spellings, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', " ").as_str() {
            "uncommitted" | "read uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "committed" | "read committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable" | "repeatable read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(crate::error::Error::InvalidUsage(format!(
                "invalid isolation level: {s}"
            ))),
        }
    }
}

//! Structured error descriptor carried by every fallible response.
//!
//! A status vector is an ordered list of arguments terminated by an end
//! marker. The first `Gds` argument names the primary error; the following
//! arguments parameterize it. An empty vector means success.

use crate::error::ProtocolError;
use crate::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// Wire tags for status arguments.
mod tag {
    pub const END: u32 = 0;
    pub const GDS: u32 = 1;
    pub const STRING: u32 = 2;
    pub const NUMBER: u32 = 4;
    pub const WARNING: u32 = 18;
    pub const SQL_STATE: u32 = 19;
}

/// Maximum number of arguments accepted in one status vector.
const MAX_STATUS_ARGS: usize = 64;

/// Stable error codes. These are part of the protocol contract.
pub mod codes {
    pub const BAD_DB_HANDLE: u32 = 335_544_324;
    pub const BAD_REQ_HANDLE: u32 = 335_544_327;
    pub const BAD_SEGSTR_HANDLE: u32 = 335_544_328;
    pub const BAD_TRANS_HANDLE: u32 = 335_544_332;
    pub const BAD_STMT_HANDLE: u32 = 335_544_333;
    pub const BAD_EVENT_HANDLE: u32 = 335_544_334;
    pub const BAD_SVC_HANDLE: u32 = 335_544_335;
    pub const TOO_MANY_HANDLES: u32 = 335_544_336;
    pub const BAD_BATCH_HANDLE: u32 = 335_544_337;

    pub const IO_ERROR: u32 = 335_544_344;
    pub const LOGIN: u32 = 335_544_472;
    pub const NETWORK_ERROR: u32 = 335_544_721;
    pub const CONNECT_REJECT: u32 = 335_544_421;
    pub const PROTOCOL: u32 = 335_544_365;
    pub const WIRE_CRYPT_REQUIRED: u32 = 335_545_064;
    pub const CRYPT_KEY_MISSING: u32 = 335_545_065;
    pub const ASYNC_ACTIVE: u32 = 335_544_560;
    pub const CANCELLED: u32 = 335_544_794;
    pub const IMPLEMENT: u32 = 335_544_378;
    pub const SHUTDOWN: u32 = 335_544_528;

    pub const DATABASE_UNKNOWN: u32 = 335_544_734;
    pub const DATABASE_EXISTS: u32 = 335_544_735;
    pub const TABLE_UNKNOWN: u32 = 335_544_580;
    pub const TABLE_EXISTS: u32 = 335_544_351;
    pub const SQL_SYNTAX: u32 = 335_544_634;
    pub const UNIQUE_KEY_VIOLATION: u32 = 335_544_665;
    pub const TRANSACTION_STATE: u32 = 335_544_468;
    pub const NO_CURSOR: u32 = 335_544_577;
    pub const CURSOR_NOT_SCROLLABLE: u32 = 335_545_092;
    pub const SEGMENT: u32 = 335_544_366;
    pub const SEGSTR_EOF: u32 = 335_544_367;
    pub const BLOB_NOT_FOUND: u32 = 335_544_329;
    pub const BAD_BPB: u32 = 335_544_330;
    pub const BAD_DPB: u32 = 335_544_331;
    pub const BATCH_DEFAULT_BPB: u32 = 335_545_186;
    pub const BATCH_BLOB_POLICY: u32 = 335_545_187;
    pub const BATCH_BLOB_ID: u32 = 335_545_188;
    pub const BATCH_TOO_BIG: u32 = 335_545_189;
    pub const REQUEST_STATE: u32 = 335_544_338;
    pub const SERVICE_UNKNOWN: u32 = 335_544_559;
    pub const MESSAGE_FORMAT: u32 = 335_544_353;
    pub const INTERNAL: u32 = 335_544_389;
}

/// One argument of a status vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusArg {
    /// Primary or secondary error code.
    Gds(u32),
    /// String parameter for the preceding code.
    Str(String),
    /// Numeric parameter for the preceding code.
    Number(i64),
    /// Five-character SQLSTATE.
    SqlState(String),
    /// Warning code (does not make the vector an error).
    Warning(u32),
}

/// Ordered list of status arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusVector {
    args: Vec<StatusArg>,
}

impl StatusVector {
    /// Creates an empty (success) vector.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Creates a vector with a single primary error code.
    pub fn error(code: u32) -> Self {
        Self {
            args: vec![StatusArg::Gds(code)],
        }
    }

    pub fn with_str(mut self, value: impl Into<String>) -> Self {
        self.args.push(StatusArg::Str(value.into()));
        self
    }

    pub fn with_number(mut self, value: i64) -> Self {
        self.args.push(StatusArg::Number(value));
        self
    }

    pub fn with_sql_state(mut self, state: impl Into<String>) -> Self {
        self.args.push(StatusArg::SqlState(state.into()));
        self
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.args.push(StatusArg::Gds(code));
        self
    }

    pub fn with_warning(mut self, code: u32) -> Self {
        self.args.push(StatusArg::Warning(code));
        self
    }

    pub fn args(&self) -> &[StatusArg] {
        &self.args
    }

    /// Returns whether this vector reports an error (warnings alone do not).
    pub fn is_error(&self) -> bool {
        self.args.iter().any(|a| matches!(a, StatusArg::Gds(_)))
    }

    /// Returns the primary error code, if any.
    pub fn primary_code(&self) -> Option<u32> {
        self.args.iter().find_map(|a| match a {
            StatusArg::Gds(code) => Some(*code),
            _ => None,
        })
    }

    /// Returns whether any argument carries the given code.
    pub fn contains_code(&self, code: u32) -> bool {
        self.args
            .iter()
            .any(|a| matches!(a, StatusArg::Gds(c) if *c == code))
    }

    pub fn sql_state(&self) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            StatusArg::SqlState(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        for arg in &self.args {
            match arg {
                StatusArg::Gds(code) => {
                    buf.put_u32(tag::GDS);
                    buf.put_u32(*code);
                }
                StatusArg::Str(s) => {
                    buf.put_u32(tag::STRING);
                    buf.put_wire_str(s)?;
                }
                StatusArg::Number(n) => {
                    buf.put_u32(tag::NUMBER);
                    buf.put_i64(*n);
                }
                StatusArg::SqlState(s) => {
                    buf.put_u32(tag::SQL_STATE);
                    buf.put_wire_str(s)?;
                }
                StatusArg::Warning(code) => {
                    buf.put_u32(tag::WARNING);
                    buf.put_u32(*code);
                }
            }
        }
        buf.put_u32(tag::END);
        Ok(())
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut args = Vec::new();
        loop {
            let kind = reader.u32()?;
            let arg = match kind {
                tag::END => break,
                tag::GDS => StatusArg::Gds(reader.u32()?),
                tag::STRING => StatusArg::Str(reader.string()?),
                tag::NUMBER => StatusArg::Number(reader.i64()?),
                tag::SQL_STATE => StatusArg::SqlState(reader.string()?),
                tag::WARNING => StatusArg::Warning(reader.u32()?),
                other => {
                    return Err(ProtocolError::InvalidEnum {
                        field: "status argument",
                        value: other,
                    })
                }
            };
            if args.len() == MAX_STATUS_ARGS {
                return Err(ProtocolError::FieldTooLarge {
                    size: (args.len() + 1) as u32,
                    max: MAX_STATUS_ARGS as u32,
                });
            }
            args.push(arg);
        }
        Ok(Self { args })
    }
}

impl fmt::Display for StatusVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            return write!(f, "success");
        }
        let mut first = true;
        for arg in &self.args {
            match arg {
                StatusArg::Gds(code) => {
                    if !first {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", describe(*code))?;
                }
                StatusArg::Str(s) => write!(f, " '{}'", s)?,
                StatusArg::Number(n) => write!(f, " {}", n)?,
                StatusArg::SqlState(s) => write!(f, " [SQLSTATE {}]", s)?,
                StatusArg::Warning(code) => write!(f, " (warning {})", code)?,
            }
            first = false;
        }
        Ok(())
    }
}

/// Short message for a known code.
pub fn describe(code: u32) -> String {
    let text = match code {
        codes::BAD_DB_HANDLE => "invalid database handle",
        codes::BAD_REQ_HANDLE => "invalid request handle",
        codes::BAD_SEGSTR_HANDLE => "invalid blob handle",
        codes::BAD_TRANS_HANDLE => "invalid transaction handle",
        codes::BAD_STMT_HANDLE => "invalid statement handle",
        codes::BAD_EVENT_HANDLE => "invalid event handle",
        codes::BAD_SVC_HANDLE => "invalid service handle",
        codes::BAD_BATCH_HANDLE => "invalid batch handle",
        codes::TOO_MANY_HANDLES => "too many open handles",
        codes::LOGIN => "your user name and password are not defined",
        codes::NETWORK_ERROR => "network error",
        codes::CONNECT_REJECT => "connection rejected by remote interface",
        codes::PROTOCOL => "protocol error",
        codes::WIRE_CRYPT_REQUIRED => "wire encryption required",
        codes::CRYPT_KEY_MISSING => "missing database encryption key",
        codes::ASYNC_ACTIVE => "another asynchronous operation is active",
        codes::CANCELLED => "operation was cancelled",
        codes::IMPLEMENT => "feature is not supported",
        codes::SHUTDOWN => "server is shutting down",
        codes::DATABASE_UNKNOWN => "database not found",
        codes::DATABASE_EXISTS => "database already exists",
        codes::TABLE_UNKNOWN => "table unknown",
        codes::TABLE_EXISTS => "table already exists",
        codes::SQL_SYNTAX => "dynamic SQL error",
        codes::UNIQUE_KEY_VIOLATION => "violation of PRIMARY KEY constraint",
        codes::TRANSACTION_STATE => "invalid transaction state",
        codes::NO_CURSOR => "cursor is not open",
        codes::CURSOR_NOT_SCROLLABLE => "cursor is not scrollable",
        codes::SEGMENT => "segment buffer length shorter than expected",
        codes::SEGSTR_EOF => "end of blob reached",
        codes::BLOB_NOT_FOUND => "blob not found",
        codes::BAD_BPB => "invalid blob parameter block",
        codes::BAD_DPB => "invalid database parameter block",
        codes::BATCH_DEFAULT_BPB => "default BPB is not set",
        codes::BATCH_BLOB_POLICY => "blob policy does not allow this operation",
        codes::BATCH_BLOB_ID => "unknown batch blob id",
        codes::BATCH_TOO_BIG => "batch buffer limit exceeded",
        codes::REQUEST_STATE => "request in invalid state",
        codes::SERVICE_UNKNOWN => "service is not defined",
        codes::MESSAGE_FORMAT => "message does not match format",
        codes::IO_ERROR => "I/O error",
        _ => return format!("error {}", code),
    };
    text.to_string()
}

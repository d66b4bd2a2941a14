//! Opcode vocabulary.
//!
//! The numeric values are part of the wire contract and must never change.

use crate::error::ProtocolError;

/// Leading discriminant of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    // Connection management
    Connect = 1,
    Exit = 2,
    Accept = 3,
    Reject = 4,
    Disconnect = 6,
    Response = 9,

    // Attachment lifecycle
    Attach = 19,
    Create = 20,
    Detach = 21,

    // Compiled requests
    Compile = 22,
    Start = 23,
    StartAndSend = 24,
    Send = 25,
    Receive = 26,
    Unwind = 27,
    Release = 28,

    // Transactions
    Transaction = 29,
    Commit = 30,
    Rollback = 31,
    Prepare = 32,

    // Blobs
    CreateBlob = 34,
    OpenBlob = 35,
    GetSegment = 36,
    PutSegment = 37,
    CancelBlob = 38,
    CloseBlob = 39,

    // Info queries
    InfoDatabase = 40,
    InfoRequest = 41,
    InfoTransaction = 42,
    InfoBlob = 43,

    BatchSegments = 44,

    // Events
    QueEvents = 48,
    CancelEvents = 49,

    CommitRetaining = 50,
    Prepare2 = 51,
    Event = 52,

    // Async sibling channel
    ConnectRequest = 53,
    AuxConnect = 54,

    Seek = 61,

    // Statements
    AllocateStatement = 62,
    Execute = 63,
    ExecImmediate = 64,
    Fetch = 65,
    FetchResponse = 66,
    FreeStatement = 67,
    PrepareStatement = 68,
    SetCursor = 69,
    InfoSql = 70,

    Dummy = 71,

    Execute2 = 76,
    SqlResponse = 78,
    DropDatabase = 81,

    // Service manager
    ServiceAttach = 82,
    ServiceDetach = 83,
    ServiceInfo = 84,
    ServiceStart = 85,

    RollbackRetaining = 86,

    // Authentication and operational control
    TrustedAuth = 90,
    Cancel = 91,
    ContAuth = 92,
    Ping = 93,
    AcceptData = 94,
    Crypt = 96,
    CryptKeyCallback = 97,
    CondAccept = 98,

    // Batches
    BatchCreate = 99,
    BatchMsg = 100,
    BatchExec = 101,
    BatchRelease = 102,
    BatchCompletionState = 103,
    BatchRegBlob = 104,
    BatchBlobStream = 105,
    BatchSetBpb = 106,
    BatchCancel = 109,
    BatchSync = 110,

    FetchScroll = 112,
}

impl Opcode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Returns the opcode's name as used in logs and metrics labels.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Connect => "connect",
            Opcode::Exit => "exit",
            Opcode::Accept => "accept",
            Opcode::Reject => "reject",
            Opcode::Disconnect => "disconnect",
            Opcode::Response => "response",
            Opcode::Attach => "attach",
            Opcode::Create => "create",
            Opcode::Detach => "detach",
            Opcode::Compile => "compile",
            Opcode::Start => "start",
            Opcode::StartAndSend => "start_and_send",
            Opcode::Send => "send",
            Opcode::Receive => "receive",
            Opcode::Unwind => "unwind",
            Opcode::Release => "release",
            Opcode::Transaction => "transaction",
            Opcode::Commit => "commit",
            Opcode::Rollback => "rollback",
            Opcode::Prepare => "prepare",
            Opcode::CreateBlob => "create_blob",
            Opcode::OpenBlob => "open_blob",
            Opcode::GetSegment => "get_segment",
            Opcode::PutSegment => "put_segment",
            Opcode::CancelBlob => "cancel_blob",
            Opcode::CloseBlob => "close_blob",
            Opcode::InfoDatabase => "info_database",
            Opcode::InfoRequest => "info_request",
            Opcode::InfoTransaction => "info_transaction",
            Opcode::InfoBlob => "info_blob",
            Opcode::BatchSegments => "batch_segments",
            Opcode::QueEvents => "que_events",
            Opcode::CancelEvents => "cancel_events",
            Opcode::CommitRetaining => "commit_retaining",
            Opcode::Prepare2 => "prepare2",
            Opcode::Event => "event",
            Opcode::ConnectRequest => "connect_request",
            Opcode::AuxConnect => "aux_connect",
            Opcode::Seek => "seek_blob",
            Opcode::AllocateStatement => "allocate_statement",
            Opcode::Execute => "execute",
            Opcode::ExecImmediate => "exec_immediate",
            Opcode::Fetch => "fetch",
            Opcode::FetchResponse => "fetch_response",
            Opcode::FreeStatement => "free_statement",
            Opcode::PrepareStatement => "prepare_statement",
            Opcode::SetCursor => "set_cursor",
            Opcode::InfoSql => "info_sql",
            Opcode::Dummy => "dummy",
            Opcode::Execute2 => "execute2",
            Opcode::SqlResponse => "sql_response",
            Opcode::DropDatabase => "drop_database",
            Opcode::ServiceAttach => "service_attach",
            Opcode::ServiceDetach => "service_detach",
            Opcode::ServiceInfo => "service_info",
            Opcode::ServiceStart => "service_start",
            Opcode::RollbackRetaining => "rollback_retaining",
            Opcode::TrustedAuth => "trusted_auth",
            Opcode::Cancel => "cancel",
            Opcode::ContAuth => "cont_auth",
            Opcode::Ping => "ping",
            Opcode::AcceptData => "accept_data",
            Opcode::Crypt => "crypt",
            Opcode::CryptKeyCallback => "crypt_key_callback",
            Opcode::CondAccept => "cond_accept",
            Opcode::BatchCreate => "batch_create",
            Opcode::BatchMsg => "batch_msg",
            Opcode::BatchExec => "batch_exec",
            Opcode::BatchRelease => "batch_rls",
            Opcode::BatchCompletionState => "batch_cs",
            Opcode::BatchRegBlob => "batch_regblob",
            Opcode::BatchBlobStream => "batch_blob_stream",
            Opcode::BatchSetBpb => "batch_set_bpb",
            Opcode::BatchCancel => "batch_cancel",
            Opcode::BatchSync => "batch_sync",
            Opcode::FetchScroll => "fetch_scroll",
        }
    }
}

impl TryFrom<u32> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let op = match value {
            1 => Opcode::Connect,
            2 => Opcode::Exit,
            3 => Opcode::Accept,
            4 => Opcode::Reject,
            6 => Opcode::Disconnect,
            9 => Opcode::Response,
            19 => Opcode::Attach,
            20 => Opcode::Create,
            21 => Opcode::Detach,
            22 => Opcode::Compile,
            23 => Opcode::Start,
            24 => Opcode::StartAndSend,
            25 => Opcode::Send,
            26 => Opcode::Receive,
            27 => Opcode::Unwind,
            28 => Opcode::Release,
            29 => Opcode::Transaction,
            30 => Opcode::Commit,
            31 => Opcode::Rollback,
            32 => Opcode::Prepare,
            34 => Opcode::CreateBlob,
            35 => Opcode::OpenBlob,
            36 => Opcode::GetSegment,
            37 => Opcode::PutSegment,
            38 => Opcode::CancelBlob,
            39 => Opcode::CloseBlob,
            40 => Opcode::InfoDatabase,
            41 => Opcode::InfoRequest,
            42 => Opcode::InfoTransaction,
            43 => Opcode::InfoBlob,
            44 => Opcode::BatchSegments,
            48 => Opcode::QueEvents,
            49 => Opcode::CancelEvents,
            50 => Opcode::CommitRetaining,
            51 => Opcode::Prepare2,
            52 => Opcode::Event,
            53 => Opcode::ConnectRequest,
            54 => Opcode::AuxConnect,
            61 => Opcode::Seek,
            62 => Opcode::AllocateStatement,
            63 => Opcode::Execute,
            64 => Opcode::ExecImmediate,
            65 => Opcode::Fetch,
            66 => Opcode::FetchResponse,
            67 => Opcode::FreeStatement,
            68 => Opcode::PrepareStatement,
            69 => Opcode::SetCursor,
            70 => Opcode::InfoSql,
            71 => Opcode::Dummy,
            76 => Opcode::Execute2,
            78 => Opcode::SqlResponse,
            81 => Opcode::DropDatabase,
            82 => Opcode::ServiceAttach,
            83 => Opcode::ServiceDetach,
            84 => Opcode::ServiceInfo,
            85 => Opcode::ServiceStart,
            86 => Opcode::RollbackRetaining,
            90 => Opcode::TrustedAuth,
            91 => Opcode::Cancel,
            92 => Opcode::ContAuth,
            93 => Opcode::Ping,
            94 => Opcode::AcceptData,
            96 => Opcode::Crypt,
            97 => Opcode::CryptKeyCallback,
            98 => Opcode::CondAccept,
            99 => Opcode::BatchCreate,
            100 => Opcode::BatchMsg,
            101 => Opcode::BatchExec,
            102 => Opcode::BatchRelease,
            103 => Opcode::BatchCompletionState,
            104 => Opcode::BatchRegBlob,
            105 => Opcode::BatchBlobStream,
            106 => Opcode::BatchSetBpb,
            109 => Opcode::BatchCancel,
            110 => Opcode::BatchSync,
            112 => Opcode::FetchScroll,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values_are_stable() {
        assert_eq!(Opcode::Connect.as_u32(), 1);
        assert_eq!(Opcode::Response.as_u32(), 9);
        assert_eq!(Opcode::Attach.as_u32(), 19);
        assert_eq!(Opcode::Ping.as_u32(), 93);
        assert_eq!(Opcode::FetchScroll.as_u32(), 112);
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(
            Opcode::try_from(5),
            Err(ProtocolError::UnknownOpcode(5))
        ));
        assert!(matches!(
            Opcode::try_from(10_000),
            Err(ProtocolError::UnknownOpcode(10_000))
        ));
    }

    #[test]
    fn test_every_value_maps_back() {
        for value in 0..256u32 {
            if let Ok(op) = Opcode::try_from(value) {
                assert_eq!(op.as_u32(), value);
                assert!(!op.name().is_empty());
            }
        }
    }
}

//! Pieces shared by the object proxies.

use crate::error::ClientError;
use crate::port::Port;
use bytes::Bytes;
use relwire_protocol::packet::InfoQuery;
use relwire_protocol::{InfoResponse, Packet};
use std::sync::Arc;

/// Buffer length sent with info queries.
pub const INFO_BUFFER_LENGTH: u32 = 4096;

/// Server object id held by a proxy; empty once released.
#[derive(Debug)]
pub(crate) struct Handle {
    kind: &'static str,
    id: Option<u32>,
}

impl Handle {
    pub fn new(kind: &'static str, id: u32) -> Self {
        Self { kind, id: Some(id) }
    }

    pub fn get(&self) -> Result<u32, ClientError> {
        self.id.ok_or(ClientError::Released(self.kind))
    }

    pub fn is_released(&self) -> bool {
        self.id.is_none()
    }

    pub fn clear(&mut self) {
        self.id = None;
    }
}

/// Rejects handles that belong to another connection.
pub(crate) fn same_port(port: &Arc<Port>, other: &Arc<Port>, what: &str) -> Result<(), ClientError> {
    if Arc::ptr_eq(port, other) {
        Ok(())
    } else {
        Err(ClientError::usage(format!("{} belongs to another connection", what)))
    }
}

/// Sends an info query built by `build` and parses the answer.
pub(crate) fn query_info<F>(port: &Port, object: u32, items: &[u8], build: F) -> Result<InfoResponse, ClientError>
where
    F: FnOnce(InfoQuery) -> Packet,
{
    let response = port.call(build(InfoQuery {
        object,
        items: Bytes::copy_from_slice(items),
        buffer_length: INFO_BUFFER_LENGTH,
    }))?;
    Ok(InfoResponse::parse(&response.data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_release() {
        let mut handle = Handle::new("blob", 7);
        assert_eq!(handle.get().unwrap(), 7);
        handle.clear();
        assert!(handle.is_released());
        assert!(matches!(handle.get(), Err(ClientError::Released("blob"))));
    }
}

//! Service manager sessions.

use crate::error::ClientError;
use crate::port::Port;
use crate::proxy::{Handle, INFO_BUFFER_LENGTH};
use bytes::Bytes;
use relwire_protocol::info::items;
use relwire_protocol::packet::{AttachDb, ObjectRef, ServiceInfo, ServiceStart};
use relwire_protocol::pblock::spb;
use relwire_protocol::{InfoResponse, Packet, ParamBlock};
use std::sync::Arc;

/// Name the service manager is attached under.
pub const SERVICE_MANAGER: &str = "service_mgr";

/// A service manager attachment.
#[derive(Debug)]
pub struct Service {
    port: Arc<Port>,
    handle: Handle,
}

impl Service {
    pub fn attach(port: &Arc<Port>) -> Result<Service, ClientError> {
        let params = ParamBlock::new().with_str(spb::USER_NAME, &port.config().user);
        let id = port
            .call(Packet::ServiceAttach(AttachDb {
                database: SERVICE_MANAGER.to_string(),
                dpb: params.to_bytes().map_err(ClientError::Message)?,
            }))?
            .object;
        Ok(Service {
            port: port.clone(),
            handle: Handle::new("service", id),
        })
    }

    pub fn id(&self) -> Result<u32, ClientError> {
        self.handle.get()
    }

    /// Starts an action such as `spb::ACTION_LIST_DATABASES`.
    pub fn start(&self, action: u8) -> Result<(), ClientError> {
        self.start_with(ParamBlock::new().with_bytes(spb::ACTION, vec![action]))
    }

    pub fn start_with(&self, params: ParamBlock) -> Result<(), ClientError> {
        self.port
            .call(Packet::ServiceStart(ServiceStart {
                service: self.handle.get()?,
                spb: params.to_bytes().map_err(ClientError::Message)?,
            }))
            .map(|_| ())
    }

    pub fn query(&self, recv_items: &[u8]) -> Result<InfoResponse, ClientError> {
        let response = self.port.call(Packet::ServiceInfo(ServiceInfo {
            service: self.handle.get()?,
            send_items: Bytes::new(),
            recv_items: Bytes::copy_from_slice(recv_items),
            buffer_length: INFO_BUFFER_LENGTH,
        }))?;
        Ok(InfoResponse::parse(&response.data)?)
    }

    /// Drains the output of the running action, one line per query.
    pub fn lines(&self) -> Result<Vec<String>, ClientError> {
        let mut lines = Vec::new();
        loop {
            let info = self.query(&[items::SVC_LINE])?;
            let line = info
                .get(items::SVC_LINE)
                .and_then(|item| item.as_str())
                .unwrap_or_default();
            if line.is_empty() {
                return Ok(lines);
            }
            lines.push(line.to_string());
        }
    }

    pub fn server_version(&self) -> Result<String, ClientError> {
        let info = self.query(&[items::SVC_SERVER_VERSION])?;
        Ok(info
            .get(items::SVC_SERVER_VERSION)
            .and_then(|item| item.as_str())
            .unwrap_or_default()
            .to_string())
    }

    pub fn detach(&mut self) -> Result<(), ClientError> {
        let id = self.handle.get()?;
        self.port.call(Packet::ServiceDetach(ObjectRef::new(id)))?;
        self.handle.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::tests::Script;
    use relwire_protocol::info::InfoWriter;
    use relwire_protocol::packet::{ptype, Response};

    fn line(text: &str) -> Packet {
        let mut writer = InfoWriter::new(INFO_BUFFER_LENGTH);
        writer.push_str(items::SVC_LINE, text);
        Packet::Response(Response::with_data(writer.finish()))
    }

    #[test]
    fn test_lines_until_empty() {
        let script = Script::new();
        let port = script.port(ptype::SYNC);
        script.reply(Packet::Response(Response::with_object(1)));
        let service = Service::attach(&port).unwrap();
        script.reply(Packet::Response(Response::ok()));
        service.start(spb::ACTION_LIST_DATABASES).unwrap();
        for text in ["alpha", "beta", ""] {
            script.reply(line(text));
        }
        assert_eq!(service.lines().unwrap(), vec!["alpha", "beta"]);
    }
}

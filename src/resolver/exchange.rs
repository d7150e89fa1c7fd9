/* httpctl (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{Name, RData, RecordType},
};
use tokio::net::{lookup_host, UdpSocket};

use crate::utils::ResolutionError;

const MAX_UDP_RESPONSE: usize = 4096;

/// One record from an A query's answer section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    A(Ipv4Addr),
    Cname(String),
    Other,
}

/// Wire-level DNS exchange used by [`super::ResolutionCache`].
#[async_trait]
pub trait DnsExchange: Send + Sync {
    /// Sends a recursive A query for `host` to `nameserver` and returns the answer section.
    async fn query_a(
        &self,
        nameserver: SocketAddr,
        host: &str,
    ) -> Result<Vec<Answer>, ResolutionError>;

    /// Resolves a CNAME target through the platform resolver, keeping IPv4 only.
    async fn lookup_native(&self, name: &str) -> Vec<Ipv4Addr> {
        match lookup_host((name, 0)).await {
            Ok(addrs) => addrs
                .filter_map(|addr| match addr {
                    SocketAddr::V4(v4) => Some(*v4.ip()),
                    SocketAddr::V6(_) => None,
                })
                .collect(),
            Err(err) => {
                tracing::debug!(target: "dns", %name, error = %err, "native lookup failed");
                Vec::new()
            }
        }
    }
}

/// Single-datagram exchange over UDP, encoded with `hickory-proto`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpExchange;

impl UdpExchange {
    fn encode(id: u16, host: &str) -> Result<Vec<u8>, String> {
        let fqdn = if host.ends_with('.') {
            host.to_string()
        } else {
            format!("{host}.")
        };
        let name = Name::from_ascii(&fqdn).map_err(|err| err.to_string())?;

        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, RecordType::A));
        message.to_vec().map_err(|err| err.to_string())
    }
}

#[async_trait]
impl DnsExchange for UdpExchange {
    async fn query_a(
        &self,
        nameserver: SocketAddr,
        host: &str,
    ) -> Result<Vec<Answer>, ResolutionError> {
        let exchange_err = |reason: String| ResolutionError::Exchange {
            nameserver: nameserver.to_string(),
            reason,
        };

        let id: u16 = rand::random();
        let request = Self::encode(id, host).map_err(exchange_err)?;

        let bind: SocketAddr = match nameserver {
            SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|err| exchange_err(err.to_string()))?;
        socket
            .connect(nameserver)
            .await
            .map_err(|err| exchange_err(err.to_string()))?;
        socket
            .send(&request)
            .await
            .map_err(|err| exchange_err(err.to_string()))?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        let response = loop {
            let len = socket
                .recv(&mut buf)
                .await
                .map_err(|err| exchange_err(err.to_string()))?;
            let message =
                Message::from_vec(&buf[..len]).map_err(|err| exchange_err(err.to_string()))?;
            // Stray datagrams for other ids are dropped; the caller's deadline bounds the wait.
            if message.id() == id && message.message_type() == MessageType::Response {
                break message;
            }
        };

        tracing::trace!(
            target: "dns",
            %host,
            %nameserver,
            rcode = ?response.response_code(),
            answers = response.answers().len(),
            "dns response"
        );

        check_response_code(response.response_code(), nameserver)?;
        Ok(response
            .answers()
            .iter()
            .map(|record| match record.data() {
                Some(RData::A(a)) => Answer::A(a.0),
                Some(RData::CNAME(cname)) => Answer::Cname(cname.0.to_utf8()),
                _ => Answer::Other,
            })
            .collect())
    }
}

/// NOERROR and NXDOMAIN are final answers. Every other code blames the nameserver, so
/// it comes back as a retryable exchange failure.
fn check_response_code(code: ResponseCode, nameserver: SocketAddr) -> Result<(), ResolutionError> {
    match code {
        ResponseCode::NoError | ResponseCode::NXDomain => Ok(()),
        other => Err(ResolutionError::Exchange {
            nameserver: nameserver.to_string(),
            reason: format!("nameserver answered {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_query_asks_for_a_records_recursively() {
        let bytes = UdpExchange::encode(0x1234, "example.com").expect("encode");
        let message = Message::from_vec(&bytes).expect("decode");
        assert_eq!(message.id(), 0x1234);
        assert!(message.recursion_desired());
        let query = &message.queries()[0];
        assert_eq!(query.query_type(), RecordType::A);
        assert_eq!(query.name().to_utf8(), "example.com.");
    }

    #[test]
    fn invalid_names_fail_to_encode() {
        let oversized_label = format!("{}.com", "a".repeat(64));
        assert!(UdpExchange::encode(1, &oversized_label).is_err());
    }

    #[test]
    fn server_side_failures_are_retryable() {
        let ns: SocketAddr = "10.0.0.53:53".parse().expect("addr");
        assert!(check_response_code(ResponseCode::NoError, ns).is_ok());
        assert!(check_response_code(ResponseCode::NXDomain, ns).is_ok());
        for code in [ResponseCode::ServFail, ResponseCode::Refused, ResponseCode::NotImp] {
            let err = check_response_code(code, ns).unwrap_err();
            assert!(err.is_retryable(), "{code:?} should move on to another nameserver");
        }
    }

    #[tokio::test]
    async fn servfail_from_the_wire_is_an_exchange_failure() {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind nameserver");
        let nameserver = server.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_RESPONSE];
            let (len, client) = server.recv_from(&mut buf).await.expect("query");
            let query = Message::from_vec(&buf[..len]).expect("decode query");
            let mut reply = Message::new();
            reply
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_response_code(ResponseCode::ServFail);
            for q in query.queries() {
                reply.add_query(q.clone());
            }
            let bytes = reply.to_vec().expect("encode reply");
            server.send_to(&bytes, client).await.expect("reply");
        });

        let err = UdpExchange
            .query_a(nameserver, "broken.example")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Exchange { .. }), "got {err:?}");
        assert!(err.is_retryable());
    }
}

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use gssbind_core::ldap::{
    decode_message, encode_request, encode_unbind_request, frame_length, sasl_bind_operation,
    BindResponse, LdapMessage, ProtocolError, Tag,
};
use gssbind_core::{BindError, DirectoryConnection, DirectoryDialer};
use tracing::{debug, info, instrument, warn};

/// Largest LDAP message accepted from the server.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Failure of an LDAP exchange on an established connection.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("LDAP I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<RequestError> for BindError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Protocol(err) => BindError::Protocol(err),
            RequestError::Io(err) => BindError::Io(err),
        }
    }
}

/// The socket and protocol state of a bound connection, for callers that
/// take over the LDAP session themselves.
#[derive(Debug)]
pub struct LdapParts {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Message id the next request must use.
    pub next_message_id: i32,
    /// Bytes already read from the socket but not yet decoded.
    pub read_buffer: Vec<u8>,
}

/// Dials plain LDAP over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    /// Read/write deadline applied to the bind exchange once connected.
    pub io_timeout: Option<Duration>,
}

impl DirectoryDialer for TcpDialer {
    type Connection = LdapConnection;

    #[instrument(name = "ldap.dial", level = "info", skip(self), err)]
    fn dial(&self, host: &str, port: u16, timeout: Duration) -> io::Result<LdapConnection> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let mut last_error = None;

        for address in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&address, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(self.io_timeout)?;
                    stream.set_write_timeout(self.io_timeout)?;
                    info!(%address, "connected to directory server");
                    return Ok(LdapConnection::new(stream, address));
                }
                Err(err) => {
                    debug!(%address, %err, "connection attempt failed");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{host} did not resolve to any address"),
            )
        }))
    }
}

/// An LDAP connection carrying SASL binds and, once bound, any further
/// operations the caller encodes.
///
/// Dropping the connection unbinds and shuts the socket down.
#[derive(Debug)]
pub struct LdapConnection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    next_message_id: i32,
    buffer: Vec<u8>,
}

impl LdapConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
            next_message_id: 1,
            buffer: Vec::new(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Sends an `UnbindRequest` and closes the connection.
    pub fn unbind(mut self) {
        self.close();
    }

    /// Sends `operation` under a fresh message id and returns that id.
    #[instrument(name = "ldap.send", level = "debug", skip_all, fields(peer = %self.peer), err)]
    pub fn send(&mut self, operation: Tag) -> Result<i32, RequestError> {
        let message_id = self.next_id();
        let request = encode_request(message_id, operation)?;

        let stream = self.stream()?;
        stream.write_all(&request)?;
        stream.flush()?;
        debug!(message_id, request_len = request.len(), "request sent");
        Ok(message_id)
    }

    /// Reads the next message from the server, whatever its id.
    pub fn receive(&mut self) -> Result<LdapMessage, RequestError> {
        let frame = self.read_frame()?;
        Ok(decode_message(&frame)?)
    }

    /// Sends `operation` and reads its single response.
    ///
    /// Fails with [`ProtocolError::UnexpectedMessageId`] when the next
    /// message answers something else.
    pub fn request(&mut self, operation: Tag) -> Result<LdapMessage, RequestError> {
        let message_id = self.send(operation)?;
        let response = self.receive()?;
        if response.message_id != message_id {
            return Err(ProtocolError::UnexpectedMessageId {
                expected: message_id,
                actual: response.message_id,
            }
            .into());
        }
        Ok(response)
    }

    /// Releases the socket without unbinding. `None` once closed.
    pub fn into_parts(mut self) -> Option<LdapParts> {
        let stream = self.stream.take()?;
        Some(LdapParts {
            stream,
            peer: self.peer,
            next_message_id: self.next_message_id,
            read_buffer: std::mem::take(&mut self.buffer),
        })
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))
    }

    fn next_id(&mut self) -> i32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.checked_add(1).unwrap_or(1);
        id
    }

    fn read_frame(&mut self) -> Result<Vec<u8>, RequestError> {
        loop {
            if let Some(length) = frame_length(&self.buffer)? {
                if length > MAX_FRAME_LEN {
                    return Err(ProtocolError::LengthTooLarge(length).into());
                }
                if self.buffer.len() >= length {
                    let rest = self.buffer.split_off(length);
                    return Ok(std::mem::replace(&mut self.buffer, rest));
                }
            }

            let mut chunk = [0u8; 4096];
            let read = self.stream()?.read(&mut chunk)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )
                .into());
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

impl DirectoryConnection for LdapConnection {
    #[instrument(
        name = "ldap.sasl_bind",
        level = "debug",
        skip(self, credentials),
        fields(peer = %self.peer, credentials_len = credentials.map(<[u8]>::len))
    )]
    fn sasl_bind(
        &mut self,
        mechanism: &str,
        credentials: Option<&[u8]>,
    ) -> Result<BindResponse, BindError> {
        let message = self.request(sasl_bind_operation(mechanism, credentials))?;
        let response = BindResponse::try_from(message)?;
        let message_id = response.message_id;

        debug!(
            message_id,
            result = %response.result_code,
            server_creds_len = response.server_sasl_creds.as_ref().map(Vec::len),
            "bind response"
        );
        Ok(response)
    }

    fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };

        let message_id = self.next_id();
        match encode_unbind_request(message_id) {
            Ok(unbind) => {
                if let Err(err) = stream.write_all(&unbind) {
                    debug!(%err, "failed to send unbind request");
                }
            }
            Err(err) => warn!(%err, "failed to encode unbind request"),
        }

        if let Err(err) = stream.shutdown(Shutdown::Both) {
            debug!(%err, "socket shutdown failed");
        }
        info!(peer = %self.peer, "directory connection closed");
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn reads_responses_split_across_segments() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 22];
            stream.read_exact(&mut request).unwrap();

            let response = [
                0x30, 0x0c, 0x02, 0x01, 0x01, 0x61, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
            ];
            stream.write_all(&response[..3]).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
            stream.write_all(&response[3..]).unwrap();

            let mut unbind = Vec::new();
            stream.read_to_end(&mut unbind).unwrap();
            unbind
        });

        let dialer = TcpDialer::default();
        let mut connection = dialer
            .dial("127.0.0.1", address.port(), Duration::from_secs(1))
            .unwrap();
        let response = connection.sasl_bind("GSSAPI", None).unwrap();
        assert!(response.is_success());

        connection.close();
        assert!(connection.is_closed());
        assert!(connection.sasl_bind("GSSAPI", None).is_err());

        let unbind = server.join().unwrap();
        assert_eq!(unbind, [0x30, 0x05, 0x02, 0x01, 0x02, 0x42, 0x00]);
    }

    #[test]
    fn mismatched_message_id_is_a_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 22];
            stream.read_exact(&mut request).unwrap();
            stream
                .write_all(&[
                    0x30, 0x0c, 0x02, 0x01, 0x09, 0x61, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04,
                    0x00,
                ])
                .unwrap();
        });

        let mut connection = TcpDialer::default()
            .dial("127.0.0.1", address.port(), Duration::from_secs(1))
            .unwrap();
        let err = connection.sasl_bind("GSSAPI", None).unwrap_err();
        assert!(matches!(
            err,
            BindError::Protocol(ProtocolError::UnexpectedMessageId { expected: 1, actual: 9 })
        ));
        server.join().unwrap();
    }

    #[test]
    fn released_socket_is_not_unbound() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 22];
            stream.read_exact(&mut request).unwrap();
            stream
                .write_all(&[
                    0x30, 0x0c, 0x02, 0x01, 0x01, 0x61, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04,
                    0x00,
                ])
                .unwrap();

            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).unwrap();
            rest
        });

        let mut connection = TcpDialer::default()
            .dial("127.0.0.1", address.port(), Duration::from_secs(1))
            .unwrap();
        connection.sasl_bind("GSSAPI", None).unwrap();

        let parts = connection.into_parts().unwrap();
        assert_eq!(parts.next_message_id, 2);
        assert_eq!(parts.peer, address);
        assert!(parts.read_buffer.is_empty());
        parts.stream.shutdown(Shutdown::Both).unwrap();

        // Drop did not write an UnbindRequest.
        assert!(server.join().unwrap().is_empty());
    }

    #[test]
    fn refused_connection_reports_io_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = TcpDialer::default()
            .dial("127.0.0.1", port, Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}

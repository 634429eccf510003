use std::time::Duration;

use async_trait::async_trait;
use meterlink_core::{DeviceEndpoint, Protocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{ChunkDescriptor, DeviceDriver, DeviceHandle, DriverError, MODBUS_MAX_REGISTERS};

// ADU structure: MBAP header(7) + PDU(function(1) + data)
const MBAP_HEADER_LEN: usize = 7;
const READ_HOLDING_REGISTERS: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Modbus application protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of everything after this field (unit id + PDU).
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DriverError> {
        if bytes.len() < MBAP_HEADER_LEN {
            return Err(DriverError::Malformed(format!(
                "short MBAP header: {} bytes",
                bytes.len()
            )));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }

    pub fn to_bytes(&self) -> [u8; MBAP_HEADER_LEN] {
        let mut bytes = [0u8; MBAP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }
}

/// Encode a read-holding-registers request.
pub fn encode_read_request(transaction_id: u16, unit_id: u8, chunk: ChunkDescriptor) -> Vec<u8> {
    let header = MbapHeader {
        transaction_id,
        protocol_id: 0,
        length: 6,
        unit_id,
    };

    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 5);
    frame.extend_from_slice(&header.to_bytes());
    frame.push(READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&chunk.start.to_be_bytes());
    frame.extend_from_slice(&chunk.count.to_be_bytes());
    frame
}

/// Decode the PDU of a read-holding-registers response into register words.
pub fn decode_read_response(pdu: &[u8], expected: u16) -> Result<Vec<u16>, DriverError> {
    let Some(&function) = pdu.first() else {
        return Err(DriverError::Malformed("empty PDU".into()));
    };

    if function & EXCEPTION_FLAG != 0 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(DriverError::Exception {
            function: function & !EXCEPTION_FLAG,
            code,
        });
    }

    if function != READ_HOLDING_REGISTERS {
        return Err(DriverError::Malformed(format!(
            "unexpected function code {function:#04x}"
        )));
    }

    let byte_count = pdu.get(1).copied().unwrap_or(0) as usize;
    let data = &pdu[2.min(pdu.len())..];
    if byte_count != expected as usize * 2 || data.len() < byte_count {
        return Err(DriverError::Malformed(format!(
            "expected {} register bytes, got {byte_count} (payload {})",
            expected as usize * 2,
            data.len()
        )));
    }

    Ok(data[..byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Modbus TCP driver reading holding registers.
#[derive(Debug, Clone, Default)]
pub struct ModbusTcpDriver;

impl ModbusTcpDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceDriver for ModbusTcpDriver {
    fn protocol(&self) -> Protocol {
        Protocol::ModbusTcp
    }

    async fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceHandle>, DriverError> {
        let addr = endpoint.socket_addr();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(DriverError::Connect { addr, source }),
            Err(_) => return Err(DriverError::Timeout(timeout)),
        };
        stream.set_nodelay(true)?;

        debug!(%addr, unit_id = endpoint.unit_id, "Modbus TCP session opened");

        Ok(Box::new(ModbusTcpHandle {
            stream: Some(stream),
            unit_id: endpoint.unit_id,
            transaction_id: 0,
        }))
    }
}

struct ModbusTcpHandle {
    stream: Option<TcpStream>,
    unit_id: u8,
    transaction_id: u16,
}

impl ModbusTcpHandle {
    async fn exchange(&mut self, chunk: ChunkDescriptor) -> Result<Vec<u16>, DriverError> {
        let stream = self.stream.as_mut().ok_or(DriverError::Closed)?;

        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        stream
            .write_all(&encode_read_request(tid, self.unit_id, chunk))
            .await?;

        // Responses to earlier, timed-out requests may still be in flight;
        // skip frames until our transaction id comes back.
        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            read_frame_part(stream, &mut header).await?;
            let header = MbapHeader::from_bytes(&header)?;

            if header.protocol_id != 0 || header.length < 2 {
                return Err(DriverError::Malformed(format!(
                    "bad MBAP header {header:?}"
                )));
            }

            let mut pdu = vec![0u8; header.length as usize - 1];
            read_frame_part(stream, &mut pdu).await?;

            if header.transaction_id != tid {
                warn!(
                    expected = tid,
                    got = header.transaction_id,
                    "Discarding stale Modbus response"
                );
                continue;
            }

            return decode_read_response(&pdu, chunk.count);
        }
    }
}

async fn read_frame_part(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), DriverError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(DriverError::Closed),
        Err(e) => Err(DriverError::Io(e)),
    }
}

#[async_trait]
impl DeviceHandle for ModbusTcpHandle {
    async fn read_points(
        &mut self,
        chunk: ChunkDescriptor,
        timeout: Duration,
    ) -> Result<Vec<u16>, DriverError> {
        if chunk.count == 0 || chunk.count > MODBUS_MAX_REGISTERS {
            return Err(DriverError::Malformed(format!(
                "invalid register count {}",
                chunk.count
            )));
        }

        match tokio::time::timeout(timeout, self.exchange(chunk)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(timeout)),
        }
    }

    async fn probe(&mut self) -> bool {
        // Any well-formed reply, exceptions included, proves the device is alive.
        match self
            .read_points(ChunkDescriptor::new(0, 1), PROBE_TIMEOUT)
            .await
        {
            Ok(_) | Err(DriverError::Exception { .. }) => true,
            Err(_) => false,
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn request_frame_layout() {
        let frame = encode_read_request(0x0102, 7, ChunkDescriptor::new(0x0010, 4));
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x07, 0x03, 0x00, 0x10, 0x00, 0x04]
        );
    }

    #[test]
    fn decodes_register_words() {
        let pdu = [0x03, 0x04, 0x00, 0x2A, 0x01, 0x00];
        assert_eq!(decode_read_response(&pdu, 2).unwrap(), vec![42, 256]);
    }

    #[test]
    fn decodes_exception_response() {
        let pdu = [0x83, 0x02];
        let err = decode_read_response(&pdu, 2).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Exception {
                function: 0x03,
                code: 0x02
            }
        ));
        assert!(err.to_string().contains("illegal data address"));
    }

    #[test]
    fn rejects_short_payload() {
        let pdu = [0x03, 0x04, 0x00, 0x2A];
        assert!(matches!(
            decode_read_response(&pdu, 2),
            Err(DriverError::Malformed(_))
        ));
    }

    /// Minimal Modbus TCP responder: echoes register address as value.
    async fn serve_one(listener: TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        while socket.read_exact(&mut request).await.is_ok() {
            let start = u16::from_be_bytes([request[8], request[9]]);
            let count = u16::from_be_bytes([request[10], request[11]]);
            let mut pdu = vec![0x03, (count * 2) as u8];
            for offset in 0..count {
                pdu.extend_from_slice(&(start + offset).to_be_bytes());
            }
            let header = MbapHeader {
                transaction_id: u16::from_be_bytes([request[0], request[1]]),
                protocol_id: 0,
                length: pdu.len() as u16 + 1,
                unit_id: request[6],
            };
            socket.write_all(&header.to_bytes()).await.unwrap();
            socket.write_all(&pdu).await.unwrap();
        }
    }

    #[tokio::test]
    async fn reads_from_a_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_one(listener));

        let endpoint = DeviceEndpoint::new("127.0.0.1", port, 1);
        let mut handle = ModbusTcpDriver::new()
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        let words = handle
            .read_points(ChunkDescriptor::new(100, 3), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(words, vec![100, 101, 102]);
        assert!(handle.probe().await);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = DeviceEndpoint::new("127.0.0.1", port, 1);
        let err = ModbusTcpDriver::new()
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DriverError::Connect { .. }));
    }
}

//! Bus port abstraction.
//!
//! [`BusPort`] is the seam between the driver and the wire: one request in,
//! one response out. The production implementation owns the serial device
//! (feature `serial-port`); [`LoopbackPort`] echoes frames back for tests
//! and for running a kiosk with no hardware attached.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Errors from the physical bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No response within the read deadline.
    #[error("bus read timed out")]
    Timeout,

    /// The serial device failed or disappeared.
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The port could not be opened.
    #[error("failed to open serial port '{path}': {reason}")]
    Open { path: String, reason: String },
}

/// One half-duplex exchange on the RS-485 bus.
///
/// Implementations are owned exclusively by the driver actor, so they take
/// `&mut self` and need no internal locking.
#[async_trait::async_trait]
pub trait BusPort: Send {
    /// Write `request` and read the slave's response.
    async fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>, BusError>;
}

/// Test port: records every frame and echoes it back, or pops an injected
/// failure. Also serves as the no-hardware development backend.
#[derive(Debug, Default)]
pub struct LoopbackPort {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    failures: Arc<Mutex<VecDeque<BusError>>>,
}

/// Inspection handle for a [`LoopbackPort`] that has been boxed away.
#[derive(Debug, Clone, Default)]
pub struct LoopbackHandle {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    failures: Arc<Mutex<VecDeque<BusError>>>,
}

impl LoopbackPort {
    #[must_use]
    pub fn new() -> (Self, LoopbackHandle) {
        let port = Self::default();
        let handle = LoopbackHandle {
            sent: Arc::clone(&port.sent),
            failures: Arc::clone(&port.failures),
        };
        (port, handle)
    }
}

impl LoopbackHandle {
    /// Frames written so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<Vec<u8>> {
        #[allow(clippy::unwrap_used)]
        self.sent.lock().unwrap().clone()
    }

    /// Queue a failure for an upcoming transact call.
    pub fn inject_failure(&self, error: BusError) {
        #[allow(clippy::unwrap_used)]
        self.failures.lock().unwrap().push_back(error);
    }
}

#[async_trait::async_trait]
impl BusPort for LoopbackPort {
    async fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>, BusError> {
        {
            #[allow(clippy::unwrap_used)]
            let mut sent = self.sent.lock().unwrap();
            sent.push(request.to_vec());
        }
        let injected = {
            #[allow(clippy::unwrap_used)]
            let mut failures = self.failures.lock().unwrap();
            failures.pop_front()
        };
        match injected {
            Some(error) => Err(error),
            None => Ok(request.to_vec()),
        }
    }
}

#[cfg(feature = "serial-port")]
pub use serial::SerialBusPort;

#[cfg(feature = "serial-port")]
mod serial {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::SerialPortBuilderExt;
    use tracing::trace;

    use super::{BusError, BusPort};
    use crate::modbus::FUNC_WRITE_SINGLE_COIL;

    /// The real RS-485 port, 8N1.
    pub struct SerialBusPort {
        stream: tokio_serial::SerialStream,
        read_timeout: Duration,
    }

    impl SerialBusPort {
        /// Open `path` at `baud`.
        ///
        /// # Errors
        ///
        /// [`BusError::Open`] when the device cannot be opened.
        pub fn open(path: &str, baud: u32, read_timeout: Duration) -> Result<Self, BusError> {
            let stream = tokio_serial::new(path, baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .open_native_async()
                .map_err(|e| BusError::Open {
                    path: path.to_owned(),
                    reason: e.to_string(),
                })?;
            Ok(Self {
                stream,
                read_timeout,
            })
        }

        /// Read a full response: either the 8-byte echo of a single-coil
        /// write (6 for multiple-coils) or a 5-byte exception frame.
        async fn read_response(&mut self, request_func: u8) -> Result<Vec<u8>, BusError> {
            let mut head = [0u8; 2];
            self.stream.read_exact(&mut head).await?;

            let remaining = if head[1] == request_func | 0x80 {
                3 // exception: code + CRC
            } else if request_func == FUNC_WRITE_SINGLE_COIL {
                6
            } else {
                6 // 0x0F echoes addr + count + CRC
            };

            let mut rest = vec![0u8; remaining];
            self.stream.read_exact(&mut rest).await?;

            let mut response = head.to_vec();
            response.extend_from_slice(&rest);
            Ok(response)
        }
    }

    #[async_trait::async_trait]
    impl BusPort for SerialBusPort {
        async fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>, BusError> {
            self.stream.write_all(request).await?;
            self.stream.flush().await?;
            trace!(bytes = request.len(), "frame written");

            let response = tokio::time::timeout(
                self.read_timeout,
                self.read_response(request[1]),
            )
            .await
            .map_err(|_| BusError::Timeout)??;
            trace!(bytes = response.len(), "frame read");
            Ok(response)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_echoes_and_records() {
        let (mut port, handle) = LoopbackPort::new();
        let response = port.transact(&[1, 5, 0, 0, 0xFF, 0, 0x8C, 0x3A]).await.unwrap();
        assert_eq!(response, vec![1, 5, 0, 0, 0xFF, 0, 0x8C, 0x3A]);
        assert_eq!(handle.sent().len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_surface_once() {
        let (mut port, handle) = LoopbackPort::new();
        handle.inject_failure(BusError::Timeout);
        assert!(matches!(
            port.transact(&[1, 5, 0, 0, 0, 0, 0, 0]).await,
            Err(BusError::Timeout)
        ));
        assert!(port.transact(&[1, 5, 0, 0, 0, 0, 0, 0]).await.is_ok());
    }
}

// src/io/transport.rs
//
// Transport seam between the Modbus client and the wire.
//
// `ModbusTransport` is the request/response surface the client drives. The
// production implementation wraps a tokio-modbus client context over TCP or
// RTU; tests substitute a scripted transport. Every call is bounded by the
// transport's own timeout and records the PDU bytes of the exchange so the
// client can log it as a transaction.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::*;

use super::modbus_client::{ConnectionConfig, TcpParams, TransportKind};
use super::pdu::{self, WireCapture};
use super::serial::open_serial_stream;
use super::ModbusError;

/// Timeout applied to every transport call until the caller overrides it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause of the close watch while response bytes wait for the client.
const CLOSE_WATCH_BACKOFF: Duration = Duration::from_millis(50);

// ============================================================================
// Trait
// ============================================================================

#[async_trait]
pub trait ModbusTransport: Send {
    fn is_open(&self) -> bool;

    async fn open(&mut self) -> Result<(), ModbusError>;

    async fn close(&mut self) -> Result<(), ModbusError>;

    fn set_unit_id(&mut self, unit_id: u8);

    fn set_timeout(&mut self, timeout: Duration);

    fn timeout(&self) -> Duration;

    /// Enable recording of request/response bytes.
    fn set_capture(&mut self, enabled: bool);

    /// The most recent exchange, cleared so it is only logged once.
    fn take_capture(&mut self) -> Option<WireCapture>;

    /// Resolves with a reason when the open link is closed from the far
    /// side. Taken once per open; `None` when the transport cannot tell.
    fn take_close_signal(&mut self) -> Option<oneshot::Receiver<String>> {
        None
    }

    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>, ModbusError>;

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, ModbusError>;

    async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ModbusError>;

    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ModbusError>;

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ModbusError>;

    async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<(), ModbusError>;

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError>;

    async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError>;
}

/// Builds a fresh, closed transport for a connection config.
pub type TransportFactory =
    Arc<dyn Fn(&ConnectionConfig) -> Box<dyn ModbusTransport> + Send + Sync>;

/// Factory producing tokio-modbus backed transports.
pub fn default_factory() -> TransportFactory {
    Arc::new(|config: &ConnectionConfig| {
        Box::new(TokioModbusTransport::new(config.clone())) as Box<dyn ModbusTransport>
    })
}

// ============================================================================
// tokio-modbus Transport
// ============================================================================

/// TCP or RTU transport over a tokio-modbus client context.
///
/// TCP links carry a close watch on a second handle of the same socket, so a
/// peer close is noticed while the client is idle. RTU lines with
/// `auto_open` off open the device on the first request instead of in `open`.
pub struct TokioModbusTransport {
    config: ConnectionConfig,
    ctx: Option<Context>,
    /// RTU device is opened by the first request
    deferred: bool,
    unit_id: u8,
    timeout: Duration,
    capture_enabled: bool,
    capture: Option<WireCapture>,
    close_watch: Option<JoinHandle<()>>,
    close_signal: Option<oneshot::Receiver<String>>,
}

impl TokioModbusTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        let unit_id = config.unit_id;
        Self {
            config,
            ctx: None,
            deferred: false,
            unit_id,
            timeout: DEFAULT_TIMEOUT,
            capture_enabled: false,
            capture: None,
            close_watch: None,
            close_signal: None,
        }
    }

    fn context(&mut self) -> Result<&mut Context, ModbusError> {
        if self.ctx.is_none() && self.deferred {
            self.ctx = Some(self.open_rtu()?);
            self.deferred = false;
        }
        self.ctx.as_mut().ok_or(ModbusError::NotConnected)
    }

    fn stop_close_watch(&mut self) {
        if let Some(handle) = self.close_watch.take() {
            handle.abort();
        }
        self.close_signal = None;
    }

    /// Connect and attach a context. Returns the context and a second handle
    /// of the socket for the close watch.
    async fn open_tcp(
        tcp_params: TcpParams,
        unit_id: u8,
    ) -> Result<(Context, TcpStream), ModbusError> {
        let connect_timeout = Duration::from_millis(tcp_params.timeout_ms.max(1));

        let addr = tokio::net::lookup_host((tcp_params.host.as_str(), tcp_params.port))
            .await?
            .next()
            .ok_or_else(|| {
                ModbusError::InvalidArgument(format!("cannot resolve host {}", tcp_params.host))
            })?;

        tlog!("[ModbusTransport] Connecting to {}", addr);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => return Err(ModbusError::Timeout(connect_timeout)),
        };

        let stream = stream.into_std()?;
        let watch = stream.try_clone()?;
        let stream = TcpStream::from_std(stream)?;
        let watch = TcpStream::from_std(watch)?;
        Ok((tcp::attach_slave(stream, Slave(unit_id)), watch))
    }

    fn open_rtu(&self) -> Result<Context, ModbusError> {
        tlog!(
            "[ModbusTransport] Opening {} at {} baud",
            self.config.rtu.com,
            self.config.rtu.baud_rate
        );
        let stream = open_serial_stream(&self.config.rtu)?;
        Ok(rtu::attach_slave(stream, Slave(self.unit_id)))
    }

    /// Map the outcome of one call, drop the context if the link is gone and
    /// record the exchange.
    fn finish<T>(
        &mut self,
        request: Vec<u8>,
        function_code: u8,
        result: Result<tokio_modbus::Result<T>, Elapsed>,
        response: impl FnOnce(&T) -> Vec<u8>,
    ) -> Result<T, ModbusError> {
        let (outcome, response_bytes) = match result {
            Err(_) => (Err(ModbusError::Timeout(self.timeout)), None),
            Ok(Err(e)) => {
                let err = ModbusError::from(e);
                if err.is_connection_lost() {
                    self.ctx = None;
                    self.stop_close_watch();
                }
                (Err(err), None)
            }
            Ok(Ok(Err(code))) => (
                Err(ModbusError::Exception(code)),
                Some(pdu::exception_response(self.unit_id, function_code, code)),
            ),
            Ok(Ok(Ok(value))) => {
                let bytes = response(&value);
                (Ok(value), Some(bytes))
            }
        };

        if self.capture_enabled {
            self.capture = Some(WireCapture {
                request,
                responses: response_bytes.into_iter().collect(),
            });
        }
        outcome
    }
}

#[async_trait]
impl ModbusTransport for TokioModbusTransport {
    fn is_open(&self) -> bool {
        self.ctx.is_some() || self.deferred
    }

    async fn open(&mut self) -> Result<(), ModbusError> {
        self.stop_close_watch();
        match self.config.transport {
            TransportKind::Tcp => {
                let (ctx, watch) = Self::open_tcp(self.config.tcp.clone(), self.unit_id).await?;
                let (tx, rx) = oneshot::channel();
                self.close_watch = Some(spawn_close_watch(watch, tx));
                self.close_signal = Some(rx);
                self.ctx = Some(ctx);
            }
            TransportKind::Rtu if !self.config.rtu.auto_open => {
                tlog!(
                    "[ModbusTransport] {} opens on the first request",
                    self.config.rtu.com
                );
                self.deferred = true;
            }
            TransportKind::Rtu => self.ctx = Some(self.open_rtu()?),
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ModbusError> {
        self.stop_close_watch();
        self.deferred = false;
        let Some(mut ctx) = self.ctx.take() else {
            return Ok(());
        };
        match ctx.disconnect().await {
            Ok(_) => Ok(()),
            Err(e) => Err(ModbusError::ConnectionClosed(e.to_string())),
        }
    }

    fn set_unit_id(&mut self, unit_id: u8) {
        self.unit_id = unit_id;
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.set_slave(Slave(unit_id));
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_capture(&mut self, enabled: bool) {
        self.capture_enabled = enabled;
        if !enabled {
            self.capture = None;
        }
    }

    fn take_capture(&mut self) -> Option<WireCapture> {
        self.capture.take()
    }

    fn take_close_signal(&mut self) -> Option<oneshot::Receiver<String>> {
        self.close_signal.take()
    }

    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>, ModbusError> {
        let unit_id = self.unit_id;
        let request = pdu::read_request(unit_id, pdu::FC_READ_COILS, address, quantity);
        let timeout = self.timeout;
        let result = tokio::time::timeout(timeout, self.context()?.read_coils(address, quantity)).await;
        self.finish(request, pdu::FC_READ_COILS, result, |bits| {
            pdu::read_bits_response(unit_id, pdu::FC_READ_COILS, bits)
        })
    }

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        let unit_id = self.unit_id;
        let fc = pdu::FC_READ_DISCRETE_INPUTS;
        let request = pdu::read_request(unit_id, fc, address, quantity);
        let timeout = self.timeout;
        let result =
            tokio::time::timeout(timeout, self.context()?.read_discrete_inputs(address, quantity))
                .await;
        self.finish(request, fc, result, |bits| pdu::read_bits_response(unit_id, fc, bits))
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let unit_id = self.unit_id;
        let fc = pdu::FC_READ_HOLDING_REGISTERS;
        let request = pdu::read_request(unit_id, fc, address, quantity);
        let timeout = self.timeout;
        let result =
            tokio::time::timeout(timeout, self.context()?.read_holding_registers(address, quantity))
                .await;
        self.finish(request, fc, result, |words| {
            pdu::read_registers_response(unit_id, fc, words)
        })
    }

    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let unit_id = self.unit_id;
        let fc = pdu::FC_READ_INPUT_REGISTERS;
        let request = pdu::read_request(unit_id, fc, address, quantity);
        let timeout = self.timeout;
        let result =
            tokio::time::timeout(timeout, self.context()?.read_input_registers(address, quantity))
                .await;
        self.finish(request, fc, result, |words| {
            pdu::read_registers_response(unit_id, fc, words)
        })
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ModbusError> {
        let request = pdu::write_single_coil(self.unit_id, address, value);
        let echo = request.clone();
        let timeout = self.timeout;
        let result =
            tokio::time::timeout(timeout, self.context()?.write_single_coil(address, value)).await;
        self.finish(request, pdu::FC_WRITE_SINGLE_COIL, result, |_| echo)
    }

    async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        let unit_id = self.unit_id;
        let fc = pdu::FC_WRITE_MULTIPLE_COILS;
        let request = pdu::write_multiple_coils(unit_id, address, values);
        let quantity = values.len() as u16;
        let timeout = self.timeout;
        let result =
            tokio::time::timeout(timeout, self.context()?.write_multiple_coils(address, values))
                .await;
        self.finish(request, fc, result, |_| {
            pdu::write_multiple_response(unit_id, fc, address, quantity)
        })
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError> {
        let request = pdu::write_single_register(self.unit_id, address, value);
        let echo = request.clone();
        let timeout = self.timeout;
        let result =
            tokio::time::timeout(timeout, self.context()?.write_single_register(address, value))
                .await;
        self.finish(request, pdu::FC_WRITE_SINGLE_REGISTER, result, |_| echo)
    }

    async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let unit_id = self.unit_id;
        let fc = pdu::FC_WRITE_MULTIPLE_REGISTERS;
        let request = pdu::write_multiple_registers(unit_id, address, values);
        let quantity = values.len() as u16;
        let timeout = self.timeout;
        let result = tokio::time::timeout(
            timeout,
            self.context()?.write_multiple_registers(address, values),
        )
        .await;
        self.finish(request, fc, result, |_| {
            pdu::write_multiple_response(unit_id, fc, address, quantity)
        })
    }
}

impl Drop for TokioModbusTransport {
    fn drop(&mut self) {
        self.stop_close_watch();
    }
}

/// Wait on the second socket handle until the peer closes or the link fails.
/// Pending response bytes belong to the client context; the watch only peeks.
fn spawn_close_watch(watch: TcpStream, tx: oneshot::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 1];
        let reason = loop {
            match watch.peek(&mut buf).await {
                Ok(0) => break "connection closed by peer".to_string(),
                Ok(_) => tokio::time::sleep(CLOSE_WATCH_BACKOFF).await,
                Err(e) => break e.to_string(),
            }
        };
        let _ = tx.send(reason);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_before_open_report_not_connected() {
        let mut transport = TokioModbusTransport::new(ConnectionConfig::default());
        assert!(!transport.is_open());
        let err = transport.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::NotConnected));
        // Nothing was sent, so nothing is captured
        transport.set_capture(true);
        assert!(transport.take_capture().is_none());
    }

    #[tokio::test]
    async fn test_close_when_not_open_is_ok() {
        let mut transport = TokioModbusTransport::new(ConnectionConfig::default());
        assert!(transport.close().await.is_ok());
        assert_eq!(transport.timeout(), DEFAULT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_open_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = ConnectionConfig::default();
        config.tcp.port = port;
        let mut transport = TokioModbusTransport::new(config);
        assert!(transport.open().await.is_err());
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_peer_close_is_signalled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut config = ConnectionConfig::default();
        config.tcp.port = port;
        let mut transport = TokioModbusTransport::new(config);
        transport.open().await.unwrap();
        let signal = transport.take_close_signal().unwrap();
        assert!(transport.take_close_signal().is_none());
        peer.await.unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(2), signal)
            .await
            .unwrap()
            .unwrap();
        assert!(!reason.is_empty());
    }

    #[tokio::test]
    async fn test_local_close_drops_signal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            let _ = hold_rx.await;
        });

        let mut config = ConnectionConfig::default();
        config.tcp.port = port;
        let mut transport = TokioModbusTransport::new(config);
        transport.open().await.unwrap();
        let signal = transport.take_close_signal().unwrap();

        transport.close().await.unwrap();
        assert!(!transport.is_open());
        // Watch is gone before the peer hangs up: no close reason is sent
        let result = tokio::time::timeout(Duration::from_secs(2), signal)
            .await
            .unwrap();
        assert!(result.is_err());
        let _ = hold_tx.send(());
    }

    fn missing_rtu(auto_open: bool) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();
        config.transport = TransportKind::Rtu;
        config.rtu.com = "/dev/modscope-missing".into();
        config.rtu.auto_open = auto_open;
        config
    }

    #[tokio::test]
    async fn test_rtu_auto_open_opens_in_open() {
        let mut transport = TokioModbusTransport::new(missing_rtu(true));
        assert!(matches!(transport.open().await, Err(ModbusError::Serial(_))));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_rtu_without_auto_open_opens_on_first_request() {
        let mut transport = TokioModbusTransport::new(missing_rtu(false));
        transport.open().await.unwrap();
        assert!(transport.is_open());
        assert!(transport.take_close_signal().is_none());

        let err = transport.read_holding_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Serial(_)));

        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }
}

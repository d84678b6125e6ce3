// src/io/modbus_client/mock.rs
//
// Scripted in-memory transport for client tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_modbus::ExceptionCode;

use super::lock;
use crate::io::pdu::{self, WireCapture};
use crate::io::transport::{ModbusTransport, TransportFactory, DEFAULT_TIMEOUT};
use crate::io::ModbusError;

/// How a request starting at a given address fails.
#[derive(Clone, Copy, Debug)]
pub enum MockFault {
    /// Device answers with IllegalDataAddress
    Exception,
    /// Link drops while the request is on the wire
    LinkDown,
}

/// Device behind the mock link. Shared by every transport the factory builds.
#[derive(Default)]
pub struct MockDevice {
    pub holding: HashMap<u16, u16>,
    pub input: HashMap<u16, u16>,
    pub coils: HashMap<u16, bool>,
    pub discrete: HashMap<u16, bool>,
    /// Units that answer; `None` means all of them
    pub units: Option<HashSet<u8>>,
    pub fail_open: bool,
    pub hang_close: bool,
    pub link_up: bool,
    pub read_delay: Duration,
    pub open_delay: Duration,
    /// Requests starting at these addresses fail
    pub faults: HashMap<u16, MockFault>,
    close_senders: Vec<oneshot::Sender<String>>,

    pub open_attempts: usize,
    /// Every request that reached the device, as `(unit, fc, address, quantity)`
    pub requests: Vec<(u8, u8, u16, u16)>,
    pub in_flight: usize,
    pub max_in_flight: usize,
}

impl MockDevice {
    pub fn shared() -> Arc<Mutex<MockDevice>> {
        Arc::new(Mutex::new(MockDevice::default()))
    }

    /// Drop the link from the device side and signal every open transport.
    pub fn peer_close(&mut self) {
        self.link_up = false;
        for tx in self.close_senders.drain(..) {
            let _ = tx.send("mock peer closed".into());
        }
    }
}

pub fn mock_factory(device: Arc<Mutex<MockDevice>>) -> TransportFactory {
    Arc::new(move |_config| {
        Box::new(MockTransport {
            device: device.clone(),
            open: false,
            unit_id: 1,
            timeout: DEFAULT_TIMEOUT,
            capture_enabled: false,
            capture: None,
            close_signal: None,
        }) as Box<dyn ModbusTransport>
    })
}

pub struct MockTransport {
    device: Arc<Mutex<MockDevice>>,
    open: bool,
    unit_id: u8,
    timeout: Duration,
    capture_enabled: bool,
    capture: Option<WireCapture>,
    close_signal: Option<oneshot::Receiver<String>>,
}

impl MockTransport {
    /// Common request path: link check, unit check, delay, bookkeeping.
    async fn exchange(&mut self, fc: u8, address: u16, quantity: u16) -> Result<(), ModbusError> {
        if self.capture_enabled {
            self.capture = Some(WireCapture {
                request: pdu::read_request(self.unit_id, fc, address, quantity),
                responses: Vec::new(),
            });
        }
        let (delay, answers) = {
            let mut device = lock(&self.device);
            if !self.open || !device.link_up {
                self.open = false;
                return Err(ModbusError::ConnectionClosed("mock link down".into()));
            }
            device.requests.push((self.unit_id, fc, address, quantity));
            let fault = device.faults.get(&address).copied();
            match fault {
                Some(MockFault::Exception) => {
                    return Err(ModbusError::Exception(ExceptionCode::IllegalDataAddress))
                }
                Some(MockFault::LinkDown) => {
                    device.link_up = false;
                    self.open = false;
                    return Err(ModbusError::ConnectionClosed("mock link dropped".into()));
                }
                None => {}
            }
            device.in_flight += 1;
            device.max_in_flight = device.max_in_flight.max(device.in_flight);
            let answers = device
                .units
                .as_ref()
                .map_or(true, |units| units.contains(&self.unit_id));
            (device.read_delay, answers)
        };

        if !answers {
            tokio::time::sleep(self.timeout).await;
        } else if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.device).in_flight -= 1;

        if !answers {
            return Err(ModbusError::Timeout(self.timeout));
        }
        if let Some(capture) = self.capture.as_mut() {
            capture.responses.push(vec![self.unit_id, fc]);
        }
        Ok(())
    }

    fn words(map: &HashMap<u16, u16>, address: u16, quantity: u16) -> Vec<u16> {
        (0..quantity)
            .map(|i| *map.get(&address.wrapping_add(i)).unwrap_or(&0))
            .collect()
    }

    fn bits(map: &HashMap<u16, bool>, address: u16, quantity: u16) -> Vec<bool> {
        (0..quantity)
            .map(|i| *map.get(&address.wrapping_add(i)).unwrap_or(&false))
            .collect()
    }
}

#[async_trait]
impl ModbusTransport for MockTransport {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<(), ModbusError> {
        let delay = lock(&self.device).open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut device = lock(&self.device);
        device.open_attempts += 1;
        if device.fail_open {
            return Err(ModbusError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock refused",
            )));
        }
        let (tx, rx) = oneshot::channel();
        device.close_senders.push(tx);
        device.link_up = true;
        self.close_signal = Some(rx);
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ModbusError> {
        let hang = lock(&self.device).hang_close;
        if hang {
            std::future::pending::<()>().await;
        }
        self.open = false;
        Ok(())
    }

    fn set_unit_id(&mut self, unit_id: u8) {
        self.unit_id = unit_id;
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_capture(&mut self, enabled: bool) {
        self.capture_enabled = enabled;
    }

    fn take_capture(&mut self) -> Option<WireCapture> {
        self.capture.take()
    }

    fn take_close_signal(&mut self) -> Option<oneshot::Receiver<String>> {
        self.close_signal.take()
    }

    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>, ModbusError> {
        self.exchange(pdu::FC_READ_COILS, address, quantity).await?;
        Ok(Self::bits(&lock(&self.device).coils, address, quantity))
    }

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        self.exchange(pdu::FC_READ_DISCRETE_INPUTS, address, quantity).await?;
        Ok(Self::bits(&lock(&self.device).discrete, address, quantity))
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.exchange(pdu::FC_READ_HOLDING_REGISTERS, address, quantity).await?;
        Ok(Self::words(&lock(&self.device).holding, address, quantity))
    }

    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.exchange(pdu::FC_READ_INPUT_REGISTERS, address, quantity).await?;
        Ok(Self::words(&lock(&self.device).input, address, quantity))
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), ModbusError> {
        self.exchange(pdu::FC_WRITE_SINGLE_COIL, address, 1).await?;
        lock(&self.device).coils.insert(address, value);
        Ok(())
    }

    async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        self.exchange(pdu::FC_WRITE_MULTIPLE_COILS, address, values.len() as u16)
            .await?;
        let mut device = lock(&self.device);
        for (i, v) in values.iter().enumerate() {
            device.coils.insert(address + i as u16, *v);
        }
        Ok(())
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError> {
        self.exchange(pdu::FC_WRITE_SINGLE_REGISTER, address, 1).await?;
        lock(&self.device).holding.insert(address, value);
        Ok(())
    }

    async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        self.exchange(pdu::FC_WRITE_MULTIPLE_REGISTERS, address, values.len() as u16)
            .await?;
        let mut device = lock(&self.device);
        for (i, v) in values.iter().enumerate() {
            device.holding.insert(address + i as u16, *v);
        }
        Ok(())
    }
}

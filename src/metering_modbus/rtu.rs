use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::thread;

use log::{debug, error, info};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ErrorKind, ModbusProto};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, UnboundedReceiver, UnboundedSender};

use crate::config::Config;
use crate::models::BusErrorCode;
use super::bus::{BusError, BusRequest, BusSession, Completion, FunctionCode};

/// A request with its frame, ready for the wire
struct Pending {
    request: BusRequest,
    mreq: ModbusRequest,
    frame: Vec<u8>,
}

/// Modbus RTU client on a local serial port. One worker thread owns the
/// port and runs the requests strictly one after another.
pub struct RtuBus {
    requests: mpsc::Sender<Pending>,
}

impl RtuBus {
    pub fn open(config: &Config) -> Result<(RtuBus, UnboundedReceiver<Completion>), BusError> {
        let stop_bits = if config.stop_bits() == 2 { StopBits::Two } else { StopBits::One };
        let port = serialport::new(config.bus.port.as_str(), config.bus.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(stop_bits)
            .timeout(config.timeout())
            .open()
            .map_err(|e| BusError::Open { port: config.bus.port.clone(), reason: e.to_string() })?;

        let (bus, req_rx) = RtuBus::channel(config.queue_depth());
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("modbus-rtu".to_string())
            .spawn(move || run_worker(port, req_rx, done_tx))
            .map_err(|e| BusError::Open { port: config.bus.port.clone(), reason: e.to_string() })?;

        info!(
            "Modbus RTU on {} with {} baud 8N{}, timeout {}ms, queue depth {}",
            config.bus.port,
            config.bus.baud_rate,
            config.stop_bits(),
            config.bus.timeout_ms,
            config.queue_depth()
        );
        Ok((bus, done_rx))
    }

    fn channel(depth: usize) -> (RtuBus, Receiver<Pending>) {
        let (tx, rx) = mpsc::channel(depth);
        (RtuBus { requests: tx }, rx)
    }
}

impl BusSession for RtuBus {
    fn enqueue(&self, request: BusRequest) -> Result<(), BusError> {
        let (mreq, frame) = build_frame(&request)?;
        self.requests
            .try_send(Pending { request, mreq, frame })
            .map_err(|e| match e {
                TrySendError::Full(_) => BusError::QueueFull,
                TrySendError::Closed(_) => BusError::Closed,
            })
    }
}

fn build_frame(request: &BusRequest) -> Result<(ModbusRequest, Vec<u8>), BusError> {
    let mut mreq = ModbusRequest::new(request.address, ModbusProto::Rtu);
    let mut frame = Vec::new();
    let r = match request.function {
        FunctionCode::ReadHoldingRegisters => mreq.generate_get_holdings(request.register, request.count, &mut frame),
        FunctionCode::ReadInputRegisters => mreq.generate_get_inputs(request.register, request.count, &mut frame),
    };
    r.map_err(|e| BusError::Frame(format!("{:?}", e)))?;
    Ok((mreq, frame))
}

fn run_worker(mut port: Box<dyn SerialPort>, mut requests: Receiver<Pending>, done: UnboundedSender<Completion>) {
    debug!("RTU worker started");
    while let Some(pending) = requests.blocking_recv() {
        let outcome = transact(port.as_mut(), &pending);
        if let Err(code) = &outcome {
            debug!(
                "Request to {} register {:#06x} failed: {}",
                pending.request.address, pending.request.register, code
            );
        }

        let completion = Completion {
            address: pending.request.address,
            token: pending.request.token,
            outcome,
        };
        if done.send(completion).is_err() {
            info!("Nobody listens for completions anymore, stopping RTU worker");
            return;
        }
    }
    error!("RTU request queue closed, worker stopped");
}

fn transact(port: &mut dyn SerialPort, pending: &Pending) -> Result<Vec<u8>, BusErrorCode> {
    /* Leftovers of a timed out request must not be taken as our answer */
    if let Err(e) = port.clear(ClearBuffer::Input) {
        debug!("Unable to clear input buffer: {}", e);
    }

    port.write_all(&pending.frame).map_err(io_code)?;
    port.flush().map_err(io_code)?;

    let mut response = vec![0u8; 3];
    port.read_exact(&mut response).map_err(io_code)?;

    let len = guess_response_frame_len(&response, ModbusProto::Rtu).map_err(classify)? as usize;
    if len > response.len() {
        response.resize(len, 0);
        port.read_exact(&mut response[3..]).map_err(io_code)?;
    }

    parse_response(&pending.mreq, &response)
}

/// Register payload of a response as big endian bytes
fn parse_response(mreq: &ModbusRequest, response: &[u8]) -> Result<Vec<u8>, BusErrorCode> {
    let mut words: Vec<u16> = Vec::new();
    mreq.parse_u16(response, &mut words).map_err(classify)?;
    Ok(words.iter().flat_map(|w| w.to_be_bytes()).collect())
}

fn io_code(e: std::io::Error) -> BusErrorCode {
    match e.kind() {
        IoErrorKind::TimedOut | IoErrorKind::WouldBlock | IoErrorKind::UnexpectedEof => BusErrorCode::Timeout,
        _ => BusErrorCode::Transport,
    }
}

fn classify(e: ErrorKind) -> BusErrorCode {
    match e {
        ErrorKind::FrameCRCError => BusErrorCode::CrcMismatch,
        ErrorKind::IllegalFunction => BusErrorCode::DeviceException(0x01),
        ErrorKind::IllegalDataAddress => BusErrorCode::DeviceException(0x02),
        ErrorKind::IllegalDataValue => BusErrorCode::DeviceException(0x03),
        ErrorKind::SlaveDeviceFailure => BusErrorCode::DeviceException(0x04),
        _ => BusErrorCode::MalformedFrame,
    }
}

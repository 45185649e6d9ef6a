//! Keithley 2400-series SMU over SCPI.
//!
//! The driver only needs a byte stream, so the same code runs over a raw
//! socket (`TCPIP::host::port::SOCKET`) or, with the `instrument_visa`
//! feature, any VISA resource.

use log::{debug, info};
use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use crate::{
    smu::{SourceMeter, SourceSetup},
    DriveMode, Quantity, SweepError, SweepResult,
};

/// Steps used to bring the source back to zero on shutdown.
const RAMP_STEPS: usize = 10;

pub struct Keithley2400<T: Read + Write> {
    device: String,
    port: T,
    timeout: Duration,
    inbox: Vec<u8>,
    level: f64,
    output_on: bool,
    mode: DriveMode,
    ramp_pause: Duration,
}

impl<T: Read + Write> Keithley2400<T> {
    pub fn new(device: impl Into<String>, port: T, timeout: Duration) -> Self {
        Self {
            device: device.into(),
            port,
            timeout,
            inbox: Vec::new(),
            level: 0.0,
            output_on: false,
            mode: DriveMode::CurrentDriven,
            ramp_pause: Duration::ZERO,
        }
    }

    pub fn into_port(self) -> T {
        self.port
    }

    fn io_error(&self, operation: &str, e: io::Error) -> SweepError {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SweepError::InstrumentTimeout {
                device: self.device.clone(),
                operation: operation.to_string(),
                timeout: self.timeout,
            },
            _ => SweepError::instrument(&self.device, format!("{operation}: {e}")),
        }
    }

    fn write(&mut self, command: &str) -> SweepResult<()> {
        debug!("{} <- {command}", self.device);
        let line = format!("{command}\n");
        self.port
            .write_all(line.as_bytes())
            .and_then(|()| self.port.flush())
            .map_err(|e| self.io_error(command, e))
    }

    /// One reply line. The whole line must arrive within the driver timeout,
    /// however the bytes are split across reads.
    fn read_line(&mut self, operation: &str) -> SweepResult<String> {
        let mut chunk = [0u8; 256];
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(end) = self.inbox.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.inbox.drain(..=end).collect();
                let reply = String::from_utf8_lossy(&line).trim().to_string();
                debug!("{} -> {reply}", self.device);
                return Ok(reply);
            }
            if Instant::now() >= deadline {
                return Err(self.io_error(operation, io::ErrorKind::TimedOut.into()));
            }
            match self.port.read(&mut chunk) {
                Ok(0) => {
                    return Err(SweepError::instrument(
                        &self.device,
                        format!("{operation}: connection closed"),
                    ))
                }
                Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(operation, e)),
            }
        }
    }

    fn query(&mut self, command: &str) -> SweepResult<String> {
        self.write(command)?;
        self.read_line(command)
    }

    /// Fails on the first entry of the instrument's error queue.
    fn check_errors(&mut self) -> SweepResult<()> {
        let reply = self.query(":SYST:ERR?")?;
        let code = reply
            .split(',')
            .next()
            .and_then(|c| c.trim().parse::<i32>().ok());
        match code {
            Some(0) => Ok(()),
            _ => Err(SweepError::instrument(&self.device, reply)),
        }
    }

    fn parse_reading(&self, reply: &str, quantity: Quantity) -> SweepResult<f64> {
        let values: Vec<f64> = reply
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| {
                SweepError::instrument(&self.device, format!("unexpected reading {reply:?}"))
            })?;
        match (quantity, values.as_slice()) {
            (Quantity::Voltage, [v, _, ..]) => Ok(*v),
            (Quantity::Current, [_, i, ..]) => Ok(*i),
            _ => Err(SweepError::instrument(
                &self.device,
                format!("unexpected reading {reply:?}"),
            )),
        }
    }
}

fn scpi(quantity: Quantity) -> &'static str {
    match quantity {
        Quantity::Current => "CURR",
        Quantity::Voltage => "VOLT",
    }
}

impl<T: Read + Write> SourceMeter for Keithley2400<T> {
    fn device(&self) -> &str {
        &self.device
    }

    fn identify(&mut self) -> SweepResult<String> {
        self.query("*IDN?")
    }

    fn configure(&mut self, setup: &SourceSetup) -> SweepResult<()> {
        let source = scpi(setup.drive_mode.sourced());
        let (sense, protection) = match setup.drive_mode {
            DriveMode::CurrentDriven => ("VOLT", setup.compliance_voltage),
            DriveMode::VoltageDriven => ("CURR", setup.compliance_current),
        };

        self.write("*RST")?;
        self.write("*CLS")?;
        self.write(":ROUT:TERM FRON")?;
        self.write(&format!(":SOUR:FUNC {source}"))?;
        self.write(&format!(":SOUR:{source}:MODE FIX"))?;
        self.write(&format!(":SOUR:{source}:RANG:AUTO 1"))?;
        self.write(&format!(":SENS:FUNC \"{sense}\""))?;
        self.write(&format!(":SENS:{sense}:PROT {protection:e}"))?;
        self.write(&format!(":SENS:{sense}:RANG:AUTO 1"))?;
        self.write(&format!(":SENS:{sense}:NPLC {}", setup.nplc))?;
        self.write(&format!(":SOUR:DEL {}", setup.source_delay))?;
        self.write(":TRIG:COUN 1")?;
        self.write(":FORM:ELEM VOLT,CURR")?;
        self.write(&format!(":SOUR:{source}:LEV 0"))?;
        self.write(":OUTP ON")?;
        self.query("*OPC?")?;
        self.check_errors()?;

        self.mode = setup.drive_mode;
        self.level = 0.0;
        self.output_on = true;
        self.ramp_pause = Duration::from_secs_f64(setup.source_delay.max(0.0));
        info!("{}: output enabled", self.device);
        Ok(())
    }

    fn set_level(&mut self, quantity: Quantity, value: f64) -> SweepResult<()> {
        if !self.output_on {
            return Err(SweepError::instrument(&self.device, "output not enabled"));
        }
        if quantity != self.mode.sourced() {
            return Err(SweepError::instrument(
                &self.device,
                format!("cannot source {quantity} in {:?} mode", self.mode),
            ));
        }
        self.write(&format!(":SOUR:{}:LEV {value:e}", scpi(quantity)))?;
        self.level = value;
        Ok(())
    }

    fn read_back(&mut self, quantity: Quantity) -> SweepResult<f64> {
        let reply = self.query(":READ?")?;
        self.parse_reading(&reply, quantity)
    }

    fn shutdown(&mut self) -> SweepResult<()> {
        if !self.output_on {
            return Ok(());
        }
        let source = scpi(self.mode.sourced());
        let start = self.level;
        for step in (0..RAMP_STEPS).rev() {
            let value = start * step as f64 / RAMP_STEPS as f64;
            self.write(&format!(":SOUR:{source}:LEV {value:e}"))?;
            if !self.ramp_pause.is_zero() {
                std::thread::sleep(self.ramp_pause);
            }
        }
        self.level = 0.0;
        self.write(":OUTP OFF")?;
        self.output_on = false;
        Ok(())
    }
}

/// Host and port of a `TCPIP[n]::host::port::SOCKET` address.
pub fn parse_socket_address(device_id: &str) -> Option<(String, u16)> {
    let parts: Vec<&str> = device_id.split("::").collect();
    match parts.as_slice() {
        [board, host, port, kind]
            if board.to_ascii_uppercase().starts_with("TCPIP")
                && kind.eq_ignore_ascii_case("SOCKET") =>
        {
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => None,
    }
}

/// Open the SMU named by `device_id`.
pub fn connect(device_id: &str, timeout: Duration) -> SweepResult<Box<dyn SourceMeter + Send>> {
    if let Some((host, port)) = parse_socket_address(device_id) {
        let addr = (host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SweepError::config(format!("cannot resolve {host}")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                SweepError::InstrumentTimeout {
                    device: device_id.to_string(),
                    operation: "connect".into(),
                    timeout,
                }
            } else {
                SweepError::instrument(device_id, format!("connect: {e}"))
            }
        })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        return Ok(Box::new(Keithley2400::new(device_id, stream, timeout)));
    }

    open_resource(device_id, timeout)
}

#[cfg(feature = "instrument_visa")]
fn open_resource(device_id: &str, timeout: Duration) -> SweepResult<Box<dyn SourceMeter + Send>> {
    let session = visa::VisaSession::open(device_id, timeout)?;
    Ok(Box::new(Keithley2400::new(device_id, session, timeout)))
}

#[cfg(not(feature = "instrument_visa"))]
fn open_resource(device_id: &str, _timeout: Duration) -> SweepResult<Box<dyn SourceMeter + Send>> {
    Err(SweepError::config(format!(
        "SMU address {device_id} needs the instrument_visa feature; only TCPIP::host::port::SOCKET is built in"
    )))
}

#[cfg(feature = "instrument_visa")]
mod visa {
    use std::{
        ffi::CString,
        io::{self, Read, Write},
        time::Duration,
    };
    use visa_rs::prelude::*;

    use crate::{SweepError, SweepResult};

    /// A VISA instrument together with the resource manager that owns it.
    pub struct VisaSession {
        instr: Instrument,
        _rm: DefaultRM,
    }

    impl VisaSession {
        pub fn open(resource: &str, timeout: Duration) -> SweepResult<Self> {
            let fail = |e: visa_rs::Error| SweepError::instrument(resource, e.to_string());
            let rm = DefaultRM::new().map_err(fail)?;
            let name = CString::new(resource)
                .map_err(|_| SweepError::config(format!("invalid VISA address {resource:?}")))?;
            let instr = rm
                .open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(fail)?;
            Ok(Self { instr, _rm: rm })
        }
    }

    impl Read for VisaSession {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.instr.read(buf)
        }
    }

    impl Write for VisaSession {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.instr.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.instr.flush()
        }
    }
}

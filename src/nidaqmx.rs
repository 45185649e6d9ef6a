//! NI-DAQmx chassis driver.
//!
//! Thin bindings to the parts of the NI-DAQmx C library the sweep needs:
//! on-demand analog output for the static control voltages and finite,
//! sample-clocked analog input for each acquisition window. Every task lives
//! only as long as one operation and is cleared on drop.

use log::warn;
use ndarray::Array2;
use std::{ffi::CString, ptr, time::Duration};

use crate::{DaqChassis, SweepError, SweepResult};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
type TaskHandle = *mut libc::c_void;

const DAQMX_VAL_CFG_DEFAULT: CInt32 = -1;
const DAQMX_VAL_RISING: CInt32 = 10280;
const DAQMX_VAL_VOLTS: CInt32 = 10348;
const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
const DAQMX_VAL_GROUPBYCHANNEL: CBool32 = 0;

const DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE: CInt32 = -200284;
const DAQMX_ERROR_TIMEOUT: CInt32 = -200474;

/// Analog input range used for the readout channels.
const AI_RANGE: [f64; 2] = [-10.0, 10.0];

const ON_DEMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxResetDevice(name: CConstStr) -> CInt32;
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;
    fn DAQmxGetDevAIPhysicalChans(device: CConstStr, data: CCharBuf, bufferSize: CUint32) -> CInt32;
    fn DAQmxGetDevAOPhysicalChans(device: CConstStr, data: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;

    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        src: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;

    fn DAQmxCreateAIVoltageChan(
        handle: TaskHandle,
        physicalChannel: CConstStr,
        nameToAssign: CConstStr,
        terminalConfig: CInt32,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;

    fn DAQmxReadAnalogF64(
        handle: TaskHandle,
        numSampsPerChan: CInt32,
        timeout: CFloat64,
        fillMode: CBool32,
        readArray: *mut CFloat64,
        arraySizeInSamps: CUint32,
        sampsPerChanRead: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        numSampsPerChan: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const CFloat64,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
}

fn extended_error_info() -> String {
    let mut buf = vec![0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(buf.as_mut_ptr(), buf.len() as CUint32);
        std::ffi::CStr::from_ptr(buf.as_ptr())
            .to_string_lossy()
            .into_owned()
    }
}

/// Where a DAQmx call happens, for error reports.
struct CallSite<'a> {
    device: &'a str,
    operation: &'a str,
    timeout: Duration,
}

/// Run a DAQmx call and turn a negative status into a [`SweepError`].
fn daqmx_call(site: &CallSite<'_>, func: impl FnOnce() -> CInt32) -> SweepResult<CInt32> {
    let code = func();
    if code >= 0 {
        return Ok(code);
    }
    if is_timeout_code(code) {
        return Err(SweepError::InstrumentTimeout {
            device: site.device.to_string(),
            operation: site.operation.to_string(),
            timeout: site.timeout,
        });
    }
    Err(SweepError::instrument(
        site.device,
        format!("{} failed ({code}): {}", site.operation, extended_error_info()),
    ))
}

fn is_timeout_code(code: CInt32) -> bool {
    matches!(
        code,
        DAQMX_ERROR_TIMEOUT | DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE
    )
}

fn c_string(value: &str) -> SweepResult<CString> {
    CString::new(value).map_err(|_| SweepError::config(format!("invalid NI name {value:?}")))
}

fn physical_channel(module: &str, kind: &str, channel: u32) -> String {
    format!("{module}/{kind}{channel}")
}

/// Entries in a DAQmx comma separated physical channel list.
fn count_channels(list: &str) -> u32 {
    list.split(',').filter(|c| !c.trim().is_empty()).count() as u32
}

struct NiTask {
    handle: TaskHandle,
    device: String,
}

impl NiTask {
    fn new(device: &str) -> SweepResult<Self> {
        let mut handle: TaskHandle = ptr::null_mut();
        let name = c_string("")?;
        let site = CallSite {
            device,
            operation: "create task",
            timeout: Duration::ZERO,
        };
        daqmx_call(&site, || unsafe { DAQmxCreateTask(name.as_ptr(), &mut handle) })?;
        Ok(Self {
            handle,
            device: device.to_string(),
        })
    }

    fn site<'a>(&'a self, operation: &'a str, timeout: Duration) -> CallSite<'a> {
        CallSite {
            device: &self.device,
            operation,
            timeout,
        }
    }

    fn create_ai_chan(&self, physical: &str, limits: [f64; 2]) -> SweepResult<()> {
        let chan = c_string(physical)?;
        let assigned = c_string("")?;
        daqmx_call(&self.site("create AI channel", Duration::ZERO), || unsafe {
            DAQmxCreateAIVoltageChan(
                self.handle,
                chan.as_ptr(),
                assigned.as_ptr(),
                DAQMX_VAL_CFG_DEFAULT,
                limits[0],
                limits[1],
                DAQMX_VAL_VOLTS,
                ptr::null(),
            )
        })?;
        Ok(())
    }

    fn create_ao_chan(&self, physical: &str, limits: [f64; 2]) -> SweepResult<()> {
        let chan = c_string(physical)?;
        let assigned = c_string("")?;
        daqmx_call(&self.site("create AO channel", Duration::ZERO), || unsafe {
            DAQmxCreateAOVoltageChan(
                self.handle,
                chan.as_ptr(),
                assigned.as_ptr(),
                limits[0],
                limits[1],
                DAQMX_VAL_VOLTS,
                ptr::null(),
            )
        })?;
        Ok(())
    }

    fn cfg_sample_clk(&self, rate: f64, samples: usize) -> SweepResult<()> {
        let src = c_string("")?;
        daqmx_call(&self.site("configure sample clock", Duration::ZERO), || unsafe {
            DAQmxCfgSampClkTiming(
                self.handle,
                src.as_ptr(),
                rate,
                DAQMX_VAL_RISING,
                DAQMX_VAL_FINITESAMPS,
                samples as CUint64,
            )
        })?;
        Ok(())
    }

    fn start(&self) -> SweepResult<()> {
        daqmx_call(&self.site("start task", Duration::ZERO), || unsafe {
            DAQmxStartTask(self.handle)
        })?;
        Ok(())
    }

    fn stop(&self) -> SweepResult<()> {
        daqmx_call(&self.site("stop task", Duration::ZERO), || unsafe {
            DAQmxStopTask(self.handle)
        })?;
        Ok(())
    }

    /// Blocking finite read, grouped by channel. Returns the buffer and the
    /// number of samples per channel actually read.
    fn read_analog(
        &self,
        n_channels: usize,
        samples: usize,
        timeout: Duration,
    ) -> SweepResult<(Vec<f64>, usize)> {
        let mut buf = vec![0.0; n_channels * samples];
        let mut read: CInt32 = 0;
        daqmx_call(&self.site("read analog inputs", timeout), || unsafe {
            DAQmxReadAnalogF64(
                self.handle,
                samples as CInt32,
                timeout.as_secs_f64(),
                DAQMX_VAL_GROUPBYCHANNEL,
                buf.as_mut_ptr(),
                buf.len() as CUint32,
                &mut read,
                ptr::null_mut(),
            )
        })?;
        Ok((buf, read.max(0) as usize))
    }

    fn write_scalar(&self, volts: f64, timeout: Duration) -> SweepResult<()> {
        let data = [volts];
        let mut written: CInt32 = 0;
        daqmx_call(&self.site("write analog output", timeout), || unsafe {
            DAQmxWriteAnalogF64(
                self.handle,
                1,
                1,
                timeout.as_secs_f64(),
                DAQMX_VAL_GROUPBYCHANNEL,
                data.as_ptr(),
                &mut written,
                ptr::null_mut(),
            )
        })?;
        Ok(())
    }
}

impl Drop for NiTask {
    fn drop(&mut self) {
        let code = unsafe { DAQmxClearTask(self.handle) };
        if code < 0 {
            warn!("{}: clearing task failed ({code})", self.device);
        }
    }
}

/// The NI chassis holding the activation and readout modules.
pub struct NiChassis {
    name: String,
}

impl NiChassis {
    pub fn new() -> Self {
        Self {
            name: "NIDAQmx".into(),
        }
    }

    fn physical_channels(
        &self,
        module: &str,
        operation: &str,
        query: unsafe extern "C" fn(CConstStr, CCharBuf, CUint32) -> CInt32,
    ) -> SweepResult<String> {
        let device = c_string(module)?;
        let mut buf = vec![0 as libc::c_char; 4096];
        let site = CallSite {
            device: module,
            operation,
            timeout: Duration::ZERO,
        };
        daqmx_call(&site, || unsafe {
            query(device.as_ptr(), buf.as_mut_ptr(), buf.len() as CUint32)
        })?;
        let list = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
        Ok(list.to_string_lossy().into_owned())
    }
}

impl Default for NiChassis {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqChassis for NiChassis {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset_module(&mut self, module: &str) -> SweepResult<()> {
        let device = c_string(module)?;
        let site = CallSite {
            device: module,
            operation: "reset device",
            timeout: Duration::ZERO,
        };
        daqmx_call(&site, || unsafe { DAQmxResetDevice(device.as_ptr()) })?;
        Ok(())
    }

    fn ai_channel_count(&self, module: &str) -> SweepResult<u32> {
        let list = self.physical_channels(module, "list AI channels", DAQmxGetDevAIPhysicalChans)?;
        Ok(count_channels(&list))
    }

    fn ao_channel_count(&self, module: &str) -> SweepResult<u32> {
        let list = self.physical_channels(module, "list AO channels", DAQmxGetDevAOPhysicalChans)?;
        Ok(count_channels(&list))
    }

    fn write_voltage(
        &mut self,
        module: &str,
        channel: u32,
        volts: f64,
        limits: [f64; 2],
    ) -> SweepResult<()> {
        let task = NiTask::new(module)?;
        task.create_ao_chan(&physical_channel(module, "ao", channel), limits)?;
        task.write_scalar(volts, ON_DEMAND_TIMEOUT)
    }

    fn read_voltages(
        &mut self,
        module: &str,
        channels: &[u32],
        sample_rate: f64,
        samples: usize,
        timeout: Duration,
    ) -> SweepResult<Array2<f64>> {
        let task = NiTask::new(module)?;
        for &channel in channels {
            task.create_ai_chan(&physical_channel(module, "ai", channel), AI_RANGE)?;
        }
        task.cfg_sample_clk(sample_rate, samples)?;
        task.start()?;
        let (buf, read) = task.read_analog(channels.len(), samples, timeout)?;
        task.stop()?;

        Ok(Array2::from_shape_fn((channels.len(), read), |(row, col)| {
            buf[row * read + col]
        }))
    }
}

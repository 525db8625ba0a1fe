use std::{fmt, sync::Mutex, time::Duration};

use probe_rs::{
    MemoryInterface, Permissions, RegisterId, Session,
    probe::{WireProtocol, list::Lister},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{FuzzConfig, ProbeInterface};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no debug probe detected")]
    NoProbe,
    #[error("probe fault: {0}")]
    Fault(String),
}

impl From<probe_rs::Error> for ProbeError {
    fn from(err: probe_rs::Error) -> Self {
        Self::Fault(err.to_string())
    }
}

/// Contract over the debug probe. The underlying debug protocol is
/// sequential, so implementations serialize their operations internally.
pub trait ProbeControl: Send + Sync {
    /// Blocks until the target CPU is halted.
    fn halt(&self) -> Result<(), ProbeError>;

    /// Reads the program counter. Requires a halted target.
    fn read_pc(&self) -> Result<u32, ProbeError>;

    /// Resumes execution without reset.
    fn resume(&self) -> Result<(), ProbeError>;

    /// Reads `words` 32-bit words starting at `addr`, for diagnostics.
    fn read_memory32(&self, addr: u32, words: usize) -> Result<Vec<u32>, ProbeError>;

    /// Halt, read the program counter, resume, as one unit. The resume is
    /// attempted even when the register read fails.
    fn sample_pc(&self) -> Result<u32, ProbeError> {
        self.halt()?;
        let pc = self.read_pc();
        let resumed = self.resume();
        let pc = pc?;
        resumed?;
        Ok(pc)
    }
}

/// The register ordinal for the ARM program counter (R15) used when the
/// target description does not name one.
const PC_REGISTER_FALLBACK: u16 = 15;

const HALT_TIMEOUT: Duration = Duration::from_millis(100);

/// A live probe-rs session against the target controller. There is exactly
/// one debug session per probe, and only one operation may be in flight.
pub struct ProbeSession {
    inner: Mutex<SessionInner>,
    pc_register: RegisterId,
}

struct SessionInner {
    session: Session,
}

impl fmt::Debug for ProbeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeSession")
            .field("pc_register", &self.pc_register)
            .finish_non_exhaustive()
    }
}

impl ProbeSession {
    /// Opens the first detected probe and attaches to the configured target.
    pub fn connect(config: &FuzzConfig) -> Result<Self, ProbeError> {
        let lister = Lister::new();
        let probes = lister.list_all();
        let probe_info = probes.first().ok_or(ProbeError::NoProbe)?;
        let mut probe = probe_info.open().map_err(|err| ProbeError::Fault(err.to_string()))?;

        let protocol = match config.interface {
            ProbeInterface::Jtag => WireProtocol::Jtag,
            ProbeInterface::Swd => WireProtocol::Swd,
        };
        probe
            .select_protocol(protocol)
            .map_err(|err| ProbeError::Fault(err.to_string()))?;
        probe
            .set_speed(config.jtag_speed)
            .map_err(|err| ProbeError::Fault(err.to_string()))?;

        let mut session = probe.attach(config.device_name.as_str(), Permissions::default())?;
        let pc_register = resolve_pc_register(&mut session)?;
        info!(
            device = %config.device_name,
            speed_khz = config.jtag_speed,
            pc_register = pc_register.0,
            "probe attached"
        );

        Ok(Self {
            inner: Mutex::new(SessionInner { session }),
            pc_register,
        })
    }

    /// The resolved PC register ordinal.
    pub fn pc_register_index(&self) -> u16 {
        self.pc_register.0
    }

    fn with_core<T>(
        &self,
        op: impl FnOnce(&mut probe_rs::Core<'_>) -> Result<T, probe_rs::Error>,
    ) -> Result<T, ProbeError> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut core = inner.session.core(0)?;
        op(&mut core).map_err(Into::into)
    }
}

/// Resolves the target-specific PC register at connect time by matching a
/// register named after ARM's R15 (or a literal "PC"), falling back to
/// ordinal 15.
fn resolve_pc_register(session: &mut Session) -> Result<RegisterId, ProbeError> {
    let core = session.core(0)?;
    let resolved = core
        .registers()
        .core_registers()
        .find(|reg| reg.name().contains("R15") || reg.name() == "PC")
        .map(|reg| reg.id());
    match resolved {
        Some(id) => {
            debug!(register = id.0, "resolved PC register from target description");
            Ok(id)
        }
        None => {
            debug!(register = PC_REGISTER_FALLBACK, "PC register not named, using fallback");
            Ok(RegisterId(PC_REGISTER_FALLBACK))
        }
    }
}

impl ProbeControl for ProbeSession {
    fn halt(&self) -> Result<(), ProbeError> {
        self.with_core(|core| core.halt(HALT_TIMEOUT).map(|_| ()))
    }

    fn read_pc(&self) -> Result<u32, ProbeError> {
        let pc_register = self.pc_register;
        self.with_core(|core| core.read_core_reg::<u32>(pc_register))
    }

    fn resume(&self) -> Result<(), ProbeError> {
        self.with_core(|core| core.run())
    }

    fn read_memory32(&self, addr: u32, words: usize) -> Result<Vec<u32>, ProbeError> {
        self.with_core(|core| {
            let mut buf = vec![0u32; words];
            core.read_32(u64::from(addr), &mut buf)?;
            Ok(buf)
        })
    }

    fn sample_pc(&self) -> Result<u32, ProbeError> {
        // One lock for the whole halt-read-resume unit; the resume runs
        // even when the register read fails.
        let pc_register = self.pc_register;
        self.with_core(|core| {
            core.halt(HALT_TIMEOUT)?;
            let pc = core.read_core_reg::<u32>(pc_register);
            let resumed = core.run();
            let pc = pc?;
            resumed?;
            Ok(pc)
        })
    }
}

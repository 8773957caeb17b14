//! Top-level processor facade: composition, configuration, and the run loop.

use thiserror::Error;

use crate::core::clint::{Clint, ClintStatus};
use crate::core::csr::CsrBank;
use crate::core::{Pipeline, Program, RetiredInstruction};
use crate::instruction::Instruction;
use crate::memory::{Memory, MemoryError};
use crate::registers::{Registers, Specifier};
use crate::uart::Uart;

/// Configuration for a [`Processor`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Accepted and recorded, but without effect: the core resolves RAW
    /// hazards by stalling only. Reserved for an EX→EX/MEM→EX forwarding
    /// implementation.
    pub forwarding_enabled: bool,
    /// Size of the backing store in bytes.
    pub memory_size: usize,
    /// Address of the first backing-store byte.
    pub memory_base_address: u32,
    /// Map the TX-only UART at `0x1000_0000`.
    pub enable_uart: bool,
    /// Map the CLINT at `0x0200_0000` and tick it every cycle.
    pub enable_clint: bool,
    /// Cycles per mtime increment. Must be non-zero.
    pub clint_time_scale: u64,
    /// Ceiling on the number of cycles a single [`Processor::execute`] may
    /// consume; the ultimate termination guard for guests that trap into
    /// nowhere or loop.
    pub max_cycles: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            forwarding_enabled: false,
            memory_size: 0x1_0000,
            memory_base_address: 0,
            enable_uart: true,
            enable_clint: true,
            clint_time_scale: 1,
            max_cycles: 100_000,
        }
    }
}

/// Facade-level construction failures. These are programmer errors of the
/// embedding application, never guest-visible traps.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("memory size must be non-zero")]
    ZeroMemorySize,
    #[error("memory of {size:#x} bytes at base {base:#010x} exceeds the 32-bit address space")]
    MemoryOutOfRange { size: usize, base: u32 },
    #[error("clint time scale must be non-zero")]
    ZeroTimeScale,
}

/// Either kind of facade-level failure, for the [`run_program`] convenience.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// What one [`Processor::execute`] run produced.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    /// The retired instructions in program order, each with the cycle its
    /// writeback completed. Bubbles and squashed instructions never appear.
    pub retired: Vec<RetiredInstruction>,
    pub total_cycles: u64,
    pub stall_count: u64,
    pub bubble_count: u64,
    pub flush_count: u64,
    /// Cycles per retired instruction (0 when nothing retired).
    pub cpi: f64,
    /// Retired instructions per cycle (0 when no cycles elapsed).
    pub ipc: f64,
}

/// A fully composed processor: the pipeline plus its memory, peripherals,
/// CSR bank, and trap/interrupt machinery.
#[derive(Debug)]
pub struct Processor {
    config: Config,
    pipeline: Pipeline,
}

impl Processor {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        if config.memory_size == 0 {
            return Err(ConfigError::ZeroMemorySize);
        }
        if config.memory_base_address as u64 + config.memory_size as u64 > 1 << 32 {
            return Err(ConfigError::MemoryOutOfRange {
                size: config.memory_size,
                base: config.memory_base_address,
            });
        }
        if config.clint_time_scale == 0 {
            return Err(ConfigError::ZeroTimeScale);
        }
        let mut memory = Memory::new(config.memory_size, config.memory_base_address);
        if config.enable_uart {
            memory.attach_uart(Uart::new());
        }
        if config.enable_clint {
            memory.attach_clint(Clint::new(config.clint_time_scale));
        }
        Ok(Self {
            pipeline: Pipeline::new(memory),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Preload general purpose registers.
    pub fn initialize_registers(&mut self, values: &[(Specifier, u32)]) {
        for (specifier, value) in values {
            self.pipeline.registers_mut().set_x(*specifier, *value);
        }
    }

    /// Preload memory words. Writes go through the normal word path, so
    /// peripheral addresses (e.g. mtimecmp) behave exactly as guest stores
    /// would.
    pub fn initialize_memory(&mut self, values: &[(u32, u32)]) -> Result<(), MemoryError> {
        let (memory, interrupts, csr) = self.pipeline.memory_parts_mut();
        for (address, value) in values {
            memory.write_word(*address, *value, interrupts, csr)?;
        }
        Ok(())
    }

    /// Blit a raw byte image into the backing store.
    pub fn load_program(&mut self, bytes: &[u8], start_address: u32) -> Result<(), MemoryError> {
        self.pipeline.memory_mut().load_program(bytes, start_address)
    }

    /// Run `instructions` as a program image based at the current PC, until
    /// the pipeline drains or the cycle ceiling is reached.
    pub fn execute(&mut self, instructions: Vec<Instruction>) -> ExecutionSummary {
        let program = Program::new(self.pipeline.registers().pc(), instructions);
        let cycles_before = self.pipeline.cycle();
        let stalls_before = self.pipeline.stall_count();
        let bubbles_before = self.pipeline.bubble_count();
        let flushes_before = self.pipeline.flush_count();

        self.pipeline.run(&program, self.config.max_cycles);

        let retired = self.pipeline.take_retired();
        let total_cycles = self.pipeline.cycle() - cycles_before;
        let cpi = match retired.is_empty() {
            true => 0.0,
            false => total_cycles as f64 / retired.len() as f64,
        };
        let ipc = match total_cycles {
            0 => 0.0,
            _ => retired.len() as f64 / total_cycles as f64,
        };
        ExecutionSummary {
            retired,
            total_cycles,
            stall_count: self.pipeline.stall_count() - stalls_before,
            bubble_count: self.pipeline.bubble_count() - bubbles_before,
            flush_count: self.pipeline.flush_count() - flushes_before,
            cpi,
            ipc,
        }
    }

    pub fn get_register(&self, specifier: Specifier) -> u32 {
        self.pipeline.registers().x(specifier)
    }

    /// Read a memory word, swallowing faults as 0 (the lenient collaborator
    /// path).
    pub fn get_memory(&self, address: u32) -> u32 {
        self.pipeline.memory().read_word_lenient(address)
    }

    pub fn pc(&self) -> u32 {
        self.pipeline.registers().pc()
    }

    pub fn registers(&self) -> &Registers {
        self.pipeline.registers()
    }

    pub fn csr(&self) -> &CsrBank {
        self.pipeline.csr()
    }

    pub fn csr_mut(&mut self) -> &mut CsrBank {
        self.pipeline.csr_mut()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// The non-zero general purpose registers, in index order.
    pub fn register_snapshot(&self) -> Vec<(Specifier, u32)> {
        Specifier::iter_all()
            .map(|specifier| (specifier, self.pipeline.registers().x(specifier)))
            .filter(|(_, value)| *value != 0)
            .collect()
    }

    /// Drain the UART's buffered output. Empty if the UART is disabled.
    pub fn uart_output(&mut self) -> Vec<u8> {
        self.pipeline
            .memory_mut()
            .uart_mut()
            .map(Uart::drain_output)
            .unwrap_or_default()
    }

    /// Bytes transmitted over the UART since reset. 0 if disabled.
    pub fn uart_transmitted(&self) -> u64 {
        self.pipeline
            .memory()
            .uart()
            .map(Uart::transmitted)
            .unwrap_or(0)
    }

    /// A snapshot of the CLINT registers, if the CLINT is enabled.
    pub fn clint_status(&self) -> Option<ClintStatus> {
        self.pipeline.memory().clint().map(Clint::status)
    }

    /// Restore the whole machine to reset state (registers, CSRs,
    /// peripherals, memory, and pipeline bookkeeping).
    pub fn reset(&mut self) {
        self.pipeline.reset();
    }
}

/// Build a default-configured processor, preload registers and memory, and
/// run `instructions` to completion.
pub fn run_program(
    instructions: Vec<Instruction>,
    initial_registers: &[(Specifier, u32)],
    initial_memory: &[(u32, u32)],
) -> Result<(Processor, ExecutionSummary), ProcessorError> {
    let mut processor = Processor::new(Config::default())?;
    processor.initialize_registers(initial_registers);
    processor.initialize_memory(initial_memory)?;
    let summary = processor.execute(instructions);
    Ok((processor, summary))
}

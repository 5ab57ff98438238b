use std::collections::BTreeMap;
use std::fs::File;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::backend::Backend;
use crate::backend::reservation_station::{StationTag, StationView};
use crate::frontend::frontend::Frontend;
use crate::instructions::instructions::{InstrRecord, Opcode, Program, REGISTER_COUNT, RegisterType, StationClass, WordType};
use crate::memory_subsystem::load_store_queue::LSQEntry;
use crate::memory_subsystem::memory_subsystem::{MemoryEntry, MemorySubsystem};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

/// Internal logic faults of the engine. None of them should occur for a validated program
/// and configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid operand R{0}")]
    InvalidOperand(RegisterType),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// The reason an instruction could not make progress in a cycle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize)]
pub enum StallReason {
    // no idle reservation station in the class
    StationFull,
    // no space in the load/store queue
    QueueFull,
    // a ready station found no idle functional unit
    UnitBusy,
    // a completed result lost the class port of the result bus
    CdbConflict,
    // a completed store waits for its data operand
    StoreData,
    // a memory operation waits for older loads or stores
    MemoryOrder,
    // a control instruction waits for the in-flight branch
    BranchInFlight,
    // issue waits for a CALL or RET to redirect
    ControlPending,
}

pub(crate) struct PerfCounters {
    pub issue_cnt: u64,
    pub execute_cnt: u64,
    pub retire_cnt: u64,
    pub cycle_cnt: u64,
    pub branch_cnt: u64,
    pub branch_misprediction_cnt: u64,
    pub bad_speculation_cnt: u64,
    pub pipeline_flushes: u64,
    pub stall_cnt: BTreeMap<StallReason, u64>,
    pub last_cycle_stalls: Vec<StallReason>,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            issue_cnt: 0,
            execute_cnt: 0,
            retire_cnt: 0,
            cycle_cnt: 0,
            branch_cnt: 0,
            branch_misprediction_cnt: 0,
            bad_speculation_cnt: 0,
            pipeline_flushes: 0,
            stall_cnt: BTreeMap::new(),
            last_cycle_stalls: Vec::new(),
        }
    }

    pub fn begin_cycle(&mut self) {
        self.last_cycle_stalls.clear();
    }

    pub fn record_stall(&mut self, reason: StallReason) {
        *self.stall_cnt.entry(reason).or_insert(0) += 1;
        self.last_cycle_stalls.push(reason);
    }

    pub fn ipc(&self) -> f64 {
        if self.cycle_cnt == 0 {
            return 0.0;
        }
        self.retire_cnt as f64 / self.cycle_cnt as f64
    }

    pub fn misprediction_rate(&self) -> f64 {
        if self.branch_cnt == 0 {
            return 0.0;
        }
        self.branch_misprediction_cnt as f64 / self.branch_cnt as f64
    }
}

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Trace {
    pub issue: bool,
    pub execute: bool,
    pub broadcast: bool,
    pub retire: bool,
    pub branch: bool,
    pub cycle: bool,
}

/// The reservation stations and functional units of one station class.
#[derive(Clone, Copy, Deserialize, Serialize, Debug, PartialEq)]
pub struct StationConfig {
    // the number of reservation stations
    pub station_count: u16,
    // the execution latency in cycles
    pub exec_cycles: u8,
    // the cycles needed to compute the address; memory classes only
    #[serde(default)]
    pub addr_cycles: u8,
    // the number of functional units; defaults to one per station
    #[serde(default)]
    pub unit_count: Option<u8>,
}

impl StationConfig {
    const fn new(station_count: u16, exec_cycles: u8, addr_cycles: u8) -> Self {
        StationConfig { station_count, exec_cycles, addr_cycles, unit_count: None }
    }

    pub fn unit_count(&self) -> u8 {
        self.unit_count.unwrap_or_else(|| self.station_count.min(u8::MAX as u16) as u8)
    }
}

#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
#[serde(default)]
pub struct HardwareConfig {
    pub load: StationConfig,
    pub store: StationConfig,
    pub beq: StationConfig,
    pub jump: StationConfig,
    pub add: StationConfig,
    pub mul: StationConfig,
    pub nor: StationConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            load: StationConfig::new(2, 2, 4),
            store: StationConfig::new(2, 2, 4),
            beq: StationConfig::new(2, 1, 0),
            jump: StationConfig::new(1, 1, 0),
            add: StationConfig::new(4, 2, 0),
            mul: StationConfig::new(2, 10, 0),
            nor: StationConfig::new(2, 1, 0),
        }
    }
}

impl HardwareConfig {
    pub fn get(&self, class: StationClass) -> &StationConfig {
        match class {
            StationClass::LOAD => &self.load,
            StationClass::STORE => &self.store,
            StationClass::BEQ => &self.beq,
            StationClass::JUMP => &self.jump,
            StationClass::ADD => &self.add,
            StationClass::MUL => &self.mul,
            StationClass::NOR => &self.nor,
        }
    }

    pub fn get_mut(&mut self, class: StationClass) -> &mut StationConfig {
        match class {
            StationClass::LOAD => &mut self.load,
            StationClass::STORE => &mut self.store,
            StationClass::BEQ => &mut self.beq,
            StationClass::JUMP => &mut self.jump,
            StationClass::ADD => &mut self.add,
            StationClass::MUL => &mut self.mul,
            StationClass::NOR => &mut self.nor,
        }
    }
}

#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
#[serde(default)]
pub struct CPUConfig {
    // the number of instructions that can be issued every clock cycle
    pub issue_width: u8,
    // the frequency of the CPU in Hz; unpaced when absent
    pub frequency_hz: Option<u64>,
    // verify the engine invariants after every cycle
    pub check_invariants: bool,
    pub stations: HardwareConfig,
    // execution latencies that differ from the latency of the station class
    pub latency_overrides: BTreeMap<Opcode, u8>,
    // the capacity of the load/store queue; defaults to the number of memory stations
    pub lsq_capacity: Option<u16>,
    // the initial values of R0..R7; R0 is forced to 0
    pub registers: [WordType; REGISTER_COUNT as usize],
    // if processing of a single instruction should be traced (logged)
    pub trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            issue_width: 1,
            frequency_hz: None,
            check_invariants: true,
            stations: HardwareConfig::default(),
            latency_overrides: BTreeMap::new(),
            lsq_capacity: None,
            // R_i starts out holding i
            registers: std::array::from_fn(|reg| reg as WordType),
            trace: Trace::default(),
        }
    }
}

fn invalid(field: String, reason: &str) -> ConfigError {
    ConfigError::InvalidField { field, reason: reason.to_string() }
}

impl CPUConfig {
    pub fn lsq_capacity(&self) -> u16 {
        self.lsq_capacity
            .unwrap_or_else(|| self.stations.load.station_count.saturating_add(self.stations.store.station_count))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issue_width == 0 {
            return Err(invalid("issue_width".to_string(), "must be positive"));
        }

        if self.frequency_hz == Some(0) {
            return Err(invalid("frequency_hz".to_string(), "must be positive"));
        }

        for class in StationClass::ALL {
            let station_config = self.stations.get(class);
            let name = class.name().to_lowercase();
            if station_config.station_count == 0 {
                return Err(invalid(format!("stations.{}.station_count", name), "must be positive"));
            }
            if station_config.exec_cycles == 0 {
                return Err(invalid(format!("stations.{}.exec_cycles", name), "must be positive"));
            }
            if station_config.unit_count == Some(0) {
                return Err(invalid(format!("stations.{}.unit_count", name), "must be positive"));
            }
        }

        for (opcode, cycles) in self.latency_overrides.iter() {
            if *cycles == 0 {
                return Err(invalid(format!("latency_overrides.{:?}", opcode), "must be positive"));
            }
        }

        if self.lsq_capacity() == 0 {
            return Err(invalid("lsq_capacity".to_string(), "must be positive"));
        }

        Ok(())
    }
}

pub fn load_cpu_config(file_path: &str) -> Result<CPUConfig, ConfigError> {
    let file = File::open(file_path)?;
    let config: CPUConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    Ok(config)
}

pub fn load_cpu_config_from_string(src: &str) -> Result<CPUConfig, ConfigError> {
    let config: CPUConfig = serde_yaml::from_str(src)?;
    config.validate()?;
    Ok(config)
}

struct ArgRegEntry {
    pub(crate) value: WordType,
}

/// The architectural register file. R0 always reads zero.
pub struct ArgRegFile {
    entries: Vec<ArgRegEntry>,
}

impl ArgRegFile {
    pub(crate) fn new(initial: &[WordType; REGISTER_COUNT as usize]) -> ArgRegFile {
        let mut entries = Vec::with_capacity(REGISTER_COUNT as usize);
        for value in initial.iter() {
            entries.push(ArgRegEntry { value: *value });
        }
        entries[0].value = 0;

        ArgRegFile { entries }
    }

    pub fn get_value(&self, reg: RegisterType) -> WordType {
        self.entries.get(reg as usize).map_or(0, |entry| entry.value)
    }

    pub fn set_value(&mut self, reg: RegisterType, value: WordType) {
        if reg == 0 {
            return;
        }
        if let Some(entry) = self.entries.get_mut(reg as usize) {
            entry.value = value;
        }
    }

    pub fn values(&self) -> Vec<WordType> {
        self.entries.iter().map(|entry| entry.value).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Metrics {
    pub cycles: u64,
    pub issued: u64,
    pub committed: u64,
    pub ipc: f64,
    pub branches_resolved: u64,
    pub mispredictions: u64,
    pub misprediction_rate: f64,
    pub squashed: u64,
    pub stalls: BTreeMap<StallReason, u64>,
    pub last_cycle_stalls: Vec<StallReason>,
}

impl Metrics {
    pub fn stall_count(&self, reason: StallReason) -> u64 {
        self.stalls.get(&reason).copied().unwrap_or(0)
    }
}

/// An owned view of the engine state between two cycles. `instructions` only holds the
/// records of instructions still in flight; `CycleEngine::instructions` borrows the full
/// history.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub cycle: u64,
    pub pc: WordType,
    pub halted: bool,
    pub paused: bool,
    pub stations: Vec<StationView>,
    pub alias_table: Vec<Option<StationTag>>,
    pub registers: Vec<WordType>,
    pub memory: Vec<MemoryEntry>,
    pub load_store_queue: Vec<LSQEntry>,
    pub instructions: Vec<InstrRecord>,
    pub metrics: Metrics,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunLimit {
    Halted,
    MaxCycles(u64),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunOutcome {
    Halted,
    Paused,
    CycleLimit,
}

/// The cycle-driven Tomasulo engine. It owns all mutable simulator state; observers only
/// see owned snapshots taken between cycles.
pub struct CycleEngine {
    config: CPUConfig,
    program: Rc<Program>,
    initial_memory: Vec<MemoryEntry>,
    backend: Backend,
    frontend: Frontend,
    memory_subsystem: MemorySubsystem,
    arch_reg_file: ArgRegFile,
    perf_counters: PerfCounters,
    cycle_period: Option<Duration>,
    paused: bool,
}

impl CycleEngine {
    pub fn new(config: CPUConfig, program: Rc<Program>, memory: Vec<MemoryEntry>) -> Result<CycleEngine, ConfigError> {
        config.validate()?;

        let mut memory_subsystem = MemorySubsystem::new(&config);
        memory_subsystem.init(&memory);

        let cycle_period = config.frequency_hz.map(|hz| Duration::from_micros(1_000_000 / hz));

        Ok(CycleEngine {
            backend: Backend::new(&config),
            frontend: Frontend::new(&program),
            memory_subsystem,
            arch_reg_file: ArgRegFile::new(&config.registers),
            perf_counters: PerfCounters::new(),
            cycle_period,
            paused: false,
            initial_memory: memory,
            program,
            config,
        })
    }

    pub fn cycle(&self) -> u64 {
        self.perf_counters.cycle_cnt
    }

    /// Advances exactly one cycle. Does nothing once the program halted.
    pub fn step(&mut self) -> Result<(), EngineError> {
        if self.is_halted() {
            return Ok(());
        }

        let now = self.perf_counters.cycle_cnt + 1;
        self.perf_counters.begin_cycle();
        self.backend.do_cycle(
            now,
            &mut self.frontend,
            &mut self.memory_subsystem,
            &mut self.arch_reg_file,
            &mut self.perf_counters,
        )?;
        self.perf_counters.cycle_cnt = now;

        if self.config.trace.cycle {
            let perf_counters = &self.perf_counters;
            info!("[Cycles:{}][Issued={}][Executed={}][Retired={}][IPC={:.2}][Mispredicted={}][Stalls={:?}]",
                  perf_counters.cycle_cnt,
                  perf_counters.issue_cnt,
                  perf_counters.execute_cnt,
                  perf_counters.retire_cnt,
                  perf_counters.ipc(),
                  perf_counters.branch_misprediction_cnt,
                  perf_counters.last_cycle_stalls);
        }

        if self.config.check_invariants {
            self.check_invariants()?;
        }
        Ok(())
    }

    /// Steps until the program halts, the cycle limit is reached or the engine is paused.
    pub fn run(&mut self, limit: RunLimit) -> Result<RunOutcome, EngineError> {
        loop {
            if self.paused {
                return Ok(RunOutcome::Paused);
            }
            if self.is_halted() {
                return Ok(RunOutcome::Halted);
            }
            if let RunLimit::MaxCycles(max_cycles) = limit {
                if self.cycle() >= max_cycles {
                    return Ok(RunOutcome::CycleLimit);
                }
            }

            self.step()?;

            if let Some(cycle_period) = self.cycle_period {
                thread::sleep(cycle_period);
            }
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Discards all state and starts over from the initial registers, memory and pc.
    pub fn reset(&mut self) {
        self.backend.flush();
        self.frontend = Frontend::new(&self.program);
        self.memory_subsystem = MemorySubsystem::new(&self.config);
        self.memory_subsystem.init(&self.initial_memory);
        self.arch_reg_file = ArgRegFile::new(&self.config.registers);
        self.perf_counters = PerfCounters::new();
        self.paused = false;
    }

    /// True when nothing is left to issue, every station is empty and the load/store
    /// queue is drained.
    pub fn is_halted(&self) -> bool {
        self.frontend.peek().is_none()
            && !self.frontend.is_awaiting_jump()
            && self.backend.is_empty()
            && self.memory_subsystem.lsq.is_empty()
    }

    pub fn check_invariants(&self) -> Result<(), EngineError> {
        self.backend.check_invariants(&self.memory_subsystem)
    }

    pub fn register(&self, reg: RegisterType) -> WordType {
        self.arch_reg_file.get_value(reg)
    }

    pub fn memory(&self, address: WordType) -> WordType {
        self.memory_subsystem.memory.read(address)
    }

    pub fn call_depth(&self) -> usize {
        self.backend.call_depth()
    }

    pub fn branch_in_flight(&self) -> bool {
        self.backend.branch_in_flight()
    }

    pub fn instructions(&self) -> &[InstrRecord] {
        self.backend.history()
    }

    pub fn metrics(&self) -> Metrics {
        let perf_counters = &self.perf_counters;
        Metrics {
            cycles: perf_counters.cycle_cnt,
            issued: perf_counters.issue_cnt,
            committed: perf_counters.retire_cnt,
            ipc: perf_counters.ipc(),
            branches_resolved: perf_counters.branch_cnt,
            mispredictions: perf_counters.branch_misprediction_cnt,
            misprediction_rate: perf_counters.misprediction_rate(),
            squashed: perf_counters.bad_speculation_cnt,
            stalls: perf_counters.stall_cnt.clone(),
            last_cycle_stalls: perf_counters.last_cycle_stalls.clone(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            cycle: self.perf_counters.cycle_cnt,
            pc: self.frontend.pc(),
            halted: self.is_halted(),
            paused: self.paused,
            stations: self.backend.station_views(),
            alias_table: self.backend.alias_table(),
            registers: self.arch_reg_file.values(),
            memory: self.memory_subsystem.memory.touched(),
            load_store_queue: self.memory_subsystem.lsq.iter().map(|(_, entry)| *entry).collect(),
            instructions: self.backend.in_flight_history().cloned().collect(),
            metrics: self.metrics(),
        }
    }
}

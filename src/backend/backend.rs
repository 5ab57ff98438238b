use std::collections::BTreeMap;
use std::mem;

use log::{debug, info};

use crate::backend::branch_unit::{BranchUnit, Resolution};
use crate::backend::cdb::{CDB, CDBBroadcast};
use crate::backend::execution_unit::{EU, EUState, EUTable, schedule};
use crate::backend::register_alias_table::RAT;
use crate::backend::reservation_station::{Operand, RSState, RSTable, StationTag, StationView};
use crate::cpu::{ArgRegFile, CPUConfig, EngineError, PerfCounters, StallReason, Trace};
use crate::frontend::frontend::Frontend;
use crate::instructions::instructions::{Instr, InstrRecord, Opcode, REGISTER_COUNT, StationClass, WordType};
use crate::memory_subsystem::load_store_queue::{LSQEntryState, MemoryOp};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

fn violation(msg: String) -> EngineError {
    EngineError::InvariantViolation(msg)
}

/// The out-of-order core. Every cycle runs the same fixed phase order:
/// broadcast, commit, branch resolution, execute and issue.
pub(crate) struct Backend {
    // indexed by StationClass::index
    rs_tables: Vec<RSTable>,
    eu_tables: Vec<EUTable>,
    rat: RAT,
    branch_unit: BranchUnit,
    cdb: CDB,
    resolved: Vec<Resolution>,
    // the records of all issued instructions, indexed by seq
    history: Vec<InstrRecord>,
    // every record before this seq is finished
    oldest_in_flight: usize,
    issue_n_wide: u8,
    latency_overrides: BTreeMap<Opcode, u8>,
    trace: Trace,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Backend {
        let mut rs_tables = Vec::with_capacity(StationClass::ALL.len());
        let mut eu_tables = Vec::with_capacity(StationClass::ALL.len());
        for class in StationClass::ALL {
            let station_config = cpu_config.stations.get(class);
            rs_tables.push(RSTable::new(class, station_config));
            eu_tables.push(EUTable::new(station_config.unit_count()));
        }

        Backend {
            rs_tables,
            eu_tables,
            rat: RAT::new(),
            branch_unit: BranchUnit::new(),
            cdb: CDB::new(),
            resolved: Vec::new(),
            history: Vec::new(),
            oldest_in_flight: 0,
            issue_n_wide: cpu_config.issue_width,
            latency_overrides: cpu_config.latency_overrides.clone(),
            trace: cpu_config.trace.clone(),
        }
    }

    pub(crate) fn do_cycle(&mut self,
                           now: u64,
                           frontend: &mut Frontend,
                           memory_subsystem: &mut MemorySubsystem,
                           arch_reg_file: &mut ArgRegFile,
                           perf_counters: &mut PerfCounters) -> Result<(), EngineError> {
        self.cycle_broadcast(now, perf_counters)?;
        self.cycle_commit(now, frontend, memory_subsystem, arch_reg_file, perf_counters)?;
        self.cycle_branch_resolution(frontend, memory_subsystem, perf_counters)?;
        self.cycle_execute(now, memory_subsystem, perf_counters)?;
        self.cycle_issue(now, frontend, memory_subsystem, arch_reg_file, perf_counters)?;
        debug_assert!(self.cdb.is_empty());

        while self.history.get(self.oldest_in_flight).map_or(false, |record| !record.is_in_flight()) {
            self.oldest_in_flight += 1;
        }
        Ok(())
    }

    // Every class port broadcasts at most one completed result; waiting stations pick it
    // up and may use it from the next cycle.
    fn cycle_broadcast(&mut self, now: u64, perf_counters: &mut PerfCounters) -> Result<(), EngineError> {
        let mut broadcasts = Vec::new();

        for table in self.rs_tables.iter() {
            let arbitration = CDB::arbitrate(table, now);
            for _ in 0..arbitration.deferred {
                perf_counters.record_stall(StallReason::CdbConflict);
            }
            for _ in 0..arbitration.awaiting_data {
                perf_counters.record_stall(StallReason::StoreData);
            }

            let rs = match arbitration.winner {
                Some(rs_index) => table.get(rs_index),
                None => continue,
            };

            let instr = rs.instr.ok_or_else(|| violation(format!("{} completed without an instruction", rs.tag)))?;
            let value = match instr {
                Instr::STORE { .. } => rs.value(1),
                _ => rs.result,
            }.ok_or_else(|| violation(format!("{} broadcast without a value", rs.tag)))?;

            broadcasts.push(CDBBroadcast { tag: rs.tag, seq: rs.seq, sink: instr.sink(), value });
        }

        for broadcast in broadcasts {
            if self.trace.broadcast {
                info!("Broadcast [{}] {}={}", self.history[broadcast.seq as usize].instr, broadcast.tag, broadcast.value);
            }

            for table in self.rs_tables.iter_mut() {
                table.wake(broadcast.tag, broadcast.value, now + 1);
            }
            self.cdb.push(broadcast);
        }

        Ok(())
    }

    // Writes the broadcast results into the register file and memory and releases
    // their stations.
    fn cycle_commit(&mut self,
                    now: u64,
                    frontend: &mut Frontend,
                    memory_subsystem: &mut MemorySubsystem,
                    arch_reg_file: &mut ArgRegFile,
                    perf_counters: &mut PerfCounters) -> Result<(), EngineError> {
        for broadcast in self.cdb.take() {
            let tag = broadcast.tag;
            let table = &mut self.rs_tables[tag.class.index()];
            let rs = table.get(tag.index);
            let instr = rs.instr.ok_or_else(|| violation(format!("{} retired without an instruction", tag)))?;
            let pc = rs.pc;
            let address = rs.address;
            let lsq_index = rs.lsq_index;

            match instr {
                Instr::LOAD { .. } | Instr::STORE { .. } => {
                    let lsq_index = lsq_index.ok_or_else(|| violation(format!("{} has no queue entry", tag)))?;
                    let address = address.ok_or_else(|| violation(format!("{} retired without an address", tag)))?;
                    let lsq = &mut memory_subsystem.lsq;

                    if instr.opcode() == Opcode::STORE {
                        memory_subsystem.memory.write(address, broadcast.value);
                    } else {
                        if lsq.has_older_store_conflict(lsq_index) {
                            return Err(violation(format!("{} read {} past an older store", tag, address)));
                        }
                        memory_subsystem.memory.touch(address);
                    }
                    lsq.retire(lsq_index);
                }
                Instr::BEQ { .. } => {
                    self.resolved.push(Resolution { seq: broadcast.seq, tag, instr, pc, result: broadcast.value });
                }
                Instr::CALL { offset } => {
                    self.branch_unit.push_call(broadcast.value);
                    frontend.redirect(pc as WordType + 1 + offset);
                }
                Instr::RET => match self.branch_unit.pop_return() {
                    Some(_) => frontend.redirect(broadcast.value),
                    None => frontend.exit(),
                },
                _ => {}
            }

            if let Some(reg) = broadcast.sink {
                self.rat.commit(reg, tag, broadcast.value, arch_reg_file)?;
            }
            self.rat.resolve(tag);
            table.release(tag.index);

            self.history[broadcast.seq as usize].write_back = Some(now);
            perf_counters.retire_cnt += 1;

            if self.trace.retire {
                info!("Retired [{}]", instr);
            }
        }

        Ok(())
    }

    fn cycle_branch_resolution(&mut self,
                               frontend: &mut Frontend,
                               memory_subsystem: &mut MemorySubsystem,
                               perf_counters: &mut PerfCounters) -> Result<(), EngineError> {
        for resolution in mem::take(&mut self.resolved) {
            let state = self.branch_unit.resolve(&resolution)?;
            perf_counters.branch_cnt += 1;
            self.history[resolution.seq as usize].branch = Some(state);

            if self.trace.branch {
                info!("Resolved [{}] taken={} mispredicted={}", resolution.instr, resolution.result != 0, state.mispredicted);
            }

            if !state.mispredicted {
                self.confirm_speculation();
                continue;
            }

            let target = state.target
                .ok_or_else(|| violation(format!("{} mispredicted without a target", resolution.tag)))?;
            perf_counters.branch_misprediction_cnt += 1;
            perf_counters.pipeline_flushes += 1;
            self.squash(resolution.seq, memory_subsystem, perf_counters);
            frontend.redirect(target);
        }

        Ok(())
    }

    /// Discards every instruction issued after the branch `seq`: their stations, units
    /// and queue entries are released and the alias table is rolled back to the branch.
    fn squash(&mut self, seq: u64, memory_subsystem: &mut MemorySubsystem, perf_counters: &mut PerfCounters) {
        for class in StationClass::ALL {
            let table = &mut self.rs_tables[class.index()];
            let eu_table = &mut self.eu_tables[class.index()];

            let squashed: Vec<u16> = table.iter()
                .filter(|rs| rs.is_busy() && rs.seq > seq)
                .map(|rs| rs.tag.index)
                .collect();

            for rs_index in squashed {
                let rs = table.get(rs_index);
                if let Some(eu_index) = rs.eu_index {
                    eu_table.deallocate(eu_index);
                }

                debug!("Squashed {}", rs);
                self.history[rs.seq as usize].squashed = true;

                table.release(rs_index);
                perf_counters.bad_speculation_cnt += 1;
            }
        }

        memory_subsystem.lsq.squash_after(seq);
        self.rat.restore();
    }

    fn confirm_speculation(&mut self) {
        for table in self.rs_tables.iter_mut() {
            for rs in table.iter_mut() {
                rs.speculative = false;
            }
        }
        self.rat.discard_checkpoint();
    }

    fn cycle_execute(&mut self,
                     now: u64,
                     memory_subsystem: &mut MemorySubsystem,
                     perf_counters: &mut PerfCounters) -> Result<(), EngineError> {
        self.cycle_address_generation(now, memory_subsystem)?;
        self.cycle_select(now, memory_subsystem, perf_counters)?;
        self.cycle_tick(now, memory_subsystem, perf_counters)
    }

    // Memory operations compute base + offset once the base is usable.
    fn cycle_address_generation(&mut self, now: u64, memory_subsystem: &mut MemorySubsystem) -> Result<(), EngineError> {
        for class in [StationClass::LOAD, StationClass::STORE] {
            let table = &mut self.rs_tables[class.index()];

            for rs_index in 0..table.capacity {
                let rs = table.get_mut(rs_index);
                if rs.state != RSState::ISSUED || rs.address.is_some() || !rs.operand_available(0, now) {
                    continue;
                }

                let address_avail = if rs.addr_cycles_remaining > 0 {
                    rs.addr_cycles_remaining -= 1;
                    if rs.addr_cycles_remaining > 0 {
                        continue;
                    }
                    now + 1
                } else {
                    now
                };

                let base = rs.value(0).ok_or_else(|| violation(format!("{} has no base", rs.tag)))?;
                let lsq_index = rs.lsq_index.ok_or_else(|| violation(format!("{} has no queue entry", rs.tag)))?;
                let address = base.wrapping_add(rs.imm);
                rs.address = Some(address);
                rs.address_avail = address_avail;
                memory_subsystem.lsq.resolve_address(lsq_index, address, address_avail);
                self.history[rs.seq as usize].addr_resolved = Some(now);
            }
        }

        Ok(())
    }

    // Ready stations claim functional units, oldest first.
    fn cycle_select(&mut self,
                    now: u64,
                    memory_subsystem: &MemorySubsystem,
                    perf_counters: &mut PerfCounters) -> Result<(), EngineError> {
        for class in StationClass::ALL {
            let index = class.index();

            let mut candidates = Vec::new();
            for rs in self.rs_tables[index].iter() {
                if !rs.exec_ready(now) {
                    continue;
                }

                if let Some(lsq_index) = rs.lsq_index {
                    if !memory_subsystem.lsq.may_execute(lsq_index, now) {
                        perf_counters.record_stall(StallReason::MemoryOrder);
                        continue;
                    }
                }
                candidates.push((rs.seq, rs.tag.index));
            }

            let (started, waiting) = schedule(candidates, self.eu_tables[index].idle_count());
            for _ in waiting {
                perf_counters.record_stall(StallReason::UnitBusy);
            }

            let exec_cycles = self.rs_tables[index].exec_cycles;
            for rs_index in started {
                let eu_index = self.eu_tables[index].allocate(rs_index)
                    .ok_or_else(|| violation(format!("no idle unit for {}{}", class.name(), rs_index + 1)))?;

                let rs = self.rs_tables[index].get_mut(rs_index);
                let instr = rs.instr.ok_or_else(|| violation(format!("{} started without an instruction", rs.tag)))?;
                rs.state = RSState::EXECUTING;
                rs.cycles_remaining = self.latency_overrides.get(&instr.opcode()).copied().unwrap_or(exec_cycles);
                rs.eu_index = Some(eu_index);
                self.history[rs.seq as usize].exec_start = Some(now);

                if self.trace.execute {
                    info!("Executing [{}] on {} unit {}", instr, class.name(), eu_index);
                }
            }
        }

        Ok(())
    }

    // Advances every executing station and computes the results of those that finish.
    // A finished station frees its unit for the next cycle.
    fn cycle_tick(&mut self,
                  now: u64,
                  memory_subsystem: &MemorySubsystem,
                  perf_counters: &mut PerfCounters) -> Result<(), EngineError> {
        for class in StationClass::ALL {
            let index = class.index();
            let completed = self.rs_tables[index].tick(now);

            for rs_index in completed {
                let result = EU::execute(self.rs_tables[index].get(rs_index), &memory_subsystem.memory)?;

                let rs = self.rs_tables[index].get_mut(rs_index);
                rs.result = result;
                if let Some(eu_index) = rs.eu_index.take() {
                    self.eu_tables[index].deallocate(eu_index);
                }
                self.history[rs.seq as usize].exec_end = Some(now);
                perf_counters.execute_cnt += 1;
            }
        }

        Ok(())
    }

    // Issues instructions in program order until the first one that can't be issued.
    fn cycle_issue(&mut self,
                   now: u64,
                   frontend: &mut Frontend,
                   memory_subsystem: &mut MemorySubsystem,
                   arch_reg_file: &ArgRegFile,
                   perf_counters: &mut PerfCounters) -> Result<(), EngineError> {
        for _ in 0..self.issue_n_wide {
            if frontend.is_awaiting_jump() {
                perf_counters.record_stall(StallReason::ControlPending);
                break;
            }

            let (pc, instr) = match frontend.peek() {
                Some(next) => next,
                None => break,
            };

            if instr.is_control() && self.branch_unit.has_in_flight() {
                perf_counters.record_stall(StallReason::BranchInFlight);
                break;
            }

            let class = instr.class();
            if !self.rs_tables[class.index()].has_idle() {
                perf_counters.record_stall(StallReason::StationFull);
                break;
            }

            if instr.is_memory() && !memory_subsystem.lsq.has_space() {
                perf_counters.record_stall(StallReason::QueueFull);
                break;
            }

            // sources are renamed before the sink is bound, so `ADDI R1, R1, 1` reads the
            // previous producer of R1
            let mut source = [Operand::Unused; 2];
            for (source_index, reg) in instr.sources().iter().enumerate() {
                if let Some(reg) = reg {
                    source[source_index] = self.rat.rename(*reg, arch_reg_file)?;
                }
            }
            if let Some(reg) = instr.sink() {
                RAT::check(reg)?;
            }

            let tag = self.rs_tables[class.index()].allocate()
                .ok_or_else(|| violation(format!("no idle {} station", class.name())))?;
            let seq = self.history.len() as u64;
            let speculative = self.branch_unit.has_in_flight();

            let lsq_index = match instr {
                Instr::LOAD { .. } => memory_subsystem.lsq.allocate(seq, MemoryOp::LOAD, tag),
                Instr::STORE { .. } => memory_subsystem.lsq.allocate(seq, MemoryOp::STORE, tag),
                _ => None,
            };

            let rs = self.rs_tables[class.index()].get_mut(tag.index);
            rs.instr = Some(instr);
            rs.pc = pc;
            rs.seq = seq;
            rs.source = source;
            rs.source_avail = [now + 1; 2];
            rs.imm = instr.immediate();
            rs.speculative = speculative;
            rs.lsq_index = lsq_index;

            if let Some(reg) = instr.sink() {
                self.rat.bind(reg, tag)?;
            }

            let mut record = InstrRecord::new(seq, pc, instr, tag, now, speculative);
            perf_counters.issue_cnt += 1;

            if self.trace.issue {
                info!("Issued [{}] to {}", instr, tag);
            }

            match instr {
                Instr::BEQ { .. } => {
                    record.branch = Some(self.branch_unit.predict(tag, seq));
                    self.rat.checkpoint();
                    frontend.advance();
                    self.history.push(record);
                }
                Instr::CALL { .. } | Instr::RET => {
                    frontend.await_jump();
                    self.history.push(record);
                    break;
                }
                _ => {
                    frontend.advance();
                    self.history.push(record);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn flush(&mut self) {
        for table in self.rs_tables.iter_mut() {
            table.flush();
        }
        for eu_table in self.eu_tables.iter_mut() {
            eu_table.flush();
        }
        self.rat.flush();
        self.branch_unit.flush();
        self.cdb.flush();
        self.resolved.clear();
        self.history.clear();
        self.oldest_in_flight = 0;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rs_tables.iter().all(|table| table.is_empty()) && self.cdb.is_empty() && self.resolved.is_empty()
    }

    /// Verifies the structural invariants between the alias table, the stations, the
    /// functional units and the load/store queue.
    pub(crate) fn check_invariants(&self, memory_subsystem: &MemorySubsystem) -> Result<(), EngineError> {
        let live_station = |tag: StationTag| {
            let rs = self.rs_tables[tag.class.index()].get(tag.index);
            if rs.is_busy() { Some(rs) } else { None }
        };

        for reg in 0..REGISTER_COUNT {
            if let Some(tag) = self.rat.get(reg)? {
                let rs = live_station(tag)
                    .ok_or_else(|| violation(format!("R{} names released station {}", reg, tag)))?;
                if rs.instr.and_then(|instr| instr.sink()) != Some(reg) {
                    return Err(violation(format!("R{} names {} which does not write it", reg, tag)));
                }
            }
        }

        let in_flight = self.branch_unit.in_flight();
        if in_flight.is_some() != self.rat.has_checkpoint() {
            return Err(violation("alias table checkpoint does not match the in-flight branch".to_string()));
        }

        if let Some(checkpoint) = self.rat.checkpoint_entries() {
            for (reg, entry) in checkpoint.iter().enumerate() {
                if let Some(tag) = entry {
                    if live_station(*tag).is_none() {
                        return Err(violation(format!("checkpointed R{} names released station {}", reg, tag)));
                    }
                }
            }
        }

        let mut memory_stations = 0;
        for (table, eu_table) in self.rs_tables.iter().zip(self.eu_tables.iter()) {
            let mut executing = 0;

            for rs in table.iter().filter(|rs| rs.is_busy()) {
                for source in rs.source.iter() {
                    if let Operand::Pending(tag) = source {
                        if live_station(*tag).is_none() {
                            return Err(violation(format!("{} waits on released station {}", rs.tag, tag)));
                        }
                    }
                }

                if rs.speculative && in_flight.map_or(true, |branch| branch.seq >= rs.seq) {
                    return Err(violation(format!("{} is speculative without an older branch in flight", rs.tag)));
                }

                if rs.state == RSState::EXECUTING {
                    executing += 1;
                    if !table.class.is_memory() && !table.operands_ready(rs.tag.index) {
                        return Err(violation(format!("{} executes with pending operands", rs.tag)));
                    }
                    let eu_index = rs.eu_index
                        .ok_or_else(|| violation(format!("{} executes without a unit", rs.tag)))?;
                    if eu_table.get(eu_index).rs_index != Some(rs.tag.index) {
                        return Err(violation(format!("{} and unit {} disagree", rs.tag, eu_index)));
                    }
                } else if rs.eu_index.is_some() {
                    return Err(violation(format!("{} holds a unit while not executing", rs.tag)));
                }

                if table.class.is_memory() {
                    memory_stations += 1;
                    let lsq_index = rs.lsq_index
                        .ok_or_else(|| violation(format!("{} has no queue entry", rs.tag)))?;
                    let entry = memory_subsystem.lsq.get(lsq_index);
                    if entry.tag != Some(rs.tag) || entry.seq != rs.seq {
                        return Err(violation(format!("{} and its queue entry disagree", rs.tag)));
                    }
                }
            }

            let busy_units = eu_table.iter().filter(|eu| eu.state == EUState::EXECUTING).count();
            if busy_units != executing {
                return Err(violation(format!("{} {} units busy for {} executing stations",
                                             busy_units, table.class.name(), executing)));
            }
        }

        let queued = memory_subsystem.lsq.iter()
            .filter(|(_, entry)| entry.state != LSQEntryState::RETIRED)
            .count();
        if queued != memory_stations {
            return Err(violation(format!("{} queue entries for {} memory stations", queued, memory_stations)));
        }

        Ok(())
    }

    pub(crate) fn station_views(&self) -> Vec<StationView> {
        self.rs_tables.iter().flat_map(|table| table.iter().map(|rs| rs.view())).collect()
    }

    pub(crate) fn alias_table(&self) -> Vec<Option<StationTag>> {
        self.rat.table.clone()
    }

    pub(crate) fn history(&self) -> &[InstrRecord] {
        &self.history
    }

    // Starts at the oldest unfinished record, so its length is bounded by the window of
    // instructions in flight rather than the length of the run.
    pub(crate) fn in_flight_history(&self) -> impl Iterator<Item=&InstrRecord> {
        self.history[self.oldest_in_flight..].iter().filter(|record| record.is_in_flight())
    }

    pub(crate) fn branch_in_flight(&self) -> bool {
        self.branch_unit.has_in_flight()
    }

    pub(crate) fn call_depth(&self) -> usize {
        self.branch_unit.call_depth()
    }
}

use std::rc::Rc;

use crate::cpu::{CPUConfig, CycleEngine, RunLimit, RunOutcome, StallReason, StationConfig};
use crate::instructions::instructions::{InstrRecord, Opcode, Program, RegisterType, StationClass, WordType};
use crate::memory_subsystem::memory_subsystem::MemoryEntry;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::backend::reservation_station::RSState;
    use crate::loader::loader::load_from_string;

    use super::*;

    #[test]
    fn test_independent_adds_then_dependent_add() {
        let src = r#"
ADDI R1, R0, 5
ADDI R2, R0, 10
ADD R3, R1, R2
"#;
        let mut harness = TestHarness::default();
        harness.set_stations(StationClass::ADD, 8, 2);
        harness.config.latency_overrides.insert(Opcode::ADDI, 1);
        harness.run(src);

        harness.assert_reg_value(1, 5);
        harness.assert_reg_value(2, 10);
        harness.assert_reg_value(3, 15);
        assert_eq!(harness.record(0).write_back, Some(3));
        assert_eq!(harness.record(1).write_back, Some(4));
        assert_eq!(harness.record(2).exec_start, Some(5));
        assert_eq!(harness.record(2).exec_end, Some(6));
        assert_eq!(harness.record(2).write_back, Some(7));

        let metrics = harness.engine().metrics();
        assert_eq!(metrics.cycles, 7);
        assert_eq!(metrics.committed, 3);
        assert_eq!(metrics.ipc, 3.0 / 7.0);
    }

    #[test]
    fn test_load_waits_for_store_address() {
        let src = r#"
ADDI R1, R0, 7
STORE R1, 0(R2)
LOAD R3, 0(R2)
"#;
        let mut harness = TestHarness::default();
        harness.set_stations(StationClass::ADD, 4, 1);
        harness.run(src);

        let store = harness.record(1).clone();
        let load = harness.record(2).clone();
        assert_eq!(store.addr_resolved, Some(6));
        assert_eq!(store.exec_start, Some(7));
        assert_eq!(store.write_back, Some(9));
        assert_eq!(load.exec_start, Some(9));
        assert!(load.exec_start >= store.addr_resolved);

        harness.assert_reg_value(3, 7);
        harness.assert_mem_value(2, 7);
        harness.assert_cycles(11);
        assert_eq!(harness.engine().metrics().stall_count(StallReason::MemoryOrder), 1);
    }

    #[test]
    fn test_taken_branch_is_mispredicted() {
        let src = r#"
BEQ R1, R2, 8
ADDI R4, R0, 1
ADDI R4, R0, 2
ADDI R4, R0, 3
ADDI R4, R0, 4
ADDI R4, R0, 5
ADDI R4, R0, 6
ADDI R4, R0, 7
ADDI R4, R0, 8
ADDI R5, R0, 7
"#;
        let mut harness = TestHarness::default();
        harness.set_stations(StationClass::ADD, 4, 1);
        harness.config.registers[2] = 1;
        harness.run(src);

        let branch = harness.record(0).branch.unwrap();
        assert!(!branch.predicted_taken);
        assert_eq!(branch.taken, Some(true));
        assert!(branch.mispredicted);
        assert_eq!(branch.target, Some(9));

        assert!(harness.record(1).squashed);
        assert_eq!(harness.record(1).write_back, None);
        assert_eq!(harness.record(2).pc, 9);

        harness.assert_reg_value(4, 4);
        harness.assert_reg_value(5, 7);
        harness.assert_cycles(5);

        let metrics = harness.engine().metrics();
        assert_eq!(metrics.mispredictions, 1);
        assert_eq!(metrics.branches_resolved, 1);
        assert_eq!(metrics.misprediction_rate, 1.0);
        assert_eq!(metrics.squashed, 1);
        assert_eq!(metrics.committed, 2);
    }

    #[test]
    fn test_not_taken_branch_keeps_speculative_work() {
        let src = r#"
ADDI R1, R0, 1
BEQ R1, R0, 2
ADDI R2, R0, 5
ADDI R3, R0, 6
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        harness.assert_reg_value(2, 5);
        harness.assert_reg_value(3, 6);
        assert!(harness.record(2).speculative);
        assert!(!harness.record(2).squashed);

        let branch = harness.record(1).branch.unwrap();
        assert_eq!(branch.taken, Some(false));
        assert!(!branch.mispredicted);

        let metrics = harness.engine().metrics();
        assert_eq!(metrics.mispredictions, 0);
        assert_eq!(metrics.branches_resolved, 1);
        assert_eq!(metrics.committed, 4);
    }

    #[test]
    fn test_speculative_result_waits_for_branch() {
        let src = r#"
ADDI R1, R0, 1
BEQ R1, R0, 2
ADDI R2, R0, 5
"#;
        let mut harness = TestHarness::default();
        harness.set_stations(StationClass::ADD, 4, 1);
        harness.run(src);

        // the branch resolves in cycle 5; the add finished in cycle 4
        assert_eq!(harness.record(1).write_back, Some(5));
        assert_eq!(harness.record(2).exec_end, Some(4));
        assert_eq!(harness.record(2).write_back, Some(6));
    }

    #[test]
    fn test_call_and_return() {
        let src = r#"
CALL 2
ADDI R3, R0, 9
RET
ADDI R2, R0, 5
RET
"#;
        let mut harness = TestHarness::default();
        let outcome = harness.run(src);
        assert_eq!(outcome, RunOutcome::Halted);

        harness.assert_reg_value(1, 1);
        harness.assert_reg_value(2, 5);
        harness.assert_reg_value(3, 9);
        assert_eq!(harness.engine().call_depth(), 0);
        assert_eq!(harness.engine().instructions().len(), 5);
        assert!(harness.engine().metrics().stall_count(StallReason::ControlPending) > 0);
    }

    #[test]
    fn test_return_with_empty_call_stack_halts() {
        let src = r#"
RET
ADDI R2, R0, 5
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        harness.assert_cycles(3);
        harness.assert_reg_value(2, 2);
        assert_eq!(harness.engine().metrics().committed, 1);
    }

    #[test]
    fn test_write_after_write() {
        let src = r#"
ADDI R1, R0, 3
MUL R3, R1, R1
ADDI R3, R0, 4
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        harness.assert_reg_value(3, 4);
        assert!(harness.record(1).write_back > harness.record(2).write_back);
    }

    #[test]
    fn test_same_src_dst_reg() {
        let src = r#"
ADDI R1, R0, 5
ADDI R1, R1, 10
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(1, 15);
    }

    #[test]
    fn test_r0_is_never_written() {
        let src = r#"
ADDI R0, R0, 5
ADD R1, R0, R0
"#;
        let mut harness = TestHarness::default();
        harness.run(src);
        harness.assert_reg_value(0, 0);
        harness.assert_reg_value(1, 0);
    }

    #[test]
    fn test_mul_and_nor() {
        let src = r#"
ADDI R1, R0, 15
ADD R1, R1, R1
ADD R1, R1, R1
ADD R1, R1, R1
ADD R1, R1, R1
ADD R1, R1, R1
ADD R1, R1, R1
ADD R1, R1, R1
ADD R1, R1, R1
MUL R2, R1, R1
NOR R3, R0, R0
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        // 3840 * 3840 = 0xE10000
        harness.assert_reg_value(1, 3840);
        harness.assert_reg_value(2, 0);
        harness.assert_reg_value(3, -1);
    }

    #[test]
    fn test_result_bus_conflict() {
        let src = r#"
ADDI R1, R0, 1
ADDI R2, R0, 2
"#;
        let mut harness = TestHarness::default();
        harness.config.issue_width = 2;
        harness.set_stations(StationClass::ADD, 4, 1);
        harness.run(src);

        assert_eq!(harness.record(0).exec_end, Some(2));
        assert_eq!(harness.record(1).exec_end, Some(2));
        assert_eq!(harness.record(0).write_back, Some(3));
        assert_eq!(harness.record(1).write_back, Some(4));
        assert_eq!(harness.engine().metrics().stall_count(StallReason::CdbConflict), 1);
    }

    #[test]
    fn test_functional_unit_conflict() {
        let src = r#"
ADDI R1, R0, 1
ADDI R2, R0, 2
"#;
        let mut harness = TestHarness::default();
        harness.config.issue_width = 2;
        harness.set_stations(StationClass::ADD, 4, 1);
        harness.config.stations.add.unit_count = Some(1);
        harness.run(src);

        assert_eq!(harness.record(0).exec_start, Some(2));
        assert_eq!(harness.record(1).exec_start, Some(3));
        assert_eq!(harness.engine().metrics().stall_count(StallReason::UnitBusy), 1);
    }

    #[test]
    fn test_station_exhaustion_stalls_issue() {
        let src = r#"
ADDI R1, R0, 1
ADDI R2, R0, 2
"#;
        let mut harness = TestHarness::default();
        harness.set_stations(StationClass::ADD, 1, 1);
        harness.run(src);

        assert_eq!(harness.record(1).issue, 3);
        harness.assert_cycles(5);
        assert_eq!(harness.engine().metrics().stall_count(StallReason::StationFull), 1);
    }

    #[test]
    fn test_queue_exhaustion_stalls_issue() {
        let src = r#"
LOAD R1, 0(R0)
LOAD R2, 1(R0)
"#;
        let mut harness = TestHarness::default();
        harness.config.lsq_capacity = Some(1);
        harness.run(src);

        // the queue entry is retired at commit, in time for issue in the same cycle
        assert_eq!(Some(harness.record(1).issue), harness.record(0).write_back);
        assert!(harness.engine().metrics().stall_count(StallReason::QueueFull) > 0);
    }

    #[test]
    fn test_independent_throughput() {
        for exec_cycles in [1u8, 2] {
            let src = "ADDI R1, R0, 1\n".repeat(3) + &"ADDI R2, R0, 2\n".repeat(3);
            let mut harness = TestHarness::default();
            harness.set_stations(StationClass::ADD, 8, exec_cycles);
            harness.run(&src);

            // issue + exec + broadcast, plus one cycle per additional instruction
            harness.assert_cycles(6 + exec_cycles as u64 + 1);
        }
    }

    #[test]
    fn test_dependency_chain() {
        for (exec_cycles, cycles) in [(1u8, 9u64), (2, 13)] {
            let src = "ADDI R1, R1, 1\n".repeat(4);
            let mut harness = TestHarness::default();
            harness.set_stations(StationClass::ADD, 8, exec_cycles);
            harness.run(&src);

            harness.assert_reg_value(1, 5);
            harness.assert_cycles(cycles);
            for k in 1..4 {
                assert!(harness.record(k).exec_start > harness.record(k - 1).write_back);
            }
        }
    }

    #[test]
    fn test_loop() {
        let mut harness = TestHarness::default();
        harness.run(LOOP_SRC);

        harness.assert_reg_value(1, 0);
        harness.assert_reg_value(2, 5);
        harness.assert_reg_value(5, 1);

        let metrics = harness.engine().metrics();
        assert_eq!(metrics.branches_resolved, 5);
        assert_eq!(metrics.mispredictions, 3);
        assert_eq!(metrics.squashed, 2);
        assert_eq!(metrics.misprediction_rate, 3.0 / 5.0);
    }

    #[test]
    fn test_squashed_store_never_writes_memory() {
        let src = r#"
ADDI R1, R0, 9
BEQ R0, R0, 1
STORE R1, 4(R0)
ADDI R3, R0, 1
"#;
        let mut harness = TestHarness::default();
        harness.set_stations(StationClass::ADD, 4, 1);
        harness.set_stations(StationClass::BEQ, 2, 4);
        harness.config.stations.store = StationConfig { station_count: 2, exec_cycles: 1, addr_cycles: 0, unit_count: None };
        harness.run(src);

        let store = harness.record(2).clone();
        assert!(store.speculative);
        assert!(store.squashed);
        assert_eq!(store.exec_end, Some(4));
        assert_eq!(store.write_back, None);

        harness.assert_mem_value(4, 0);
        harness.assert_reg_value(3, 1);
        assert!(harness.engine().snapshot().memory.iter().all(|entry| entry.address != 4));
    }

    #[test]
    fn test_squash_releases_younger_stations() {
        let src = r#"
BEQ R0, R0, 2
MUL R1, R0, R0
LOAD R2, 0(R0)
ADDI R3, R0, 1
"#;
        let mut harness = TestHarness::default();
        harness.set_stations(StationClass::BEQ, 2, 3);
        let mut engine = harness.build(src);

        // the branch executes in cycles 2..4 and resolves in cycle 5
        for _ in 0..4 {
            engine.step().unwrap();
        }
        let snapshot = engine.snapshot();
        assert!(snapshot.stations.iter().any(|station| station.busy && station.speculative));
        assert_eq!(snapshot.load_store_queue.len(), 1);

        engine.step().unwrap();
        let snapshot = engine.snapshot();
        let busy: Vec<_> = snapshot.stations.iter().filter(|station| station.busy).collect();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].op, Some(Opcode::ADDI));
        assert_eq!(busy[0].state, RSState::ISSUED);
        assert!(snapshot.load_store_queue.is_empty());
        assert!(snapshot.alias_table.iter().all(|entry| entry.map_or(true, |tag| tag == busy[0].tag)));
        assert_eq!(snapshot.registers, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_initial_registers_and_memory() {
        let src = r#"
LOAD R1, 2(R2)
STORE R1, 3(R2)
"#;
        let mut harness = TestHarness::default();
        harness.config.registers[2] = 4;
        harness.memory.push(MemoryEntry { address: 6, value: 11 });
        harness.run(src);

        harness.assert_reg_value(1, 11);
        harness.assert_mem_value(7, 11);
        assert_eq!(harness.engine().snapshot().memory, vec![
            MemoryEntry { address: 6, value: 11 },
            MemoryEntry { address: 7, value: 11 },
        ]);
    }

    #[test]
    fn test_alias_table_names_busy_stations() {
        let mut harness = TestHarness::default();
        let mut engine = harness.build(LOOP_SRC);

        while !engine.is_halted() {
            engine.step().unwrap();
            let snapshot = engine.snapshot();
            for tag in snapshot.alias_table.iter().flatten() {
                let station = snapshot.stations.iter().find(|station| station.tag == *tag).unwrap();
                assert!(station.busy);
                assert_eq!(station.tag.class, tag.class);
            }
        }
    }

    #[test]
    fn test_branch_offset_is_relative_to_next_instruction() {
        let src = r#"
BEQ R0, R0, 1
ADDI R1, R0, 5
ADDI R2, R0, 7
"#;
        let mut harness = TestHarness::default();
        harness.run(src);

        assert_eq!(harness.record(0).branch.unwrap().target, Some(2));
        assert!(harness.record(1).squashed);
        assert_eq!(harness.record(2).pc, 2);
        harness.assert_reg_value(1, 1);
        harness.assert_reg_value(2, 7);
    }

    #[test]
    fn test_zero_branch_offset_falls_through() {
        let src = r#"
BEQ R0, R0, 0
ADDI R1, R0, 5
"#;
        let mut harness = TestHarness::default();
        let outcome = harness.run(src);
        assert_eq!(outcome, RunOutcome::Halted);

        // taken, so still a misprediction; the squashed add is issued again
        let branch = harness.record(0).branch.unwrap();
        assert_eq!(branch.target, Some(1));
        assert!(branch.mispredicted);
        assert!(harness.record(1).squashed);
        assert_eq!(harness.record(2).pc, 1);
        harness.assert_reg_value(1, 5);

        let metrics = harness.engine().metrics();
        assert_eq!(metrics.branches_resolved, 1);
        assert_eq!(metrics.squashed, 1);
    }

    #[test]
    fn test_older_producer_commits_during_speculation() {
        let src = r#"
ADDI R2, R0, 3
MUL R1, R2, R2
BEQ R0, R0, 1
ADDI R1, R0, 1
ADD R3, R1, R0
"#;
        let mut harness = TestHarness::default();
        // the branch resolves long after the MUL wrote back
        harness.set_stations(StationClass::BEQ, 2, 20);
        harness.run(src);

        let mul = harness.record(1).clone();
        let branch = harness.record(2).clone();
        assert!(mul.write_back < branch.write_back);
        assert!(harness.record(3).speculative);
        assert!(harness.record(3).squashed);
        assert!(harness.record(4).squashed);
        assert_eq!(harness.record(5).pc, 4);

        harness.assert_reg_value(1, 9);
        harness.assert_reg_value(3, 9);
        assert_eq!(harness.engine().metrics().squashed, 2);
    }

    #[test]
    fn test_default_registers() {
        let mut harness = TestHarness::default();
        let engine = harness.build("ADD R1, R6, R7");
        assert_eq!(engine.snapshot().registers, vec![0, 1, 2, 3, 4, 5, 6, 7]);

        harness.run("ADD R1, R6, R7");
        harness.assert_reg_value(1, 13);
    }

    #[test]
    fn test_snapshot_holds_in_flight_records() {
        let mut harness = TestHarness::default();
        let mut engine = harness.build(LOOP_SRC);
        let station_count: usize = StationClass::ALL.iter()
            .map(|class| harness.config.stations.get(*class).station_count as usize)
            .sum();

        while !engine.is_halted() {
            engine.step().unwrap();
            let snapshot = engine.snapshot();
            assert!(snapshot.instructions.len() <= station_count);
            for record in snapshot.instructions.iter() {
                assert!(record.is_in_flight());
                assert_eq!(record, &engine.instructions()[record.seq as usize]);
            }
        }

        assert!(engine.snapshot().instructions.is_empty());
        assert_eq!(engine.instructions().len() as u64, engine.metrics().issued);
    }

    #[test]
    fn test_deterministic_trace() {
        let mut harness = TestHarness::default();
        let first = harness.trace(LOOP_SRC);
        let second = harness.trace(LOOP_SRC);
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset() {
        let mut harness = TestHarness::default();
        let mut engine = harness.build(LOOP_SRC);
        let initial = engine.snapshot();

        assert_eq!(engine.run(RunLimit::Halted).unwrap(), RunOutcome::Halted);
        let cycles = engine.cycle();

        engine.reset();
        assert_eq!(engine.snapshot(), initial);
        assert_eq!(engine.run(RunLimit::Halted).unwrap(), RunOutcome::Halted);
        assert_eq!(engine.cycle(), cycles);
    }

    #[test]
    fn test_pause_resume_and_cycle_limit() {
        let mut harness = TestHarness::default();
        let mut engine = harness.build(LOOP_SRC);

        engine.pause();
        assert_eq!(engine.run(RunLimit::Halted).unwrap(), RunOutcome::Paused);
        assert_eq!(engine.cycle(), 0);

        engine.resume();
        assert_eq!(engine.run(RunLimit::MaxCycles(2)).unwrap(), RunOutcome::CycleLimit);
        assert_eq!(engine.cycle(), 2);

        assert_eq!(engine.run(RunLimit::Halted).unwrap(), RunOutcome::Halted);
        let cycles = engine.cycle();
        engine.step().unwrap();
        assert_eq!(engine.cycle(), cycles);
        assert!(engine.snapshot().halted);
    }

    #[test]
    fn test_empty_program_halts_immediately() {
        let mut harness = TestHarness::default();
        let engine = harness.build("# nothing to do\n");
        assert!(engine.is_halted());
        assert_eq!(engine.metrics().ipc, 0.0);
    }

    #[test]
    fn test_entry_point() {
        let mut harness = TestHarness::default();
        let mut program = load_from_string("ADDI R1, R0, 7\nADDI R2, R0, 9").unwrap();
        program.entry_point = 1;
        harness.run_program(program);

        harness.assert_reg_value(1, 1);
        harness.assert_reg_value(2, 9);
    }

    const LOOP_SRC: &str = r#"
ADDI R1, R0, 3
ADDI R2, R2, 1
ADDI R1, R1, -1
BEQ R1, R0, 1
BEQ R0, R0, -4
ADDI R5, R0, 1
"#;

    struct TestHarness {
        config: CPUConfig,
        memory: Vec<MemoryEntry>,
        engine: Option<CycleEngine>,
    }

    impl Default for TestHarness {
        fn default() -> Self {
            TestHarness { config: CPUConfig::default(), memory: Vec::new(), engine: None }
        }
    }

    impl TestHarness {
        fn set_stations(&mut self, class: StationClass, station_count: u16, exec_cycles: u8) {
            let stations = self.config.stations.get_mut(class);
            stations.station_count = station_count;
            stations.exec_cycles = exec_cycles;
        }

        fn build(&mut self, src: &str) -> CycleEngine {
            let program = match load_from_string(src) {
                Ok(program) => program,
                Err(err) => panic!("Loading program failed: {}", err),
            };
            self.build_program(program)
        }

        fn build_program(&mut self, program: Program) -> CycleEngine {
            CycleEngine::new(self.config.clone(), Rc::new(program), self.memory.clone())
                .expect("invalid test configuration")
        }

        fn run(&mut self, src: &str) -> RunOutcome {
            let engine = self.build(src);
            self.run_engine(engine)
        }

        fn run_program(&mut self, program: Program) -> RunOutcome {
            let engine = self.build_program(program);
            self.run_engine(engine)
        }

        fn run_engine(&mut self, mut engine: CycleEngine) -> RunOutcome {
            let outcome = engine.run(RunLimit::MaxCycles(1000)).expect("engine failed");
            assert_eq!(outcome, RunOutcome::Halted);
            self.engine = Some(engine);
            outcome
        }

        // One serialized snapshot per cycle.
        fn trace(&mut self, src: &str) -> Vec<String> {
            let mut engine = self.build(src);
            let mut trace = Vec::new();
            while !engine.is_halted() {
                engine.step().expect("engine failed");
                trace.push(serde_yaml::to_string(&engine.snapshot()).expect("snapshot not serializable"));
            }
            trace
        }

        fn engine(&self) -> &CycleEngine {
            self.engine.as_ref().expect("CPU is not initialized")
        }

        fn record(&self, seq: usize) -> &InstrRecord {
            &self.engine().instructions()[seq]
        }

        fn assert_reg_value(&self, reg: RegisterType, value: WordType) {
            assert_eq!(self.engine().register(reg), value, "R{}", reg);
        }

        fn assert_mem_value(&self, address: WordType, value: WordType) {
            assert_eq!(self.engine().memory(address), value, "memory[{}]", address);
        }

        fn assert_cycles(&self, cycles: u64) {
            assert_eq!(self.engine().cycle(), cycles);
        }
    }
}

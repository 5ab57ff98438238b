use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use log::error;
use structopt::StructOpt;

use tomasulo_sim::cpu::{CPUConfig, CycleEngine, load_cpu_config, RunLimit, RunOutcome};
use tomasulo_sim::loader::loader::{load, load_memory, LoadError};

#[derive(StructOpt, Debug)]
#[structopt(name = "Tomasulo Simulator")]
struct Opt {
    /// Path of the program to load
    #[structopt(short, long, parse(from_os_str))]
    file: PathBuf,

    /// Sets a custom config file; the built-in hardware is used otherwise
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Initial memory image with one `address value` pair per line
    #[structopt(short, long, parse(from_os_str))]
    memory: Option<PathBuf>,

    /// The program counter to start from
    #[structopt(long, default_value = "0")]
    pc: usize,

    /// Stop after this many cycles
    #[structopt(long, default_value = "100000")]
    max_cycles: u64,
}

fn report_load_error(path: &str, err: LoadError) -> ! {
    error!("Loading '{}' failed.", path);
    match err {
        LoadError::AnalysisError(msg_vec) => {
            for msg in msg_vec {
                error!("{}", msg);
            }
        }
        other => error!("{}", other),
    }
    exit(1);
}

fn print_summary(engine: &CycleEngine) {
    let snapshot = engine.snapshot();
    println!("Registers:");
    for (reg, value) in snapshot.registers.iter().enumerate() {
        println!("  R{} = {}", reg, value);
    }

    println!("Memory:");
    for entry in snapshot.memory.iter() {
        println!("  [{}] = {}", entry.address, entry.value);
    }

    println!("{:<20} {:>6} {:>6} {:>6} {:>6} {:>6}  {}", "Instruction", "Issue", "Addr", "Start", "End", "WB", "Flags");
    let cycle = |c: Option<u64>| c.map_or("-".to_string(), |c| c.to_string());
    for record in engine.instructions().iter() {
        let mut flags = Vec::new();
        if record.squashed {
            flags.push("squashed".to_string());
        }
        if let Some(branch) = record.branch {
            if branch.mispredicted {
                flags.push(format!("mispredicted -> {}", branch.target.unwrap_or_default()));
            }
        }
        println!("{:<20} {:>6} {:>6} {:>6} {:>6} {:>6}  {}",
                 record.instr.to_string(),
                 record.issue,
                 cycle(record.addr_resolved),
                 cycle(record.exec_start),
                 cycle(record.exec_end),
                 cycle(record.write_back),
                 flags.join(", "));
    }

    let metrics = &snapshot.metrics;
    println!("Cycles: {}", metrics.cycles);
    println!("Committed: {}", metrics.committed);
    println!("IPC: {:.3}", metrics.ipc);
    println!("Branches: {} Mispredictions: {} ({:.1}%)",
             metrics.branches_resolved, metrics.mispredictions, metrics.misprediction_rate * 100.0);
    for (reason, count) in metrics.stalls.iter() {
        println!("Stall {:?}: {}", reason, count);
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();

    let cpu_config = match &opt.config {
        None => CPUConfig::default(),
        Some(config_path) => {
            let config_path = config_path.to_string_lossy();
            match load_cpu_config(&config_path) {
                Ok(config) => config,
                Err(err) => {
                    error!("Failed to load {}. Cause: {}", config_path, err);
                    exit(1);
                }
            }
        }
    };

    let path = opt.file.to_string_lossy().to_string();
    let mut program = match load(&path) {
        Ok(program) => program,
        Err(err) => report_load_error(&path, err),
    };
    program.entry_point = opt.pc;

    let memory = match &opt.memory {
        None => Vec::new(),
        Some(memory_path) => {
            let memory_path = memory_path.to_string_lossy().to_string();
            match load_memory(&memory_path) {
                Ok(entries) => entries,
                Err(err) => report_load_error(&memory_path, err),
            }
        }
    };

    let mut engine = match CycleEngine::new(cpu_config, Rc::new(program), memory) {
        Ok(engine) => engine,
        Err(err) => {
            error!("Invalid configuration: {}", err);
            exit(1);
        }
    };

    match engine.run(RunLimit::MaxCycles(opt.max_cycles)) {
        Ok(RunOutcome::Halted) => println!("Program complete!"),
        Ok(outcome) => println!("Stopped: {:?} after {} cycles", outcome, engine.cycle()),
        Err(err) => {
            error!("Simulation aborted in cycle {}: {}", engine.cycle() + 1, err);
            print_summary(&engine);
            exit(2);
        }
    }

    print_summary(&engine);
}

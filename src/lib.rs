pub mod backend;
pub mod cpu;
pub mod frontend;
pub mod instructions;
pub mod loader;
pub mod memory_subsystem;

#[cfg(test)]
mod cpu_tests;

pub mod load_store_queue;
pub mod memory_subsystem;

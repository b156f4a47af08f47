mod process;

pub use process::{is_process_alive, kill_process, terminate_process};

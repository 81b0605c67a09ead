//! Reference task server binary.
//! Run with: cargo run --bin taskstream-server

use std::process::ExitCode;

use taskstream::start_taskstream;

fn main() -> ExitCode {
    start_taskstream::run()
}

//! drover CLI: pull threat-intelligence feeds into tables, once or on a schedule.

use std::process::ExitCode;

use drover::{Application, Config};

fn main() -> ExitCode {
    Application::<Config>::run()
}

use std::process;

fn main() {
    if let Err(err) = coordinator_runtime::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}

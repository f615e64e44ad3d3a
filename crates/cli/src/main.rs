use std::process::ExitCode;

fn main() -> ExitCode {
    roundkeeper_cli::run()
}

use std::process::ExitCode;

fn main() -> ExitCode {
    dunegate_cli::run()
}

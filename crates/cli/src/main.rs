use std::process::ExitCode;

fn main() -> ExitCode {
    caucus_cli::run()
}

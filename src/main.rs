use std::process::ExitCode;

fn main() -> ExitCode {
    match rekey::run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

pub mod boot;
pub mod cli;
pub mod system;
pub mod write;

fn main() -> std::process::ExitCode {
    cli::main()
}

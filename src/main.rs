use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    mods::logging::init();
    mods::cli::run().await
}

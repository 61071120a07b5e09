use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    agentrun_cli::run().await
}

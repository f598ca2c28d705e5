//! mcp-gateway CLI entry point.

#![warn(clippy::all)]

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("Error: CLI feature not enabled. Build with --features cli");
    std::process::exit(1);
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() {
    use clap::Parser;

    let cli = mcp_gateway::cli::Cli::parse();
    let code = cli.run().await;
    std::process::exit(code);
}

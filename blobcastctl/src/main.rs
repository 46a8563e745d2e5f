use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = blobcastctl::Cli::parse();
    if let Err(err) = blobcastctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

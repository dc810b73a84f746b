use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = inference_router::cli::Cli::parse();
    if let Err(e) = inference_router::cmd::dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

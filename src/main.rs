use clap::Parser;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("botfleet=info")),
        )
        .init();

    let cli = botfleet::cli::Cli::parse();
    let code = botfleet::cli::run(cli).await;
    std::process::exit(code);
}

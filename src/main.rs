use rider_sync_lib::{cli::parse_args, commands};

#[tokio::main]
async fn main() {
    let cli = parse_args();
    std::process::exit(commands::run(cli).await);
}

use clap::Parser;

use omnitap::cmd::{run_cli, shutdown, Cli};
use omnitap::log::init_tracing_with;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing_with(cli.log_level.as_deref(), cli.log_json);

    let code = run_cli(cli).await;
    shutdown().await;
    std::process::exit(code);
}

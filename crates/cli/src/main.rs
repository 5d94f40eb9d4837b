use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let code = refork_cli::main_entry().await?;
    std::process::exit(code);
}

use anyhow::Result;
use outcall_switchboard::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    outcall_log::init();
    let server = Server::new()?;
    server.run().await
}

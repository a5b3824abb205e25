use rustyarcade::server::{LobbyServer, DEFAULT_BIND_ADDRESS};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let bind_address = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
    let root = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Cannot determine current directory: {}", e);
            return;
        }
    };
    if let Err(e) = LobbyServer::start(&bind_address, &root).await {
        eprintln!("Server error: {}", e);
    }
}

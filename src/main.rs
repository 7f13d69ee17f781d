// src/main.rs
use live_poll::server::{self, StartupError};

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    server::run().await
}

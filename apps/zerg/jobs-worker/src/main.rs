//! Jobs Worker Service - Entry Point
//!
//! Background worker that processes jobs from Redis queues.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_jobs_worker::run().await
}

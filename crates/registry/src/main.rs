#[tokio::main]
async fn main() -> registry::Result<()> {
    registry::init_tracing();
    registry::run().await
}

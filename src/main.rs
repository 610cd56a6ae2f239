#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coworking_desk_lib::run().await
}

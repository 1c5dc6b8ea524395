use ammo_target::{listener, ListenConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let config = ListenConfig::default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let listener = match listener::bind(&config) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(message = "Error in listener", error = %err);
                return Err(anyhow::Error::from(err));
            }
        };
        tracing::debug!(message = "Started runtime", workers = config.workers);
        listener.serve().await;
        Ok::<_, anyhow::Error>(())
    })
}

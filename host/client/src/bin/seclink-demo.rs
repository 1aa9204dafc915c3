use anyhow::Context as _;
use seclink_client::{CallArgs, OutCell, Session, SessionConfig, SharedBuffer, demo_surface};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    smol::block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let session = Session::initialize(SessionConfig::default(), demo_surface())
        .await
        .context("failed to start session")?;

    for procedure in session.procedures() {
        let args = procedure
            .spec()
            .args
            .iter()
            .map(|arg| format!("{}: {}", arg.name, arg.kind))
            .collect::<Vec<_>>();

        tracing::info!("{}({}) -> {}", procedure.name(), args.join(", "), procedure.spec().ret);
    }

    let input = SharedBuffer::new((0..32).collect::<Vec<u8>>());
    let output = SharedBuffer::new(vec![0u8; 32]);
    let len = OutCell::with(0);

    let args = CallArgs::new()
        .with("input", &input)
        .with("output", &output)
        .with("len", &len);

    let ret = session.call("demo_copy", &args)?.await?;

    tracing::info!(
        ?ret,
        len = ?len.get(),
        output = ?output.snapshot(),
        "copied a key through the worker"
    );

    let values = SharedBuffer::new(vec![10i32, 20, 30]);
    let total = OutCell::with(0);

    let args = CallArgs::new()
        .with("values", &values)
        .with("count", 4)
        .with("total", &total);

    match session.call("demo_sum", &args)?.await {
        Ok(_) => tracing::info!(total = ?total.get(), "summed values"),
        Err(err) => tracing::warn!(error_type = %err.error_type(), "expected failure: {err}"),
    }

    session.destroy()?.await?;

    tracing::info!(requests = session.messages_sent(), "session destroyed");

    Ok(())
}
